//! Utilities shared by segment construction and connection identification.

use std::fmt::{self, Display};

/// A calculator for the one's-complement checksum carried by TCP segments.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(u16);

impl Checksum {
    /// Creates a new checksum calculator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `u16` to the checksum value.
    pub fn add_u16(&mut self, value: u16) {
        let (sum, carry) = self.0.overflowing_add(value);
        self.0 = sum + carry as u16;
    }

    /// Adds a `u16` formed by two `u8`s to the checksum value.
    pub fn add_u8(&mut self, a: u8, b: u8) {
        self.add_u16(u16::from_be_bytes([a, b]));
    }

    /// Adds two `u16`s to the checksum value by splitting a `u32` in half.
    pub fn add_u32(&mut self, value: [u8; 4]) {
        self.add_u8(value[0], value[1]);
        self.add_u8(value[2], value[3]);
    }

    /// Accumulates a byte slice two bytes at a time. An odd trailing byte is
    /// padded with zero.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            self.add_u8(pair[0], pair[1]);
        }
        if let [last] = pairs.remainder() {
            self.add_u8(*last, 0);
        }
    }

    /// The complemented checksum, ready for the wire.
    pub fn as_u16(&self) -> u16 {
        !self.0
    }
}

/// An IPv4 address, used here to form the pseudo-header that TCP checksums
/// cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    /// The address `127.0.0.1`.
    pub const LOCALHOST: Self = Self([127u8, 0, 0, 1]);

    /// Creates a new address.
    pub const fn new(address: [u8; 4]) -> Self {
        Self(address)
    }

    /// Gets the address as a `u32`.
    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Gets the address as a `[u8; 4]`.
    pub fn to_bytes(self) -> [u8; 4] {
        self.0
    }
}

impl Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl From<u32> for Ipv4Address {
    fn from(n: u32) -> Self {
        Self(n.to_be_bytes())
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(n: [u8; 4]) -> Self {
        Self(n)
    }
}

impl From<Ipv4Address> for u32 {
    fn from(address: Ipv4Address) -> Self {
        address.to_u32()
    }
}

impl From<Ipv4Address> for [u8; 4] {
    fn from(address: Ipv4Address) -> Self {
        address.0
    }
}

/// One side of a connection: an address and a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoint {
    pub address: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: Ipv4Address, port: u16) -> Self {
        Self { address, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// The pair of endpoints that uniquely identifies a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoints {
    /// The local endpoint
    pub local: Endpoint,
    /// The remote endpoint
    pub remote: Endpoint,
}

impl Endpoints {
    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    /// Gets the matching identifier for the remote TCP.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_folds_carries() {
        let mut checksum = Checksum::new();
        checksum.add_u16(0xffff);
        checksum.add_u16(0x0001);
        // 0xffff + 0x0001 wraps to 0x0001 after the end-around carry
        assert_eq!(checksum.as_u16(), !0x0001);
    }

    #[test]
    fn checksum_pads_odd_tail() {
        let mut odd = Checksum::new();
        odd.add_bytes(&[0x12, 0x34, 0x56]);

        let mut even = Checksum::new();
        even.add_bytes(&[0x12, 0x34, 0x56, 0x00]);

        assert_eq!(odd.as_u16(), even.as_u16());
    }

    #[test]
    fn address_conversions() {
        let address = Ipv4Address::new([10, 0, 0, 1]);
        assert_eq!(address.to_u32(), 0x0a000001);
        assert_eq!(Ipv4Address::from(0x0a000001u32), address);
        assert_eq!(address.to_string(), "10.0.0.1");
    }

    #[test]
    fn endpoints_reverse() {
        let id = Endpoints::new(
            Endpoint::new(Ipv4Address::LOCALHOST, 80),
            Endpoint::new(Ipv4Address::new([10, 0, 0, 1]), 8080),
        );
        let reversed = id.reverse();
        assert_eq!(reversed.local, id.remote);
        assert_eq!(reversed.remote, id.local);
        assert_eq!(reversed.reverse(), id);
    }
}
