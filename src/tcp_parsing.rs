//! Parsing and serialization of TCP segment headers.

use crate::utility::{Checksum, Ipv4Address};
use thiserror::Error as ThisError;

/// The number of 32-bit words in a TCP header without optional header parts
const BASE_HEADER_WORDS: u8 = 5;
/// The number of bytes in a TCP header without optional header parts
pub const BASE_HEADER_OCTETS: usize = BASE_HEADER_WORDS as usize * 4;

/// The IP protocol number for TCP, used in the checksum pseudo-header
const TCP_PROTOCOL: u8 = 6;

/// The data for a TCP header
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct TcpHeader {
    /// The source port number
    pub src_port: u16,
    /// The destination port number
    pub dst_port: u16,
    /// The sequence number of the first data octet in this segment, except
    /// when SYN is present, in which case it is the initial sequence number
    /// and the first data octet is one past it.
    pub seq: u32,
    /// When the ACK control bit is set, the next sequence number the sender
    /// of the segment is expecting to receive.
    pub ack: u32,
    /// Flags that adjust how the segment is handled
    pub ctl: Control,
    /// The number of data octets, starting from the acknowledgment number,
    /// that the sender of this segment is willing to accept.
    pub wnd: u16,
    /// The checksum over the pseudo-header, header, and payload
    pub checksum: u16,
}

impl TcpHeader {
    /// Parses and validates a serialized segment. `bytes` must contain the
    /// header and the entire payload, since the checksum covers both. The
    /// addresses form the pseudo-header and must be given in the direction
    /// the segment traveled.
    pub fn from_bytes(
        bytes: &[u8],
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
    ) -> Result<Self, ParseError> {
        if bytes.len() < BASE_HEADER_OCTETS {
            return Err(ParseError::HeaderTooShort);
        }
        let data_offset = bytes[12] >> 4;
        if data_offset != BASE_HEADER_WORDS {
            return Err(ParseError::UnexpectedOptions);
        }
        let length: u16 = bytes.len().try_into().map_err(|_| ParseError::PacketTooLong)?;

        let expected = u16::from_be_bytes([bytes[16], bytes[17]]);
        let mut checksum = Checksum::new();
        // The checksum field itself counts as zero
        checksum.add_bytes(&bytes[..16]);
        checksum.add_bytes(&bytes[18..]);
        checksum.add_u32(src_address.to_bytes());
        checksum.add_u32(dst_address.to_bytes());
        checksum.add_u8(0, TCP_PROTOCOL);
        checksum.add_u16(length);
        let actual = checksum.as_u16();
        if actual != expected {
            return Err(ParseError::Checksum { actual, expected });
        }

        Ok(Self {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            seq: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ack: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            ctl: Control::from(bytes[13] & 0b11_1111),
            wnd: u16::from_be_bytes([bytes[14], bytes[15]]),
            checksum: expected,
        })
    }

    /// Converts the header to its serialized format, ready to prepend to a
    /// payload and hand to the network layer.
    pub fn serialize(&self) -> [u8; BASE_HEADER_OCTETS] {
        let mut out = [0; BASE_HEADER_OCTETS];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = BASE_HEADER_WORDS << 4;
        out[13] = self.ctl.into();
        out[14..16].copy_from_slice(&self.wnd.to_be_bytes());
        out[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        out
    }
}

/// An error that occurred while parsing a TCP segment
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    #[error("too few bytes to constitute a TCP header")]
    HeaderTooShort,
    #[error("the segment length could not fit into a u16")]
    PacketTooLong,
    #[error(
        "the computed checksum {actual:#06x} did not match the header checksum {expected:#06x}"
    )]
    Checksum { actual: u16, expected: u16 },
    #[error("data offset was different from that expected for an option-less header")]
    UnexpectedOptions,
}

/// Used for building a TCP header with a valid checksum
#[derive(Debug)]
pub struct TcpHeaderBuilder(TcpHeader);

impl TcpHeaderBuilder {
    /// Initializes the header with defaults and the given values
    pub fn new(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self(TcpHeader {
            src_port,
            dst_port,
            seq,
            ack: 0,
            ctl: Control::default(),
            wnd: 0,
            // Filled in by .build()
            checksum: 0,
        })
    }

    /// Sets the window size
    pub fn wnd(mut self, wnd: u16) -> Self {
        self.0.wnd = wnd;
        self
    }

    /// Sets the acknowledgment number and the ACK bit
    pub fn ack(mut self, ack: u32) -> Self {
        self.0.ack = ack;
        self.0.ctl.set_ack(true);
        self
    }

    /// Sets the SYN bit
    pub fn syn(mut self) -> Self {
        self.0.ctl.set_syn(true);
        self
    }

    /// Sets the FIN bit
    pub fn fin(mut self) -> Self {
        self.0.ctl.set_fin(true);
        self
    }

    /// Sets the RST bit
    #[allow(unused)]
    pub fn rst(mut self) -> Self {
        self.0.ctl.set_rst(true);
        self
    }

    /// Computes the checksum over the pseudo-header, header, and payload and
    /// returns the finished header.
    pub fn build(
        self,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
        payload: &[u8],
    ) -> Result<TcpHeader, BuildHeaderError> {
        let length: u16 = (payload.len() + BASE_HEADER_OCTETS)
            .try_into()
            .map_err(|_| BuildHeaderError::OverlyLongPayload)?;

        let mut checksum = Checksum::new();
        // Pseudo header
        checksum.add_u32(src_address.to_bytes());
        checksum.add_u32(dst_address.to_bytes());
        checksum.add_u8(0, TCP_PROTOCOL);
        checksum.add_u16(length);
        // Header parts
        checksum.add_u16(self.0.src_port);
        checksum.add_u16(self.0.dst_port);
        checksum.add_u32(self.0.seq.to_be_bytes());
        checksum.add_u32(self.0.ack.to_be_bytes());
        checksum.add_u8(BASE_HEADER_WORDS << 4, self.0.ctl.into());
        checksum.add_u16(self.0.wnd);
        checksum.add_bytes(payload);

        let mut header = self.0;
        header.checksum = checksum.as_u16();
        Ok(header)
    }
}

/// An error that occurred while building a TCP header
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum BuildHeaderError {
    #[error("the TCP payload is longer than can fit into a single segment")]
    OverlyLongPayload,
}

/// The control bits of a TCP header
#[derive(Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Control(u8);

impl Control {
    /// Creates a new Control with the given bits
    pub const fn new(ack: bool, rst: bool, syn: bool, fin: bool) -> Self {
        Self(fin as u8 | (syn as u8) << 1 | (rst as u8) << 2 | (ack as u8) << 4)
    }

    /// Whether the acknowledgment field is significant
    pub const fn ack(self) -> bool {
        self.bit(4)
    }

    /// Sets whether the acknowledgment field is significant
    pub fn set_ack(&mut self, state: bool) {
        self.set_bit(4, state);
    }

    /// Whether to reset the connection
    pub const fn rst(self) -> bool {
        self.bit(2)
    }

    /// Sets whether to reset the connection
    pub fn set_rst(&mut self, state: bool) {
        self.set_bit(2, state);
    }

    /// Whether to synchronize sequence numbers
    pub const fn syn(self) -> bool {
        self.bit(1)
    }

    /// Sets whether to synchronize sequence numbers
    pub fn set_syn(&mut self, state: bool) {
        self.set_bit(1, state);
    }

    /// Whether the sender has no more data
    pub const fn fin(self) -> bool {
        self.bit(0)
    }

    /// Sets whether the sender has no more data
    pub fn set_fin(&mut self, state: bool) {
        self.set_bit(0, state);
    }

    const fn bit(self, bit: u8) -> bool {
        (self.0 >> bit) & 0b1 == 1
    }

    fn set_bit(&mut self, bit: u8, state: bool) {
        self.0 = (self.0 & !(1 << bit)) | ((state as u8) << bit);
    }
}

impl From<u8> for Control {
    fn from(n: u8) -> Self {
        Self(n)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut named = Vec::new();
        if self.ack() {
            named.push("ACK");
        }
        if self.rst() {
            named.push("RST");
        }
        if self.syn() {
            named.push("SYN");
        }
        if self.fin() {
            named.push("FIN");
        }
        write!(f, "Control({})", named.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"Hello, world!";
    const SRC_ADDRESS: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const DST_ADDRESS: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const SRC_PORT: u16 = 0xcafe;
    const DST_PORT: u16 = 0xbabe;
    const SEQUENCE: u32 = 123456789;
    const WINDOW: u16 = 1024;
    const ACKNOWLEDGMENT: u32 = 10;

    fn build_expected() -> (etherparse::TcpHeader, Vec<u8>) {
        let expected = {
            let mut expected = etherparse::TcpHeader::new(SRC_PORT, DST_PORT, SEQUENCE, WINDOW);
            expected.acknowledgment_number = ACKNOWLEDGMENT;
            expected.ack = true;
            expected.checksum = expected
                .calc_checksum_ipv4_raw(SRC_ADDRESS.to_bytes(), DST_ADDRESS.to_bytes(), PAYLOAD)
                .unwrap();
            expected
        };

        let serial = {
            let mut serial = vec![];
            expected.write(&mut serial).unwrap();
            serial
        };

        (expected, serial)
    }

    #[test]
    fn parses_packet() {
        let (expected, mut serial) = build_expected();
        serial.extend_from_slice(PAYLOAD);

        let actual = TcpHeader::from_bytes(&serial, SRC_ADDRESS, DST_ADDRESS).unwrap();

        assert_eq!(actual.src_port, SRC_PORT);
        assert_eq!(actual.dst_port, DST_PORT);
        assert_eq!(actual.seq, SEQUENCE);
        assert_eq!(actual.ack, ACKNOWLEDGMENT);
        assert_eq!(actual.wnd, WINDOW);
        assert_eq!(actual.checksum, expected.checksum);
        assert!(actual.ctl.ack());
        assert!(!actual.ctl.rst());
        assert!(!actual.ctl.syn());
        assert!(!actual.ctl.fin());
    }

    #[test]
    fn builds_packet() {
        let (_, expected) = build_expected();

        let actual = TcpHeaderBuilder::new(SRC_PORT, DST_PORT, SEQUENCE)
            .wnd(WINDOW)
            .ack(ACKNOWLEDGMENT)
            .build(SRC_ADDRESS, DST_ADDRESS, PAYLOAD)
            .unwrap()
            .serialize();

        assert_eq!(expected.as_slice(), actual.as_slice());
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let (_, mut serial) = build_expected();
        serial.extend_from_slice(PAYLOAD);
        serial[5] ^= 0xff;

        let result = TcpHeader::from_bytes(&serial, SRC_ADDRESS, DST_ADDRESS);
        assert!(matches!(result, Err(ParseError::Checksum { .. })));
    }

    #[test]
    fn rejects_short_buffer() {
        assert_eq!(
            TcpHeader::from_bytes(&[0u8; 12], SRC_ADDRESS, DST_ADDRESS),
            Err(ParseError::HeaderTooShort)
        );
    }

    #[test]
    fn round_trips_through_serialization() {
        let header = TcpHeaderBuilder::new(SRC_PORT, DST_PORT, SEQUENCE)
            .wnd(WINDOW)
            .ack(ACKNOWLEDGMENT)
            .syn()
            .build(SRC_ADDRESS, DST_ADDRESS, &[])
            .unwrap();
        let parsed =
            TcpHeader::from_bytes(&header.serialize(), SRC_ADDRESS, DST_ADDRESS).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn control_works() {
        let control = Control::new(false, true, true, false);
        assert!(!control.ack());
        assert!(control.rst());
        assert!(control.syn());
        assert!(!control.fin());

        let control = {
            let mut control = Control::default();
            control.set_ack(true);
            control.set_fin(true);
            control
        };
        assert!(control.ack());
        assert!(!control.rst());
        assert!(!control.syn());
        assert!(control.fin());
    }
}
