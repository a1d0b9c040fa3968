use crate::tcp_parsing::{ParseError, TcpHeader, BASE_HEADER_OCTETS};
use crate::utility::Endpoints;

/// A TCP segment: one header and its payload bytes.
///
/// Segments are built once and then handed off whole: inbound segments move
/// from the network layer through the pending queue to the state machine,
/// outbound segments move from the state machine to the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(header: TcpHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// The amount of sequence space the segment occupies. SYN and FIN each
    /// count for one in addition to the payload bytes.
    pub fn seg_len(&self) -> u32 {
        (self.payload.len() + self.header.ctl.syn() as usize + self.header.ctl.fin() as usize)
            as u32
    }

    /// The first sequence number past the end of the segment.
    pub fn seq_end(&self) -> u32 {
        self.header.seq.wrapping_add(self.seg_len())
    }

    /// Parses and checksum-validates a raw inbound segment addressed to the
    /// local side of `id`.
    pub fn parse(bytes: &[u8], id: Endpoints) -> Result<Self, ParseError> {
        let header = TcpHeader::from_bytes(bytes, id.remote.address, id.local.address)?;
        Ok(Self {
            header,
            payload: bytes[BASE_HEADER_OCTETS..].to_vec(),
        })
    }

    /// Serializes the segment for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BASE_HEADER_OCTETS + self.payload.len());
        out.extend_from_slice(&self.header.serialize());
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_parsing::TcpHeaderBuilder;
    use crate::utility::{Endpoint, Ipv4Address};

    const ID: Endpoints = Endpoints {
        local: Endpoint {
            address: Ipv4Address::new([10, 0, 0, 1]),
            port: 0xcafe,
        },
        remote: Endpoint {
            address: Ipv4Address::new([10, 0, 0, 2]),
            port: 0xbeef,
        },
    };

    #[test]
    fn seg_len_counts_syn_and_fin() {
        let header = TcpHeaderBuilder::new(1, 2, 100)
            .syn()
            .build(ID.local.address, ID.remote.address, &[])
            .unwrap();
        let segment = Segment::new(header, Vec::new());
        assert_eq!(segment.seg_len(), 1);
        assert_eq!(segment.seq_end(), 101);

        let header = TcpHeaderBuilder::new(1, 2, 100)
            .fin()
            .ack(1)
            .build(ID.local.address, ID.remote.address, b"abc")
            .unwrap();
        let segment = Segment::new(header, b"abc".to_vec());
        assert_eq!(segment.seg_len(), 4);
        assert_eq!(segment.seq_end(), 104);
    }

    #[test]
    fn wire_round_trip() {
        // Built by the remote side, so ports and addresses are reversed
        let header = TcpHeaderBuilder::new(ID.remote.port, ID.local.port, 42)
            .ack(7)
            .wnd(512)
            .build(ID.remote.address, ID.local.address, b"payload")
            .unwrap();
        let sent = Segment::new(header, b"payload".to_vec());

        let received = Segment::parse(&sent.to_bytes(), ID).unwrap();
        assert_eq!(received, sent);
    }
}
