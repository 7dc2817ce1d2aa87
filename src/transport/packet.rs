//! Wire codec for the datagram session layer.
//!
//! Every datagram starts with a fixed header: a magic word, a packet kind,
//! and the payload length. Control packets (`Hello`, `Accept`, `Reject`,
//! `Shutdown`) carry the session handshake; `Data` packets carry one TS
//! bundle of up to 1316 bytes.

use crate::constants::{ MAX_STREAMID_LEN, TS_DATAGRAM_LEN };
use crate::error::{ RelayError, Result };

/// Magic word at the start of every session datagram.
pub const MAGIC: u32 = 0x524c_5331;

/// Fixed header size: magic (4) + kind (1) + payload length (2).
pub const HEADER_SIZE: usize = 7;

/// Largest datagram the session layer will emit or accept. Data payloads
/// (1316 bytes) are larger than any control payload.
pub const MAX_DATAGRAM: usize = HEADER_SIZE + TS_DATAGRAM_LEN;

const KIND_HELLO: u8 = 0;
const KIND_ACCEPT: u8 = 1;
const KIND_REJECT: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_SHUTDOWN: u8 = 4;

/// One decoded session datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Connection request carrying the stream identifier and the caller's
    /// requested latency in milliseconds.
    Hello {
        streamid: String,
        latency_ms: u32,
    },
    /// Positive handshake answer, sent from the session socket so the peer
    /// learns the per-connection port. Echoes the granted latency.
    Accept {
        latency_ms: u32,
    },
    /// Negative handshake answer with a human-readable reason.
    Reject {
        reason: String,
    },
    /// One TS payload datagram.
    Data(Vec<u8>),
    /// Orderly teardown notification.
    Shutdown,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let (kind, payload): (u8, Vec<u8>) = match self {
            Packet::Hello { streamid, latency_ms } => {
                let mut p = latency_ms.to_le_bytes().to_vec();
                p.extend_from_slice(streamid.as_bytes());
                (KIND_HELLO, p)
            }
            Packet::Accept { latency_ms } => (KIND_ACCEPT, latency_ms.to_le_bytes().to_vec()),
            Packet::Reject { reason } => (KIND_REJECT, reason.as_bytes().to_vec()),
            Packet::Data(data) => (KIND_DATA, data.clone()),
            Packet::Shutdown => (KIND_SHUTDOWN, Vec::new()),
        };

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.push(kind);
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Packet> {
        if data.len() < HEADER_SIZE {
            return Err(RelayError::SocketBroken("short session datagram".into()));
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != MAGIC {
            return Err(RelayError::SocketBroken("bad session magic".into()));
        }
        let kind = data[4];
        let len = u16::from_le_bytes([data[5], data[6]]) as usize;
        let payload = data
            .get(HEADER_SIZE..HEADER_SIZE + len)
            .ok_or_else(|| RelayError::SocketBroken("truncated session datagram".into()))?;

        match kind {
            KIND_HELLO => {
                if payload.len() < 4 || payload.len() > 4 + MAX_STREAMID_LEN {
                    return Err(RelayError::SocketBroken("malformed hello".into()));
                }
                let latency_ms = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let streamid = std::str
                    ::from_utf8(&payload[4..])
                    .map_err(|_| RelayError::SocketBroken("hello streamid not utf-8".into()))?
                    .to_string();
                Ok(Packet::Hello { streamid, latency_ms })
            }
            KIND_ACCEPT => {
                if payload.len() < 4 {
                    return Err(RelayError::SocketBroken("malformed accept".into()));
                }
                let latency_ms = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Packet::Accept { latency_ms })
            }
            KIND_REJECT => {
                let reason = String::from_utf8_lossy(payload).to_string();
                Ok(Packet::Reject { reason })
            }
            KIND_DATA => {
                if payload.len() > TS_DATAGRAM_LEN {
                    return Err(RelayError::SocketBroken("oversized data datagram".into()));
                }
                Ok(Packet::Data(payload.to_vec()))
            }
            KIND_SHUTDOWN => Ok(Packet::Shutdown),
            other => Err(RelayError::SocketBroken(format!("unknown packet kind {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_roundtrip() {
        let packet = Packet::Hello {
            streamid: "publish.example/live/demo".into(),
            latency_ms: 120,
        };
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn data_roundtrip() {
        let packet = Packet::Data(vec![0x47; 1316]);
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn control_roundtrips() {
        for packet in [
            Packet::Accept { latency_ms: 100 },
            Packet::Reject { reason: "no publisher".into() },
            Packet::Shutdown,
        ] {
            assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut encoded = Packet::Shutdown.encode();
        encoded[0] ^= 0xff;
        assert!(Packet::decode(&encoded).is_err());
    }

    #[test]
    fn truncated_datagram_rejected() {
        let encoded = Packet::Data(vec![1, 2, 3, 4]).encode();
        assert!(Packet::decode(&encoded[..encoded.len() - 2]).is_err());
        assert!(Packet::decode(&encoded[..3]).is_err());
    }

    #[test]
    fn oversized_data_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.push(KIND_DATA);
        buf.extend_from_slice(&(2000u16).to_le_bytes());
        buf.extend(std::iter::repeat(0u8).take(2000));
        assert!(Packet::decode(&buf).is_err());
    }
}
