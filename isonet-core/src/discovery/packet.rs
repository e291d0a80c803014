//! Discovery datagrams
//!
//! ```text
//! offset  field          type
//! 0       packet type    u8     (1 = REGISTER)
//! 1       confirm port   u16 LE
//! ```

use crate::error::DiscoveryError;

/// Type tag of the registration beacon
pub const PACKET_REGISTER: u8 = 1;

/// A decoded discovery datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    /// A starting isolate, reachable on the given port of the source host
    Register { port: u16 },
    /// Reserved types, ignored by this protocol
    Unknown { kind: u8 },
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Register { port } => {
                let mut data = Vec::with_capacity(3);
                data.push(PACKET_REGISTER);
                data.extend_from_slice(&port.to_le_bytes());
                data
            }
            Packet::Unknown { kind } => vec![*kind],
        }
    }

    /// Decode a datagram; trailing bytes are ignored
    pub fn decode(data: &[u8]) -> Result<Packet, DiscoveryError> {
        let (&kind, body) = data
            .split_first()
            .ok_or_else(|| DiscoveryError::MalformedPacket("empty datagram".to_string()))?;

        match kind {
            PACKET_REGISTER => {
                let port = body.get(..2).ok_or_else(|| {
                    DiscoveryError::MalformedPacket(format!(
                        "REGISTER packet of {} bytes",
                        data.len()
                    ))
                })?;
                let port = u16::from_le_bytes([port[0], port[1]]);
                if port == 0 {
                    return Err(DiscoveryError::MalformedPacket(
                        "REGISTER packet with port 0".to_string(),
                    ));
                }
                Ok(Packet::Register { port })
            }
            kind => Ok(Packet::Unknown { kind }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_layout() {
        assert_eq!(Packet::Register { port: 5000 }.encode(), vec![1, 0x88, 0x13]);
        assert_eq!(
            Packet::decode(&[1, 0x88, 0x13]).unwrap(),
            Packet::Register { port: 5000 }
        );
    }

    #[test]
    fn test_truncated_register() {
        assert!(Packet::decode(&[]).is_err());
        assert!(Packet::decode(&[1]).is_err());
        assert!(Packet::decode(&[1, 0x88]).is_err());
        assert!(Packet::decode(&[1, 0, 0]).is_err());
    }

    #[test]
    fn test_trailing_bytes_and_reserved_types() {
        assert_eq!(
            Packet::decode(&[1, 0x10, 0x00, 0xff]).unwrap(),
            Packet::Register { port: 16 }
        );
        assert_eq!(Packet::decode(&[7, 1, 2]).unwrap(), Packet::Unknown { kind: 7 });
    }
}
