use crate::error::WireError;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub mod auth;
pub mod handshake;
pub mod packets;

pub use auth::{AuthMethod, Authenticator};
pub use handshake::{AuthSwitchRequest, CapabilityFlags, HandshakeResponse41, HandshakeV10};
pub use packets::{Command, ERRPacket, OKPacket};

/// Largest payload a single frame can carry; longer payloads continue in the next frame.
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

// MySQL Packet Header
// 3 bytes length
// 1 byte sequence id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u32,
    pub seq_id: u8,
}

/// One logical packet. Payloads split across several frames are joined here.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: BytesMut,
}

impl Packet {
    pub fn new(seq_id: u8, payload: BytesMut) -> Self {
        Self {
            header: PacketHeader {
                length: payload.len() as u32,
                seq_id,
            },
            payload,
        }
    }

    pub fn seq_id(&self) -> u8 {
        self.header.seq_id
    }

    pub fn is_ok(&self) -> bool {
        self.payload.first() == Some(&packets::OK_HEADER)
    }

    pub fn is_err(&self) -> bool {
        self.payload.first() == Some(&packets::ERR_HEADER)
    }

    /// EOF packets share their header byte with auth-switch and long lenenc
    /// integers; only short payloads are EOF.
    pub fn is_eof(&self) -> bool {
        self.payload.first() == Some(&packets::EOF_HEADER) && self.payload.len() < 9
    }
}

pub struct MySQLProtocol;

impl MySQLProtocol {
    /// Reads a full packet from the buffer, joining continuation frames.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched until every frame of the
    /// packet has arrived.
    pub fn read_packet(src: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        let mut offset = 0;
        let mut total = 0;
        let mut frames = 0;
        let mut seq_id;
        loop {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let len = LittleEndian::read_u24(&src[offset..offset + 3]) as usize;
            seq_id = src[offset + 3];
            if src.len() < offset + 4 + len {
                src.reserve(offset + 4 + len - src.len());
                return Ok(None);
            }
            offset += 4 + len;
            total += len;
            frames += 1;
            if len < MAX_PAYLOAD_LEN {
                break;
            }
        }

        let payload = if frames == 1 {
            src.advance(4);
            src.split_to(total)
        } else {
            let mut joined = BytesMut::with_capacity(total);
            for _ in 0..frames {
                let len = LittleEndian::read_u24(&src[..3]) as usize;
                src.advance(4);
                joined.extend_from_slice(&src.split_to(len));
            }
            joined
        };

        Ok(Some(Packet {
            header: PacketHeader {
                length: total as u32,
                seq_id,
            },
            payload,
        }))
    }

    /// Writes `payload` as one or more frames starting at `seq_id`.
    ///
    /// Returns the sequence id the peer will use for its reply.
    pub fn write_packet(payload: &[u8], mut seq_id: u8, dst: &mut BytesMut) -> u8 {
        dst.reserve(payload.len() + 4 * (payload.len() / MAX_PAYLOAD_LEN + 1));
        let mut rest = payload;
        loop {
            let len = rest.len().min(MAX_PAYLOAD_LEN);
            dst.put_uint_le(len as u64, 3);
            dst.put_u8(seq_id);
            dst.put_slice(&rest[..len]);
            seq_id = seq_id.wrapping_add(1);
            rest = &rest[len..];
            // A payload that fills the last frame exactly is closed by an empty frame.
            if len < MAX_PAYLOAD_LEN {
                return seq_id;
            }
        }
    }
}

/// Frames MySQL packets for `tokio_util::codec::Framed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        MySQLProtocol::read_packet(src)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = WireError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), WireError> {
        MySQLProtocol::write_packet(&item.payload, item.header.seq_id, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_waits_for_full_packet() {
        let mut buf = BytesMut::new();
        MySQLProtocol::write_packet(b"\x03SELECT 1", 0, &mut buf);
        let mut partial = buf.split_to(6);
        assert!(MySQLProtocol::read_packet(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 6);

        partial.unsplit(buf);
        let packet = MySQLProtocol::read_packet(&mut partial).unwrap().unwrap();
        assert_eq!(packet.seq_id(), 0);
        assert_eq!(&packet.payload[..], b"\x03SELECT 1");
        assert!(partial.is_empty());
    }

    #[test]
    fn test_large_payload_is_split_and_joined() {
        let payload = vec![b'x'; MAX_PAYLOAD_LEN + 10];
        let mut buf = BytesMut::new();
        let next = MySQLProtocol::write_packet(&payload, 0, &mut buf);
        assert_eq!(next, 2);
        assert_eq!(buf.len(), payload.len() + 8);

        let packet = MySQLProtocol::read_packet(&mut buf).unwrap().unwrap();
        assert_eq!(packet.payload.len(), payload.len());
        assert_eq!(packet.seq_id(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_exact_frame_size_gets_empty_trailer() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN];
        let mut buf = BytesMut::new();
        assert_eq!(MySQLProtocol::write_packet(&payload, 5, &mut buf), 7);
        assert_eq!(&buf[buf.len() - 4..], &[0, 0, 0, 6]);

        let packet = MySQLProtocol::read_packet(&mut buf).unwrap().unwrap();
        assert_eq!(packet.payload.len(), MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_eof_detection_ignores_long_payloads() {
        let eof = Packet::new(3, BytesMut::from(&[0xfe, 0, 0, 2, 0][..]));
        assert!(eof.is_eof());
        let switch = Packet::new(2, BytesMut::from(&b"\xfemysql_native_password\0salt"[..]));
        assert!(!switch.is_eof());
    }
}
