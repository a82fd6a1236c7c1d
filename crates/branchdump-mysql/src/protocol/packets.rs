use crate::error::WireError;
use bytes::{Buf, BufMut, BytesMut};

pub const OK_HEADER: u8 = 0x00;
pub const EOF_HEADER: u8 = 0xfe;
pub const ERR_HEADER: u8 = 0xff;

pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

pub const ER_ACCESS_DENIED: u16 = 1045;
pub const ER_TABLE_EXISTS: u16 = 1050;
pub const ER_NO_SUCH_TABLE: u16 = 1146;
pub const CR_CONN_HOST_ERROR: u16 = 2003;

type Result<T> = std::result::Result<T, WireError>;

// Helper: Length Encoded Integer
pub fn read_lenenc_int(src: &mut BytesMut) -> Result<Option<u64>> {
    if src.is_empty() {
        return Ok(None);
    }
    let first = src[0];
    if first < 251 {
        src.advance(1);
        Ok(Some(first as u64))
    } else if first == 0xfc {
        if src.len() < 3 {
            return Ok(None);
        }
        src.advance(1);
        Ok(Some(src.get_u16_le() as u64))
    } else if first == 0xfd {
        if src.len() < 4 {
            return Ok(None);
        }
        src.advance(1);
        Ok(Some(src.get_uint_le(3)))
    } else if first == 0xfe {
        if src.len() < 9 {
            return Ok(None);
        }
        src.advance(1);
        Ok(Some(src.get_u64_le()))
    } else {
        Err(WireError::Protocol(format!("Invalid length encoded int: {}", first)))
    }
}

pub fn write_lenenc_int(dst: &mut BytesMut, val: u64) {
    if val < 251 {
        dst.put_u8(val as u8);
    } else if val < 0x10000 {
        dst.put_u8(0xfc);
        dst.put_u16_le(val as u16);
    } else if val < 0x1000000 {
        dst.put_u8(0xfd);
        dst.put_uint_le(val, 3);
    } else {
        dst.put_u8(0xfe);
        dst.put_u64_le(val);
    }
}

pub fn read_lenenc_str(src: &mut BytesMut) -> Result<Option<BytesMut>> {
    let len = match read_lenenc_int(src)? {
        Some(l) => l as usize,
        None => return Ok(None),
    };
    if src.len() < len {
        return Err(WireError::Protocol("Incomplete packet for string".into()));
    }
    Ok(Some(src.split_to(len)))
}

pub fn write_lenenc_str(dst: &mut BytesMut, s: &[u8]) {
    write_lenenc_int(dst, s.len() as u64);
    dst.put_slice(s);
}

/// Reads a NUL-terminated string and consumes the terminator.
pub fn read_null_str(src: &mut BytesMut) -> Result<String> {
    match src.iter().position(|&b| b == 0) {
        Some(pos) => {
            let bytes = src.split_to(pos);
            src.advance(1);
            Ok(String::from_utf8_lossy(&bytes).to_string())
        }
        None => Err(WireError::Protocol("missing string terminator".into())),
    }
}

pub fn write_null_str(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

/// The commands this crate sends or answers. Others are passed through
/// opaquely by the relay and never parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    InitDb { schema: String },
    Query { query: String },
    Ping,
    Other(u8),
}

impl Command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_INIT_DB: u8 = 0x02;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_PING: u8 = 0x0e;

    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        let Some((&cmd, data)) = payload.split_first() else {
            return Ok(None);
        };
        let command = match cmd {
            Self::COM_QUIT => Command::Quit,
            Self::COM_INIT_DB => Command::InitDb {
                schema: String::from_utf8_lossy(data).to_string(),
            },
            Self::COM_QUERY => Command::Query {
                query: String::from_utf8_lossy(data).to_string(),
            },
            Self::COM_PING => Command::Ping,
            other => Command::Other(other),
        };
        Ok(Some(command))
    }

    pub fn write(&self, dst: &mut BytesMut) {
        match self {
            Command::Quit => dst.put_u8(Self::COM_QUIT),
            Command::InitDb { schema } => {
                dst.put_u8(Self::COM_INIT_DB);
                dst.put_slice(schema.as_bytes());
            }
            Command::Query { query } => {
                dst.reserve(query.len() + 1);
                dst.put_u8(Self::COM_QUERY);
                dst.put_slice(query.as_bytes());
            }
            Command::Ping => dst.put_u8(Self::COM_PING),
            Command::Other(cmd) => dst.put_u8(*cmd),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OKPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl OKPacket {
    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u8(OK_HEADER);
        write_lenenc_int(dst, self.affected_rows);
        write_lenenc_int(dst, self.last_insert_id);
        dst.put_u16_le(self.status_flags);
        dst.put_u16_le(self.warnings);
        dst.put_slice(self.info.as_bytes());
    }

    /// Parses an OK payload (header byte included), assuming CLIENT_PROTOCOL_41.
    pub fn parse(mut src: BytesMut) -> Result<Self> {
        if src.first() != Some(&OK_HEADER) {
            return Err(WireError::Protocol("not an OK packet".into()));
        }
        src.advance(1);
        let truncated = || WireError::Protocol("truncated OK packet".into());
        let affected_rows = read_lenenc_int(&mut src)?.ok_or_else(truncated)?;
        let last_insert_id = read_lenenc_int(&mut src)?.ok_or_else(truncated)?;
        if src.len() < 4 {
            return Err(truncated());
        }
        let status_flags = src.get_u16_le();
        let warnings = src.get_u16_le();
        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info: String::from_utf8_lossy(&src).to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ERRPacket {
    pub error_code: u16,
    pub sql_state: String, // 5 chars
    pub error_message: String,
}

impl ERRPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.into(),
        }
    }

    pub fn access_denied(username: &str, host: &str) -> Self {
        Self::new(
            ER_ACCESS_DENIED,
            "28000",
            format!("Access denied for user '{}'@'{}' (using password: YES)", username, host),
        )
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u8(ERR_HEADER);
        dst.put_u16_le(self.error_code);
        dst.put_u8(b'#');
        dst.put_slice(self.sql_state.as_bytes());
        dst.put_slice(self.error_message.as_bytes());
    }

    pub fn parse(mut src: BytesMut) -> Result<Self> {
        if src.first() != Some(&ERR_HEADER) || src.len() < 3 {
            return Err(WireError::Protocol("not an ERR packet".into()));
        }
        src.advance(1);
        let error_code = src.get_u16_le();
        let mut sql_state = String::from("HY000");
        if src.first() == Some(&b'#') && src.len() >= 6 {
            src.advance(1);
            sql_state = String::from_utf8_lossy(&src.split_to(5)).to_string();
        }
        Ok(Self {
            error_code,
            sql_state,
            error_message: String::from_utf8_lossy(&src).to_string(),
        })
    }
}

impl From<ERRPacket> for WireError {
    fn from(err: ERRPacket) -> Self {
        WireError::Server {
            code: err.error_code,
            state: err.sql_state,
            message: err.error_message,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EOFPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EOFPacket {
    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u8(EOF_HEADER);
        dst.put_u16_le(self.warnings);
        dst.put_u16_le(self.status_flags);
    }

    pub fn parse(mut src: BytesMut) -> Result<Self> {
        if src.first() != Some(&EOF_HEADER) {
            return Err(WireError::Protocol("not an EOF packet".into()));
        }
        src.advance(1);
        if src.len() < 4 {
            // Pre-4.1 EOF carries no status.
            return Ok(Self::default());
        }
        Ok(Self {
            warnings: src.get_u16_le(),
            status_flags: src.get_u16_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenenc_int() {
        let mut buf = BytesMut::new();
        write_lenenc_int(&mut buf, 250);
        write_lenenc_int(&mut buf, 65535);
        write_lenenc_int(&mut buf, 70000);
        write_lenenc_int(&mut buf, 1 << 40);

        assert_eq!(read_lenenc_int(&mut buf).unwrap().unwrap(), 250);
        assert_eq!(read_lenenc_int(&mut buf).unwrap().unwrap(), 65535);
        assert_eq!(read_lenenc_int(&mut buf).unwrap().unwrap(), 70000);
        assert_eq!(read_lenenc_int(&mut buf).unwrap().unwrap(), 1 << 40);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_command_query() {
        let cmd = Command::parse(b"\x03SELECT 1").unwrap().unwrap();
        assert_eq!(cmd, Command::Query { query: "SELECT 1".into() });
        assert_eq!(Command::parse(b"\x09").unwrap(), Some(Command::Other(0x09)));
        assert_eq!(Command::parse(b"").unwrap(), None);
    }

    #[test]
    fn test_ok_packet_serialization() {
        let mut buf = BytesMut::new();
        let ok = OKPacket {
            affected_rows: 1,
            last_insert_id: 12345,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
            info: "".to_string(),
        };
        ok.write(&mut buf);

        assert_eq!(buf[0], 0x00); // Header
        assert_eq!(buf[1], 1); // Affected
        assert_eq!(buf[2], 0xfc); // Last insert ID > 250 -> 2 bytes
        assert_eq!(buf[3], 0x39); // 12345 & 0xFF
        assert_eq!(buf[4], 0x30); // 12345 >> 8
        assert_eq!(OKPacket::parse(buf).unwrap(), ok);
    }

    #[test]
    fn test_err_packet_parse() {
        let mut buf = BytesMut::new();
        ERRPacket::new(ER_TABLE_EXISTS, "42S01", "Table 'users' already exists").write(&mut buf);
        let err = ERRPacket::parse(buf).unwrap();
        assert_eq!(err.error_code, 1050);
        assert_eq!(err.sql_state, "42S01");
        assert_eq!(err.error_message, "Table 'users' already exists");
    }

    #[test]
    fn test_null_str() {
        let mut buf = BytesMut::from(&b"root\0rest"[..]);
        assert_eq!(read_null_str(&mut buf).unwrap(), "root");
        assert_eq!(&buf[..], b"rest");
        assert!(read_null_str(&mut buf).is_err());
    }
}
