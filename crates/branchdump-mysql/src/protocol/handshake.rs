use super::packets::{read_null_str, write_lenenc_str, write_null_str, SERVER_STATUS_AUTOCOMMIT};
use crate::error::WireError;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

type Result<T> = std::result::Result<T, WireError>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CapabilityFlags: u32 {
        const CLIENT_LONG_PASSWORD = 1;
        const CLIENT_FOUND_ROWS = 2;
        const CLIENT_LONG_FLAG = 4;
        const CLIENT_CONNECT_WITH_DB = 8;
        const CLIENT_NO_SCHEMA = 16;
        const CLIENT_COMPRESS = 32;
        const CLIENT_ODBC = 64;
        const CLIENT_LOCAL_FILES = 128;
        const CLIENT_IGNORE_SPACE = 256;
        const CLIENT_PROTOCOL_41 = 512;
        const CLIENT_INTERACTIVE = 1024;
        const CLIENT_SSL = 2048;
        const CLIENT_IGNORE_SIGPIPE = 4096;
        const CLIENT_TRANSACTIONS = 8192;
        const CLIENT_RESERVED = 16384;
        const CLIENT_SECURE_CONNECTION = 32768;
        const CLIENT_MULTI_STATEMENTS = 65536;
        const CLIENT_MULTI_RESULTS = 131072;
        const CLIENT_PS_MULTI_RESULTS = 262144;
        const CLIENT_PLUGIN_AUTH = 524288;
        const CLIENT_CONNECT_ATTRS = 1048576;
        const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA = 2097152;
        const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS = 4194304;
        const CLIENT_SESSION_TRACK = 8388608;
        const CLIENT_DEPRECATE_EOF = 16777216;
    }
}

impl CapabilityFlags {
    /// Capabilities the relay offers local clients and this crate's client requests.
    ///
    /// Compression, TLS and the EOF-less result protocol are left out so that the
    /// byte stream stays identical on both sides of the relay.
    pub fn relay_default() -> Self {
        Self::CLIENT_LONG_PASSWORD
            | Self::CLIENT_FOUND_ROWS
            | Self::CLIENT_LONG_FLAG
            | Self::CLIENT_CONNECT_WITH_DB
            | Self::CLIENT_PROTOCOL_41
            | Self::CLIENT_TRANSACTIONS
            | Self::CLIENT_SECURE_CONNECTION
            | Self::CLIENT_MULTI_STATEMENTS
            | Self::CLIENT_MULTI_RESULTS
            | Self::CLIENT_PS_MULTI_RESULTS
            | Self::CLIENT_PLUGIN_AUTH
            | Self::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    }

    /// Capabilities that must never cross the relay.
    pub fn relay_forbidden() -> Self {
        Self::CLIENT_SSL | Self::CLIENT_COMPRESS | Self::CLIENT_DEPRECATE_EOF
    }
}

/// utf8mb4_general_ci
pub const DEFAULT_CHARSET: u8 = 45;

pub const DEFAULT_MAX_PACKET_SIZE: u32 = 1 << 30;

/// Initial server greeting (Protocol::HandshakeV10).
#[derive(Debug, Clone)]
pub struct HandshakeV10 {
    pub protocol_version: u8, // 10
    pub server_version: String,
    pub connection_id: u32,
    /// 20 byte scramble, both parts joined.
    pub auth_plugin_data: Vec<u8>,
    pub capabilities: CapabilityFlags,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl HandshakeV10 {
    pub fn new(connection_id: u32, salt: &[u8], server_version: &str, auth_plugin_name: &str) -> Self {
        Self {
            protocol_version: 10,
            server_version: server_version.to_string(),
            connection_id,
            auth_plugin_data: salt.to_vec(),
            capabilities: CapabilityFlags::relay_default(),
            character_set: DEFAULT_CHARSET,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: auth_plugin_name.to_string(),
        }
    }

    /// The 20 scramble bytes without any trailing NUL.
    pub fn salt(&self) -> &[u8] {
        let end = self.auth_plugin_data.len().min(20);
        &self.auth_plugin_data[..end]
    }

    pub fn write(&self, dst: &mut BytesMut) {
        let caps = self.capabilities.bits();
        let (part1, part2) = self.auth_plugin_data.split_at(self.auth_plugin_data.len().min(8));
        dst.put_u8(self.protocol_version);
        write_null_str(dst, &self.server_version);
        dst.put_u32_le(self.connection_id);
        dst.put_slice(part1);
        dst.put_u8(0); // filler
        dst.put_u16_le(caps as u16);
        dst.put_u8(self.character_set);
        dst.put_u16_le(self.status_flags);
        dst.put_u16_le((caps >> 16) as u16);
        dst.put_u8((self.auth_plugin_data.len() + 1) as u8);
        dst.put_slice(&[0u8; 10]); // reserved
        dst.put_slice(part2);
        dst.put_u8(0); // terminator for part 2
        write_null_str(dst, &self.auth_plugin_name);
    }

    pub fn parse(mut src: BytesMut) -> Result<Self> {
        if src.first() == Some(&super::packets::ERR_HEADER) {
            return Err(super::packets::ERRPacket::parse(src)?.into());
        }
        if src.len() < 2 || src[0] != 10 {
            return Err(WireError::Protocol("unsupported handshake protocol version".into()));
        }
        let protocol_version = src.get_u8();
        let server_version = read_null_str(&mut src)?;
        if src.len() < 4 + 8 + 1 + 2 {
            return Err(WireError::Protocol("Handshake too short".into()));
        }
        let connection_id = src.get_u32_le();
        let mut auth_plugin_data = src.split_to(8).to_vec();
        src.advance(1); // filler
        let caps_low = src.get_u16_le() as u32;

        let mut character_set = DEFAULT_CHARSET;
        let mut status_flags = 0;
        let mut caps_high = 0;
        let mut auth_plugin_name = String::from("mysql_native_password");
        if src.len() >= 1 + 2 + 2 + 1 + 10 {
            character_set = src.get_u8();
            status_flags = src.get_u16_le();
            caps_high = src.get_u16_le() as u32;
            let data_len = src.get_u8() as usize;
            src.advance(10); // reserved
            let capabilities = CapabilityFlags::from_bits_truncate(caps_low | (caps_high << 16));
            if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
                let part2_len = data_len.saturating_sub(8).max(13).min(src.len());
                let mut part2 = src.split_to(part2_len);
                while part2.last() == Some(&0) {
                    part2.truncate(part2.len() - 1);
                }
                auth_plugin_data.extend_from_slice(&part2);
            }
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !src.is_empty() {
                auth_plugin_name = match src.iter().position(|&b| b == 0) {
                    Some(_) => read_null_str(&mut src)?,
                    None => String::from_utf8_lossy(&src).to_string(),
                };
            }
        }

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data,
            capabilities: CapabilityFlags::from_bits_truncate(caps_low | (caps_high << 16)),
            character_set,
            status_flags,
            auth_plugin_name,
        })
    }
}

/// Client reply to the greeting (Protocol::HandshakeResponse41).
#[derive(Debug, Clone)]
pub struct HandshakeResponse41 {
    pub capabilities: CapabilityFlags,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: Option<String>,
    /// Raw connection attributes, forwarded untouched.
    pub connect_attrs: Option<Vec<u8>>,
}

impl HandshakeResponse41 {
    pub fn parse(mut src: BytesMut) -> Result<Self> {
        // Assume packet header already stripped
        if src.len() < 32 {
            return Err(WireError::Protocol("Handshake response too short".into()));
        }

        let capabilities = CapabilityFlags::from_bits_truncate(src.get_u32_le());
        if !capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            return Err(WireError::Protocol("client does not speak protocol 4.1".into()));
        }
        let max_packet_size = src.get_u32_le();
        let character_set = src.get_u8();
        src.advance(23); // reserved

        let username = read_null_str(&mut src)
            .map_err(|_| WireError::Protocol("Invalid username format".into()))?;

        let auth_response = if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            super::packets::read_lenenc_str(&mut src)?
                .map(|b| b.to_vec())
                .unwrap_or_default()
        } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            if src.is_empty() {
                Vec::new()
            } else {
                let len = (src.get_u8() as usize).min(src.len());
                src.split_to(len).to_vec()
            }
        } else {
            read_null_str(&mut src)?.into_bytes()
        };

        let mut database = None;
        if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) && !src.is_empty() {
            let db = read_null_str(&mut src)?;
            if !db.is_empty() {
                database = Some(db);
            }
        }

        let mut auth_plugin_name = None;
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !src.is_empty() {
            auth_plugin_name = Some(read_null_str(&mut src)?);
        }

        let mut connect_attrs = None;
        if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) && !src.is_empty() {
            connect_attrs = Some(src.to_vec());
        }

        Ok(Self {
            capabilities,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
            connect_attrs,
        })
    }

    pub fn write(&self, dst: &mut BytesMut) {
        let mut caps = self.capabilities;
        caps.set(CapabilityFlags::CLIENT_CONNECT_WITH_DB, self.database.is_some());
        caps.set(CapabilityFlags::CLIENT_CONNECT_ATTRS, self.connect_attrs.is_some());
        dst.put_u32_le(caps.bits());
        dst.put_u32_le(self.max_packet_size);
        dst.put_u8(self.character_set);
        dst.put_slice(&[0u8; 23]);
        write_null_str(dst, &self.username);
        if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            write_lenenc_str(dst, &self.auth_response);
        } else {
            dst.put_u8(self.auth_response.len() as u8);
            dst.put_slice(&self.auth_response);
        }
        if let Some(db) = &self.database {
            write_null_str(dst, db);
        }
        if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            write_null_str(dst, self.auth_plugin_name.as_deref().unwrap_or(""));
        }
        if let Some(attrs) = &self.connect_attrs {
            dst.put_slice(attrs);
        }
    }
}

/// Server request to redo authentication with another plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(mut src: BytesMut) -> Result<Self> {
        if src.first() != Some(&super::packets::EOF_HEADER) {
            return Err(WireError::Protocol("not an auth switch request".into()));
        }
        src.advance(1);
        let plugin_name = read_null_str(&mut src)?;
        let mut plugin_data = src.to_vec();
        if plugin_data.last() == Some(&0) {
            plugin_data.pop();
        }
        Ok(Self {
            plugin_name,
            plugin_data,
        })
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u8(super::packets::EOF_HEADER);
        write_null_str(dst, &self.plugin_name);
        dst.put_slice(&self.plugin_data);
        dst.put_u8(0);
    }
}
