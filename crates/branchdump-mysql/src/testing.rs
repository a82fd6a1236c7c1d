//! Scripted in-process MySQL server for tests.
//!
//! Speaks just enough of the protocol to log in with `mysql_native_password`
//! and answer the statements a dump replay sends. It keeps a catalog of table
//! names so schema collisions and missing tables behave like a real server.

use crate::client::{next_packet, packet_from, PacketStream};
use crate::error::{Result, WireError};
use crate::protocol::auth::{generate_salt, NATIVE_PASSWORD_PLUGIN};
use crate::protocol::packets::{
    write_lenenc_int, write_lenenc_str, EOFPacket, ER_NO_SUCH_TABLE, ER_TABLE_EXISTS,
    SERVER_STATUS_AUTOCOMMIT,
};
use crate::protocol::{
    AuthMethod, AuthSwitchRequest, Authenticator, Command, ERRPacket, HandshakeResponse41,
    HandshakeV10, OKPacket, PacketCodec,
};
use branchdump_core::Secret;
use bytes::BufMut;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const ER_PARSE_ERROR: u16 = 1064;
const ER_BAD_TABLE: u16 = 1051;
const ER_UNKNOWN_COM: u16 = 1047;

#[derive(Debug, Clone)]
pub struct FakeUpstreamConfig {
    pub username: String,
    pub password: Secret,
    /// Tables that already exist when the server starts.
    pub tables: Vec<String>,
    /// Statements containing any of these substrings fail with a syntax error.
    pub fail_on: Vec<String>,
    /// Statements containing any of these substrings drop the connection.
    pub disconnect_on: Vec<String>,
    /// Delay applied before answering each query.
    pub query_delay: Option<Duration>,
    /// Greet with `caching_sha2_password` and switch to native auth.
    pub auth_switch: bool,
}

impl FakeUpstreamConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password),
            tables: Vec::new(),
            fail_on: Vec::new(),
            disconnect_on: Vec::new(),
            query_delay: None,
            auth_switch: false,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }

    pub fn fail_on(mut self, pattern: impl Into<String>) -> Self {
        self.fail_on.push(pattern.into());
        self
    }

    pub fn disconnect_on(mut self, pattern: impl Into<String>) -> Self {
        self.disconnect_on.push(pattern.into());
        self
    }

    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = Some(delay);
        self
    }

    pub fn with_auth_switch(mut self) -> Self {
        self.auth_switch = true;
        self
    }
}

#[derive(Debug, Default)]
struct UpstreamState {
    tables: BTreeSet<String>,
    statements: Vec<String>,
    logins: usize,
    rejected_logins: usize,
}

enum Reply {
    Ok(u64),
    Err(ERRPacket),
    Rows,
    Disconnect,
}

struct Inner {
    config: FakeUpstreamConfig,
    state: Mutex<UpstreamState>,
}

/// Handle to a running fake server. Dropping it stops the server.
pub struct FakeUpstream {
    addr: SocketAddr,
    inner: Arc<Inner>,
    shutdown: CancellationToken,
}

impl FakeUpstream {
    pub async fn start(config: FakeUpstreamConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = UpstreamState {
            tables: config.tables.iter().cloned().collect(),
            ..Default::default()
        };
        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(state),
        });
        let shutdown = CancellationToken::new();

        let accept_inner = inner.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut next_id = 100u32;
            loop {
                let (socket, _) = tokio::select! {
                    _ = accept_shutdown.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(_) => return,
                    },
                };
                let inner = accept_inner.clone();
                let cancel = accept_shutdown.clone();
                let id = next_id;
                next_id = next_id.wrapping_add(1);
                tokio::spawn(async move {
                    let _ = inner.serve_client(socket, id, cancel).await;
                });
            }
        });

        Ok(Self {
            addr,
            inner,
            shutdown,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every COM_QUERY received, in arrival order.
    pub fn statements(&self) -> Vec<String> {
        self.inner.state.lock().statements.clone()
    }

    pub fn statements_containing(&self, needle: &str) -> usize {
        self.inner
            .state
            .lock()
            .statements
            .iter()
            .filter(|s| s.contains(needle))
            .count()
    }

    pub fn tables(&self) -> Vec<String> {
        self.inner.state.lock().tables.iter().cloned().collect()
    }

    pub fn logins(&self) -> usize {
        self.inner.state.lock().logins
    }

    pub fn rejected_logins(&self) -> usize {
        self.inner.state.lock().rejected_logins
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Inner {
    async fn serve_client(&self, socket: TcpStream, id: u32, cancel: CancellationToken) -> Result<()> {
        let mut framed = Framed::new(socket, PacketCodec);
        if !self.handshake(&mut framed, id).await? {
            return Ok(());
        }

        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                packet = framed.next() => match packet {
                    Some(packet) => packet?,
                    None => return Ok(()),
                },
            };
            let seq = packet.seq_id().wrapping_add(1);
            let command = Command::parse(&packet.payload)?
                .ok_or_else(|| WireError::Protocol("empty command".into()))?;
            let reply = match command {
                Command::Quit => return Ok(()),
                Command::Ping | Command::InitDb { .. } => Reply::Ok(0),
                Command::Query { query } => {
                    if let Some(delay) = self.config.query_delay {
                        tokio::time::sleep(delay).await;
                    }
                    self.execute(&query)
                }
                Command::Other(cmd) => Reply::Err(ERRPacket::new(
                    ER_UNKNOWN_COM,
                    "08S01",
                    format!("Unknown command {:#04x}", cmd),
                )),
            };
            match reply {
                Reply::Ok(affected_rows) => {
                    let ok = OKPacket {
                        affected_rows,
                        status_flags: SERVER_STATUS_AUTOCOMMIT,
                        ..Default::default()
                    };
                    framed.send(packet_from(seq, |b| ok.write(b))).await?;
                }
                Reply::Err(err) => framed.send(packet_from(seq, |b| err.write(b))).await?,
                Reply::Rows => send_single_row(&mut framed, seq).await?,
                Reply::Disconnect => return Ok(()),
            }
        }
    }

    /// Returns `false` when the client was rejected.
    async fn handshake(&self, framed: &mut PacketStream<TcpStream>, id: u32) -> Result<bool> {
        let mut salt = generate_salt();
        let plugin = if self.config.auth_switch {
            "caching_sha2_password"
        } else {
            NATIVE_PASSWORD_PLUGIN
        };
        let greeting = HandshakeV10::new(id, &salt, "8.0.34-fake", plugin);
        framed.send(packet_from(0, |b| greeting.write(b))).await?;

        let packet = next_packet(framed).await?;
        let mut seq = packet.seq_id().wrapping_add(1);
        let response = HandshakeResponse41::parse(packet.payload)?;
        let mut auth_response = response.auth_response.clone();

        if self.config.auth_switch {
            salt = generate_salt();
            let switch = AuthSwitchRequest {
                plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
                plugin_data: salt.to_vec(),
            };
            framed.send(packet_from(seq, |b| switch.write(b))).await?;
            let reply = next_packet(framed).await?;
            seq = reply.seq_id().wrapping_add(1);
            auth_response = reply.payload.to_vec();
        }

        let authenticator = Authenticator::new(
            AuthMethod::NativePassword,
            self.config.username.clone(),
            self.config.password.clone(),
        );
        if !authenticator.verify(&response.username, &auth_response, &salt) {
            self.state.lock().rejected_logins += 1;
            let denied = ERRPacket::access_denied(&response.username, "localhost");
            framed.send(packet_from(seq, |b| denied.write(b))).await?;
            return Ok(false);
        }

        self.state.lock().logins += 1;
        let ok = OKPacket {
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        };
        framed.send(packet_from(seq, |b| ok.write(b))).await?;
        Ok(true)
    }

    fn execute(&self, sql: &str) -> Reply {
        let mut state = self.state.lock();
        state.statements.push(sql.to_string());

        if self.config.disconnect_on.iter().any(|p| sql.contains(p.as_str())) {
            return Reply::Disconnect;
        }
        if let Some(pattern) = self.config.fail_on.iter().find(|p| sql.contains(p.as_str())) {
            return Reply::Err(ERRPacket::new(
                ER_PARSE_ERROR,
                "42000",
                format!("You have an error in your SQL syntax near '{}'", pattern),
            ));
        }

        let words: Vec<&str> = sql.split_whitespace().take(8).collect();
        let keyword = |i: usize| words.get(i).map(|w| w.to_ascii_uppercase()).unwrap_or_default();
        match (keyword(0).as_str(), keyword(1).as_str()) {
            ("CREATE", "TABLE") => {
                let (_, name) = object_name(&words[2..]);
                let Some(name) = name else {
                    return Reply::Err(ERRPacket::new(ER_PARSE_ERROR, "42000", "missing table name"));
                };
                if !state.tables.insert(name.clone()) {
                    return Reply::Err(ERRPacket::new(
                        ER_TABLE_EXISTS,
                        "42S01",
                        format!("Table '{}' already exists", name),
                    ));
                }
                Reply::Ok(0)
            }
            ("DROP", "TABLE") => {
                let (if_exists, name) = object_name(&words[2..]);
                let Some(name) = name else {
                    return Reply::Err(ERRPacket::new(ER_PARSE_ERROR, "42000", "missing table name"));
                };
                if !state.tables.remove(&name) && !if_exists {
                    return Reply::Err(ERRPacket::new(
                        ER_BAD_TABLE,
                        "42S02",
                        format!("Unknown table '{}'", name),
                    ));
                }
                Reply::Ok(0)
            }
            ("INSERT", _) => {
                let into = words.iter().position(|w| w.eq_ignore_ascii_case("INTO"));
                let name = into.and_then(|i| object_name(&words[i + 1..]).1);
                match name {
                    Some(name) if state.tables.contains(&name) => {
                        Reply::Ok(sql.matches("),(").count() as u64 + 1)
                    }
                    Some(name) => Reply::Err(ERRPacket::new(
                        ER_NO_SUCH_TABLE,
                        "42S02",
                        format!("Table '{}' doesn't exist", name),
                    )),
                    None => Reply::Err(ERRPacket::new(ER_PARSE_ERROR, "42000", "missing table name")),
                }
            }
            ("SELECT", _) => Reply::Rows,
            _ => Reply::Ok(0),
        }
    }
}

/// Table name following `TABLE`/`INTO`, skipping `IF [NOT] EXISTS` and any
/// schema qualifier. The flag reports whether an `IF` clause was present.
fn object_name(words: &[&str]) -> (bool, Option<String>) {
    let mut rest = words;
    let mut conditional = false;
    if rest.first().is_some_and(|w| w.eq_ignore_ascii_case("IF")) {
        conditional = true;
        let exists = rest.iter().position(|w| w.eq_ignore_ascii_case("EXISTS"));
        rest = match exists {
            Some(i) => &rest[i + 1..],
            None => &[],
        };
    }
    let name = rest.first().and_then(|word| {
        let word = word.split('(').next().unwrap_or(word);
        let table = word.rsplit('.').next().unwrap_or(word);
        let table = table.trim_end_matches(';').trim_matches('`');
        (!table.is_empty()).then(|| table.to_string())
    });
    (conditional, name)
}

async fn send_single_row(framed: &mut PacketStream<TcpStream>, seq: u8) -> Result<()> {
    framed.send(packet_from(seq, |b| write_lenenc_int(b, 1))).await?;
    framed
        .send(packet_from(seq.wrapping_add(1), |b| {
            for part in ["def", "", "", "", "1", "1"] {
                write_lenenc_str(b, part.as_bytes());
            }
            b.put_u8(0x0c);
            b.put_u16_le(63);
            b.put_u32_le(1);
            b.put_u8(0x08);
            b.put_u16_le(0);
            b.put_u8(0);
            b.put_u16_le(0);
        }))
        .await?;
    let eof = EOFPacket {
        warnings: 0,
        status_flags: SERVER_STATUS_AUTOCOMMIT,
    };
    framed.send(packet_from(seq.wrapping_add(2), |b| eof.write(b))).await?;
    framed
        .send(packet_from(seq.wrapping_add(3), |b| write_lenenc_str(b, b"1")))
        .await?;
    framed.send(packet_from(seq.wrapping_add(4), |b| eof.write(b))).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name() {
        assert_eq!(object_name(&["`users`", "("]), (false, Some("users".to_string())));
        assert_eq!(object_name(&["IF", "EXISTS", "`db`.`logs`;"]), (true, Some("logs".to_string())));
        assert_eq!(object_name(&["IF", "NOT", "EXISTS", "t(id"]), (true, Some("t".to_string())));
        assert_eq!(object_name(&[]), (false, None));
    }
}
