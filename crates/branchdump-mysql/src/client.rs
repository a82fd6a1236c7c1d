use crate::error::{Result, WireError};
use crate::protocol::handshake::{DEFAULT_CHARSET, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::packets::{
    read_lenenc_int, EOFPacket, ERR_HEADER, EOF_HEADER, OK_HEADER, SERVER_MORE_RESULTS_EXISTS,
};
use crate::protocol::{
    AuthMethod, AuthSwitchRequest, CapabilityFlags, Command, ERRPacket, HandshakeResponse41,
    HandshakeV10, OKPacket, Packet, PacketCodec,
};
use branchdump_core::Secret;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

const AUTH_MORE_DATA: u8 = 0x01;
const FAST_AUTH_SUCCESS: u8 = 0x03;

pub type PacketStream<S> = Framed<S, PacketCodec>;

pub(crate) async fn next_packet<S>(framed: &mut PacketStream<S>) -> Result<Packet>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(packet) => packet,
        None => Err(WireError::Closed),
    }
}

pub(crate) fn packet_from<F>(seq_id: u8, write: F) -> Packet
where
    F: FnOnce(&mut BytesMut),
{
    let mut payload = BytesMut::new();
    write(&mut payload);
    Packet::new(seq_id, payload)
}

/// What a client presents when logging in.
#[derive(Debug, Clone)]
pub struct LoginOptions {
    pub username: String,
    pub password: Secret,
    pub database: Option<String>,
    pub capabilities: CapabilityFlags,
    pub character_set: Option<u8>,
}

impl LoginOptions {
    pub fn new(username: impl Into<String>, password: Secret) -> Self {
        Self {
            username: username.into(),
            password,
            database: None,
            capabilities: CapabilityFlags::relay_default(),
            character_set: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

/// Result of a successful connection phase.
#[derive(Debug)]
pub struct Login {
    pub greeting: HandshakeV10,
    /// Raw OK payload that ended authentication.
    pub ok: BytesMut,
}

/// Runs the client side of the connection phase on an already open stream.
///
/// Handles the auth switch to `mysql_native_password`/`mysql_clear_password`
/// and the caching_sha2 fast-auth shortcut. Server rejections come back as
/// [`WireError::Server`] so callers can forward them verbatim.
pub async fn login<S>(framed: &mut PacketStream<S>, opts: &LoginOptions) -> Result<Login>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting_packet = next_packet(framed).await?;
    let greeting_seq = greeting_packet.seq_id();
    let greeting = HandshakeV10::parse(greeting_packet.payload)?;
    if !greeting.capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        return Err(WireError::Protocol("server does not speak protocol 4.1".into()));
    }

    let method = AuthMethod::from_plugin_name(&greeting.auth_plugin_name).unwrap_or_default();
    let capabilities = (opts.capabilities & greeting.capabilities & !CapabilityFlags::relay_forbidden())
        | CapabilityFlags::CLIENT_PROTOCOL_41;
    let response = HandshakeResponse41 {
        capabilities,
        max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        character_set: opts.character_set.unwrap_or(DEFAULT_CHARSET),
        username: opts.username.clone(),
        auth_response: method.respond(opts.password.expose(), greeting.salt()),
        database: opts.database.clone(),
        auth_plugin_name: Some(method.plugin_name().to_string()),
        connect_attrs: None,
    };
    framed
        .send(packet_from(greeting_seq.wrapping_add(1), |b| response.write(b)))
        .await?;

    loop {
        let packet = next_packet(framed).await?;
        match packet.payload.first().copied() {
            Some(OK_HEADER) => {
                return Ok(Login {
                    greeting,
                    ok: packet.payload,
                })
            }
            Some(ERR_HEADER) => return Err(ERRPacket::parse(packet.payload)?.into()),
            Some(EOF_HEADER) => {
                let switch = AuthSwitchRequest::parse(packet.payload.clone())?;
                let method = AuthMethod::from_plugin_name(&switch.plugin_name).ok_or_else(|| {
                    WireError::Auth(format!("unsupported auth plugin '{}'", switch.plugin_name))
                })?;
                debug!(plugin = %switch.plugin_name, "server requested auth switch");
                let reply = method.respond(opts.password.expose(), &switch.plugin_data);
                framed
                    .send(packet_from(packet.seq_id().wrapping_add(1), |b| b.extend_from_slice(&reply)))
                    .await?;
            }
            Some(AUTH_MORE_DATA) if packet.payload.get(1) == Some(&FAST_AUTH_SUCCESS) => continue,
            Some(AUTH_MORE_DATA) => {
                return Err(WireError::Auth(
                    "server requires full caching_sha2_password authentication".into(),
                ))
            }
            _ => return Err(WireError::Protocol("unexpected packet during authentication".into())),
        }
    }
}

/// Totals over every result of one query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub affected_rows: u64,
    pub warnings: u64,
    pub rows: u64,
}

/// A plain client session, used by the loader to replay statements.
pub struct Connection {
    framed: PacketStream<TcpStream>,
    connection_id: u32,
    server_version: String,
}

impl Connection {
    pub async fn connect(addr: &str, opts: &LoginOptions, timeout: Duration) -> Result<Self> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", addr),
                )))
            }
        };
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, PacketCodec);
        let login = match tokio::time::timeout(timeout, login(&mut framed, opts)).await {
            Ok(login) => login?,
            Err(_) => {
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("login to {} timed out", addr),
                )))
            }
        };
        debug!(
            addr,
            connection_id = login.greeting.connection_id,
            server_version = %login.greeting.server_version,
            "connected"
        );
        Ok(Self {
            framed,
            connection_id: login.greeting.connection_id,
            server_version: login.greeting.server_version,
        })
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    async fn send_command(&mut self, command: Command) -> Result<()> {
        self.framed.send(packet_from(0, |b| command.write(b))).await
    }

    async fn read_ok(&mut self) -> Result<OKPacket> {
        let packet = next_packet(&mut self.framed).await?;
        if packet.is_err() {
            return Err(ERRPacket::parse(packet.payload)?.into());
        }
        OKPacket::parse(packet.payload)
    }

    /// Runs one COM_QUERY and drains every result it produces.
    ///
    /// A server ERR leaves the session usable; see [`WireError::is_recoverable`].
    pub async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        self.send_command(Command::Query { query: sql.to_string() }).await?;

        let mut result = QueryResult::default();
        loop {
            let packet = next_packet(&mut self.framed).await?;
            let status = if packet.is_err() {
                return Err(ERRPacket::parse(packet.payload)?.into());
            } else if packet.is_ok() {
                let ok = OKPacket::parse(packet.payload)?;
                result.affected_rows += ok.affected_rows;
                result.warnings += ok.warnings as u64;
                ok.status_flags
            } else {
                self.drain_result_set(packet, &mut result).await?
            };
            if status & SERVER_MORE_RESULTS_EXISTS == 0 {
                return Ok(result);
            }
        }
    }

    async fn drain_result_set(&mut self, header: Packet, result: &mut QueryResult) -> Result<u16> {
        let mut payload = header.payload;
        let columns = read_lenenc_int(&mut payload)?
            .ok_or_else(|| WireError::Protocol("missing column count".into()))?;
        for _ in 0..columns {
            next_packet(&mut self.framed).await?;
        }
        let eof = next_packet(&mut self.framed).await?;
        if !eof.is_eof() {
            return Err(WireError::Protocol("expected EOF after column definitions".into()));
        }
        loop {
            let row = next_packet(&mut self.framed).await?;
            if row.is_eof() {
                let eof = EOFPacket::parse(row.payload)?;
                result.warnings += eof.warnings as u64;
                return Ok(eof.status_flags);
            }
            if row.is_err() {
                return Err(ERRPacket::parse(row.payload)?.into());
            }
            result.rows += 1;
        }
    }

    pub async fn select_db(&mut self, database: &str) -> Result<()> {
        self.send_command(Command::InitDb {
            schema: database.to_string(),
        })
        .await?;
        self.read_ok().await.map(|_| ())
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.send_command(Command::Ping).await?;
        self.read_ok().await.map(|_| ())
    }

    /// Sends COM_QUIT and closes the socket.
    pub async fn quit(mut self) -> Result<()> {
        self.send_command(Command::Quit).await?;
        self.framed.close().await
    }
}
