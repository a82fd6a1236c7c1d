//! Local endpoint that authenticates MySQL clients against the branch credential
//! and then pipes their bytes, unmodified, to the remote branch.

use crate::client::{login, next_packet, packet_from, LoginOptions, PacketStream};
use crate::error::WireError;
use crate::protocol::auth::generate_salt;
use crate::protocol::packets::CR_CONN_HOST_ERROR;
use crate::protocol::{
    AuthMethod, AuthSwitchRequest, Authenticator, CapabilityFlags, ERRPacket, HandshakeResponse41,
    HandshakeV10, Packet, PacketCodec,
};
use branchdump_core::{Credential, RestoreError, Secret};
use futures::SinkExt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Bind Error: could not listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Listen Error: {0}")]
    Listen(#[source] io::Error),
}

impl From<RelayError> for RestoreError {
    fn from(err: RelayError) -> Self {
        RestoreError::Connection(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `host:port` of the remote branch.
    pub upstream_addr: String,
    /// Credential accepted from local clients and presented upstream.
    pub username: String,
    pub password: Secret,
    pub server_version: String,
    /// Bound on dialing upstream and on each side of the handshake.
    pub connect_timeout: Duration,
    /// How long `serve` waits for open connections after shutdown.
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    pub fn from_credential(credential: &Credential, upstream_override: Option<String>) -> Self {
        Self {
            upstream_addr: upstream_override.unwrap_or_else(|| credential.remote_addr()),
            username: credential.username.clone(),
            password: credential.secret.clone(),
            server_version: "8.0.34-branchdump".to_string(),
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// A bound listening socket whose address is known before anyone connects.
#[derive(Debug)]
pub struct RelayListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RelayListener {
    /// Binds `addr`; a `host:0` address picks an ephemeral port.
    pub async fn bind(addr: &str) -> Result<Self, RelayError> {
        let bind_err = |source| RelayError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Accept errors that concern a single half-open connection, not the listener.
fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

pub struct Relay {
    config: Arc<RelayConfig>,
    next_connection_id: AtomicU32,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            next_connection_id: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Accepts and relays connections until `shutdown` fires.
    ///
    /// Returns `Ok(())` for a requested shutdown and `Err(Listen)` when the
    /// listener itself fails. Connection-level failures are logged and only end
    /// that connection. The listener is closed before this returns.
    pub async fn serve(
        &self,
        listener: RelayListener,
        method: AuthMethod,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError> {
        let authenticator = Arc::new(Authenticator::new(
            method,
            self.config.username.clone(),
            self.config.password.clone(),
        ));
        let connections = shutdown.child_token();
        let tracker = TaskTracker::new();
        info!(addr = %listener.local_addr, upstream = %self.config.upstream_addr, "relay listening");

        let result = loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = listener.listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    let config = self.config.clone();
                    let authenticator = authenticator.clone();
                    let cancel = connections.clone();
                    tracker.spawn(async move {
                        debug!(%peer, connection_id, "relay connection accepted");
                        match handle_connection(socket, peer, connection_id, config, authenticator, cancel).await {
                            Ok(()) => debug!(%peer, connection_id, "relay connection closed"),
                            Err(e) => warn!(%peer, connection_id, "relay connection failed: {}", e),
                        }
                    });
                }
                Err(e) if is_connection_error(&e) => {
                    debug!("accept failed for one connection: {}", e);
                }
                Err(e) => break Err(RelayError::Listen(e)),
            };
        };

        drop(listener);
        connections.cancel();
        tracker.close();
        if tokio::time::timeout(self.config.shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            warn!("relay connections still open after {:?}", self.config.shutdown_grace);
        }
        info!("relay stopped");
        result
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    connection_id: u32,
    config: Arc<RelayConfig>,
    authenticator: Arc<Authenticator>,
    cancel: CancellationToken,
) -> Result<(), WireError> {
    socket.set_nodelay(true)?;
    let mut client = Framed::new(socket, PacketCodec);

    let handshake = authenticate(&mut client, peer, connection_id, &config, &authenticator);
    let upstream = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        res = tokio::time::timeout(config.connect_timeout * 2, handshake) => match res {
            Ok(upstream) => upstream?,
            Err(_) => return Err(WireError::Protocol("handshake timed out".into())),
        },
    };

    let client_parts = client.into_parts();
    let upstream_parts = upstream.into_parts();
    let mut client_io = client_parts.io;
    let mut upstream_io = upstream_parts.io;
    // Bytes read past the handshake belong to the other side.
    if !client_parts.read_buf.is_empty() {
        upstream_io.write_all(&client_parts.read_buf).await?;
    }
    if !upstream_parts.read_buf.is_empty() {
        client_io.write_all(&upstream_parts.read_buf).await?;
    }

    tokio::select! {
        res = tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io) => {
            let (sent, received) = res?;
            debug!(%peer, connection_id, sent, received, "relay stream finished");
        }
        _ = cancel.cancelled() => {
            debug!(%peer, connection_id, "relay connection closed on shutdown");
        }
    }
    Ok(())
}

/// Authenticates the local client, then logs in upstream with the same
/// credential. On success the client has received the upstream OK packet.
async fn authenticate(
    client: &mut PacketStream<TcpStream>,
    peer: SocketAddr,
    connection_id: u32,
    config: &RelayConfig,
    authenticator: &Authenticator,
) -> Result<PacketStream<TcpStream>, WireError> {
    let salt = generate_salt();
    let method = authenticator.method();
    let greeting = HandshakeV10::new(connection_id, &salt, &config.server_version, method.plugin_name());
    client.send(packet_from(0, |b| greeting.write(b))).await?;

    let response_packet = next_packet(client).await?;
    let mut seq = response_packet.seq_id().wrapping_add(1);
    let response = HandshakeResponse41::parse(response_packet.payload)?;

    let mut auth_response = response.auth_response.clone();
    if response
        .auth_plugin_name
        .as_deref()
        .is_some_and(|plugin| plugin != method.plugin_name())
    {
        let switch = AuthSwitchRequest {
            plugin_name: method.plugin_name().to_string(),
            plugin_data: salt.to_vec(),
        };
        client.send(packet_from(seq, |b| switch.write(b))).await?;
        let reply = next_packet(client).await?;
        seq = reply.seq_id().wrapping_add(1);
        auth_response = reply.payload.to_vec();
    }

    if !authenticator.verify(&response.username, &auth_response, &salt) {
        let denied = ERRPacket::access_denied(&response.username, &peer.ip().to_string());
        client.send(packet_from(seq, |b| denied.write(b))).await?;
        return Err(WireError::Auth(format!("rejected local user '{}'", response.username)));
    }

    let upstream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.upstream_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            reject(client, seq, format!("unable to reach {}: {}", config.upstream_addr, e)).await?;
            return Err(e.into());
        }
        Err(_) => {
            reject(client, seq, format!("timed out connecting to {}", config.upstream_addr)).await?;
            return Err(WireError::Protocol("upstream connect timed out".into()));
        }
    };
    upstream.set_nodelay(true)?;
    let mut upstream = Framed::new(upstream, PacketCodec);

    let opts = LoginOptions {
        username: config.username.clone(),
        password: config.password.clone(),
        database: response.database.clone(),
        capabilities: response.capabilities & CapabilityFlags::relay_default(),
        character_set: Some(response.character_set),
    };
    match login(&mut upstream, &opts).await {
        Ok(login) => {
            debug!(
                %peer,
                connection_id,
                upstream_connection_id = login.greeting.connection_id,
                "relay connection authenticated"
            );
            client.send(Packet::new(seq, login.ok)).await?;
            Ok(upstream)
        }
        Err(WireError::Server { code, state, message }) => {
            let err = ERRPacket::new(code, &state, message.clone());
            client.send(packet_from(seq, |b| err.write(b))).await?;
            Err(WireError::Server { code, state, message })
        }
        Err(e) => {
            reject(client, seq, format!("upstream handshake failed: {}", e)).await?;
            Err(e)
        }
    }
}

async fn reject(client: &mut PacketStream<TcpStream>, seq: u8, message: String) -> Result<(), WireError> {
    let err = ERRPacket::new(CR_CONN_HOST_ERROR, "HY000", message);
    client.send(packet_from(seq, |b| err.write(b))).await
}
