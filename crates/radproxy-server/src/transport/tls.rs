//! RadSec transport: length-prefixed RADIUS frames over TLS (RFC 6614).
//!
//! Inbound, the listener accepts a TCP connection, matches the peer address
//! against TLS client configs, handshakes with the first match's context and
//! then iterates the matching configs until one's certificate constraints
//! accept the peer, so multiple clients may share an address. Outbound, a
//! [`TlsLink`] owns the session to one upstream: writes block through the
//! reconnect ladder until the session is up, and reconnect attempts are
//! serialized with a generation counter so racing tasks reconnect once.

use crate::cert;
use crate::config::{ConfigError, Transport};
use crate::peers::{self, PeerConfig};
use crate::server::ProxyState;
use crate::session::{self, ClientHandle, Upstream, UpstreamTransport};
use radproxy_proto::{Packet, PacketError};
use rustls_pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Instant};
use tokio_rustls::client;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

type ClientStream = client::TlsStream<TcpStream>;

/// Read one length-prefixed RADIUS frame. `Ok(None)` means the peer closed
/// the stream (EOF at a frame boundary or mid-frame). A frame declaring less
/// than the minimum RADIUS size is discarded; if its length field cannot
/// even cover the prefix the stream cannot be resynchronized and is closed.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    loop {
        let mut header = [0u8; 4];
        if let Err(error) = reader.read_exact(&mut header).await {
            return match error.kind() {
                std::io::ErrorKind::UnexpectedEof => Ok(None),
                _ => Err(error),
            };
        }
        let declared = match Packet::declared_length(&header) {
            Ok(declared) => declared,
            Err(PacketError::InvalidLength(declared)) => {
                warn!(declared, "frame smaller than minimum RADIUS size");
                if declared <= Packet::LENGTH_PREFIX {
                    return Ok(None);
                }
                let mut discard = vec![0u8; declared - Packet::LENGTH_PREFIX];
                if reader.read_exact(&mut discard).await.is_err() {
                    return Ok(None);
                }
                continue;
            }
            Err(_) => return Ok(None),
        };
        let mut frame = vec![0u8; declared];
        frame[..4].copy_from_slice(&header);
        return match reader.read_exact(&mut frame[4..]).await {
            Ok(_) => Ok(Some(frame)),
            Err(error) => match error.kind() {
                std::io::ErrorKind::UnexpectedEof => Ok(None),
                _ => Err(error),
            },
        };
    }
}

#[derive(Debug)]
struct LinkState {
    writer: Option<WriteHalf<ClientStream>>,
    /// Bumped on every successful reconnect; snapshots short-circuit
    /// redundant reconnect attempts
    generation: u64,
    last_success: Option<Instant>,
}

/// TLS session to one upstream server.
pub struct TlsLink {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    target: SocketAddr,
    source: Option<SocketAddr>,
    state: Mutex<LinkState>,
    read_tx: mpsc::UnboundedSender<ReadHalf<ClientStream>>,
    read_rx: Mutex<mpsc::UnboundedReceiver<ReadHalf<ClientStream>>>,
}

impl std::fmt::Debug for TlsLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsLink").field("target", &self.target).finish()
    }
}

impl TlsLink {
    pub fn new(conf: &PeerConfig, source: Option<SocketAddr>) -> Result<Self, ConfigError> {
        let target = conf.first_target().ok_or_else(|| {
            ConfigError::Invalid(format!("server '{}' has no resolved address", conf.name))
        })?;
        let context = conf.tls.as_ref().ok_or_else(|| {
            ConfigError::Invalid(format!("server '{}' has no TLS context", conf.name))
        })?;
        let server_name = ServerName::try_from(conf.host.clone()).map_err(|_| {
            ConfigError::Invalid(format!("server '{}': invalid TLS name '{}'", conf.name, conf.host))
        })?;
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        Ok(TlsLink {
            connector: context.connector.clone(),
            server_name,
            target,
            source,
            state: Mutex::new(LinkState {
                writer: None,
                generation: 0,
                last_success: None,
            }),
            read_tx,
            read_rx: Mutex::new(read_rx),
        })
    }

    async fn dial(&self) -> std::io::Result<TcpStream> {
        let socket = match self.target {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(source) = self.source {
            socket.bind(source)?;
        }
        socket.connect(self.target).await
    }

    /// (Re)establish the session. With a `snapshot` from a previous look at
    /// the generation counter, returns immediately if some other task has
    /// reconnected since. Otherwise loops with backoff until a connection is
    /// up and its certificate satisfies the server's identity constraints:
    /// 2 s when the link was recently up or just tried, else the elapsed
    /// time since the last success, capped at 60 s; the first attempt starts
    /// immediately.
    pub async fn connect(&self, server: &Upstream, snapshot: Option<u64>) {
        let mut state = self.state.lock().await;
        if let Some(generation) = snapshot {
            if state.generation != generation {
                debug!(server = %server.conf.name, "already reconnected");
                return;
            }
        }
        loop {
            if server.connection_ok.swap(false, Ordering::Relaxed) {
                sleep(Duration::from_secs(2)).await;
            } else if let Some(last) = state.last_success {
                let elapsed = Instant::now().duration_since(last);
                if elapsed < Duration::from_secs(1) {
                    sleep(Duration::from_secs(2)).await;
                } else {
                    let backoff = elapsed.min(Duration::from_secs(60));
                    info!(server = %server.conf.name, seconds = backoff.as_secs(), "reconnect backoff");
                    sleep(backoff).await;
                }
            }
            warn!(server = %server.conf.name, target = %self.target, "trying to open TLS connection");

            let tcp = match self.dial().await {
                Ok(tcp) => tcp,
                Err(error) => {
                    warn!(server = %server.conf.name, %error, "connect failed");
                    continue;
                }
            };
            let stream = match self.connector.connect(self.server_name.clone(), tcp).await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(server = %server.conf.name, %error, "TLS handshake failed");
                    continue;
                }
            };
            let identity_ok = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|leaf| cert::verify_identity(leaf, &server.conf))
                .unwrap_or(false);
            if !identity_ok {
                info!(server = %server.conf.name, "server certificate failed identity binding");
                continue;
            }

            let (read_half, write_half) = tokio::io::split(stream);
            state.writer = Some(write_half);
            state.generation += 1;
            state.last_success = Some(Instant::now());
            let _ = self.read_tx.send(read_half);
            warn!(server = %server.conf.name, target = %self.target, "TLS connection up");
            return;
        }
    }

    /// Write one frame, reconnecting (and blocking) as long as it takes.
    pub async fn write(&self, server: &Arc<Upstream>, buf: &[u8]) {
        loop {
            let generation = {
                let mut state = self.state.lock().await;
                if let Some(writer) = state.writer.as_mut() {
                    let result = async {
                        writer.write_all(buf).await?;
                        writer.flush().await
                    }
                    .await;
                    match result {
                        Ok(()) => {
                            debug!(server = %server.conf.name, bytes = buf.len(), "sent TLS request");
                            return;
                        }
                        Err(error) => {
                            warn!(server = %server.conf.name, %error, "TLS write failed");
                            state.writer = None;
                        }
                    }
                }
                state.generation
            };
            self.connect(server, Some(generation)).await;
        }
    }
}

/// Reader task for one TLS upstream: correlates replies, and on session loss
/// drives the reconnect state machine before picking up the next session's
/// read half.
pub async fn upstream_reader(server: Arc<Upstream>) {
    let UpstreamTransport::Tls(link) = &server.transport else {
        return;
    };
    let mut slots = link.read_rx.lock().await;
    let Some(mut reader) = slots.recv().await else {
        return;
    };
    loop {
        let generation = link.state.lock().await.generation;
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => match Packet::from_frame(frame) {
                Ok(packet) => session::replyh(&server, packet).await,
                Err(error) => {
                    warn!(server = %server.conf.name, %error, "invalid frame from server")
                }
            },
            _ => {
                debug!(server = %server.conf.name, "connection lost");
                link.connect(&server, Some(generation)).await;
                reader = match slots.recv().await {
                    Some(reader) => reader,
                    None => return,
                };
            }
        }
    }
}

/// Accept loop for inbound RadSec connections.
pub async fn tls_listener(state: Arc<ProxyState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(serve_inbound(state.clone(), stream, peer));
            }
            Err(error) => warn!(%error, "accept failed"),
        }
    }
}

/// One accepted connection: handshake, certificate identity binding with
/// config iteration, then a reader loop feeding the ingress pipeline and a
/// writer task draining the connection's reply queue.
async fn serve_inbound(state: Arc<ProxyState>, tcp: TcpStream, peer: SocketAddr) {
    info!(peer = %peer, "incoming TLS connection");
    let Some(first) = peers::find_peer(&state.clients, Transport::Tls, peer.ip(), 0) else {
        warn!(peer = %peer, "ignoring connection, not a known TLS client");
        return;
    };

    let acceptor = {
        let conf = &state.clients[first];
        match &conf.tls {
            Some(context) => context.acceptor.clone(),
            None => {
                warn!(client = %conf.name, "TLS client without TLS context");
                return;
            }
        }
    };
    let stream = match acceptor.accept(tcp).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(peer = %peer, %error, "TLS accept failed");
            return;
        }
    };
    let Some(leaf) = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.to_vec())
    else {
        warn!(peer = %peer, "no client certificate presented");
        return;
    };

    let mut matched = None;
    let mut index = first;
    loop {
        let candidate = &state.clients[index];
        if cert::verify_identity(&leaf, candidate) {
            matched = Some(candidate.clone());
            break;
        }
        match peers::find_peer(&state.clients, Transport::Tls, peer.ip(), index + 1) {
            Some(next) => index = next,
            None => break,
        }
    }
    let Some(conf) = matched else {
        warn!(peer = %peer, "ignoring connection, no matching TLS client");
        return;
    };
    debug!(peer = %peer, client = %conf.name, "TLS client accepted");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Arc::new(ClientHandle::new(conf, tx));
    let (mut reader, mut writer) = tokio::io::split(stream);

    let writer_task = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            if let Err(error) = writer.write_all(&reply.buf).await {
                warn!(%error, "TLS write failed");
                continue;
            }
            if let Err(error) = writer.flush().await {
                warn!(%error, "TLS flush failed");
            }
        }
        // queue drained and reader gone; say goodbye properly
        let _ = writer.shutdown().await;
    });

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => match Packet::from_frame(frame) {
                Ok(packet) => session::radsrv(&state.realms, &client, None, packet).await,
                Err(error) => warn!(peer = %peer, %error, "invalid frame from client"),
            },
            Ok(None) => break,
            Err(error) => {
                warn!(peer = %peer, %error, "read failed");
                break;
            }
        }
    }

    // detach outstanding request slots before the client goes away
    for upstream in &state.upstreams {
        upstream.table.lock().await.purge_client(&client);
    }
    drop(client);
    let _ = writer_task.await;
    info!(peer = %peer, "TLS client disconnected");
}
