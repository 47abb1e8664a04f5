//! Peer sessions: the ingress pipeline, the reply pipeline, and the
//! per-upstream writer task.
//!
//! `radsrv` carries an accepted request from a client to an upstream's
//! request table: integrity checks, inbound rewrite, realm routing,
//! duplicate suppression and per-hop re-encryption of confidential
//! attributes. `replyh` carries a response back: correlation by outbound
//! identifier, integrity checks, outbound rewrite, MS-MPPE re-encryption
//! and restoration of the original identifier, authenticator and username.
//! `client_writer` drives retransmission and Status-Server probing for one
//! upstream.

use crate::peers::PeerConfig;
use crate::realm::{self, Realm};
use crate::table::{
    InsertOutcome, PendingRequest, RequestTable, MAX_REQUESTS, REQUEST_EXPIRY, REQUEST_RETRIES,
};
use crate::transport::tls::{self, TlsLink};
use radproxy_proto::{
    attrs, auth, message_auth, password, rewrite, AttributeType, Code, Packet,
};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Liveness probe interval for upstreams with `status_server` enabled
pub const STATUS_SERVER_PERIOD: Duration = Duration::from_secs(25);

/// An outbound reply: packet bytes plus the destination address for UDP
/// clients (TLS clients write to their connection).
#[derive(Debug)]
pub struct Reply {
    pub buf: Vec<u8>,
    pub dest: Option<SocketAddr>,
}

/// Runtime counterpart of an inbound peer admitting traffic. UDP clients are
/// created on first datagram and share their listener's reply queue; TLS
/// clients live for one accepted connection and own its queue.
#[derive(Debug)]
pub struct ClientHandle {
    pub conf: Arc<PeerConfig>,
    replies: mpsc::UnboundedSender<Reply>,
}

impl ClientHandle {
    pub fn new(conf: Arc<PeerConfig>, replies: mpsc::UnboundedSender<Reply>) -> Self {
        ClientHandle { conf, replies }
    }

    /// Sign the reply under this client's secret and queue it for the
    /// client's writer. The request authenticator must already sit at
    /// offset 4.
    pub fn enqueue_reply(&self, mut buf: Vec<u8>, dest: Option<SocketAddr>) {
        auth::sign_response(&mut buf, &self.conf.secret);
        if self.replies.send(Reply { buf, dest }).is_err() {
            debug!(client = %self.conf.name, "client writer gone, dropping reply");
        }
    }
}

/// How an upstream is reached on the wire.
#[derive(Debug)]
pub enum UpstreamTransport {
    /// Shared per-family demux socket and the server's resolved address
    Udp {
        socket: Arc<UdpSocket>,
        target: SocketAddr,
    },
    Tls(TlsLink),
}

/// Runtime counterpart of an upstream server: its request table, writer
/// wakeup, and liveness state feeding realm failover.
#[derive(Debug)]
pub struct Upstream {
    pub conf: Arc<PeerConfig>,
    pub table: Mutex<RequestTable>,
    pub new_request: Notify,
    pub connection_ok: AtomicBool,
    /// Consecutive unanswered Status-Server probes, saturating at 255
    pub lost_status: AtomicU8,
    pub transport: UpstreamTransport,
}

impl Upstream {
    pub fn new(conf: Arc<PeerConfig>, transport: UpstreamTransport) -> Self {
        Upstream {
            conf,
            table: Mutex::new(RequestTable::new()),
            new_request: Notify::new(),
            connection_ok: AtomicBool::new(false),
            lost_status: AtomicU8::new(0),
            transport,
        }
    }

    /// Any valid reply proves the server is alive.
    pub fn mark_alive(&self) {
        self.connection_ok.store(true, Ordering::Relaxed);
        self.lost_status.store(0, Ordering::Relaxed);
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.transport, UpstreamTransport::Tls(_))
    }

    /// Insert a request into the table and wake the writer.
    pub async fn enqueue(&self, request: PendingRequest) -> InsertOutcome {
        let outcome = self.table.lock().await.insert(request, &self.conf.secret);
        if matches!(outcome, InsertOutcome::Inserted(_)) {
            self.new_request.notify_one();
        }
        outcome
    }

    /// Push one packet toward the server. For TLS this blocks through the
    /// reconnect state machine until the session is up.
    pub async fn send(self: &Arc<Self>, buf: &[u8]) {
        match &self.transport {
            UpstreamTransport::Udp { socket, target } => {
                match socket.send_to(buf, *target).await {
                    Ok(sent) => {
                        debug!(server = %self.conf.name, bytes = sent, "sent UDP request")
                    }
                    Err(error) => warn!(server = %self.conf.name, %error, "UDP send failed"),
                }
            }
            UpstreamTransport::Tls(link) => {
                link.write(self, buf).await;
                // the write only returns once a session was up to take it
                self.connection_ok.store(true, Ordering::Relaxed);
            }
        }
    }
}

/// Ingress pipeline: validate, rewrite, route and enqueue one request.
pub async fn radsrv(
    realms: &[Realm],
    from: &Arc<ClientHandle>,
    from_addr: Option<SocketAddr>,
    mut packet: Packet,
) {
    let code = packet.code();
    let id = packet.identifier();
    debug!(code = packet.code_byte(), id, length = packet.length(), "received request");

    if !matches!(
        code,
        Some(Code::AccessRequest | Code::AccountingRequest | Code::StatusServer)
    ) {
        info!(
            code = packet.code_byte(),
            "only Access-Request, Accounting-Request and Status-Server are accepted, ignoring"
        );
        return;
    }

    if !attrs::validate(packet.attributes()) {
        warn!(client = %from.conf.name, "attribute validation failed, ignoring packet");
        return;
    }

    if let Some(offset) = attrs::find(
        packet.attributes(),
        AttributeType::MessageAuthenticator as u8,
    ) {
        let value_offset = Packet::MIN_SIZE + offset + 2;
        let ok = attrs::value_range(packet.attributes(), offset).len() == 16
            && message_auth::verify_at(packet.as_bytes_mut(), value_offset, &from.conf.secret);
        if !ok {
            warn!(client = %from.conf.name, "message authentication failed, ignoring packet");
            return;
        }
    }

    match code {
        Some(Code::AccountingRequest) => {
            acclog(&packet, &from.conf);
            respond_with_header(from, &packet, Code::AccountingResponse, from_addr);
            return;
        }
        Some(Code::StatusServer) => {
            respond_with_header(from, &packet, Code::AccessAccept, from_addr);
            return;
        }
        _ => {}
    }

    if let Some(rules) = &from.conf.rewrite {
        rules.apply(&mut packet);
    }

    let username = {
        let attrs = packet.attributes();
        let Some(offset) = attrs::find(attrs, AttributeType::UserName as u8) else {
            warn!(client = %from.conf.name, "ignoring request, no username attribute");
            return;
        };
        match std::str::from_utf8(attrs::value(attrs, offset)) {
            Ok(username) => username.to_string(),
            Err(_) => {
                warn!(client = %from.conf.name, "ignoring request, username is not UTF-8");
                return;
            }
        }
    };

    let mut orig_username = None;
    let mut username = username;
    if let Some(rule) = &from.conf.rewrite_username {
        match rewrite::rewrite_username(&mut packet, &rule.regex, &rule.replacement) {
            Ok(Some(original)) => {
                let attrs = packet.attributes();
                let offset = attrs::find(attrs, AttributeType::UserName as u8)
                    .expect("User-Name was just rewritten");
                username = String::from_utf8_lossy(attrs::value(attrs, offset)).into_owned();
                orig_username = Some(original);
            }
            Ok(None) => {}
            Err(error) => {
                warn!(client = %from.conf.name, %error, "username rewrite failed, ignoring request");
                return;
            }
        }
    }
    debug!(username = %username, "Access-Request");

    let Some(realm) = realm::find_realm(realms, &username) else {
        info!(username = %username, "ignoring request, no matching realm");
        return;
    };

    let Some(to) = realm.best_server() else {
        if let Some(message) = &realm.message {
            info!(client = %from.conf.name, username = %username, realm = %realm.name, "rejecting, no server available");
            respond_reject(from, &packet, message, from_addr);
        }
        return;
    };

    let orig_auth = packet.authenticator();
    let new_auth = auth::generate_request_authenticator();

    for pwd_type in [
        AttributeType::UserPassword as u8,
        AttributeType::TunnelPassword as u8,
    ] {
        let range = {
            let attrs = packet.attributes();
            attrs::find(attrs, pwd_type).map(|offset| {
                let range = attrs::value_range(attrs, offset);
                Packet::MIN_SIZE + range.start..Packet::MIN_SIZE + range.end
            })
        };
        if let Some(range) = range {
            if let Err(error) = password::recrypt_in_place(
                &mut packet.as_bytes_mut()[range],
                &from.conf.secret,
                &to.conf.secret,
                &orig_auth,
                &new_auth,
            ) {
                warn!(client = %from.conf.name, %error, "cannot re-encrypt password, ignoring request");
                return;
            }
        }
    }

    packet.set_authenticator(&new_auth);
    let request = PendingRequest {
        buf: packet.into_bytes(),
        from: Arc::downgrade(from),
        from_addr,
        orig_id: id,
        orig_auth,
        orig_username,
    };
    match to.enqueue(request).await {
        InsertOutcome::Inserted(new_id) => {
            debug!(server = %to.conf.name, id = new_id, "queued request");
        }
        InsertOutcome::Duplicate => {
            info!(client = %from.conf.name, id, "duplicate request already in flight, ignoring");
        }
        InsertOutcome::Full => {
            warn!(server = %to.conf.name, "no room in request table, dropping request");
        }
    }
}

fn acclog(packet: &Packet, conf: &PeerConfig) {
    let attrs = packet.attributes();
    match attrs::find(attrs, AttributeType::UserName as u8) {
        Some(offset) => {
            let username = String::from_utf8_lossy(attrs::value(attrs, offset)).into_owned();
            info!(client = %conf.name, username = %username, "accounting request");
        }
        None => info!(client = %conf.name, "accounting request without username attribute"),
    }
}

/// Answer locally with a header-only response echoing the request's
/// identifier and authenticator.
fn respond_with_header(
    from: &ClientHandle,
    request: &Packet,
    code: Code,
    dest: Option<SocketAddr>,
) {
    let response = Packet::new(code, request.identifier(), request.authenticator());
    debug!(client = %from.conf.name, code = code.as_u8(), "responding locally");
    from.enqueue_reply(response.into_bytes(), dest);
}

/// Access-Reject carrying the realm's configured Reply-Message.
fn respond_reject(
    from: &ClientHandle,
    request: &Packet,
    message: &str,
    dest: Option<SocketAddr>,
) {
    let mut response = Packet::new(
        Code::AccessReject,
        request.identifier(),
        request.authenticator(),
    );
    if !message.is_empty() {
        if let Err(error) =
            response.push_attribute(AttributeType::ReplyMessage as u8, message.as_bytes())
        {
            warn!(%error, "cannot attach Reply-Message");
        }
    }
    from.enqueue_reply(response.into_bytes(), dest);
}

/// Reply pipeline: correlate a response to its slot and hand it back to the
/// originating client.
pub async fn replyh(server: &Arc<Upstream>, mut packet: Packet) {
    server.mark_alive();

    let id = packet.identifier();
    match packet.code() {
        Some(Code::AccessAccept | Code::AccessReject | Code::AccessChallenge) => {
            debug!(server = %server.conf.name, code = packet.code_byte(), id, "got reply");
        }
        _ => {
            info!(
                server = %server.conf.name,
                code = packet.code_byte(),
                "discarding, only Access-Accept, Access-Reject and Access-Challenge accepted"
            );
            return;
        }
    }

    let mut table = server.table.lock().await;
    let slot = table.slot_mut(id);
    let Some(request_buf) = slot.buf.as_deref() else {
        info!(server = %server.conf.name, id, "no matching request for this id, ignoring reply");
        return;
    };
    if slot.tries == 0 {
        info!(server = %server.conf.name, id, "request not yet sent, ignoring reply");
        return;
    }
    if slot.received {
        info!(server = %server.conf.name, id, "already received, ignoring reply");
        return;
    }

    let request_auth: [u8; 16] = request_buf[4..20].try_into().expect("slot buf has header");
    if !auth::verify_response(packet.as_bytes(), &request_auth, &server.conf.secret) {
        warn!(server = %server.conf.name, id, "invalid response authenticator, ignoring reply");
        return;
    }
    if !attrs::validate(packet.attributes()) {
        warn!(server = %server.conf.name, id, "attribute validation failed, ignoring reply");
        return;
    }

    let message_auth_present = {
        match attrs::find(
            packet.attributes(),
            AttributeType::MessageAuthenticator as u8,
        ) {
            None => false,
            Some(offset) => {
                if attrs::value_range(packet.attributes(), offset).len() != 16 {
                    warn!(server = %server.conf.name, "illegal Message-Authenticator length, ignoring reply");
                    return;
                }
                // the response MAC is computed with the request authenticator
                // in the authenticator field; swap it in, check, swap back
                let response_auth = packet.authenticator();
                packet.set_authenticator(&request_auth);
                let value_offset = Packet::MIN_SIZE + offset + 2;
                let ok =
                    message_auth::verify_at(packet.as_bytes_mut(), value_offset, &server.conf.secret);
                packet.set_authenticator(&response_auth);
                if !ok {
                    warn!(server = %server.conf.name, "message authentication failed, ignoring reply");
                    return;
                }
                true
            }
        }
    };

    if slot.is_status_probe() {
        slot.received = true;
        debug!(server = %server.conf.name, "got Status-Server response");
        return;
    }

    let Some(from) = slot.from.upgrade() else {
        info!(server = %server.conf.name, id, "client gone, ignoring reply");
        return;
    };

    if let Some(rules) = &server.conf.rewrite {
        rules.apply(&mut packet);
    }

    if !recrypt_mppe_keys(
        &mut packet,
        &server.conf.secret,
        &from.conf.secret,
        &request_auth,
        &slot.orig_auth,
    ) {
        warn!(server = %server.conf.name, "MS-MPPE key handling failed, ignoring reply");
        return;
    }

    if packet.code() == Some(Code::AccessAccept) || packet.code() == Some(Code::AccessReject) {
        let attrs = packet.attributes();
        let username = attrs::find(attrs, AttributeType::UserName as u8)
            .map(|offset| String::from_utf8_lossy(attrs::value(attrs, offset)).into_owned());
        info!(
            server = %server.conf.name,
            code = packet.code_byte(),
            username = username.as_deref().unwrap_or("-"),
            "forwarding reply"
        );
    }

    packet.set_identifier(slot.orig_id);
    packet.set_authenticator(&slot.orig_auth);

    if let Some(original) = &slot.orig_username {
        match packet.resize_attribute(AttributeType::UserName as u8, original.len()) {
            Ok(Some(range)) => packet.as_bytes_mut()[range].copy_from_slice(original),
            Ok(None) => {}
            Err(error) => {
                warn!(server = %server.conf.name, %error, "cannot restore username, ignoring reply");
                return;
            }
        }
    }

    if message_auth_present {
        // resizing may have moved the attribute
        if let Some(offset) = attrs::find(
            packet.attributes(),
            AttributeType::MessageAuthenticator as u8,
        ) {
            let value_offset = Packet::MIN_SIZE + offset + 2;
            message_auth::set_at(packet.as_bytes_mut(), value_offset, &from.conf.secret);
        }
    }

    let dest = slot.from_addr;
    // once received is set the slot may be swept and reused
    slot.received = true;
    debug!(client = %from.conf.name, "handing reply back to its origin");
    from.enqueue_reply(packet.into_bytes(), dest);
}

/// Re-encrypt every MS-MPPE Send-Key/Recv-Key sub-attribute under the
/// downstream secret. Returns false if a Microsoft VSA is malformed or a key
/// fails to re-encrypt.
fn recrypt_mppe_keys(
    packet: &mut Packet,
    old_secret: &[u8],
    new_secret: &[u8],
    old_auth: &[u8; 16],
    new_auth: &[u8; 16],
) -> bool {
    let mut offset = 0;
    loop {
        let found = {
            let attrs = packet.attributes();
            attrs::find_from(attrs, offset, AttributeType::VendorSpecific as u8)
                .map(|o| (o, attrs::attr_len(attrs, o)))
        };
        let Some((vsa_offset, vsa_len)) = found else {
            return true;
        };

        let is_microsoft = {
            let value = attrs::value(packet.attributes(), vsa_offset);
            value.len() > 4 && value[..4] == attrs::VENDOR_MICROSOFT.to_be_bytes()
        };
        if is_microsoft {
            let sub_region_valid = {
                let attrs = packet.attributes();
                attrs::validate(&attrs[vsa_offset + 6..vsa_offset + vsa_len])
            };
            if !sub_region_valid {
                return false;
            }
            let mut sub_offset = vsa_offset + 6;
            let end = vsa_offset + vsa_len;
            while end - sub_offset > 1 {
                let (sub_type, sub_len) = {
                    let attrs = packet.attributes();
                    (attrs[sub_offset], attrs[sub_offset + 1] as usize)
                };
                if sub_type == attrs::MS_MPPE_SEND_KEY || sub_type == attrs::MS_MPPE_RECV_KEY {
                    debug!(sub_type, "re-encrypting MS-MPPE key");
                    let range =
                        Packet::MIN_SIZE + sub_offset + 2..Packet::MIN_SIZE + sub_offset + sub_len;
                    if password::msmppe_recrypt_in_place(
                        &mut packet.as_bytes_mut()[range],
                        old_secret,
                        new_secret,
                        old_auth,
                        new_auth,
                    )
                    .is_err()
                    {
                        return false;
                    }
                }
                sub_offset += sub_len;
            }
        }
        offset = vsa_offset + vsa_len;
    }
}

/// Writer task for one upstream: retransmits due slots, sweeps received and
/// expired ones, tracks Status-Server liveness, and emits probes.
pub async fn client_writer(server: Arc<Upstream>) {
    let mut last_send = Instant::now();

    match &server.transport {
        UpstreamTransport::Udp { .. } => {
            server.connection_ok.store(true, Ordering::Relaxed);
        }
        UpstreamTransport::Tls(link) => {
            link.connect(&server, None).await;
            server.connection_ok.store(true, Ordering::Relaxed);
            tokio::spawn(tls::upstream_reader(server.clone()));
        }
    }

    let mut deadline: Option<Instant> = None;
    loop {
        let mut wait_until = deadline;
        if server.conf.status_server {
            let jitter = Duration::from_secs(rand::rng().random_range(0..8));
            let probe_at = last_send + STATUS_SERVER_PERIOD + jitter;
            wait_until = Some(wait_until.map_or(probe_at, |d| d.min(probe_at)));
        }
        match wait_until {
            Some(at) => {
                let _ = tokio::time::timeout_at(at, server.new_request.notified()).await;
            }
            None => server.new_request.notified().await,
        }

        deadline = None;
        let mut to_send: Vec<Vec<u8>> = Vec::with_capacity(MAX_REQUESTS / 16);
        {
            let mut table = server.table.lock().await;
            let now = Instant::now();
            let is_tls = server.is_tls();
            for slot in table.slots_mut() {
                if !slot.in_use() {
                    continue;
                }
                if slot.received {
                    slot.clear();
                    continue;
                }
                if now < slot.expiry {
                    deadline = Some(deadline.map_or(slot.expiry, |d| d.min(slot.expiry)));
                    continue;
                }
                let probe = slot.is_status_probe();
                let max_tries = if probe || is_tls { 1 } else { REQUEST_RETRIES };
                if slot.tries >= max_tries {
                    if probe {
                        let lost = server
                            .lost_status
                            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                                Some(v.saturating_add(1))
                            })
                            .expect("update always succeeds");
                        warn!(
                            server = %server.conf.name,
                            lost = lost.saturating_add(1),
                            "no Status-Server response, server possibly dead"
                        );
                    } else {
                        debug!(server = %server.conf.name, "removing expired request");
                    }
                    slot.clear();
                    continue;
                }
                slot.expiry = now
                    + if probe || is_tls {
                        REQUEST_EXPIRY
                    } else {
                        REQUEST_EXPIRY / REQUEST_RETRIES as u32
                    };
                deadline = Some(deadline.map_or(slot.expiry, |d| d.min(slot.expiry)));
                slot.tries += 1;
                to_send.push(slot.buf.clone().expect("slot is in use"));
            }
        }
        if !to_send.is_empty() {
            for buf in &to_send {
                server.send(buf).await;
            }
            last_send = Instant::now();
        }

        if server.conf.status_server
            && Instant::now().duration_since(last_send) >= STATUS_SERVER_PERIOD
        {
            let probe_auth = auth::generate_request_authenticator();
            let mut probe = Packet::new(Code::StatusServer, 0, probe_auth);
            probe
                .push_attribute(AttributeType::MessageAuthenticator as u8, &[0u8; 16])
                .expect("probe is below any limit");
            debug!(server = %server.conf.name, "sending Status-Server probe");
            last_send = Instant::now();
            server
                .enqueue(PendingRequest {
                    buf: probe.into_bytes(),
                    from: Weak::new(),
                    from_addr: None,
                    orig_id: 0,
                    orig_auth: probe_auth,
                    orig_username: None,
                })
                .await;
        }
    }
}
