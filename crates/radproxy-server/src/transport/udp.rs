//! Classic RADIUS over UDP.
//!
//! A listener pairs a reader task (datagram in, peer lookup, ingress
//! pipeline) with a writer task draining the listener's shared reply queue.
//! Upstream traffic goes through per-family demux sockets shared by all UDP
//! servers; their reader tasks resolve the source address back to the
//! originating server and run the reply pipeline.

use crate::config::Transport;
use crate::peers;
use crate::server::ProxyState;
use crate::session::{self, ClientHandle, Reply};
use radproxy_proto::Packet;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Serve one UDP listener socket (authentication or accounting).
pub async fn serve_listener(state: Arc<ProxyState>, socket: Arc<UdpSocket>) {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(reply_writer(socket.clone(), rx));

    // UDP clients are created on the first datagram from their config and
    // live until shutdown, all sharing this listener's reply queue
    let mut clients: HashMap<usize, Arc<ClientHandle>> = HashMap::new();
    let mut buf = vec![0u8; 65536];
    loop {
        let (count, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                warn!(%error, "recv failed");
                continue;
            }
        };
        debug!(bytes = count, peer = %src, "got UDP datagram");

        let Some(index) = peers::find_peer(&state.clients, Transport::Udp, src.ip(), 0) else {
            warn!(peer = %src, "packet from unknown UDP peer, ignoring");
            continue;
        };
        let packet = match Packet::from_datagram(&buf[..count]) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(peer = %src, %error, "dropping datagram");
                continue;
            }
        };
        let client = clients
            .entry(index)
            .or_insert_with(|| {
                Arc::new(ClientHandle::new(state.clients[index].clone(), tx.clone()))
            })
            .clone();
        session::radsrv(&state.realms, &client, Some(src), packet).await;
    }
}

async fn reply_writer(socket: Arc<UdpSocket>, mut replies: mpsc::UnboundedReceiver<Reply>) {
    while let Some(reply) = replies.recv().await {
        // UDP replies always carry the requester's source address
        let Some(dest) = reply.dest else { continue };
        match socket.send_to(&reply.buf, dest).await {
            Ok(sent) => debug!(bytes = sent, peer = %dest, "sent reply"),
            Err(error) => warn!(peer = %dest, %error, "send failed"),
        }
    }
}

/// Reader for a shared upstream demux socket: resolve the source address to
/// a configured server and correlate the reply.
pub async fn upstream_demux(state: Arc<ProxyState>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (count, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                warn!(%error, "recv failed");
                continue;
            }
        };
        let Some(index) = peers::find_peer(&state.servers, Transport::Udp, src.ip(), 0) else {
            warn!(peer = %src, "packet from unknown UDP server, ignoring");
            continue;
        };
        let packet = match Packet::from_datagram(&buf[..count]) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(peer = %src, %error, "dropping datagram");
                continue;
            }
        };
        session::replyh(&state.upstreams[index], packet).await;
    }
}
