//! Per-upstream request table.
//!
//! A fixed array of 256 slots addressed by the 8-bit RADIUS identifier
//! assigned to outbound packets. The table is the linearization point for a
//! request's life: insertion allocates the outbound ID and stamps the
//! Message-Authenticator, replies race on the `received` flag under the
//! owning server's lock, and the writer task sweeps received and expired
//! slots. `buf == None` means the slot is free and reusable.

use crate::session::ClientHandle;
use radproxy_proto::{attrs, message_auth, AttributeType};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Slot count; matches the 8-bit RADIUS identifier space
pub const MAX_REQUESTS: usize = 256;
/// Retransmissions for UDP upstreams (TLS and Status-Server get one try)
pub const REQUEST_RETRIES: u8 = 3;
/// Total lifetime of an unanswered request
pub const REQUEST_EXPIRY: Duration = Duration::from_secs(20);

/// One in-flight request toward an upstream.
#[derive(Debug)]
pub struct RequestSlot {
    /// Outbound packet bytes; `None` marks the slot free
    pub buf: Option<Vec<u8>>,
    /// Originating client; weak so a torn-down client never lingers
    pub from: Weak<ClientHandle>,
    /// Source address for UDP replies
    pub from_addr: Option<SocketAddr>,
    /// Identifier of the original request
    pub orig_id: u8,
    /// Request authenticator of the original request
    pub orig_auth: [u8; 16],
    /// Pre-rewrite User-Name, when a rewrite was applied
    pub orig_username: Option<Vec<u8>>,
    pub tries: u8,
    pub expiry: Instant,
    pub received: bool,
}

impl RequestSlot {
    fn empty() -> Self {
        RequestSlot {
            buf: None,
            from: Weak::new(),
            from_addr: None,
            orig_id: 0,
            orig_auth: [0u8; 16],
            orig_username: None,
            tries: 0,
            expiry: Instant::now(),
            received: false,
        }
    }

    pub fn in_use(&self) -> bool {
        self.buf.is_some()
    }

    /// Free the slot for reuse.
    pub fn clear(&mut self) {
        *self = RequestSlot::empty();
    }

    /// Whether this slot carries a Status-Server probe.
    pub fn is_status_probe(&self) -> bool {
        self.buf
            .as_deref()
            .map(|buf| buf[0] == radproxy_proto::Code::StatusServer.as_u8())
            .unwrap_or(false)
    }
}

/// A request ready for insertion.
#[derive(Debug)]
pub struct PendingRequest {
    pub buf: Vec<u8>,
    pub from: Weak<ClientHandle>,
    pub from_addr: Option<SocketAddr>,
    pub orig_id: u8,
    pub orig_auth: [u8; 16],
    pub orig_username: Option<Vec<u8>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored under the returned outbound identifier
    Inserted(u8),
    /// An unanswered request from the same client with the same original
    /// identifier is already in flight
    Duplicate,
    /// All 256 slots are busy
    Full,
}

#[derive(Debug)]
pub struct RequestTable {
    slots: Vec<RequestSlot>,
    next_id: u8,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTable {
    pub fn new() -> Self {
        RequestTable {
            slots: (0..MAX_REQUESTS).map(|_| RequestSlot::empty()).collect(),
            next_id: 0,
        }
    }

    /// Insert a request: suppress duplicates, allocate a free slot scanning
    /// forward from `next_id`, write the slot index into the packet's
    /// identifier byte and stamp the Message-Authenticator (if the attribute
    /// is present) under the upstream's secret, which covers the new
    /// identifier.
    pub fn insert(&mut self, mut request: PendingRequest, secret: &[u8]) -> InsertOutcome {
        if request.from.upgrade().is_some() && self.is_duplicate(&request.from, request.orig_id) {
            return InsertOutcome::Duplicate;
        }

        let start = self.next_id as usize;
        let id = match (start..MAX_REQUESTS)
            .chain(0..start)
            .find(|&i| !self.slots[i].in_use())
        {
            Some(id) => id as u8,
            None => return InsertOutcome::Full,
        };

        request.buf[1] = id;
        if let Some(offset) = attrs::find(
            &request.buf[20..],
            AttributeType::MessageAuthenticator as u8,
        ) {
            message_auth::set_at(&mut request.buf, 20 + offset + 2, secret);
        }

        let slot = &mut self.slots[id as usize];
        slot.buf = Some(request.buf);
        slot.from = request.from;
        slot.from_addr = request.from_addr;
        slot.orig_id = request.orig_id;
        slot.orig_auth = request.orig_auth;
        slot.orig_username = request.orig_username;
        slot.tries = 0;
        slot.expiry = Instant::now();
        slot.received = false;
        self.next_id = id.wrapping_add(1);
        InsertOutcome::Inserted(id)
    }

    fn is_duplicate(&self, from: &Weak<ClientHandle>, orig_id: u8) -> bool {
        self.slots.iter().any(|slot| {
            slot.in_use()
                && !slot.received
                && slot.orig_id == orig_id
                && Weak::ptr_eq(&slot.from, from)
        })
    }

    pub fn slot_mut(&mut self, id: u8) -> &mut RequestSlot {
        &mut self.slots[id as usize]
    }

    pub fn slots_mut(&mut self) -> &mut [RequestSlot] {
        &mut self.slots
    }

    /// Detach a departing client from every slot that references it, so
    /// nothing addresses it after teardown.
    pub fn purge_client(&mut self, client: &Arc<ClientHandle>) {
        let target = Arc::downgrade(client);
        for slot in &mut self.slots {
            if Weak::ptr_eq(&slot.from, &target) {
                slot.from = Weak::new();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;
    use crate::peers::{HostSpec, PeerConfig};
    use crate::session::Reply;
    use radproxy_proto::{Code, Packet};
    use tokio::sync::mpsc;

    fn test_client() -> (Arc<ClientHandle>, mpsc::UnboundedReceiver<Reply>) {
        let conf = Arc::new(PeerConfig {
            name: "test".into(),
            transport: Transport::Udp,
            host: "192.0.2.1".into(),
            host_spec: HostSpec::Exact(vec!["192.0.2.1".parse().unwrap()]),
            port: 0,
            secret: b"c".to_vec(),
            tls: None,
            cert_cn_regex: None,
            cert_uri_regex: None,
            rewrite: None,
            rewrite_username: None,
            status_server: false,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ClientHandle::new(conf, tx)), rx)
    }

    fn pending(from: &Arc<ClientHandle>, orig_id: u8) -> PendingRequest {
        let packet = Packet::new(Code::AccessRequest, orig_id, [7u8; 16]);
        PendingRequest {
            buf: packet.into_bytes(),
            from: Arc::downgrade(from),
            from_addr: None,
            orig_id,
            orig_auth: [7u8; 16],
            orig_username: None,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let (client, _rx) = test_client();
        let mut table = RequestTable::new();
        assert_eq!(table.insert(pending(&client, 1), b"s"), InsertOutcome::Inserted(0));
        assert_eq!(table.insert(pending(&client, 2), b"s"), InsertOutcome::Inserted(1));
        assert_eq!(table.slot_mut(0).buf.as_ref().unwrap()[1], 0);
        assert_eq!(table.slot_mut(1).buf.as_ref().unwrap()[1], 1);
    }

    #[tokio::test]
    async fn test_duplicate_suppressed() {
        let (client, _rx) = test_client();
        let mut table = RequestTable::new();
        assert_eq!(table.insert(pending(&client, 7), b"s"), InsertOutcome::Inserted(0));
        assert_eq!(table.insert(pending(&client, 7), b"s"), InsertOutcome::Duplicate);
        // a different original id from the same client is fine
        assert_eq!(table.insert(pending(&client, 8), b"s"), InsertOutcome::Inserted(1));
        // and so is the same id from another client
        let (other, _rx2) = test_client();
        assert_eq!(table.insert(pending(&other, 7), b"s"), InsertOutcome::Inserted(2));
    }

    #[tokio::test]
    async fn test_received_slot_admits_retransmit() {
        let (client, _rx) = test_client();
        let mut table = RequestTable::new();
        table.insert(pending(&client, 7), b"s");
        table.slot_mut(0).received = true;
        assert_eq!(table.insert(pending(&client, 7), b"s"), InsertOutcome::Inserted(1));
    }

    #[tokio::test]
    async fn test_full_table_drops() {
        let (client, _rx) = test_client();
        let mut table = RequestTable::new();
        for i in 0..MAX_REQUESTS {
            assert_eq!(
                table.insert(pending(&client, i as u8), b"s"),
                InsertOutcome::Inserted(i as u8)
            );
        }
        // ids wrapped around, all orig ids distinct per 8-bit space; use a
        // second client so the duplicate check cannot fire first
        let (other, _rx2) = test_client();
        assert_eq!(table.insert(pending(&other, 1), b"s"), InsertOutcome::Full);
    }

    #[tokio::test]
    async fn test_allocation_wraps_and_reuses_freed_slots() {
        let (client, _rx) = test_client();
        let mut table = RequestTable::new();
        for i in 0..MAX_REQUESTS {
            table.insert(pending(&client, i as u8), b"s");
        }
        table.slot_mut(5).clear();
        let (other, _rx2) = test_client();
        assert_eq!(table.insert(pending(&other, 5), b"s"), InsertOutcome::Inserted(5));
    }

    #[tokio::test]
    async fn test_message_authenticator_stamped_after_id_assignment() {
        let (client, _rx) = test_client();
        let mut table = RequestTable::new();

        let mut packet = Packet::new(Code::AccessRequest, 9, [7u8; 16]);
        packet
            .push_attribute(radproxy_proto::AttributeType::MessageAuthenticator as u8, &[0u8; 16])
            .unwrap();
        let request = PendingRequest {
            buf: packet.into_bytes(),
            from: Arc::downgrade(&client),
            from_addr: None,
            orig_id: 9,
            orig_auth: [7u8; 16],
            orig_username: None,
        };
        assert_eq!(table.insert(request, b"upstream"), InsertOutcome::Inserted(0));

        let mut sent = table.slot_mut(0).buf.clone().unwrap();
        assert!(radproxy_proto::message_auth::verify_at(&mut sent, 22, b"upstream"));
    }

    #[tokio::test]
    async fn test_purge_client_detaches_slots() {
        let (client, _rx) = test_client();
        let (other, _rx2) = test_client();
        let mut table = RequestTable::new();
        table.insert(pending(&client, 1), b"s");
        table.insert(pending(&other, 2), b"s");

        table.purge_client(&client);
        assert!(table.slot_mut(0).from.upgrade().is_none());
        assert!(table.slot_mut(1).from.upgrade().is_some());
        // purged slot no longer counts toward duplicates from that client
        assert_eq!(table.insert(pending(&client, 1), b"s"), InsertOutcome::Inserted(2));
    }
}
