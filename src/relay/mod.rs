//! The query-multiplexing core: one task owning the cache, the query
//! pool, and the id pool, wired to the two UDP sockets.
//!
//! Datagrams from clients arrive on the downstream socket; answers the
//! relay already knows (hosts table or cache) go straight back out of
//! it.  Everything else is re-labelled with a pool-allocated
//! transaction id and forwarded out of the upstream socket, with a
//! 5 second timer; the upstream's reply is correlated back to the
//! waiting slot and returned to the client under the client's own
//! transaction id.
//!
//! All mutable state is owned by the `run` task.  Timers are spawned
//! tasks that report back over a channel, so their fires are
//! serialised with socket I/O by the same `select!` loop; a fire that
//! loses the race against the reply is recognised by its stale
//! generation and ignored.

pub mod id_pool;
pub mod query_pool;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::cache::{Cache, RecordBundle};
use crate::net_util::send_udp_bytes_to;
use crate::protocol::wire_types::*;
use crate::relay::id_pool::IdPool;
use crate::relay::query_pool::{QueryPool, QUERY_POOL_MAX_SIZE};

/// How long to wait for the upstream resolver before giving up on a
/// query.  The client never learns: it is expected to retry.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Plain DNS over UDP carries at most 512 octets of message.
const MAX_DATAGRAM_SIZE: usize = 512;

/// The daemon aggregate: every piece of mutable relay state, singly
/// owned by the `run` task.
pub struct Relay {
    cache: Cache,
    queries: QueryPool,
    ids: IdPool,
    downstream: Arc<UdpSocket>,
    upstream: Arc<UdpSocket>,
    upstream_addr: SocketAddr,
    timeout_tx: mpsc::Sender<u16>,
}

impl Relay {
    /// Assemble a relay around its sockets.  The returned receiver
    /// carries timeout fires and must be handed back to `run`.
    pub fn new(
        cache: Cache,
        downstream: Arc<UdpSocket>,
        upstream: Arc<UdpSocket>,
        upstream_addr: SocketAddr,
    ) -> (Self, mpsc::Receiver<u16>) {
        let (timeout_tx, timeout_rx) = mpsc::channel(QUERY_POOL_MAX_SIZE);
        (
            Self {
                cache,
                queries: QueryPool::new(),
                ids: IdPool::new(),
                downstream,
                upstream,
                upstream_addr,
                timeout_tx,
            },
            timeout_rx,
        )
    }

    /// The event loop.  Never returns.
    pub async fn run(mut self, mut timeouts: mpsc::Receiver<u16>) {
        let downstream = Arc::clone(&self.downstream);
        let upstream = Arc::clone(&self.upstream);
        let mut client_buf = BytesMut::zeroed(MAX_DATAGRAM_SIZE);
        let mut upstream_buf = BytesMut::zeroed(MAX_DATAGRAM_SIZE);

        loop {
            tokio::select! {
                Ok((size, peer)) = downstream.recv_from(&mut client_buf) => {
                    self.handle_query(peer, &client_buf[..size]).await;
                }
                Ok((size, _)) = upstream.recv_from(&mut upstream_buf) => {
                    self.handle_reply(&upstream_buf[..size]).await;
                }
                Some(slot_id) = timeouts.recv() => {
                    self.handle_timeout(slot_id);
                }
            }
        }
    }

    /// A datagram arrived on the downstream socket.
    pub async fn handle_query(&mut self, peer: SocketAddr, datagram: &[u8]) {
        let message = match Message::from_octets(datagram) {
            Ok(message) => message,
            Err(error) => {
                tracing::error!(?peer, %error, "dropping malformed datagram");
                return;
            }
        };

        if message.header.is_response {
            tracing::debug!(?peer, "dropping response received on the listen port");
            return;
        }

        let Some(question) = message.questions.first().cloned() else {
            tracing::error!(?peer, "dropping query with no question");
            return;
        };

        tracing::info!(?peer, %question, id = %message.header.id, "query");

        if self.queries.is_full() {
            tracing::error!(?peer, %question, "query pool full, dropping query");
            return;
        }
        let client_id = message.header.id;
        let Some(slot_id) = self.queries.insert(peer, client_id, message) else {
            return;
        };

        match self.cache.query(&question) {
            Some(bundle) => self.answer_from_cache(slot_id, &question, bundle).await,
            None => self.forward_upstream(slot_id, &question).await,
        }
    }

    /// Answer a query synchronously from a cache (or hosts-table)
    /// bundle and retire its slot.
    async fn answer_from_cache(&mut self, slot_id: u16, question: &Question, bundle: RecordBundle) {
        let Some(mut slot) = self.queries.remove(slot_id) else {
            return;
        };

        let message = &mut slot.message;
        message.header.is_response = true;
        if message.header.recursion_desired {
            message.header.recursion_available = true;
        }

        if bundle.is_shield() {
            tracing::info!(%question, "shielded name, answering NXDOMAIN");
            message.header.rcode = Rcode::NameError;
            message.answers.clear();
            message.authority.clear();
            message.additional.clear();
        } else {
            message.answers = bundle.answers;
            message.authority = bundle.authority;
            message.additional = bundle.additional;
        }

        self.send_message(&self.downstream, slot.client_addr, message)
            .await;
    }

    /// Forward a cache miss to the upstream resolver under a fresh
    /// transaction id, and arm its timeout.
    async fn forward_upstream(&mut self, slot_id: u16, question: &Question) {
        if self.ids.is_full() {
            tracing::error!(%question, "upstream id pool full, dropping query");
            self.drop_slot(slot_id);
            return;
        }
        let Some(upstream_id) = self.ids.insert(slot_id) else {
            return;
        };

        let octets = {
            let Some(slot) = self.queries.get_mut(slot_id) else {
                self.ids.remove(upstream_id);
                return;
            };
            slot.upstream_id = Some(upstream_id);
            slot.message.header.id = upstream_id;
            match slot.message.to_octets() {
                Ok(octets) => octets,
                Err(error) => {
                    tracing::error!(%question, %error, "could not serialise query");
                    self.drop_slot(slot_id);
                    return;
                }
            }
        };

        tracing::info!(%question, %upstream_id, "forwarding to upstream");
        self.send_octets(&self.upstream, self.upstream_addr, octets)
            .await;

        let tx = self.timeout_tx.clone();
        let timer = tokio::spawn(async move {
            sleep(UPSTREAM_TIMEOUT).await;
            let _ = tx.send(slot_id).await;
        });
        if let Some(slot) = self.queries.get_mut(slot_id) {
            slot.timer = Some(timer);
        }
    }

    /// A datagram arrived on the upstream socket.
    pub async fn handle_reply(&mut self, datagram: &[u8]) {
        let mut reply = match Message::from_octets(datagram) {
            Ok(message) => message,
            Err(error) => {
                tracing::error!(%error, "dropping malformed upstream datagram");
                return;
            }
        };

        let upstream_id = reply.header.id;
        let Some(slot_id) = self.ids.remove(upstream_id) else {
            tracing::error!(%upstream_id, "upstream reply for unknown transaction id");
            return;
        };

        let Some(slot) = self.queries.get(slot_id) else {
            // already timed out; the transaction id is simply released
            tracing::debug!(%upstream_id, "upstream reply for a slot that is gone");
            return;
        };

        let asked = slot.message.questions.first().map(|q| q.name.clone());
        let answered = reply.questions.first().map(|q| q.name.clone());
        if asked != answered {
            tracing::error!(
                asked = ?asked.map(|n| n.to_dotted_string()),
                answered = ?answered.map(|n| n.to_dotted_string()),
                "upstream answered a different question, dropping reply"
            );
            self.drop_slot(slot_id);
            return;
        }

        let client_id = slot.client_id;
        let client_addr = slot.client_addr;
        reply.header.id = client_id;

        if reply.header.rcode == Rcode::NoError && is_cacheable(&reply) {
            self.cache.insert(&reply);
        }

        tracing::info!(?client_addr, %client_id, "reply routed to client");
        self.send_message(&self.downstream, client_addr, &reply)
            .await;
        self.drop_slot(slot_id);
    }

    /// A timeout timer fired.  A stale slot id means the reply won
    /// the race and the slot was already retired: nothing to do.
    pub fn handle_timeout(&mut self, slot_id: u16) {
        if self.queries.get(slot_id).is_some() {
            tracing::info!(%slot_id, "upstream query timed out");
            self.drop_slot(slot_id);
        }
    }

    /// Retire a slot, releasing its upstream transaction id if one
    /// was allocated.
    fn drop_slot(&mut self, slot_id: u16) {
        if let Some(slot) = self.queries.remove(slot_id) {
            if let Some(upstream_id) = slot.upstream_id {
                self.ids.remove(upstream_id);
            }
        }
    }

    async fn send_message(&self, socket: &UdpSocket, target: SocketAddr, message: &Message) {
        match message.to_octets() {
            Ok(octets) => self.send_octets(socket, target, octets).await,
            Err(error) => {
                tracing::error!(?target, %error, "could not serialise message");
            }
        }
    }

    async fn send_octets(&self, socket: &UdpSocket, target: SocketAddr, mut octets: Vec<u8>) {
        if let Err(error) = send_udp_bytes_to(socket, target, &mut octets).await {
            tracing::error!(?target, %error, "UDP send error");
        }
    }
}

/// Only ordinary address-chasing answers are worth remembering: A,
/// CNAME, and AAAA.
fn is_cacheable(reply: &Message) -> bool {
    match reply.questions.first() {
        Some(question) => matches!(
            question.qtype,
            QueryType::Record(RecordType::A)
                | QueryType::Record(RecordType::CNAME)
                | QueryType::Record(RecordType::AAAA)
        ),
        None => false,
    }
}
