//! The pool of in-flight client queries.
//!
//! Slots live in a fixed direct-address table indexed by `slot_id %
//! QUERY_POOL_MAX_SIZE`.  Slot ids are drawn from the whole 16-bit
//! space and a released id is pushed back as `id + QUERY_POOL_MAX_SIZE`,
//! so the high bits of a slot id are a generation count: a timeout
//! that fires after its slot was freed and the table index reused
//! carries a stale id and is recognised as such.

use std::net::SocketAddr;

use tokio::task::JoinHandle;

use crate::protocol::wire_types::Message;
use crate::relay::id_pool::IdRing;

/// How many client queries may be in flight at once.
pub const QUERY_POOL_MAX_SIZE: usize = 256;

/// One in-flight client query.
#[derive(Debug)]
pub struct QuerySlot {
    /// Generation-tagged slot id.
    pub id: u16,

    /// The transaction id the client used, restored onto the reply.
    pub client_id: u16,

    /// Where the reply goes.
    pub client_addr: SocketAddr,

    /// The relay's own copy of the query.
    pub message: Message,

    /// The upstream transaction id, once the query has been forwarded.
    pub upstream_id: Option<u16>,

    /// The timeout timer, once armed.
    pub timer: Option<JoinHandle<()>>,
}

impl QuerySlot {
    /// Stop the timeout timer, if armed.  A timer which already fired
    /// is handled by the generation check instead.
    pub fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// The pool itself.
#[derive(Debug)]
pub struct QueryPool {
    slots: Vec<Option<QuerySlot>>,
    free: IdRing,
    count: usize,
}

impl QueryPool {
    pub fn new() -> Self {
        let mut free = IdRing::with_capacity(1 << 16);
        for id in 0..QUERY_POOL_MAX_SIZE {
            free.push(id as u16);
        }
        Self {
            slots: (0..QUERY_POOL_MAX_SIZE).map(|_| None).collect(),
            free,
            count: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.count == QUERY_POOL_MAX_SIZE
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Claim a slot for a new client query.  Returns the slot id, or
    /// `None` when the pool is full.
    pub fn insert(
        &mut self,
        client_addr: SocketAddr,
        client_id: u16,
        message: Message,
    ) -> Option<u16> {
        if self.is_full() {
            return None;
        }
        let id = self.free.pop()?;
        self.slots[table_index(id)] = Some(QuerySlot {
            id,
            client_id,
            client_addr,
            message,
            upstream_id: None,
            timer: None,
        });
        self.count += 1;
        Some(id)
    }

    /// Fetch a live slot.  A stale id (the table index was reused, or
    /// the slot was freed) returns `None`.
    pub fn get(&self, id: u16) -> Option<&QuerySlot> {
        self.slots[table_index(id)]
            .as_ref()
            .filter(|slot| slot.id == id)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut QuerySlot> {
        self.slots[table_index(id)]
            .as_mut()
            .filter(|slot| slot.id == id)
    }

    /// Free a slot, stopping its timer and returning its id to the
    /// free queue with the generation advanced.  Idempotent: freeing
    /// an already-free or stale id does nothing.
    pub fn remove(&mut self, id: u16) -> Option<QuerySlot> {
        let index = table_index(id);
        if self.slots[index].as_ref()?.id != id {
            return None;
        }
        let mut slot = self.slots[index].take()?;
        slot.stop_timer();
        self.free.push(id.wrapping_add(QUERY_POOL_MAX_SIZE as u16));
        self.count -= 1;
        Some(slot)
    }
}

impl Default for QueryPool {
    fn default() -> Self {
        Self::new()
    }
}

fn table_index(id: u16) -> usize {
    usize::from(id) % QUERY_POOL_MAX_SIZE
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::protocol::wire_types::*;

    fn client_addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000))
    }

    fn query(id: u16) -> Message {
        Message::from_question(
            id,
            Question {
                name: DomainName::from_dotted_string("example.com.").unwrap(),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        )
    }

    #[test]
    fn insert_get_remove() {
        let mut pool = QueryPool::new();

        let id = pool.insert(client_addr(), 0x1234, query(0x1234)).unwrap();
        assert_eq!(0x1234, pool.get(id).unwrap().client_id);
        assert_eq!(1, pool.len());

        let slot = pool.remove(id).unwrap();
        assert_eq!(id, slot.id);
        assert_eq!(0, pool.len());
        assert!(pool.get(id).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut pool = QueryPool::new();
        let id = pool.insert(client_addr(), 1, query(1)).unwrap();

        assert!(pool.remove(id).is_some());
        assert!(pool.remove(id).is_none());
        assert_eq!(0, pool.len());
    }

    #[test]
    fn reused_index_gets_a_new_generation() {
        let mut pool = QueryPool::new();

        // drain the initial free list so the recycled id comes up
        let ids: Vec<u16> = (0..QUERY_POOL_MAX_SIZE)
            .map(|i| pool.insert(client_addr(), i as u16, query(i as u16)).unwrap())
            .collect();
        let first = ids[0];
        pool.remove(first).unwrap();

        let recycled = pool.insert(client_addr(), 999, query(999)).unwrap();
        assert_ne!(first, recycled);
        assert_eq!(
            first.wrapping_add(QUERY_POOL_MAX_SIZE as u16),
            recycled
        );

        // the stale id addresses the same table index but no longer
        // resolves
        assert!(pool.get(first).is_none());
        assert_eq!(999, pool.get(recycled).unwrap().client_id);
        assert!(pool.remove(first).is_none());
        assert_eq!(QUERY_POOL_MAX_SIZE, pool.len());
    }

    #[test]
    fn pool_refuses_inserts_when_full() {
        let mut pool = QueryPool::new();
        for i in 0..QUERY_POOL_MAX_SIZE {
            assert!(pool.insert(client_addr(), i as u16, query(i as u16)).is_some());
        }
        assert!(pool.is_full());
        assert_eq!(None, pool.insert(client_addr(), 9999, query(9999)));
    }

    #[test]
    fn slot_ids_wrap_within_u16() {
        let mut pool = QueryPool::new();
        let message = query(0);

        // enough insert/remove pairs to wrap the 16-bit id space; a
        // freed id must always read as stale afterwards
        let mut last = pool.insert(client_addr(), 0, message.clone()).unwrap();
        for _ in 0..(1usize << 16) + 16 {
            pool.remove(last).unwrap();
            let next = pool.insert(client_addr(), 0, message.clone()).unwrap();
            assert!(pool.get(last).is_none());
            last = next;
        }
    }
}
