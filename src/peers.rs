//! # Peer Directory
//!
//! The directory is the single arena of [`PeerRecord`]s, keyed by
//! [`Identity`]. Bootstrap, discovery, the DHT responder and the flood relay
//! all read and mutate peers through it; nobody holds references into the
//! arena.
//!
//! ## Connection state
//!
//! ```text
//! Unknown ──► Connecting ──► Connected
//!    ▲            │              │
//!    │            ▼              ▼
//!    └───────── Failed ◄─────────┘   (re-dial only)
//! ```
//!
//! `Failed → Connecting` only happens when a caller explicitly dials again
//! (re-bootstrap or a fresh discovery round).
//!
//! ## Locking
//!
//! One `RwLock` guards the map. Every method holds it for a bounded amount of
//! in-memory work and never across an `.await`, so concurrent upserts are
//! atomic and address sets are merged, never overwritten.

use std::collections::{BinaryHeap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identity::{distance_cmp, Contact, Identity};

/// Upper bound on tracked peers. When full, the stalest record that is not
/// Connected or Connecting is evicted to make room.
pub const MAX_PEER_RECORDS: usize = 10_000;

/// Upper bound on addresses remembered per peer.
pub const MAX_ADDRS_PER_PEER: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unknown,
    Connecting,
    Connected,
    Failed,
}

#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub identity: Identity,
    pub addrs: Vec<String>,
    pub last_seen: Instant,
    pub state: ConnectionState,
}

impl PeerRecord {
    fn new(identity: Identity) -> Self {
        Self {
            identity,
            addrs: Vec::new(),
            last_seen: Instant::now(),
            state: ConnectionState::Unknown,
        }
    }

    pub fn contact(&self) -> Contact {
        Contact::new(self.identity, self.addrs.clone())
    }

    fn merge_addrs(&mut self, addrs: &[String]) {
        for addr in addrs {
            if self.addrs.len() >= MAX_ADDRS_PER_PEER {
                break;
            }
            if !self.addrs.contains(addr) {
                self.addrs.push(addr.clone());
            }
        }
    }
}

#[derive(Debug)]
pub struct PeerDirectory {
    local: Identity,
    records: RwLock<HashMap<Identity, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new(local: Identity) -> Self {
        Self {
            local,
            records: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Identity, PeerRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Identity, PeerRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge `addrs` into the record for `identity`, creating it if needed.
    ///
    /// Returns `None` for the local identity or when the directory is full of
    /// live peers.
    pub fn upsert(&self, identity: Identity, addrs: &[String]) -> Option<PeerRecord> {
        if identity == self.local {
            return None;
        }
        let mut records = self.write();
        if !records.contains_key(&identity) && records.len() >= MAX_PEER_RECORDS {
            let victim = records
                .values()
                .filter(|r| matches!(r.state, ConnectionState::Unknown | ConnectionState::Failed))
                .min_by_key(|r| r.last_seen)
                .map(|r| r.identity);
            match victim {
                Some(id) => {
                    records.remove(&id);
                    trace!(peer = %id.short(), "evicted stale peer record");
                }
                None => {
                    debug!(peer = %identity.short(), "peer directory full, dropping new peer");
                    return None;
                }
            }
        }
        let record = records
            .entry(identity)
            .or_insert_with(|| PeerRecord::new(identity));
        record.merge_addrs(addrs);
        record.last_seen = Instant::now();
        Some(record.clone())
    }

    pub fn upsert_contact(&self, contact: &Contact) -> Option<PeerRecord> {
        self.upsert(contact.identity, &contact.addrs)
    }

    /// Begin a dial. Allowed from `Unknown` and `Failed`.
    ///
    /// Returns `false` when the peer is already connecting or connected, in
    /// which case the caller should not dial.
    pub fn mark_connecting(&self, identity: &Identity) -> bool {
        self.transition(identity, |state| match state {
            ConnectionState::Unknown | ConnectionState::Failed => Some(ConnectionState::Connecting),
            _ => None,
        })
    }

    /// Complete a dial. Only valid from `Connecting`.
    pub fn mark_connected(&self, identity: &Identity) -> bool {
        self.transition(identity, |state| match state {
            ConnectionState::Connecting => Some(ConnectionState::Connected),
            _ => None,
        })
    }

    /// Record a failed dial or a lost connection.
    pub fn mark_failed(&self, identity: &Identity) -> bool {
        self.transition(identity, |state| match state {
            ConnectionState::Connecting | ConnectionState::Connected => Some(ConnectionState::Failed),
            _ => None,
        })
    }

    /// A peer opened a session to us. Only an `Unknown` record is promoted
    /// to `Connected`; a `Failed` peer keeps its state (with refreshed
    /// addresses) until it is dialed again, and a `Connecting` one is left
    /// to the dialer.
    pub fn mark_inbound(&self, contact: &Contact) -> bool {
        if self.upsert_contact(contact).is_none() {
            return false;
        }
        self.transition(&contact.identity, |state| match state {
            ConnectionState::Unknown => Some(ConnectionState::Connected),
            _ => None,
        })
    }

    fn transition(
        &self,
        identity: &Identity,
        next: impl FnOnce(ConnectionState) -> Option<ConnectionState>,
    ) -> bool {
        let mut records = self.write();
        let Some(record) = records.get_mut(identity) else {
            return false;
        };
        match next(record.state) {
            Some(state) => {
                trace!(peer = %identity.short(), from = ?record.state, to = ?state, "peer state change");
                record.state = state;
                record.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, identity: &Identity) -> Option<PeerRecord> {
        self.read().get(identity).cloned()
    }

    pub fn state(&self, identity: &Identity) -> Option<ConnectionState> {
        self.read().get(identity).map(|r| r.state)
    }

    pub fn connected(&self) -> Vec<Contact> {
        self.read()
            .values()
            .filter(|r| r.state == ConnectionState::Connected)
            .map(PeerRecord::contact)
            .collect()
    }

    pub fn count_in(&self, state: ConnectionState) -> usize {
        self.read().values().filter(|r| r.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// The `k` dialable peers closest to `target` by XOR distance, nearest
    /// first. Failed peers and peers without addresses are skipped.
    pub fn closest(&self, target: &Identity, k: usize) -> Vec<Contact> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct DistContact {
            dist: [u8; 32],
            contact: Contact,
        }

        impl Ord for DistContact {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistContact {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<DistContact> = BinaryHeap::with_capacity(k + 1);

        for record in self.read().values() {
            if record.state == ConnectionState::Failed || record.addrs.is_empty() {
                continue;
            }
            let dist = record.identity.xor_distance(target);
            if heap.len() < k {
                heap.push(DistContact { dist, contact: record.contact() });
            } else if let Some(max_entry) = heap.peek()
                && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
            {
                heap.push(DistContact { dist, contact: record.contact() });
                heap.pop();
            }
        }

        heap.into_sorted_vec().into_iter().map(|dc| dc.contact).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(byte: u8) -> Identity {
        Identity::from_bytes([byte; 32])
    }

    fn addr(port: u16) -> String {
        format!("127.0.0.1:{port}")
    }

    #[test]
    fn upsert_creates_unknown_record() {
        let dir = PeerDirectory::new(id(0));
        let record = dir.upsert(id(1), &[addr(1)]).expect("record");
        assert_eq!(record.state, ConnectionState::Unknown);
        assert_eq!(record.addrs, vec![addr(1)]);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn upsert_ignores_local_identity() {
        let dir = PeerDirectory::new(id(0));
        assert!(dir.upsert(id(0), &[addr(1)]).is_none());
        assert!(dir.is_empty());
    }

    #[test]
    fn upsert_merges_addresses() {
        let dir = PeerDirectory::new(id(0));
        dir.upsert(id(1), &[addr(1)]);
        dir.upsert(id(1), &[addr(2), addr(1)]);
        let record = dir.get(&id(1)).expect("record");
        assert_eq!(record.addrs, vec![addr(1), addr(2)]);
    }

    #[test]
    fn concurrent_upserts_do_not_lose_addresses() {
        let dir = Arc::new(PeerDirectory::new(id(0)));
        let handles: Vec<_> = (0..MAX_ADDRS_PER_PEER as u16)
            .map(|port| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    dir.upsert(id(1), &[addr(port)]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        let record = dir.get(&id(1)).expect("record");
        assert_eq!(record.addrs.len(), MAX_ADDRS_PER_PEER);
    }

    #[test]
    fn state_machine_follows_allowed_transitions() {
        let dir = PeerDirectory::new(id(0));
        dir.upsert(id(1), &[addr(1)]);

        assert!(!dir.mark_connected(&id(1)), "Unknown cannot jump to Connected");
        assert!(!dir.mark_failed(&id(1)), "Unknown cannot fail");

        assert!(dir.mark_connecting(&id(1)));
        assert!(!dir.mark_connecting(&id(1)), "already dialing");
        assert!(dir.mark_connected(&id(1)));
        assert_eq!(dir.state(&id(1)), Some(ConnectionState::Connected));

        assert!(!dir.mark_connecting(&id(1)), "connected peers are not re-dialed");
        assert!(dir.mark_failed(&id(1)));
        assert!(!dir.mark_connected(&id(1)), "Failed cannot jump to Connected");

        assert!(dir.mark_connecting(&id(1)), "explicit re-dial from Failed");
        assert!(dir.mark_failed(&id(1)));
        assert_eq!(dir.state(&id(1)), Some(ConnectionState::Failed));
    }

    #[test]
    fn transitions_on_unknown_peer_are_noops() {
        let dir = PeerDirectory::new(id(0));
        assert!(!dir.mark_connecting(&id(9)));
        assert!(!dir.mark_connected(&id(9)));
        assert!(!dir.mark_failed(&id(9)));
    }

    #[test]
    fn inbound_marks_connected() {
        let dir = PeerDirectory::new(id(0));
        assert!(dir.mark_inbound(&Contact::single(id(3), addr(3))));
        assert_eq!(dir.state(&id(3)), Some(ConnectionState::Connected));
        assert_eq!(dir.connected().len(), 1);
        assert_eq!(dir.count_in(ConnectionState::Connected), 1);
    }

    #[test]
    fn inbound_does_not_revive_failed_peer() {
        let dir = PeerDirectory::new(id(0));
        dir.upsert(id(1), &[addr(1)]);
        dir.mark_connecting(&id(1));
        dir.mark_failed(&id(1));

        assert!(!dir.mark_inbound(&Contact::single(id(1), addr(2))));
        assert_eq!(dir.state(&id(1)), Some(ConnectionState::Failed));
        assert_eq!(dir.get(&id(1)).expect("record").addrs, vec![addr(1), addr(2)]);
        assert!(dir.connected().is_empty());

        assert!(dir.mark_connecting(&id(1)), "explicit re-dial");
        assert!(dir.mark_connected(&id(1)));
    }

    #[test]
    fn inbound_leaves_dialing_and_connected_peers_alone() {
        let dir = PeerDirectory::new(id(0));
        dir.upsert(id(1), &[addr(1)]);
        dir.mark_connecting(&id(1));
        assert!(!dir.mark_inbound(&Contact::single(id(1), addr(1))));
        assert_eq!(dir.state(&id(1)), Some(ConnectionState::Connecting));

        assert!(dir.mark_connected(&id(1)));
        assert!(!dir.mark_inbound(&Contact::single(id(1), addr(1))));
        assert_eq!(dir.state(&id(1)), Some(ConnectionState::Connected));
    }

    #[test]
    fn closest_orders_by_xor_and_skips_failed() {
        let dir = PeerDirectory::new(id(0));
        for b in [0x01u8, 0x02, 0x04, 0x08] {
            dir.upsert(id(b), &[addr(b as u16)]);
        }
        dir.mark_connecting(&id(0x02));
        dir.mark_failed(&id(0x02));

        let target = id(0x00);
        let closest = dir.closest(&target, 2);
        let ids: Vec<_> = closest.iter().map(|c| c.identity).collect();
        assert_eq!(ids, vec![id(0x01), id(0x04)]);

        assert!(dir.closest(&target, 0).is_empty());
        assert_eq!(dir.closest(&target, 10).len(), 3);
    }

    #[test]
    fn closest_skips_peers_without_addresses() {
        let dir = PeerDirectory::new(id(0));
        dir.upsert(id(1), &[]);
        dir.upsert(id(2), &[addr(2)]);
        let closest = dir.closest(&id(1), 5);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].identity, id(2));
    }
}
