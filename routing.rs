//! k-bucket routing table. Generalizes the `KademliaTable` shape previously
//! seen in `kademlia.rs` from Ethereum-specific `H256`/`PeerData` types to the
//! `NodeId`/`NodeRecord` model in `types.rs`, and makes the eviction-challenge
//! step (§3 Bucket invariant) an explicit callback instead of something woven
//! into the connection layer, since this crate's discovery and connection
//! cores are separate modules.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::types::{NodeId, NodeRecord};

pub const BUCKET_COUNT: usize = NodeId::BITS;
pub const K: usize = 16;

#[derive(Debug, Default)]
pub struct Bucket {
    /// Least-recently-seen first; `touch` moves an entry to the tail.
    entries: Vec<NodeRecord>,
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|r| r.node_id() == *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= K
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.entries.iter()
    }

    pub fn least_recently_seen(&self) -> Option<&NodeRecord> {
        self.entries.first()
    }
}

/// Outcome of attempting to insert a record into a full bucket: the caller
/// (the discovery service) must ping `challenged` and report back via
/// `RoutingTable::resolve_challenge`.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
    /// Bucket is full; `challenged` is the least-recently-seen entry the
    /// caller must ping before the candidate can be admitted.
    PendingChallenge { challenged: NodeRecord },
    /// Bucket is full and already has a challenge outstanding; the
    /// candidate was queued behind it rather than discarded. No new ping
    /// is needed — `resolve_challenge` will drain the queue.
    Queued,
}

struct Inner {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    /// Candidates parked behind a `PendingChallenge` outcome, keyed by the
    /// bucket index whose least-recently-seen entry is being challenged.
    /// A bucket can accumulate more than one parked candidate while its
    /// single in-flight challenge is outstanding; they queue up FIFO rather
    /// than overwrite one another.
    pending: std::collections::HashMap<usize, Vec<NodeRecord>>,
    /// Secondary index (§3 RoutingTable: "160 buckets plus an index
    /// `nodes_by_endpoint`") letting the discovery service resolve an
    /// inbound datagram's source address back to a node id.
    nodes_by_addr: HashMap<SocketAddr, NodeId>,
    size: usize,
}

/// Thread-safe: readers (`closest_to`, `contains`) proceed concurrently;
/// mutators (`add`, `drop`, `touch`) take the write lock.
pub struct RoutingTable {
    inner: RwLock<Inner>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Arc<Self> {
        Arc::new(RoutingTable {
            inner: RwLock::new(Inner {
                local_id,
                buckets: (0..BUCKET_COUNT).map(|_| Bucket::default()).collect(),
                pending: std::collections::HashMap::new(),
                nodes_by_addr: HashMap::new(),
                size: 0,
            }),
        })
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("routing table lock poisoned")
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("routing table lock poisoned")
    }

    pub fn local_id(&self) -> NodeId {
        self.lock_read().local_id
    }

    pub fn len(&self) -> usize {
        self.lock_read().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let inner = self.lock_read();
        let Some(idx) = inner.local_id.bucket_index(id) else {
            return false;
        };
        inner.buckets[idx].position(id).is_some()
    }

    /// Inserts `record`, or reports that the target bucket is full and names
    /// the entry the discovery service must challenge (§3 Bucket invariant).
    /// `self` (the local id) is never inserted.
    pub fn add(&self, record: NodeRecord) -> InsertOutcome {
        let mut inner = self.lock_write();
        let local_id = inner.local_id;
        let Some(idx) = local_id.bucket_index(&record.node_id()) else {
            return InsertOutcome::AlreadyPresent;
        };
        if inner.buckets[idx].position(&record.node_id()).is_some() {
            return InsertOutcome::AlreadyPresent;
        }
        if inner.buckets[idx].is_full() {
            if let Some(queue) = inner.pending.get_mut(&idx) {
                // A challenge for this bucket is already outstanding; queue
                // behind it instead of overwriting the earlier candidate.
                queue.push(record);
                return InsertOutcome::Queued;
            }
            let challenged = inner.buckets[idx]
                .least_recently_seen()
                .cloned()
                .expect("full bucket has at least one entry");
            inner.pending.insert(idx, vec![record]);
            return InsertOutcome::PendingChallenge { challenged };
        }
        inner.nodes_by_addr.insert(record.endpoint.udp_addr(), record.node_id());
        inner.buckets[idx].entries.push(record);
        inner.size += 1;
        InsertOutcome::Inserted
    }

    /// Resolves an inbound datagram's source address to the node id the
    /// routing table last saw announce it, via `nodes_by_endpoint`.
    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<NodeId> {
        self.lock_read().nodes_by_addr.get(addr).copied()
    }

    /// Resolves a `PendingChallenge`: if the challenged entry answered
    /// (`survived = true`) it is moved to the tail and the head-of-queue
    /// candidate is discarded; otherwise the challenged entry is evicted and
    /// that candidate takes its place. If another candidate was queued
    /// behind this challenge, the bucket (still full either way) starts a
    /// fresh challenge against its new least-recently-seen entry and that
    /// entry is returned so the caller can ping it.
    pub fn resolve_challenge(&self, challenged_id: &NodeId, survived: bool) -> Option<NodeRecord> {
        let mut inner = self.lock_write();
        let local_id = inner.local_id;
        let idx = local_id.bucket_index(challenged_id)?;
        let mut queue = inner.pending.remove(&idx)?;
        if queue.is_empty() {
            return None;
        }
        let candidate = queue.remove(0);
        if survived {
            if let Some(pos) = inner.buckets[idx].position(challenged_id) {
                let entry = inner.buckets[idx].entries.remove(pos);
                inner.buckets[idx].entries.push(entry);
            }
            debug!(bucket = idx, "challenged entry survived, candidate discarded");
        } else {
            if let Some(pos) = inner.buckets[idx].position(challenged_id) {
                let evicted = inner.buckets[idx].entries.remove(pos);
                inner.nodes_by_addr.remove(&evicted.endpoint.udp_addr());
                inner.size -= 1;
            }
            inner.nodes_by_addr.insert(candidate.endpoint.udp_addr(), candidate.node_id());
            inner.buckets[idx].entries.push(candidate);
            inner.size += 1;
            debug!(bucket = idx, "challenged entry evicted, candidate admitted");
        }

        if queue.is_empty() {
            return None;
        }
        let next_challenged = inner.buckets[idx].least_recently_seen().cloned();
        if let Some(challenged) = &next_challenged {
            debug!(bucket = idx, challenged = %challenged.node_id(), "starting queued challenge");
        }
        inner.pending.insert(idx, queue);
        next_challenged
    }

    pub fn drop_node(&self, id: &NodeId) -> bool {
        let mut inner = self.lock_write();
        let local_id = inner.local_id;
        let Some(idx) = local_id.bucket_index(id) else {
            return false;
        };
        if let Some(pos) = inner.buckets[idx].position(id) {
            let removed = inner.buckets[idx].entries.remove(pos);
            inner.nodes_by_addr.remove(&removed.endpoint.udp_addr());
            inner.size -= 1;
            true
        } else {
            false
        }
    }

    /// Updates `last_seen`/liveness in place and moves the entry to the tail
    /// of its bucket (most-recently-seen).
    pub fn touch(&self, id: &NodeId, mutate: impl FnOnce(&mut NodeRecord)) -> bool {
        let mut inner = self.lock_write();
        let local_id = inner.local_id;
        let Some(idx) = local_id.bucket_index(id) else {
            return false;
        };
        let Some(pos) = inner.buckets[idx].position(id) else {
            return false;
        };
        let mut entry = inner.buckets[idx].entries.remove(pos);
        let old_addr = entry.endpoint.udp_addr();
        mutate(&mut entry);
        let new_addr = entry.endpoint.udp_addr();
        if old_addr != new_addr {
            inner.nodes_by_addr.remove(&old_addr);
        }
        inner.nodes_by_addr.insert(new_addr, entry.node_id());
        inner.buckets[idx].entries.push(entry);
        true
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeRecord> {
        let inner = self.lock_read();
        let idx = inner.local_id.bucket_index(id)?;
        inner.buckets[idx]
            .position(id)
            .map(|pos| inner.buckets[idx].entries[pos].clone())
    }

    /// Up to `n` records sorted by ascending XOR distance from `target`,
    /// ties broken by more-recent `last_seen`.
    pub fn closest_to(&self, target: &NodeId, n: usize) -> Vec<NodeRecord> {
        let inner = self.lock_read();
        let mut all: Vec<NodeRecord> = inner
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect();
        all.sort_by(|a, b| {
            let da = target.distance(&a.node_id());
            let db = target.distance(&b.node_id());
            da.cmp(&db).then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        all.truncate(n);
        all
    }

    /// All records reputable enough, and with a resolvable endpoint, to be
    /// handed to the channel manager as outbound-dial candidates.
    pub fn connectable(&self, min_reputation: i32) -> Vec<NodeRecord> {
        let inner = self.lock_read();
        inner
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|r| r.reputation_score >= min_reputation)
            .cloned()
            .collect()
    }

    /// Bucket indices whose entries have not been touched within `stale_after`
    /// seconds of `now` — candidates for the table-maintenance refresh tick.
    pub fn stale_buckets(&self, now: u64, stale_after_secs: u64) -> Vec<usize> {
        let inner = self.lock_read();
        inner
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| match b.least_recently_seen() {
                Some(r) => now.saturating_sub(r.last_seen) >= stale_after_secs,
                None => false,
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn bucket_len(&self, idx: usize) -> usize {
        self.lock_read().buckets[idx].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Endpoint;
    use std::net::IpAddr;

    fn record(byte: u8) -> NodeRecord {
        let mut id = [0u8; 20];
        id[19] = byte;
        NodeRecord::new(Endpoint {
            node_id: NodeId(id),
            ip: IpAddr::from([127, 0, 0, 1]),
            udp_port: 30000 + byte as u16,
            tcp_port: 40000 + byte as u16,
        })
    }

    #[test]
    fn bucket_cap_enforced_via_challenge() {
        let table = RoutingTable::new(NodeId::zero());
        for i in 1..=K as u8 {
            assert!(matches!(table.add(record(i)), InsertOutcome::Inserted));
        }
        assert_eq!(table.len(), K);
        match table.add(record(K as u8 + 1)) {
            InsertOutcome::PendingChallenge { challenged } => {
                assert_eq!(challenged.node_id(), record(1).node_id());
            }
            other => panic!("expected PendingChallenge, got {other:?}"),
        }
        assert_eq!(table.len(), K, "candidate must not be admitted until resolved");
    }

    #[test]
    fn challenge_eviction_admits_candidate() {
        let table = RoutingTable::new(NodeId::zero());
        for i in 1..=K as u8 {
            table.add(record(i));
        }
        let candidate = record(K as u8 + 1);
        table.add(candidate.clone());
        table.resolve_challenge(&record(1).node_id(), false);
        assert_eq!(table.len(), K);
        assert!(table.contains(&candidate.node_id()));
        assert!(!table.contains(&record(1).node_id()));
    }

    #[test]
    fn challenge_survival_discards_candidate() {
        let table = RoutingTable::new(NodeId::zero());
        for i in 1..=K as u8 {
            table.add(record(i));
        }
        let candidate = record(K as u8 + 1);
        table.add(candidate.clone());
        table.resolve_challenge(&record(1).node_id(), true);
        assert!(table.contains(&record(1).node_id()));
        assert!(!table.contains(&candidate.node_id()));
    }

    #[test]
    fn closest_to_orders_by_xor_distance() {
        let table = RoutingTable::new(NodeId::zero());
        for i in [1u8, 2, 4, 8] {
            table.add(record(i));
        }
        let target_id = {
            let mut id = [0u8; 20];
            id[19] = 3;
            NodeId(id)
        };
        let closest = table.closest_to(&target_id, 2);
        assert_eq!(closest.len(), 2);
        // distance(3,2)=1, distance(3,1)=2, distance(3,4)=7, distance(3,8)=11
        assert_eq!(closest[0].node_id(), record(2).node_id());
        assert_eq!(closest[1].node_id(), record(1).node_id());
    }

    #[test]
    fn local_id_never_inserted() {
        let local = NodeId::zero();
        let table = RoutingTable::new(local);
        let outcome = table.add(NodeRecord::new(Endpoint {
            node_id: local,
            ip: IpAddr::from([127, 0, 0, 1]),
            udp_port: 1,
            tcp_port: 2,
        }));
        assert!(matches!(outcome, InsertOutcome::AlreadyPresent));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn second_candidate_for_a_contested_bucket_queues_instead_of_overwriting() {
        let table = RoutingTable::new(NodeId::zero());
        for i in 1..=K as u8 {
            table.add(record(i));
        }
        let first_candidate = record(K as u8 + 1);
        let second_candidate = record(K as u8 + 2);
        match table.add(first_candidate.clone()) {
            InsertOutcome::PendingChallenge { .. } => {}
            other => panic!("expected PendingChallenge, got {other:?}"),
        }
        assert!(matches!(
            table.add(second_candidate.clone()),
            InsertOutcome::Queued
        ));

        // First challenge fails: first_candidate is admitted, and the
        // queued second_candidate immediately starts its own challenge
        // against the bucket's new least-recently-seen entry rather than
        // being silently dropped.
        let next = table.resolve_challenge(&record(1).node_id(), false);
        assert!(table.contains(&first_candidate.node_id()));
        let next_challenged = next.expect("second candidate should trigger a follow-up challenge");
        assert_eq!(next_challenged.node_id(), record(2).node_id());

        let resolved = table.resolve_challenge(&next_challenged.node_id(), false);
        assert!(resolved.is_none(), "queue should be drained");
        assert!(table.contains(&second_candidate.node_id()));
        assert!(!table.contains(&record(2).node_id()));
    }
}
