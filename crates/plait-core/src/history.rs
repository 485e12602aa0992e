//! The causal-history graph: hash-linked changes, heads, pending queue.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::change::{sha256_bytes, Change, ChangeHash};
use crate::identity::ActorId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HistoryError {
    /// A different change already occupies this (actor, seq) slot.
    #[error("duplicate seq {seq} for actor {actor}")]
    DuplicateSeq { actor: String, seq: u64 },
    #[error("seq {got} for actor {actor} is not the next expected ({expected})")]
    InvalidSequence { actor: String, got: u64, expected: u64 },
    #[error("op counters of change {hash} are not past this actor's previous ops")]
    OpCounterReuse { hash: ChangeHash },
    #[error("unknown dependency {hash}")]
    UnknownDependency { hash: ChangeHash },
    #[error("pending queue limit {limit} exceeded")]
    PendingLimitExceeded { limit: usize },
}

/// An applied change together with its canonical bytes and hash, computed
/// once on insert.
#[derive(Clone, Debug)]
pub struct StoredChange {
    pub change: Change,
    pub hash: ChangeHash,
    pub bytes: Bytes,
}

/// Outcome of offering one change to the graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inserted {
    /// Hash already known (applied or parked); nothing happened.
    Duplicate,
    /// Parked until its missing deps arrive.
    Pending,
    /// Applied, possibly promoting parked changes; hashes in application
    /// order.
    Applied(Vec<ChangeHash>),
}

/// Causal graph of changes keyed by hash.
///
/// Owns seq-chain and op-counter validation; CRDT semantics live in the
/// OpSet, which consumes changes in the order this graph applies them.
#[derive(Clone, Debug, Default)]
pub struct History {
    changes: BTreeMap<ChangeHash, StoredChange>,
    by_actor: BTreeMap<ActorId, Vec<ChangeHash>>,
    heads: BTreeSet<ChangeHash>,
    pending: BTreeMap<ChangeHash, Change>,
    max_op_by_actor: BTreeMap<ActorId, u64>,
    pending_limit: usize,
}

impl History {
    pub fn new(pending_limit: usize) -> Self {
        History {
            pending_limit,
            ..History::default()
        }
    }

    pub fn contains(&self, hash: &ChangeHash) -> bool {
        self.changes.contains_key(hash)
    }

    pub fn get(&self, hash: &ChangeHash) -> Option<&StoredChange> {
        self.changes.get(hash)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Current heads, sorted.
    pub fn heads(&self) -> Vec<ChangeHash> {
        self.heads.iter().copied().collect()
    }

    /// Greatest op counter applied for `actor`.
    pub fn max_op_for(&self, actor: &ActorId) -> u64 {
        self.max_op_by_actor.get(actor).copied().unwrap_or(0)
    }

    /// Number of applied changes authored by `actor`.
    pub fn seq_for(&self, actor: &ActorId) -> u64 {
        self.by_actor.get(actor).map_or(0, |v| v.len() as u64)
    }

    pub fn iter_hashes(&self) -> impl Iterator<Item = &ChangeHash> {
        self.changes.keys()
    }

    /// Offer a change. Known hashes are no-ops; changes with unknown deps
    /// park in the pending queue; everything else applies, together with
    /// any parked changes it unblocks.
    pub fn insert(&mut self, change: Change) -> Result<Inserted, HistoryError> {
        let bytes = change.encode();
        let hash = sha256_bytes(&bytes);
        if self.changes.contains_key(&hash) || self.pending.contains_key(&hash) {
            trace!(%hash, "change already known");
            return Ok(Inserted::Duplicate);
        }

        if change.deps.iter().any(|dep| !self.changes.contains_key(dep)) {
            if self.pending.len() >= self.pending_limit {
                return Err(HistoryError::PendingLimitExceeded {
                    limit: self.pending_limit,
                });
            }
            debug!(%hash, actor = %change.actor, seq = change.seq, "parking change with missing deps");
            self.pending.insert(hash, change);
            return Ok(Inserted::Pending);
        }

        self.apply_ready(hash, change, bytes)?;
        let mut applied = vec![hash];
        self.promote_pending(&mut applied)?;
        Ok(Inserted::Applied(applied))
    }

    /// Apply a change whose deps are all present.
    fn apply_ready(
        &mut self,
        hash: ChangeHash,
        change: Change,
        bytes: Bytes,
    ) -> Result<(), HistoryError> {
        let expected = self.seq_for(&change.actor) + 1;
        if change.seq < expected {
            return Err(HistoryError::DuplicateSeq {
                actor: change.actor.to_hex(),
                seq: change.seq,
            });
        }
        if change.seq > expected {
            return Err(HistoryError::InvalidSequence {
                actor: change.actor.to_hex(),
                got: change.seq,
                expected,
            });
        }
        if change.num_ops() > 0 && change.start_op <= self.max_op_for(&change.actor) {
            return Err(HistoryError::OpCounterReuse { hash });
        }

        for dep in &change.deps {
            self.heads.remove(dep);
        }
        self.heads.insert(hash);
        self.by_actor
            .entry(change.actor.clone())
            .or_default()
            .push(hash);
        let max_op = change.max_op();
        let entry = self.max_op_by_actor.entry(change.actor.clone()).or_insert(0);
        *entry = (*entry).max(max_op);
        debug!(%hash, actor = %change.actor, seq = change.seq, "applied change");
        self.changes.insert(
            hash,
            StoredChange {
                change,
                hash,
                bytes,
            },
        );
        Ok(())
    }

    /// Promote parked changes whose dep sets are now satisfied, smallest
    /// hash first for determinism.
    fn promote_pending(&mut self, applied: &mut Vec<ChangeHash>) -> Result<(), HistoryError> {
        loop {
            let ready = self
                .pending
                .iter()
                .find(|(_, c)| c.deps.iter().all(|d| self.changes.contains_key(d)))
                .map(|(h, _)| *h);
            let Some(hash) = ready else {
                return Ok(());
            };
            let change = self.pending.remove(&hash).expect("hash just found");
            let bytes = change.encode();
            self.apply_ready(hash, change, bytes)?;
            applied.push(hash);
        }
    }

    /// All applied hashes reachable from `starts` (inclusive) by following
    /// deps.
    fn ancestors(&self, starts: &[ChangeHash]) -> BTreeSet<ChangeHash> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<ChangeHash> = starts.iter().copied().collect();
        while let Some(hash) = queue.pop_front() {
            if !seen.insert(hash) {
                continue;
            }
            if let Some(stored) = self.changes.get(&hash) {
                queue.extend(stored.change.deps.iter().copied());
            }
        }
        seen
    }

    /// All applied changes not reachable from `have_deps`, in canonical
    /// order. Errors if a supplied hash was never seen.
    pub fn get_changes(
        &self,
        have_deps: &[ChangeHash],
    ) -> Result<Vec<&StoredChange>, HistoryError> {
        for dep in have_deps {
            if !self.changes.contains_key(dep) {
                return Err(HistoryError::UnknownDependency { hash: *dep });
            }
        }
        let known = self.ancestors(have_deps);
        Ok(self
            .canonical_order()
            .into_iter()
            .filter(|h| !known.contains(h))
            .map(|h| &self.changes[&h])
            .collect())
    }

    pub fn get_all_changes(&self) -> Vec<&StoredChange> {
        self.canonical_order()
            .into_iter()
            .map(|h| &self.changes[&h])
            .collect()
    }

    /// Union of unsatisfied dep hashes in the pending queue, plus any of
    /// `extra_heads` unknown locally. Sorted.
    pub fn get_missing_deps(&self, extra_heads: &[ChangeHash]) -> Vec<ChangeHash> {
        let mut missing = BTreeSet::new();
        for change in self.pending.values() {
            for dep in &change.deps {
                if !self.changes.contains_key(dep) && !self.pending.contains_key(dep) {
                    missing.insert(*dep);
                }
            }
        }
        for head in extra_heads {
            if !self.changes.contains_key(head) && !self.pending.contains_key(head) {
                missing.insert(*head);
            }
        }
        missing.into_iter().collect()
    }

    /// The canonical total order: topological over deps, ties broken by
    /// hash ascending. Used for batch application and document encoding.
    pub fn canonical_order(&self) -> Vec<ChangeHash> {
        let mut blocked: BTreeMap<ChangeHash, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<ChangeHash, Vec<ChangeHash>> = BTreeMap::new();
        for (hash, stored) in &self.changes {
            blocked.insert(*hash, stored.change.deps.len());
            for dep in &stored.change.deps {
                dependents.entry(*dep).or_default().push(*hash);
            }
        }
        let mut frontier: BTreeSet<ChangeHash> = blocked
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(h, _)| *h)
            .collect();
        let mut order = Vec::with_capacity(self.changes.len());
        while let Some(hash) = frontier.iter().next().copied() {
            frontier.remove(&hash);
            order.push(hash);
            if let Some(next) = dependents.get(&hash) {
                for dependent in next {
                    let n = blocked.get_mut(dependent).expect("dependent is applied");
                    *n -= 1;
                    if *n == 0 {
                        frontier.insert(*dependent);
                    }
                }
            }
        }
        debug_assert_eq!(order.len(), self.changes.len(), "dependency cycle");
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Key, ObjId};
    use crate::op::Op;

    fn actor(byte: u8) -> ActorId {
        ActorId::from_bytes(vec![byte]).unwrap()
    }

    fn change(actor_byte: u8, seq: u64, deps: Vec<ChangeHash>) -> Change {
        Change::new(
            actor(actor_byte),
            seq,
            seq,
            0,
            None,
            deps,
            vec![Op::set(
                ObjId::Root,
                Key::map(format!("k{seq}")),
                (seq as i64).into(),
                vec![],
            )],
        )
    }

    #[test]
    fn heads_track_the_frontier() {
        let mut history = History::new(100);
        let a = change(1, 1, vec![]);
        let ha = a.hash();
        history.insert(a).unwrap();
        assert_eq!(history.heads(), vec![ha]);

        let b = change(1, 2, vec![ha]);
        let hb = b.hash();
        history.insert(b).unwrap();
        assert_eq!(history.heads(), vec![hb]);
    }

    #[test]
    fn duplicate_insert_is_a_noop() {
        let mut history = History::new(100);
        let a = change(1, 1, vec![]);
        history.insert(a.clone()).unwrap();
        assert_eq!(history.insert(a).unwrap(), Inserted::Duplicate);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn out_of_order_change_parks_then_applies() {
        let mut history = History::new(100);
        let a = change(1, 1, vec![]);
        let ha = a.hash();
        let b = change(1, 2, vec![ha]);
        let hb = b.hash();

        assert_eq!(history.insert(b).unwrap(), Inserted::Pending);
        assert_eq!(history.get_missing_deps(&[]), vec![ha]);

        let applied = history.insert(a).unwrap();
        assert_eq!(applied, Inserted::Applied(vec![ha, hb]));
        assert_eq!(history.heads(), vec![hb]);
        assert_eq!(history.pending_len(), 0);
    }

    #[test]
    fn seq_gap_is_rejected_at_apply_time() {
        let mut history = History::new(100);
        let err = history.insert(change(1, 3, vec![])).unwrap_err();
        assert!(matches!(err, HistoryError::InvalidSequence { got: 3, expected: 1, .. }));
    }

    #[test]
    fn conflicting_seq_reuse_is_rejected() {
        let mut history = History::new(100);
        history.insert(change(1, 1, vec![])).unwrap();
        // Different payload, same (actor, seq).
        let mut dup = change(1, 1, vec![]);
        dup.time = 1;
        let err = history.insert(dup).unwrap_err();
        assert!(matches!(err, HistoryError::DuplicateSeq { seq: 1, .. }));
    }

    #[test]
    fn get_changes_stops_at_have_deps() {
        let mut history = History::new(100);
        let a = change(1, 1, vec![]);
        let ha = a.hash();
        let b = change(1, 2, vec![ha]);
        let hb = b.hash();
        history.insert(a).unwrap();
        history.insert(b).unwrap();

        let delta = history.get_changes(&[ha]).unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].hash, hb);

        let all = history.get_changes(&[]).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn get_changes_rejects_unknown_hash() {
        let history = History::new(100);
        let bogus = ChangeHash([7; 32]);
        assert_eq!(
            history.get_changes(&[bogus]).unwrap_err(),
            HistoryError::UnknownDependency { hash: bogus }
        );
    }

    #[test]
    fn pending_limit_is_enforced() {
        let mut history = History::new(1);
        let missing = ChangeHash([1; 32]);
        history.insert(change(1, 1, vec![missing])).unwrap();
        let err = history.insert(change(2, 1, vec![missing])).unwrap_err();
        assert_eq!(err, HistoryError::PendingLimitExceeded { limit: 1 });
    }

    #[test]
    fn canonical_order_breaks_ties_by_hash() {
        let mut history = History::new(100);
        let a = change(1, 1, vec![]);
        let b = change(2, 1, vec![]);
        let (ha, hb) = (a.hash(), b.hash());
        history.insert(a).unwrap();
        history.insert(b).unwrap();

        let order = history.canonical_order();
        let mut expected = vec![ha, hb];
        expected.sort_unstable();
        assert_eq!(order, expected);
    }
}
