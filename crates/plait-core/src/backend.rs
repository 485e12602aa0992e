//! The engine facade: history DAG + OpSet behind one synchronous surface.

use bytes::Bytes;
use tracing::debug;

use crate::change::{Change, ChangeHash};
use crate::codec;
use crate::error::BackendError;
use crate::history::{History, Inserted, StoredChange};
use crate::identity::ActorId;
use crate::limits::Limits;
use crate::opset::{OpSet, PatchLog};
use crate::patch::Patch;

/// One replica's engine state for one document.
///
/// Every entry point is synchronous and runs to completion; a `Backend`
/// must not be shared across threads without external exclusion.
#[derive(Clone, Debug)]
pub struct Backend {
    history: History,
    opset: OpSet,
    limits: Limits,
}

impl Default for Backend {
    fn default() -> Self {
        Backend::new()
    }
}

impl Backend {
    pub fn new() -> Self {
        Backend::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Backend {
            history: History::new(limits.max_pending_changes),
            opset: OpSet::new(),
            limits,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Current heads, sorted.
    pub fn get_heads(&self) -> Vec<ChangeHash> {
        self.history.heads()
    }

    pub fn max_op(&self) -> u64 {
        self.opset.max_op()
    }

    /// Next seq / greatest op counter for a local actor.
    pub fn next_seq_for(&self, actor: &ActorId) -> u64 {
        self.history.seq_for(actor) + 1
    }

    pub fn contains_change(&self, hash: &ChangeHash) -> bool {
        self.history.contains(hash)
    }

    pub fn num_changes(&self) -> usize {
        self.history.len()
    }

    pub fn pending_changes(&self) -> usize {
        self.history.pending_len()
    }

    /// Apply remote changes. Changes with unknown deps park silently; the
    /// returned patch covers everything that actually applied.
    pub fn apply_changes(&mut self, mut changes: Vec<Change>) -> Result<Patch, BackendError> {
        // Ties between concurrent changes break by hash; sorting the batch
        // makes the whole application order canonical.
        changes.sort_by_cached_key(Change::hash);
        let mut log = PatchLog::default();
        for change in changes {
            self.insert_and_apply(change, &mut log)?;
        }
        Ok(self.finish_patch(log, None, None))
    }

    /// Decode and apply remote changes from their chunk encodings.
    pub fn apply_encoded_changes<B: AsRef<[u8]>>(
        &mut self,
        chunks: &[B],
    ) -> Result<Patch, BackendError> {
        let changes = chunks
            .iter()
            .map(|chunk| Change::decode(chunk.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.apply_changes(changes)
    }

    /// Apply a change produced by this replica's own frontend. Strict:
    /// unknown deps are an error here, never parked.
    pub fn apply_local_change(&mut self, change: Change) -> Result<Patch, BackendError> {
        let hash = change.hash();
        for dep in &change.deps {
            if !self.history.contains(dep) {
                return Err(BackendError::MissingDependency {
                    change: hash,
                    missing: *dep,
                });
            }
        }
        let actor = change.actor.clone();
        let seq = change.seq;
        let mut log = PatchLog::default();
        self.insert_and_apply(change, &mut log)?;
        debug!(%hash, actor = %actor, seq, "applied local change");
        Ok(self.finish_patch(log, Some(actor), Some(seq)))
    }

    fn insert_and_apply(
        &mut self,
        change: Change,
        log: &mut PatchLog,
    ) -> Result<(), BackendError> {
        match self.history.insert(change)? {
            Inserted::Duplicate | Inserted::Pending => Ok(()),
            Inserted::Applied(hashes) => {
                for hash in hashes {
                    let stored = self.history.get(&hash).expect("hash just applied");
                    self.opset.apply_change(&stored.change, log)?;
                }
                Ok(())
            }
        }
    }

    fn finish_patch(&self, log: PatchLog, actor: Option<ActorId>, seq: Option<u64>) -> Patch {
        Patch {
            actor,
            seq,
            deps: self.history.heads(),
            max_op: self.opset.max_op(),
            pending_changes: self.history.pending_len(),
            diffs: self.opset.build_patch(log),
        }
    }

    /// The full document as the diff from an empty one; what a frontend
    /// uses to rebuild its snapshot after `load`.
    pub fn get_patch(&self) -> Patch {
        Patch {
            actor: None,
            seq: None,
            deps: self.history.heads(),
            max_op: self.opset.max_op(),
            pending_changes: self.history.pending_len(),
            diffs: self.opset.full_diff(),
        }
    }

    /// All applied changes not reachable from `have_deps`, canonical order.
    pub fn get_changes(
        &self,
        have_deps: &[ChangeHash],
    ) -> Result<Vec<&StoredChange>, BackendError> {
        Ok(self.history.get_changes(have_deps)?)
    }

    pub fn get_all_changes(&self) -> Vec<&StoredChange> {
        self.history.get_all_changes()
    }

    pub fn get_change_by_hash(&self, hash: &ChangeHash) -> Option<&StoredChange> {
        self.history.get(hash)
    }

    /// Unsatisfied pending deps plus any of `heads` unknown locally.
    pub fn get_missing_deps(&self, heads: &[ChangeHash]) -> Vec<ChangeHash> {
        self.history.get_missing_deps(heads)
    }

    /// Whole-document encoding (§6): every change in canonical order plus
    /// actor table and hash index.
    pub fn save(&self) -> Vec<u8> {
        let changes = self.history.get_all_changes();
        codec::encode_document(changes.iter().map(|stored| &stored.change)).to_vec()
    }

    pub fn load(bytes: &[u8]) -> Result<Backend, BackendError> {
        Backend::load_with_limits(bytes, Limits::default())
    }

    pub fn load_with_limits(bytes: &[u8], limits: Limits) -> Result<Backend, BackendError> {
        let changes = codec::decode_document(bytes)?;
        let mut backend = Backend::with_limits(limits);
        let mut log = PatchLog::default();
        // Stored order is canonical, so deps resolve as we go.
        for change in changes {
            backend.insert_and_apply(change, &mut log)?;
        }
        if backend.history.pending_len() > 0 {
            let missing = backend.history.get_missing_deps(&[]);
            let hash = missing.first().map(ChangeHash::to_hex).unwrap_or_default();
            return Err(codec::DecodeError::IncompleteDocument { hash }.into());
        }
        Ok(backend)
    }

    /// Canonical bytes of every change not reachable from `have_deps`;
    /// what the sync layer ships.
    pub fn encoded_changes_since(
        &self,
        have_deps: &[ChangeHash],
    ) -> Result<Vec<Bytes>, BackendError> {
        Ok(self
            .history
            .get_changes(have_deps)?
            .into_iter()
            .map(|stored| stored.bytes.clone())
            .collect())
    }
}
