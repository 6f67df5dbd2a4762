//! Offline cache.
//!
//! The cache is the only mutable state shared between the write pipeline, the subscription
//! manager and the façade. It keeps, per document address, the last state confirmed by the
//! store plus the queue of unacknowledged local writes, and derives the *view* readers see by
//! replaying those writes over the confirmed state. All mutation happens under one lock, which
//! serialises remote updates against optimistic local writes; callers only ever receive clones.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::sync::adapter::Precondition;
use crate::sync::error::{SyncError, SyncResult};
use crate::sync::model::{Address, Constraint, DocumentData, SequencedWrite, Snapshot, SnapshotMetadata, Version, WriteOp};
use crate::sync::query_evaluator::apply_constraints;

pub mod persistence;
pub(crate) mod pipeline;

pub use persistence::{CachePersistence, InMemoryCachePersistence, JsonFilePersistence, PersistedCache};

/// Receives cache notifications once the cache lock has been released.
pub trait CacheObserver: Send + Sync {
    /// The view of `address` changed because of a local write, an acknowledgement or a rollback.
    fn entry_changed(&self, address: &Address);

    /// The store rejected a local write to `address`; its optimistic state has been reverted.
    fn write_rejected(&self, address: &Address, error: &SyncError);
}

/// Writes submitted together, with the preconditions their commit must satisfy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub writes: Vec<SequencedWrite>,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
}

impl PendingBatch {
    fn key(&self) -> Option<u64> {
        self.writes.first().map(SequencedWrite::sequence)
    }
}

/// Commit this entry still expects its listener to echo, and the versions that echo supersedes.
#[derive(Clone, Debug)]
struct EchoWait {
    version: Version,
    deleted: bool,
    superseded: Vec<Version>,
}

impl EchoWait {
    fn matches(&self, snapshot: &Snapshot) -> bool {
        snapshot.version() == &self.version || (self.deleted && !snapshot.exists())
    }

    fn is_stale(&self, snapshot: &Snapshot) -> bool {
        self.superseded.contains(snapshot.version())
    }
}

/// Cached state of one document.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    address: Address,
    confirmed: Option<Snapshot>,
    view: Option<Snapshot>,
    pending_ops: VecDeque<SequencedWrite>,
    buffered: Vec<Snapshot>,
    awaiting_echo: Option<EchoWait>,
    subscriber_count: usize,
    idle_since: Option<Instant>,
}

impl CacheEntry {
    fn new(address: Address) -> Self {
        Self {
            address,
            confirmed: None,
            view: None,
            pending_ops: VecDeque::new(),
            buffered: Vec::new(),
            awaiting_echo: None,
            subscriber_count: 0,
            idle_since: Some(Instant::now()),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// What readers see: the confirmed state with pending writes applied. `None` until the
    /// document has been read, watched or written.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.view.as_ref()
    }

    /// Last state acknowledged by the store.
    pub fn confirmed(&self) -> Option<&Snapshot> {
        self.confirmed.as_ref()
    }

    /// Whether local writes are waiting for acknowledgement.
    pub fn is_dirty(&self) -> bool {
        !self.pending_ops.is_empty()
    }

    pub fn pending_ops(&self) -> impl Iterator<Item = &SequencedWrite> {
        self.pending_ops.iter()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    /// Whether the view can be trusted without a read: either the store's state is known or a
    /// pending `set`/`delete` makes it irrelevant.
    pub fn has_known_base(&self) -> bool {
        self.confirmed.is_some()
            || self
                .pending_ops
                .iter()
                .any(|write| !matches!(write.op(), WriteOp::Update { .. }))
    }

    fn confirmed_data(&self) -> Option<&DocumentData> {
        self.confirmed.as_ref().and_then(Snapshot::data)
    }

    fn fingerprint(&self) -> Option<(Option<DocumentData>, bool, bool)> {
        self.view.as_ref().map(|view| {
            (
                view.data().cloned(),
                view.from_cache(),
                view.has_pending_writes(),
            )
        })
    }

    fn recompute_view(&mut self) {
        if self.confirmed.is_none() && self.pending_ops.is_empty() {
            self.view = None;
            return;
        }
        let mut data = self.confirmed_data().cloned();
        for write in &self.pending_ops {
            data = write.op().apply_to(data.as_ref());
        }
        let (version, from_cache) = match &self.confirmed {
            Some(confirmed) => (confirmed.version().clone(), confirmed.from_cache()),
            None => (Version::absent(), true),
        };
        let metadata = SnapshotMetadata::new(from_cache, !self.pending_ops.is_empty());
        self.view = Some(Snapshot::new(self.address.clone(), data, version, Utc::now()).with_metadata(metadata));
    }

    fn confirm(&mut self, snapshot: Snapshot) {
        let mut snapshot = snapshot;
        let from_cache = snapshot.from_cache();
        snapshot.set_metadata(SnapshotMetadata::new(from_cache, false));
        self.confirmed = Some(snapshot);
    }

    fn apply_remote(&mut self, snapshot: Snapshot) {
        if !self.pending_ops.is_empty() {
            if self.confirmed.is_none() {
                // Pending writes are replayed over whatever base the store reports.
                self.confirm(snapshot);
                self.recompute_view();
            } else {
                self.buffered.push(snapshot);
            }
            return;
        }
        if let Some(wait) = &self.awaiting_echo {
            if !wait.matches(&snapshot) && wait.is_stale(&snapshot) {
                return;
            }
            self.awaiting_echo = None;
        }
        self.confirm(snapshot);
        self.recompute_view();
    }

    fn acknowledge(&mut self, write: &SequencedWrite, version: &Version) {
        let Some(position) = self
            .pending_ops
            .iter()
            .position(|pending| pending.sequence() == write.sequence())
        else {
            // Rolled back locally (deadline) but committed anyway: the store's state wins.
            if self.confirmed.is_none() && matches!(write.op(), WriteOp::Update { .. }) {
                return;
            }
            let data = write.op().apply_to(self.confirmed_data());
            self.apply_remote(Snapshot::new(self.address.clone(), data, version.clone(), Utc::now()));
            return;
        };
        self.pending_ops.remove(position);
        let mut superseded: Vec<Version> = self.confirmed.iter().map(|c| c.version().clone()).collect();
        if let Some(previous) = self.awaiting_echo.take() {
            superseded.push(previous.version);
            superseded.extend(previous.superseded);
        }
        let base_unknown = self.confirmed.is_none() && matches!(write.op(), WriteOp::Update { .. });
        if !base_unknown {
            let data = write.op().apply_to(self.confirmed_data());
            self.confirm(Snapshot::new(self.address.clone(), data, version.clone(), Utc::now()));
        }

        let mut wait = EchoWait {
            version: version.clone(),
            deleted: matches!(write.op(), WriteOp::Delete { .. }),
            superseded,
        };
        if !self.pending_ops.is_empty() {
            // Carried to the acknowledgement of the last pending write.
            self.awaiting_echo = Some(wait);
        } else {
            let buffered = std::mem::take(&mut self.buffered);
            let echo = buffered.iter().rposition(|snapshot| wait.matches(snapshot));
            wait.superseded
                .extend(buffered.iter().map(|snapshot| snapshot.version().clone()));
            wait.superseded.retain(|stale| stale != version);
            match echo {
                Some(position) => {
                    // Everything the listener reported after the echo is newer than the commit.
                    if let Some(newest) = buffered.into_iter().skip(position).last() {
                        self.confirm(newest);
                    }
                }
                None if self.subscriber_count > 0 => {
                    // The listener will still echo this commit; states it supersedes must not win.
                    self.awaiting_echo = Some(wait);
                }
                None => {}
            }
        }
        self.recompute_view();
    }

    fn rollback(&mut self, write: &SequencedWrite) -> bool {
        let Some(position) = self
            .pending_ops
            .iter()
            .position(|pending| pending.sequence() == write.sequence())
        else {
            return false;
        };
        self.pending_ops.remove(position);
        if self.pending_ops.is_empty() {
            if let Some(newest) = self.buffered.pop() {
                self.confirm(newest);
            }
            self.buffered.clear();
            if self.subscriber_count == 0 {
                self.awaiting_echo = None;
            }
        }
        self.recompute_view();
        true
    }

    fn evictable(&self, now: Instant, grace_period: Duration) -> bool {
        self.subscriber_count == 0
            && self.pending_ops.is_empty()
            && self
                .idle_since
                .is_some_and(|idle_since| now.saturating_duration_since(idle_since) >= grace_period)
    }
}

struct CacheState {
    entries: HashMap<Address, CacheEntry>,
    batches: BTreeMap<u64, PendingBatch>,
    next_sequence: u64,
}

impl CacheState {
    fn entry_mut(&mut self, address: &Address) -> &mut CacheEntry {
        self.entries
            .entry(address.clone())
            .or_insert_with(|| CacheEntry::new(address.clone()))
    }
}

pub struct OfflineCache {
    state: Mutex<CacheState>,
    grace_period: Duration,
    persistence: Option<Arc<dyn CachePersistence>>,
    observer: Mutex<Option<Weak<dyn CacheObserver>>>,
}

impl OfflineCache {
    pub fn new(grace_period: Duration, persistence: Option<Arc<dyn CachePersistence>>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                batches: BTreeMap::new(),
                next_sequence: 1,
            }),
            grace_period,
            persistence,
            observer: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_observer(&self, observer: Weak<dyn CacheObserver>) {
        *self.observer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn CacheObserver>> {
        self.observer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn notify_changed(&self, addresses: &[Address]) {
        if addresses.is_empty() {
            return;
        }
        if let Some(observer) = self.observer() {
            for address in addresses {
                observer.entry_changed(address);
            }
        }
    }

    /// Returns a copy of the entry for `address`, creating an empty one if needed. Idle entries
    /// past their grace period are swept first.
    pub fn entry(&self, address: &Address) -> CacheEntry {
        let mut state = self.state();
        Self::sweep(&mut state, Instant::now(), self.grace_period);
        state.entry_mut(address).clone()
    }

    /// Current view of `address`, if the cache knows anything about it.
    pub fn lookup(&self, address: &Address) -> Option<Snapshot> {
        self.state()
            .entries
            .get(address)
            .and_then(|entry| entry.view.clone())
    }

    /// View of `address` when it can be served without asking the store: local writes against a
    /// document the cache has never seen yield `None` until a read supplies the base.
    pub fn known_view(&self, address: &Address) -> Option<Snapshot> {
        self.state()
            .entries
            .get(address)
            .filter(|entry| entry.has_known_base())
            .and_then(|entry| entry.view.clone())
    }

    pub fn is_dirty(&self, address: &Address) -> bool {
        self.state()
            .entries
            .get(address)
            .is_some_and(CacheEntry::is_dirty)
    }

    /// Records a snapshot from the store. While local writes to the address are pending the
    /// snapshot is held back and only considered once they are acknowledged.
    pub fn apply_remote(&self, snapshot: Snapshot) {
        self.apply_remote_batch(vec![snapshot]);
    }

    pub fn apply_remote_batch(&self, snapshots: Vec<Snapshot>) {
        if snapshots.is_empty() {
            return;
        }
        let persisted = {
            let mut state = self.state();
            Self::sweep(&mut state, Instant::now(), self.grace_period);
            for snapshot in snapshots {
                let address = snapshot.address().clone();
                let entry = state.entry_mut(&address);
                entry.apply_remote(snapshot);
                if entry.subscriber_count == 0 {
                    entry.idle_since = Some(Instant::now());
                }
            }
            self.persisted_state(&state)
        };
        self.persist(persisted);
    }

    /// Queues `ops` as one batch: assigns sequence numbers, hands the batch to `forward` while
    /// the cache is still locked (so forwarding order matches sequence order) and then applies
    /// every op to the views optimistically. Nothing changes if `forward` fails.
    pub(crate) fn apply_local<F>(
        &self,
        ops: Vec<WriteOp>,
        preconditions: Vec<Precondition>,
        forward: F,
    ) -> SyncResult<Vec<SequencedWrite>>
    where
        F: FnOnce(&PendingBatch) -> SyncResult<()>,
    {
        let (writes, changed, persisted) = {
            let mut state = self.state();
            Self::sweep(&mut state, Instant::now(), self.grace_period);
            let first = state.next_sequence;
            let writes: Vec<SequencedWrite> = ops
                .into_iter()
                .enumerate()
                .map(|(offset, op)| SequencedWrite::new(first + offset as u64, op))
                .collect();
            let batch = PendingBatch {
                writes: writes.clone(),
                preconditions,
            };
            forward(&batch)?;
            state.next_sequence = first + writes.len() as u64;
            state.batches.insert(first, batch);

            let mut changed = Vec::new();
            for write in &writes {
                let entry = state.entry_mut(write.address());
                entry.pending_ops.push_back(write.clone());
                entry.recompute_view();
                if !changed.contains(write.address()) {
                    changed.push(write.address().clone());
                }
            }
            (writes, changed, self.persisted_state(&state))
        };
        log::debug!(
            "queued {} local write(s) starting at sequence {}",
            writes.len(),
            writes.first().map(SequencedWrite::sequence).unwrap_or_default()
        );
        self.persist(persisted);
        self.notify_changed(&changed);
        Ok(writes)
    }

    /// The store accepted `writes` at `version`.
    pub fn acknowledge(&self, writes: &[SequencedWrite], version: &Version) {
        let (changed, persisted) = {
            let mut state = self.state();
            if let Some(first) = writes.first() {
                state.batches.remove(&first.sequence());
            }
            let mut changed = Vec::new();
            for write in writes {
                let entry = state.entry_mut(write.address());
                let before = entry.fingerprint();
                entry.acknowledge(write, version);
                if entry.pending_ops.is_empty() && entry.subscriber_count == 0 {
                    entry.idle_since = Some(Instant::now());
                }
                if entry.fingerprint() != before && !changed.contains(write.address()) {
                    changed.push(write.address().clone());
                }
            }
            (changed, self.persisted_state(&state))
        };
        log::debug!("acknowledged {} write(s) at version {version}", writes.len());
        self.persist(persisted);
        self.notify_changed(&changed);
    }

    /// The store rejected `writes`: drops them from the pending queues, reverts the views to the
    /// last confirmed state (plus any writes still pending) and reports `error` to observers.
    pub fn rollback(&self, writes: &[SequencedWrite], error: &SyncError) {
        let (rejected, persisted) = {
            let mut state = self.state();
            if let Some(first) = writes.first() {
                state.batches.remove(&first.sequence());
            }
            let mut rejected = Vec::new();
            for write in writes {
                let entry = state.entry_mut(write.address());
                if entry.rollback(write) && !rejected.contains(write.address()) {
                    rejected.push(write.address().clone());
                }
            }
            (rejected, self.persisted_state(&state))
        };
        if rejected.is_empty() {
            return;
        }
        log::debug!("rolled back {} write(s): {error}", writes.len());
        self.persist(persisted);
        self.notify_changed(&rejected);
        if let Some(observer) = self.observer() {
            for address in &rejected {
                observer.write_rejected(address, error);
            }
        }
    }

    /// Folds writes committed outside the pipeline (transactions) into entries the cache
    /// already tracks.
    pub fn apply_committed(&self, ops: &[WriteOp], version: &Version) {
        let changed = {
            let mut state = self.state();
            let mut changed = Vec::new();
            for op in ops {
                let Some(entry) = state.entries.get_mut(op.address()) else {
                    continue;
                };
                if matches!(op, WriteOp::Update { .. }) && entry.confirmed.is_none() {
                    continue;
                }
                let before = entry.fingerprint();
                let data = op.apply_to(entry.confirmed_data());
                entry.apply_remote(Snapshot::new(op.address().clone(), data, version.clone(), Utc::now()));
                if entry.fingerprint() != before {
                    changed.push(op.address().clone());
                }
            }
            changed
        };
        self.notify_changed(&changed);
    }

    /// A listener started watching `address`; the entry will not be evicted.
    pub fn retain(&self, address: &Address) {
        let mut state = self.state();
        let entry = state.entry_mut(address);
        entry.subscriber_count += 1;
        entry.idle_since = None;
    }

    pub fn release(&self, address: &Address) {
        let mut state = self.state();
        if let Some(entry) = state.entries.get_mut(address) {
            entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
            if entry.subscriber_count == 0 {
                entry.idle_since = Some(Instant::now());
                // No listener is left to deliver the echo of the last commit.
                entry.awaiting_echo = None;
                entry.buffered.clear();
            }
        }
    }

    /// Evicts entries with no subscribers and no pending writes that have been idle for the
    /// grace period. Returns the number of entries removed.
    pub fn evict_idle(&self) -> usize {
        let mut state = self.state();
        Self::sweep(&mut state, Instant::now(), self.grace_period)
    }

    fn sweep(state: &mut CacheState, now: Instant, grace_period: Duration) -> usize {
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| !entry.evictable(now, grace_period));
        let evicted = before - state.entries.len();
        if evicted > 0 {
            log::debug!("evicted {evicted} idle cache entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Result of a query as this client should see it: the store's results with their current
    /// cached views, plus documents in the collection that local writes made match.
    pub fn overlay_query(&self, collection: &Address, constraints: &[Constraint], remote: &[Snapshot]) -> Vec<Snapshot> {
        let state = self.state();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for snapshot in remote {
            seen.insert(snapshot.address().clone());
            let current = state
                .entries
                .get(snapshot.address())
                .and_then(|entry| entry.view.clone())
                .unwrap_or_else(|| snapshot.clone());
            candidates.push(current);
        }
        for (address, entry) in &state.entries {
            if entry.is_dirty() && entry.has_known_base() && collection.contains(address) && !seen.contains(address) {
                if let Some(view) = &entry.view {
                    candidates.push(view.clone());
                }
            }
        }
        apply_constraints(candidates, constraints)
    }

    /// Answers a query from cached documents only.
    pub fn cached_query(&self, collection: &Address, constraints: &[Constraint]) -> Vec<Snapshot> {
        let state = self.state();
        let candidates = state
            .entries
            .iter()
            .filter(|(address, entry)| collection.contains(address) && entry.has_known_base())
            .filter_map(|(_, entry)| entry.view.clone())
            .map(|mut view| {
                let pending = view.has_pending_writes();
                view.set_metadata(SnapshotMetadata::new(true, pending));
                view
            })
            .collect();
        apply_constraints(candidates, constraints)
    }

    /// Loads persisted state. Returns the unacknowledged batches, oldest first, so the caller can
    /// send them again.
    pub fn restore(&self, persisted: PersistedCache) -> Vec<PendingBatch> {
        let mut state = self.state();
        for document in persisted.documents {
            let address = document.address().clone();
            let entry = state.entry_mut(&address);
            let mut document = document;
            document.set_metadata(SnapshotMetadata::new(true, false));
            entry.confirmed = Some(document);
            entry.recompute_view();
        }
        let mut highest = 0;
        for batch in &persisted.pending_batches {
            for write in &batch.writes {
                highest = highest.max(write.sequence());
                let entry = state.entry_mut(write.address());
                entry.pending_ops.push_back(write.clone());
                entry.recompute_view();
            }
            if let Some(key) = batch.key() {
                state.batches.insert(key, batch.clone());
            }
        }
        state.next_sequence = state.next_sequence.max(persisted.next_sequence).max(highest + 1);
        log::debug!(
            "restored {} cached documents and {} pending batches",
            state.entries.len(),
            state.batches.len()
        );
        state.batches.values().cloned().collect()
    }

    fn persisted_state(&self, state: &CacheState) -> Option<PersistedCache> {
        self.persistence.as_ref()?;
        let mut documents: Vec<Snapshot> = state
            .entries
            .values()
            .filter_map(|entry| entry.confirmed.clone())
            .collect();
        documents.sort_by(|left, right| left.address().cmp(right.address()));
        Some(PersistedCache {
            documents,
            pending_batches: state.batches.values().cloned().collect(),
            next_sequence: state.next_sequence,
        })
    }

    fn persist(&self, persisted: Option<PersistedCache>) {
        if let (Some(persistence), Some(persisted)) = (&self.persistence, persisted) {
            if let Err(err) = persistence.save(&persisted) {
                log::warn!("failed to persist offline cache: {err}");
            }
        }
    }
}
