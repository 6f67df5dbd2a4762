//! In-memory reference store.
//!
//! [`MemoryStore`] plays the remote document store for both client flavours: [`MemoryWebClient`]
//! exposes it through the promise-style surface and [`MemoryNativeClient`] through the callback
//! surface. Beyond documents it keeps listener bookkeeping, upload sessions and knobs for
//! simulating latency, faults and writes from other clients.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::sync::error::{
    aborted, already_exists, invalid_argument, not_found, unavailable, SyncError, SyncErrorKind, SyncResult,
};
use crate::sync::model::{Address, Constraint, DocumentData, Snapshot, Version, WatchTarget, WriteOp};
use crate::sync::query_evaluator::apply_constraints;

mod native;
mod web;

pub use native::MemoryNativeClient;
pub use web::MemoryWebClient;

const DOWNLOAD_HOST: &str = "https://storage.memory.local/v0/b/propstore/o";

/// Store operations that can be made to fail on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Read,
    Query,
    Commit,
    BeginUpload,
    UploadChunk,
    FinishUpload,
}

/// A document as the store holds it. `revision` is zero for documents that do not exist.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreDocument {
    pub address: Address,
    pub data: Option<DocumentData>,
    pub revision: u64,
}

impl StoreDocument {
    fn missing(address: Address) -> Self {
        Self {
            address,
            data: None,
            revision: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub enum StoreEvent {
    Document(StoreDocument),
    Query(Vec<StoreDocument>),
    Error(SyncError),
}

pub type StoreCallback = Arc<dyn Fn(StoreEvent) + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StoreListenerId(u64);

struct StoreListener {
    target: WatchTarget,
    callback: StoreCallback,
}

#[derive(Clone)]
struct StoredDocument {
    data: DocumentData,
    revision: u64,
}

struct UploadState {
    path: String,
    total_bytes: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct StoreState {
    documents: BTreeMap<Address, StoredDocument>,
    revision: u64,
    commits: usize,
    listeners: HashMap<StoreListenerId, StoreListener>,
    next_listener: u64,
    outbox: VecDeque<(StoreListenerId, StoreEvent)>,
    delivering: bool,
    faults: HashMap<StoreOperation, VecDeque<SyncErrorKind>>,
    uploads: HashMap<String, UploadState>,
    next_upload: u64,
    upload_failure_after: Option<u64>,
    blobs: BTreeMap<String, Bytes>,
}

struct StoreInner {
    state: Mutex<StoreState>,
    paused: watch::Sender<bool>,
    listen_registrations: AtomicUsize,
    listen_removals: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::default()),
                paused,
                listen_registrations: AtomicUsize::new(0),
                listen_removals: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Holds every commit until [`resume_commits`](Self::resume_commits) is called.
    pub fn pause_commits(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume_commits(&self) {
        self.inner.paused.send_replace(false);
    }

    /// Makes the next `times` calls of `operation` fail with `kind`.
    pub fn fail_next(&self, operation: StoreOperation, kind: SyncErrorKind, times: usize) {
        let mut state = self.state();
        let queue = state.faults.entry(operation).or_default();
        queue.extend(std::iter::repeat(kind).take(times));
    }

    /// Every chunk arriving once `bytes` have been stored for an upload fails with `Unavailable`.
    pub fn set_upload_failure_after(&self, bytes: Option<u64>) {
        self.state().upload_failure_after = bytes;
    }

    /// Number of listeners ever registered.
    pub fn listen_registrations(&self) -> usize {
        self.inner.listen_registrations.load(Ordering::SeqCst)
    }

    pub fn listen_removals(&self) -> usize {
        self.inner.listen_removals.load(Ordering::SeqCst)
    }

    pub fn active_listeners(&self) -> usize {
        self.state().listeners.len()
    }

    /// Number of successfully applied commits, including external ones.
    pub fn commit_count(&self) -> usize {
        self.state().commits
    }

    pub fn document(&self, address: &Address) -> Option<DocumentData> {
        self.state().documents.get(address).map(|stored| stored.data.clone())
    }

    pub fn blob(&self, path: &str) -> Option<Bytes> {
        self.state().blobs.get(path).cloned()
    }

    /// Applies a write as another client would: ignores pauses and injected faults.
    pub fn external_write(&self, address: &Address, data: DocumentData) -> SyncResult<u64> {
        self.apply_batch(&[WriteOp::set(address.clone(), data)], &[])
    }

    pub fn external_delete(&self, address: &Address) -> SyncResult<u64> {
        self.apply_batch(&[WriteOp::delete(address.clone())], &[])
    }

    /// Sends `error` to every registered listener, as a dropped connection would.
    pub fn break_listeners(&self, error: SyncError) {
        {
            let mut state = self.state();
            let ids: Vec<StoreListenerId> = state.listeners.keys().copied().collect();
            for id in ids {
                state.outbox.push_back((id, StoreEvent::Error(error.clone())));
            }
        }
        self.drain_outbox();
    }

    fn take_fault(&self, operation: StoreOperation) -> SyncResult<()> {
        let kind = self
            .state()
            .faults
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front());
        match kind {
            Some(kind) => Err(SyncError::new(kind, format!("injected {operation:?} failure"))),
            None => Ok(()),
        }
    }

    pub async fn read(&self, address: &Address) -> SyncResult<StoreDocument> {
        self.take_fault(StoreOperation::Read)?;
        let state = self.state();
        Ok(document_state(&state, address))
    }

    pub async fn query(&self, collection: &Address, constraints: &[Constraint]) -> SyncResult<Vec<StoreDocument>> {
        self.take_fault(StoreOperation::Query)?;
        if !collection.is_collection() {
            return Err(invalid_argument(format!("{collection} is not a collection")));
        }
        let state = self.state();
        Ok(evaluate_query(&state, collection, constraints))
    }

    /// Applies `ops` atomically. Each expectation pins a document to a revision (`None` meaning it
    /// must not exist). Returns the commit revision.
    pub async fn commit(&self, ops: &[WriteOp], expectations: &[(Address, Option<u64>)]) -> SyncResult<u64> {
        let mut paused = self.inner.paused.subscribe();
        paused
            .wait_for(|paused| !*paused)
            .await
            .map_err(|_| unavailable("memory store shut down"))?;
        self.take_fault(StoreOperation::Commit)?;
        self.apply_batch(ops, expectations)
    }

    fn apply_batch(&self, ops: &[WriteOp], expectations: &[(Address, Option<u64>)]) -> SyncResult<u64> {
        for op in ops {
            op.validate()?;
        }
        let revision = {
            let mut state = self.state();
            for (address, expected) in expectations {
                let current = state.documents.get(address).map(|stored| stored.revision);
                match (expected, current) {
                    (None, Some(_)) => return Err(already_exists(format!("{address} already exists"))),
                    (Some(expected), current) if current != Some(*expected) => {
                        return Err(aborted(format!(
                            "{address} changed since revision {expected}"
                        )))
                    }
                    _ => {}
                }
            }

            let mut staged: BTreeMap<Address, Option<DocumentData>> = BTreeMap::new();
            for op in ops {
                let address = op.address();
                let current = match staged.get(address) {
                    Some(staged) => staged.clone(),
                    None => state.documents.get(address).map(|stored| stored.data.clone()),
                };
                if matches!(op, WriteOp::Update { .. }) && current.is_none() {
                    return Err(not_found(format!("No document to update: {address}")));
                }
                staged.insert(address.clone(), op.apply_to(current.as_ref()));
            }

            state.revision += 1;
            state.commits += 1;
            let revision = state.revision;
            for (address, data) in &staged {
                match data {
                    Some(data) => {
                        state.documents.insert(
                            address.clone(),
                            StoredDocument {
                                data: data.clone(),
                                revision,
                            },
                        );
                    }
                    None => {
                        state.documents.remove(address);
                    }
                }
            }

            let touched: Vec<&Address> = staged.keys().collect();
            let mut events = Vec::new();
            for (id, listener) in &state.listeners {
                if touched.iter().any(|address| listener.target.covers(address)) {
                    events.push((*id, target_event(&state, &listener.target)));
                }
            }
            state.outbox.extend(events);
            revision
        };
        self.drain_outbox();
        Ok(revision)
    }

    /// Registers a listener; its first event is queued immediately.
    pub fn listen(&self, target: WatchTarget, callback: StoreCallback) -> StoreListenerId {
        self.inner.listen_registrations.fetch_add(1, Ordering::SeqCst);
        let id = {
            let mut state = self.state();
            state.next_listener += 1;
            let id = StoreListenerId(state.next_listener);
            let initial = target_event(&state, &target);
            state.listeners.insert(id, StoreListener { target, callback });
            state.outbox.push_back((id, initial));
            id
        };
        self.drain_outbox();
        id
    }

    pub fn unlisten(&self, id: StoreListenerId) {
        if self.state().listeners.remove(&id).is_some() {
            self.inner.listen_removals.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Delivers queued events in commit order. Only one thread drains at a time; callbacks run
    /// without the state lock so they may call back into the store.
    fn drain_outbox(&self) {
        {
            let mut state = self.state();
            if state.delivering {
                return;
            }
            state.delivering = true;
        }
        loop {
            let next = {
                let mut state = self.state();
                match state.outbox.pop_front() {
                    Some((id, event)) => state
                        .listeners
                        .get(&id)
                        .map(|listener| (Arc::clone(&listener.callback), event)),
                    None => {
                        state.delivering = false;
                        return;
                    }
                }
            };
            if let Some((callback, event)) = next {
                callback(event);
            }
        }
    }

    pub async fn begin_upload(&self, path: &str, total_bytes: u64) -> SyncResult<String> {
        self.take_fault(StoreOperation::BeginUpload)?;
        self.open_upload(path, total_bytes)
    }

    fn open_upload(&self, path: &str, total_bytes: u64) -> SyncResult<String> {
        if path.is_empty() {
            return Err(invalid_argument("Upload path must not be empty"));
        }
        let mut state = self.state();
        state.next_upload += 1;
        let token = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            token.clone(),
            UploadState {
                path: path.to_string(),
                total_bytes,
                data: Vec::new(),
            },
        );
        Ok(token)
    }

    /// Session for clients that address uploads by path. `restart` discards any unfinished
    /// upload of the same path.
    pub(crate) fn path_session(&self, path: &str, total_bytes: u64, restart: bool) -> SyncResult<String> {
        {
            let mut state = self.state();
            let existing = state
                .uploads
                .iter()
                .find(|(_, upload)| upload.path == path)
                .map(|(token, _)| token.clone());
            if let Some(token) = existing {
                if !restart {
                    return Ok(token);
                }
                state.uploads.remove(&token);
            }
        }
        if restart {
            self.take_fault(StoreOperation::BeginUpload)?;
        }
        self.open_upload(path, total_bytes)
    }

    pub(crate) fn find_path_session(&self, path: &str) -> SyncResult<String> {
        self.state()
            .uploads
            .iter()
            .find(|(_, upload)| upload.path == path)
            .map(|(token, _)| token.clone())
            .ok_or_else(|| not_found(format!("No upload in progress for {path}")))
    }

    pub async fn put_chunk(&self, token: &str, offset: u64, chunk: Bytes) -> SyncResult<u64> {
        self.take_fault(StoreOperation::UploadChunk)?;
        let mut state = self.state();
        let failure_after = state.upload_failure_after;
        let upload = state
            .uploads
            .get_mut(token)
            .ok_or_else(|| not_found(format!("Unknown upload session {token}")))?;
        let committed = upload.data.len() as u64;
        if failure_after.is_some_and(|limit| committed >= limit) {
            return Err(unavailable(format!(
                "connection lost while uploading {} at byte {committed}",
                upload.path
            )));
        }
        if offset != committed {
            return Err(invalid_argument(format!(
                "Chunk offset {offset} does not match committed size {committed}"
            )));
        }
        if committed + chunk.len() as u64 > upload.total_bytes {
            return Err(invalid_argument("Chunk runs past the declared upload size"));
        }
        upload.data.extend_from_slice(&chunk);
        Ok(upload.data.len() as u64)
    }

    pub async fn finish_upload(&self, token: &str, sha256: &str) -> SyncResult<String> {
        self.take_fault(StoreOperation::FinishUpload)?;
        let mut state = self.state();
        let upload = state
            .uploads
            .remove(token)
            .ok_or_else(|| not_found(format!("Unknown upload session {token}")))?;
        if upload.data.len() as u64 != upload.total_bytes {
            let message = format!(
                "Upload of {} finished at {} of {} bytes",
                upload.path,
                upload.data.len(),
                upload.total_bytes
            );
            state.uploads.insert(token.to_string(), upload);
            return Err(invalid_argument(message));
        }
        let digest = STANDARD.encode(Sha256::digest(&upload.data));
        if digest != sha256 {
            return Err(invalid_argument(format!("Checksum mismatch for {}", upload.path)));
        }
        let url = format!(
            "{DOWNLOAD_HOST}/{}?alt=media&token={token}",
            utf8_percent_encode(&upload.path, NON_ALPHANUMERIC)
        );
        state.blobs.insert(upload.path, Bytes::from(upload.data));
        Ok(url)
    }
}

fn document_state(state: &StoreState, address: &Address) -> StoreDocument {
    match state.documents.get(address) {
        Some(stored) => StoreDocument {
            address: address.clone(),
            data: Some(stored.data.clone()),
            revision: stored.revision,
        },
        None => StoreDocument::missing(address.clone()),
    }
}

fn evaluate_query(state: &StoreState, collection: &Address, constraints: &[Constraint]) -> Vec<StoreDocument> {
    let now = Utc::now();
    let candidates: Vec<Snapshot> = state
        .documents
        .iter()
        .filter(|(address, _)| collection.contains(address))
        .map(|(address, stored)| {
            Snapshot::new(
                address.clone(),
                Some(stored.data.clone()),
                Version::new(stored.revision.to_string()),
                now,
            )
        })
        .collect();
    apply_constraints(candidates, constraints)
        .into_iter()
        .map(|snapshot| document_state(state, snapshot.address()))
        .collect()
}

fn target_event(state: &StoreState, target: &WatchTarget) -> StoreEvent {
    match target {
        WatchTarget::Document(address) => StoreEvent::Document(document_state(state, address)),
        WatchTarget::Query {
            collection,
            constraints,
        } => StoreEvent::Query(evaluate_query(state, collection, constraints)),
    }
}

/// Commit time the web client reports for a revision: an RFC 3339 timestamp, opaque to callers.
pub(crate) fn revision_to_update_time(revision: u64) -> String {
    (update_time_base() + chrono::Duration::microseconds(revision as i64)).to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn update_time_to_revision(update_time: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc3339(update_time).ok()?.with_timezone(&Utc);
    u64::try_from((parsed - update_time_base()).num_microseconds()?).ok()
}

fn update_time_base() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn address(path: &str) -> Address {
        Address::parse(path).unwrap()
    }

    fn data(value: serde_json::Value) -> DocumentData {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn commits_validate_the_whole_batch() {
        let store = MemoryStore::new();
        let err = store
            .commit(
                &[
                    WriteOp::set(address("props/a"), data(json!({"n": 1}))),
                    WriteOp::update(address("props/b"), data(json!({"n": 2}))),
                ],
                &[],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::NotFound);
        assert!(store.document(&address("props/a")).is_none());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn expectations_guard_revisions() {
        let store = MemoryStore::new();
        let revision = store.external_write(&address("props/a"), data(json!({"n": 1}))).unwrap();
        let stale = store
            .commit(
                &[WriteOp::delete(address("props/a"))],
                &[(address("props/a"), Some(revision + 5))],
            )
            .await
            .unwrap_err();
        assert_eq!(stale.kind, SyncErrorKind::Aborted);
        let exists = store
            .commit(&[WriteOp::delete(address("props/a"))], &[(address("props/a"), None)])
            .await
            .unwrap_err();
        assert_eq!(exists.kind, SyncErrorKind::AlreadyExists);
        store
            .commit(
                &[WriteOp::delete(address("props/a"))],
                &[(address("props/a"), Some(revision))],
            )
            .await
            .unwrap();
        assert!(store.document(&address("props/a")).is_none());
    }

    #[test]
    fn listeners_get_an_initial_event_then_changes() {
        let store = MemoryStore::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let id = store.listen(
            WatchTarget::Document(address("shows/s1")),
            Arc::new(move |event| {
                if let StoreEvent::Document(document) = event {
                    captured.lock().unwrap().push(document.data.is_some());
                }
            }),
        );
        store.external_write(&address("shows/s1"), data(json!({"title": "Hamlet"}))).unwrap();
        store.external_write(&address("shows/s2"), data(json!({"title": "Lear"}))).unwrap();
        store.unlisten(id);
        store.external_delete(&address("shows/s1")).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
        assert_eq!(store.listen_registrations(), 1);
        assert_eq!(store.listen_removals(), 1);
    }

    #[test]
    fn callbacks_may_unlisten_while_being_delivered() {
        let store = MemoryStore::new();
        let slot: Arc<StdMutex<Option<StoreListenerId>>> = Arc::new(StdMutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let (inner_store, inner_slot, inner_calls) = (store.clone(), Arc::clone(&slot), Arc::clone(&calls));
        let id = store.listen(
            WatchTarget::from_address(address("props")),
            Arc::new(move |_| {
                inner_calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *inner_slot.lock().unwrap() {
                    inner_store.unlisten(id);
                }
            }),
        );
        *slot.lock().unwrap() = Some(id);
        store.external_write(&address("props/a"), data(json!({"n": 1}))).unwrap();
        store.external_write(&address("props/b"), data(json!({"n": 2}))).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.active_listeners(), 0);
    }

    #[tokio::test]
    async fn uploads_stop_at_the_failure_point() {
        let store = MemoryStore::new();
        store.set_upload_failure_after(Some(4));
        let token = store.begin_upload("photos/p1.jpg", 10).await.unwrap();
        assert_eq!(store.put_chunk(&token, 0, Bytes::from_static(b"abcd")).await.unwrap(), 4);
        let err = store.put_chunk(&token, 4, Bytes::from_static(b"efgh")).await.unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn finished_uploads_verify_checksums() {
        let store = MemoryStore::new();
        let token = store.begin_upload("photos/p 1.jpg", 3).await.unwrap();
        store.put_chunk(&token, 0, Bytes::from_static(b"abc")).await.unwrap();
        let digest = STANDARD.encode(Sha256::digest(b"abc"));
        let url = store.finish_upload(&token, &digest).await.unwrap();
        assert!(url.contains("photos%2Fp%201%2Ejpg"));
        assert_eq!(store.blob("photos/p 1.jpg").unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn update_times_encode_revisions() {
        let encoded = revision_to_update_time(12);
        assert_eq!(update_time_to_revision(&encoded), Some(12));
        assert_eq!(update_time_to_revision("not a time"), None);
    }
}
