//! Adapter for the mobile-native client library.
//!
//! The native bridge is callback based: every call takes a completion callback, listeners are
//! registered against a numeric token and removed by token, documents carry an explicit `exists`
//! flag next to a monotonically increasing revision, and failures use gRPC-style numeric codes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::channel::oneshot;
use serde_json::Value;

use crate::sync::error::{
    aborted, already_exists, cancelled, invalid_argument, not_found, permission_denied, resource_exhausted,
    unavailable, unknown, SyncError, SyncErrorKind, SyncResult,
};
use crate::sync::model::{
    Address, Constraint, DocumentData, Snapshot, SnapshotMetadata, Version, WatchTarget, WriteOp,
};
use crate::sync::translate::translate_native;

use super::{CancelFn, Precondition, RuntimeAdapter, UploadSession, WatchEvent, WatchSink};

/// Status codes reported by the native bridge.
pub mod status {
    pub const CANCELLED: i32 = 1;
    pub const UNKNOWN: i32 = 2;
    pub const INVALID_ARGUMENT: i32 = 3;
    pub const DEADLINE_EXCEEDED: i32 = 4;
    pub const NOT_FOUND: i32 = 5;
    pub const ALREADY_EXISTS: i32 = 6;
    pub const PERMISSION_DENIED: i32 = 7;
    pub const RESOURCE_EXHAUSTED: i32 = 8;
    pub const FAILED_PRECONDITION: i32 = 9;
    pub const ABORTED: i32 = 10;
    pub const OUT_OF_RANGE: i32 = 11;
    pub const UNAVAILABLE: i32 = 14;
    pub const UNAUTHENTICATED: i32 = 16;
}

#[derive(Clone, Debug, PartialEq)]
pub struct NativeDocument {
    pub path: String,
    pub exists: bool,
    pub fields: DocumentData,
    pub revision: u64,
    pub is_from_cache: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeError {
    pub code: i32,
    pub description: String,
}

impl NativeError {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeOperator {
    Equal,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NativeFilter {
    pub field: String,
    pub operator: NativeOperator,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeOrder {
    pub field: String,
    pub descending: bool,
}

/// Single-value cursor; the native query builder cannot express composite cursors.
#[derive(Clone, Debug, PartialEq)]
pub struct NativeBound {
    pub value: Value,
    pub inclusive: bool,
}

/// Query object built for the native bridge: filters and orders keep the caller's order.
#[derive(Clone, Debug, PartialEq)]
pub struct NativeQuery {
    pub path: String,
    pub filters: Vec<NativeFilter>,
    pub orders: Vec<NativeOrder>,
    pub limit: Option<u32>,
    pub start: Option<NativeBound>,
    pub end: Option<NativeBound>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NativeListenTarget {
    Document(String),
    Query(NativeQuery),
}

#[derive(Clone, Debug, PartialEq)]
pub enum NativeEvent {
    Document(NativeDocument),
    Query(Vec<NativeDocument>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum NativeMutation {
    Set { path: String, fields: DocumentData },
    Update { path: String, fields: DocumentData },
    Delete { path: String },
}

/// `revision == None` requires the document to be absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeExpectation {
    pub path: String,
    pub revision: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NativeBatch {
    pub mutations: Vec<NativeMutation>,
    pub expected_revisions: Vec<NativeExpectation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeListenerToken(pub u64);

pub type NativeCallback<T> = Box<dyn FnOnce(Result<T, NativeError>) + Send + 'static>;
pub type NativeListener = Arc<dyn Fn(Result<NativeEvent, NativeError>) + Send + Sync + 'static>;

/// Surface of the callback-registration client library this adapter bridges.
pub trait NativeClient: Send + Sync + 'static {
    fn get_document(&self, path: &str, callback: NativeCallback<NativeDocument>);

    fn run_query(&self, query: &NativeQuery, callback: NativeCallback<Vec<NativeDocument>>);

    fn add_snapshot_listener(&self, target: NativeListenTarget, listener: NativeListener) -> NativeListenerToken;

    fn remove_snapshot_listener(&self, token: NativeListenerToken);

    /// Commits the batch atomically; completes with the commit revision.
    fn commit_batch(&self, batch: NativeBatch, callback: NativeCallback<u64>);

    /// Stores the chunk at `offset` of a `total_bytes` file; an offset of zero starts the file
    /// over. Completes with the number of bytes stored for `path`.
    fn put_file_chunk(&self, path: &str, offset: u64, total_bytes: u64, chunk: Bytes, callback: NativeCallback<u64>);

    fn get_download_url(&self, path: &str, sha256: &str, callback: NativeCallback<String>);
}

pub struct NativeAdapter<C: NativeClient> {
    client: Arc<C>,
}

impl<C: NativeClient> NativeAdapter<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub fn from_arc(client: Arc<C>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }
}

/// Turns one callback-style call into a future.
async fn bridge<T, F>(register: F) -> SyncResult<T>
where
    T: Send + 'static,
    F: FnOnce(NativeCallback<T>),
{
    let (sender, receiver) = oneshot::channel();
    register(Box::new(move |result| {
        let _ = sender.send(result);
    }));
    match receiver.await {
        Ok(result) => result.map_err(normalize_error),
        Err(_) => {
            log::warn!("native client dropped a completion callback without calling it");
            Err(unknown("native client dropped the completion callback"))
        }
    }
}

#[async_trait]
impl<C: NativeClient> RuntimeAdapter for NativeAdapter<C> {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn read_once(&self, address: &Address) -> SyncResult<Snapshot> {
        if !address.is_document() {
            return Err(invalid_argument(format!("{address} is not a document address")));
        }
        let path = address.path();
        let client = Arc::clone(&self.client);
        let result = bridge(move |callback| client.get_document(&path, callback)).await;
        match result {
            Ok(document) => to_snapshot(document),
            Err(err) if err.kind == SyncErrorKind::NotFound => {
                Ok(Snapshot::missing(address.clone()))
            }
            Err(err) => Err(err),
        }
    }

    async fn read_many(&self, collection: &Address, constraints: &[Constraint]) -> SyncResult<Vec<Snapshot>> {
        let query = translate_native(collection, constraints)?;
        let client = Arc::clone(&self.client);
        let documents = bridge(move |callback| client.run_query(&query, callback)).await?;
        documents
            .into_iter()
            .filter(|document| document.exists)
            .map(to_snapshot)
            .collect()
    }

    fn watch(&self, target: &WatchTarget, sink: WatchSink) -> SyncResult<CancelFn> {
        let listen_target = match target {
            WatchTarget::Document(address) => {
                if !address.is_document() {
                    return Err(invalid_argument(format!("{address} is not a document address")));
                }
                NativeListenTarget::Document(address.path())
            }
            WatchTarget::Query {
                collection,
                constraints,
            } => NativeListenTarget::Query(translate_native(collection, constraints)?),
        };

        let removed = Arc::new(AtomicBool::new(false));
        let listener_flag = Arc::clone(&removed);
        let listener: NativeListener = Arc::new(move |result| {
            if listener_flag.load(Ordering::SeqCst) {
                return;
            }
            let event = match result {
                Ok(NativeEvent::Document(document)) => to_snapshot(document).map(WatchEvent::Document),
                Ok(NativeEvent::Query(documents)) => documents
                    .into_iter()
                    .filter(|document| document.exists)
                    .map(to_snapshot)
                    .collect::<SyncResult<Vec<_>>>()
                    .map(WatchEvent::Query),
                Err(err) => Err(normalize_error(err)),
            };
            sink(event.unwrap_or_else(WatchEvent::Error));
        });

        let token = self.client.add_snapshot_listener(listen_target, listener);
        let client = Arc::clone(&self.client);
        Ok(Box::new(move || {
            removed.store(true, Ordering::SeqCst);
            client.remove_snapshot_listener(token);
        }))
    }

    async fn write(&self, ops: &[WriteOp]) -> SyncResult<Version> {
        let batch = NativeBatch {
            mutations: ops.iter().map(to_mutation).collect(),
            expected_revisions: Vec::new(),
        };
        let client = Arc::clone(&self.client);
        let revision = bridge(move |callback| client.commit_batch(batch, callback)).await?;
        Ok(revision_version(revision))
    }

    async fn transact(&self, preconditions: &[Precondition], ops: &[WriteOp]) -> SyncResult<Version> {
        let expected_revisions = preconditions
            .iter()
            .map(|precondition| {
                Ok(NativeExpectation {
                    path: precondition.address.path(),
                    revision: parse_revision(&precondition.version)?,
                })
            })
            .collect::<SyncResult<Vec<_>>>()?;
        let batch = NativeBatch {
            mutations: ops.iter().map(to_mutation).collect(),
            expected_revisions,
        };
        let client = Arc::clone(&self.client);
        let revision = bridge(move |callback| client.commit_batch(batch, callback)).await?;
        Ok(revision_version(revision))
    }

    async fn begin_upload(&self, path: &str, total_bytes: u64) -> SyncResult<UploadSession> {
        // The native bridge addresses chunks by storage path; there is no session handshake.
        Ok(UploadSession {
            path: path.to_string(),
            token: path.to_string(),
            total_bytes,
        })
    }

    async fn upload_chunk(&self, session: &UploadSession, offset: u64, chunk: Bytes) -> SyncResult<u64> {
        let path = session.token.clone();
        let total_bytes = session.total_bytes;
        let client = Arc::clone(&self.client);
        bridge(move |callback| client.put_file_chunk(&path, offset, total_bytes, chunk, callback)).await
    }

    async fn finish_upload(&self, session: &UploadSession, checksum: &str) -> SyncResult<String> {
        let path = session.token.clone();
        let checksum = checksum.to_string();
        let client = Arc::clone(&self.client);
        bridge(move |callback| client.get_download_url(&path, &checksum, callback)).await
    }
}

const REVISION_PREFIX: &str = "rev-";

fn revision_version(revision: u64) -> Version {
    Version::new(format!("{REVISION_PREFIX}{revision}"))
}

fn parse_revision(version: &Version) -> SyncResult<Option<u64>> {
    if version.is_absent() {
        return Ok(None);
    }
    version
        .as_str()
        .strip_prefix(REVISION_PREFIX)
        .and_then(|digits| digits.parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| invalid_argument(format!("version {version} was not issued by the native client")))
}

fn to_snapshot(document: NativeDocument) -> SyncResult<Snapshot> {
    let address = Address::parse(&document.path)
        .map_err(|err| unknown(format!("native client returned an unusable path: {}", err.message())))?;
    let (data, version) = if document.exists {
        (Some(document.fields), revision_version(document.revision))
    } else {
        (None, Version::absent())
    };
    Ok(Snapshot::new(address, data, version, Utc::now())
        .with_metadata(SnapshotMetadata::new(document.is_from_cache, false)))
}

fn to_mutation(op: &WriteOp) -> NativeMutation {
    match op {
        WriteOp::Set { address, data } => NativeMutation::Set {
            path: address.path(),
            fields: data.clone(),
        },
        WriteOp::Update { address, partial } => NativeMutation::Update {
            path: address.path(),
            fields: partial.clone(),
        },
        WriteOp::Delete { address } => NativeMutation::Delete { path: address.path() },
    }
}

pub(crate) fn normalize_error(err: NativeError) -> SyncError {
    let message = err.description;
    match err.code {
        status::NOT_FOUND => not_found(message),
        status::PERMISSION_DENIED | status::UNAUTHENTICATED => permission_denied(message),
        status::INVALID_ARGUMENT | status::OUT_OF_RANGE => invalid_argument(message),
        status::ALREADY_EXISTS => already_exists(message),
        status::ABORTED | status::FAILED_PRECONDITION => aborted(message),
        status::UNAVAILABLE | status::DEADLINE_EXCEEDED => unavailable(message),
        status::CANCELLED => cancelled(message),
        status::RESOURCE_EXHAUSTED => resource_exhausted(message),
        code => unknown(format!("{message} [status {code}]")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn revisions_round_trip_through_versions() {
        let version = revision_version(42);
        assert_eq!(parse_revision(&version).unwrap(), Some(42));
        assert_eq!(parse_revision(&Version::absent()).unwrap(), None);
        let err = parse_revision(&Version::new("2024-01-01T00:00:00Z")).unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::InvalidArgument);
    }

    #[test]
    fn non_existent_documents_drop_their_fields() {
        let snapshot = to_snapshot(NativeDocument {
            path: "shows/s1".into(),
            exists: false,
            fields: json!({"stale": true}).as_object().cloned().unwrap(),
            revision: 7,
            is_from_cache: false,
        })
        .unwrap();
        assert!(!snapshot.exists());
        assert!(snapshot.data().is_none());
        assert!(snapshot.version().is_absent());
    }

    #[test]
    fn status_codes_map_onto_error_kinds() {
        let kind = |code| normalize_error(NativeError::new(code, "x")).kind;
        assert_eq!(kind(status::UNAVAILABLE), SyncErrorKind::Unavailable);
        assert_eq!(kind(status::DEADLINE_EXCEEDED), SyncErrorKind::Unavailable);
        assert_eq!(kind(status::FAILED_PRECONDITION), SyncErrorKind::Aborted);
        assert_eq!(kind(status::UNAUTHENTICATED), SyncErrorKind::PermissionDenied);
        assert_eq!(kind(99), SyncErrorKind::Unknown);
    }

    #[tokio::test]
    async fn dropped_callbacks_become_unknown_errors() {
        let result: SyncResult<u64> = bridge(|callback| drop(callback)).await;
        assert_eq!(result.unwrap_err().kind, SyncErrorKind::Unknown);
    }
}
