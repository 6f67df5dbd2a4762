//! Adapter for the browser-embedded client library.
//!
//! That client returns futures resolving to snapshot objects (`data: None` for a missing
//! document), reports errors as string codes (`"permission-denied"`, `"storage/canceled"`, ...)
//! and registers listeners with `on_snapshot(next, error) -> unsubscribe`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;

use crate::sync::error::{
    aborted, already_exists, cancelled, invalid_argument, not_found, permission_denied, resource_exhausted,
    unavailable, unknown, SyncError, SyncErrorKind, SyncResult,
};
use crate::sync::model::{
    Address, Constraint, DocumentData, Snapshot, SnapshotMetadata, Version, WatchTarget, WriteOp,
};
use crate::sync::translate::translate_web;

use super::{CancelFn, Precondition, RuntimeAdapter, UploadSession, WatchEvent, WatchSink};

/// Query object understood by the web client's query builder. Clauses keep the caller's order.
#[derive(Clone, Debug, PartialEq)]
pub struct WebQuery {
    pub collection_path: String,
    pub clauses: Vec<WebClause>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WebClause {
    /// `op` is one of `==`, `<`, `<=`, `>`, `>=`.
    Where {
        field: String,
        op: &'static str,
        value: Value,
    },
    /// `direction` is `asc` or `desc`.
    OrderBy {
        field: String,
        direction: &'static str,
    },
    Limit(u32),
    StartAt(Vec<Value>),
    StartAfter(Vec<Value>),
    EndAt(Vec<Value>),
    EndBefore(Vec<Value>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct WebDocumentSnapshot {
    pub path: String,
    pub data: Option<DocumentData>,
    pub update_time: Option<String>,
    pub from_cache: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebClientError {
    pub code: String,
    pub message: String,
}

impl WebClientError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WebListenTarget {
    Document(String),
    Query(WebQuery),
}

#[derive(Clone, Debug, PartialEq)]
pub enum WebSnapshot {
    Document(WebDocumentSnapshot),
    Query(Vec<WebDocumentSnapshot>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum WebWrite {
    Set { path: String, data: DocumentData },
    Update { path: String, fields: DocumentData },
    Delete { path: String },
}

/// `update_time == None` requires the document to be absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebPrecondition {
    pub path: String,
    pub update_time: Option<String>,
}

pub type WebObserver<T> = Box<dyn Fn(T) + Send + Sync + 'static>;
pub type WebUnsubscribe = Box<dyn FnOnce() + Send + 'static>;

/// Surface of the promise-returning client library this adapter bridges.
#[async_trait]
pub trait WebClient: Send + Sync + 'static {
    async fn get_doc(&self, path: &str) -> Result<WebDocumentSnapshot, WebClientError>;

    async fn get_docs(&self, query: &WebQuery) -> Result<Vec<WebDocumentSnapshot>, WebClientError>;

    fn on_snapshot(
        &self,
        target: WebListenTarget,
        next: WebObserver<WebSnapshot>,
        error: WebObserver<WebClientError>,
    ) -> WebUnsubscribe;

    /// Commits `writes` atomically; returns the commit time.
    async fn commit(
        &self,
        writes: Vec<WebWrite>,
        preconditions: Vec<WebPrecondition>,
    ) -> Result<String, WebClientError>;

    /// Starts a resumable upload and returns its session URL.
    async fn create_upload_session(&self, path: &str, total_bytes: u64) -> Result<String, WebClientError>;

    /// Returns the number of bytes the server has committed for the session.
    async fn put_chunk(&self, session_url: &str, offset: u64, chunk: Bytes) -> Result<u64, WebClientError>;

    /// Finalises the session and returns the download URL.
    async fn finalize_upload(&self, session_url: &str, sha256: &str) -> Result<String, WebClientError>;
}

pub struct WebAdapter<C: WebClient> {
    client: Arc<C>,
}

impl<C: WebClient> WebAdapter<C> {
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

#[async_trait]
impl<C: WebClient> RuntimeAdapter for WebAdapter<C> {
    fn name(&self) -> &'static str {
        "web"
    }

    async fn read_once(&self, address: &Address) -> SyncResult<Snapshot> {
        require_document(address)?;
        match self.client.get_doc(&address.path()).await {
            Ok(document) => to_snapshot(document),
            // Some client builds reject reads of missing documents; absence is not an error here.
            Err(err) if error_code(&err) == "not-found" => Ok(Snapshot::missing(address.clone())),
            Err(err) => Err(normalize_error(err)),
        }
    }

    async fn read_many(&self, collection: &Address, constraints: &[Constraint]) -> SyncResult<Vec<Snapshot>> {
        let query = translate_web(collection, constraints)?;
        let documents = self.client.get_docs(&query).await.map_err(normalize_error)?;
        documents.into_iter().map(to_snapshot).collect()
    }

    fn watch(&self, target: &WatchTarget, sink: WatchSink) -> SyncResult<CancelFn> {
        let listen_target = match target {
            WatchTarget::Document(address) => {
                require_document(address)?;
                WebListenTarget::Document(address.path())
            }
            WatchTarget::Query {
                collection,
                constraints,
            } => WebListenTarget::Query(translate_web(collection, constraints)?),
        };

        let cancelled = Arc::new(AtomicBool::new(false));

        let next_flag = Arc::clone(&cancelled);
        let next_sink = Arc::clone(&sink);
        let next: WebObserver<WebSnapshot> = Box::new(move |snapshot| {
            if next_flag.load(Ordering::SeqCst) {
                return;
            }
            let event = match snapshot {
                WebSnapshot::Document(document) => to_snapshot(document).map(WatchEvent::Document),
                WebSnapshot::Query(documents) => documents
                    .into_iter()
                    .map(to_snapshot)
                    .collect::<SyncResult<Vec<_>>>()
                    .map(WatchEvent::Query),
            };
            next_sink(event.unwrap_or_else(WatchEvent::Error));
        });

        let error_flag = Arc::clone(&cancelled);
        let error: WebObserver<WebClientError> = Box::new(move |err| {
            if error_flag.load(Ordering::SeqCst) {
                return;
            }
            sink(WatchEvent::Error(normalize_error(err)));
        });

        let unsubscribe = self.client.on_snapshot(listen_target, next, error);
        Ok(Box::new(move || {
            cancelled.store(true, Ordering::SeqCst);
            unsubscribe();
        }))
    }

    async fn write(&self, ops: &[WriteOp]) -> SyncResult<Version> {
        let writes = ops.iter().map(to_web_write).collect();
        let commit_time = self.client.commit(writes, Vec::new()).await.map_err(normalize_error)?;
        Ok(Version::new(commit_time))
    }

    async fn transact(&self, preconditions: &[Precondition], ops: &[WriteOp]) -> SyncResult<Version> {
        let writes = ops.iter().map(to_web_write).collect();
        let preconditions = preconditions
            .iter()
            .map(|precondition| WebPrecondition {
                path: precondition.address.path(),
                update_time: (!precondition.version.is_absent()).then(|| precondition.version.as_str().to_string()),
            })
            .collect();
        let commit_time = self
            .client
            .commit(writes, preconditions)
            .await
            .map_err(normalize_error)?;
        Ok(Version::new(commit_time))
    }

    async fn begin_upload(&self, path: &str, total_bytes: u64) -> SyncResult<UploadSession> {
        let session_url = self
            .client
            .create_upload_session(path, total_bytes)
            .await
            .map_err(normalize_error)?;
        Ok(UploadSession {
            path: path.to_string(),
            token: session_url,
            total_bytes,
        })
    }

    async fn upload_chunk(&self, session: &UploadSession, offset: u64, chunk: Bytes) -> SyncResult<u64> {
        self.client
            .put_chunk(&session.token, offset, chunk)
            .await
            .map_err(normalize_error)
    }

    async fn finish_upload(&self, session: &UploadSession, checksum: &str) -> SyncResult<String> {
        self.client
            .finalize_upload(&session.token, checksum)
            .await
            .map_err(normalize_error)
    }
}

fn require_document(address: &Address) -> SyncResult<()> {
    if address.is_document() {
        Ok(())
    } else {
        Err(invalid_argument(format!("{address} is not a document address")))
    }
}

fn to_snapshot(document: WebDocumentSnapshot) -> SyncResult<Snapshot> {
    let address = Address::parse(&document.path)
        .map_err(|err| unknown(format!("web client returned an unusable path: {}", err.message())))?;
    let version = match (&document.data, document.update_time) {
        (Some(_), Some(update_time)) => Version::new(update_time),
        _ => Version::absent(),
    };
    Ok(Snapshot::new(address, document.data, version, Utc::now())
        .with_metadata(SnapshotMetadata::new(document.from_cache, false)))
}

fn to_web_write(op: &WriteOp) -> WebWrite {
    match op {
        WriteOp::Set { address, data } => WebWrite::Set {
            path: address.path(),
            data: data.clone(),
        },
        WriteOp::Update { address, partial } => WebWrite::Update {
            path: address.path(),
            fields: partial.clone(),
        },
        WriteOp::Delete { address } => WebWrite::Delete { path: address.path() },
    }
}

/// Strips the service prefix the web client puts in front of codes (`storage/canceled`).
fn error_code(err: &WebClientError) -> &str {
    err.code.rsplit('/').next().unwrap_or(err.code.as_str())
}

pub(crate) fn normalize_error(err: WebClientError) -> SyncError {
    let message = err.message.clone();
    match error_code(&err) {
        "not-found" | "object-not-found" | "bucket-not-found" => not_found(message),
        "permission-denied" | "unauthenticated" | "unauthorized" => permission_denied(message),
        "invalid-argument" | "out-of-range" | "invalid-checksum" => invalid_argument(message),
        "already-exists" => already_exists(message),
        "aborted" | "failed-precondition" => aborted(message),
        "unavailable" | "deadline-exceeded" | "retry-limit-exceeded" => unavailable(message),
        "cancelled" | "canceled" => cancelled(message),
        "resource-exhausted" | "quota-exceeded" => resource_exhausted(message),
        other => SyncError::new(SyncErrorKind::Unknown, format!("{message} [{other}]")),
    }
}
