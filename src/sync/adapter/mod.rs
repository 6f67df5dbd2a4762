//! Runtime adapter port.
//!
//! Every backing client library is bridged to the same contract: promise-style and callback-style
//! clients alike surface [`Snapshot`]s, [`SyncError`](crate::sync::error::SyncError)s and a
//! [`CancelFn`]. Nothing adapter specific crosses this boundary.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::sync::error::SyncResult;
use crate::sync::model::{Address, Constraint, Snapshot, Version, WatchTarget, WriteOp};

pub mod native;
pub mod web;

pub use native::NativeAdapter;
pub use web::WebAdapter;

/// Event delivered by an adapter-level listener.
#[derive(Clone, Debug)]
pub enum WatchEvent {
    Document(Snapshot),
    Query(Vec<Snapshot>),
    Error(crate::sync::error::SyncError),
}

/// Receives listener events. Adapters may invoke it from any thread.
pub type WatchSink = Arc<dyn Fn(WatchEvent) + Send + Sync + 'static>;

/// Tears down an adapter-level listener. Safe to call from inside a sink invocation; once it
/// returns the adapter delivers nothing more to the sink.
pub type CancelFn = Box<dyn FnOnce() + Send + 'static>;

/// Optimistic-concurrency check attached to a transactional commit: the document must still be at
/// `version` (an absent version means the document must not exist).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precondition {
    pub address: Address,
    pub version: Version,
}

impl Precondition {
    pub fn new(address: Address, version: Version) -> Self {
        Self { address, version }
    }

    pub fn must_not_exist(address: Address) -> Self {
        Self {
            address,
            version: Version::absent(),
        }
    }
}

/// Handle to a chunked upload started with [`RuntimeAdapter::begin_upload`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSession {
    pub path: String,
    pub token: String,
    pub total_bytes: u64,
}

#[async_trait]
pub trait RuntimeAdapter: Send + Sync + 'static {
    /// Short identifier used in logs (`"web"`, `"native"`).
    fn name(&self) -> &'static str;

    /// Reads one document. A missing document is an `exists() == false` snapshot, never an
    /// error; `NotFound` is reserved for collection-level failures.
    async fn read_once(&self, address: &Address) -> SyncResult<Snapshot>;

    /// Runs a query against a collection.
    async fn read_many(&self, collection: &Address, constraints: &[Constraint]) -> SyncResult<Vec<Snapshot>>;

    /// Registers a listener. The first event (possibly served from the client's own cache) arrives
    /// asynchronously through `sink`, followed by updates.
    fn watch(&self, target: &WatchTarget, sink: WatchSink) -> SyncResult<CancelFn>;

    /// Applies `ops` atomically and returns the commit version.
    async fn write(&self, ops: &[WriteOp]) -> SyncResult<Version>;

    /// Applies `ops` atomically if every precondition still holds; fails with `Aborted` when a
    /// read document changed and `AlreadyExists` when a must-not-exist document appeared.
    async fn transact(&self, preconditions: &[Precondition], ops: &[WriteOp]) -> SyncResult<Version>;

    async fn begin_upload(&self, path: &str, total_bytes: u64) -> SyncResult<UploadSession>;

    /// Sends the chunk starting at `offset`; returns the total bytes the store has committed.
    async fn upload_chunk(&self, session: &UploadSession, offset: u64, chunk: Bytes) -> SyncResult<u64>;

    /// Completes the upload, verifying the base64 SHA-256 `checksum`, and returns a durable URL.
    async fn finish_upload(&self, session: &UploadSession, checksum: &str) -> SyncResult<String>;
}
