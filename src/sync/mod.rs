//! Data access and synchronization.
//!
//! [`SyncService`] is the public surface. It composes the adapter port ([`RuntimeAdapter`] with its
//! [`WebAdapter`] and [`NativeAdapter`] implementations), the offline cache, the subscription
//! manager, the transaction coordinator and the blob uploader.

pub mod adapter;
pub mod backend;
pub mod cache;
pub mod error;
pub mod model;
pub(crate) mod query_evaluator;
pub mod service;
pub mod settings;
pub mod subscription;
pub mod transaction;
pub mod translate;
pub mod upload;

pub use adapter::{
    CancelFn, NativeAdapter, Precondition, RuntimeAdapter, UploadSession, WatchEvent, WatchSink, WebAdapter,
};
pub use backend::{MemoryNativeClient, MemoryStore, MemoryWebClient, StoreOperation};
pub use cache::{CacheEntry, CachePersistence, InMemoryCachePersistence, JsonFilePersistence, PersistedCache};
pub use error::{SyncError, SyncErrorKind, SyncResult};
pub use model::{
    Address, Constraint, CursorEdge, Direction, DocumentData, IntoAddress, RangeOp, SequencedWrite, Snapshot,
    SnapshotMetadata, Version, WatchTarget, WriteOp,
};
pub use service::{Principal, SyncService, SyncServiceBuilder};
pub use settings::SyncSettings;
pub use subscription::{SubscriptionHandle, WatchPayload};
pub use transaction::{Transaction, TransactionOptions};
pub use translate::{translate_native, translate_web, validate_query};
pub use upload::UploadProgress;
