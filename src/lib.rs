//! Unified data access and synchronization layer for the props inventory app.
//!
//! Every feature module (props, shows, task boards, packing lists) reads, writes and watches
//! documents through [`sync::SyncService`]. The service hides which client runtime is active: a
//! deployment builds it with either the browser-embedded [`sync::WebAdapter`] or the mobile-native
//! [`sync::NativeAdapter`], and callers see the same snapshots, listener lifecycle, optimistic writes
//! and transactional batches either way.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use propstore_sync::sync::{MemoryStore, MemoryWebClient, SyncService, SyncSettings, WebAdapter};
//! use serde_json::json;
//!
//! # async fn run() -> propstore_sync::sync::SyncResult<()> {
//! let store = MemoryStore::new();
//! let adapter = WebAdapter::new(MemoryWebClient::new(store));
//! let service = SyncService::new(Arc::new(adapter), SyncSettings::default())?;
//!
//! service
//!     .set("props/p1", json!({ "name": "Sword" }).as_object().cloned().unwrap_or_default())
//!     .await?;
//! let snapshot = service.get("props/p1").await?;
//! assert!(snapshot.exists());
//! # Ok(()) }
//! ```

pub mod platform;
pub mod sync;
pub mod util;
