use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::field_path::get_field;
use super::Address;

/// Field map stored in a document.
pub type DocumentData = Map<String, Value>;

/// Opaque version token issued by the backing store.
///
/// Tokens only support equality: they are not guaranteed to be numeric or monotonic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Version reported for a document that does not exist.
    pub fn absent() -> Self {
        Self(String::new())
    }

    pub fn is_absent(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("<absent>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Metadata about the state of a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    from_cache: bool,
    has_pending_writes: bool,
}

impl SnapshotMetadata {
    pub fn new(from_cache: bool, has_pending_writes: bool) -> Self {
        Self {
            from_cache,
            has_pending_writes,
        }
    }

    /// Indicates whether the snapshot was served from the local cache.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Indicates whether the snapshot contains writes not yet acknowledged by the store.
    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }
}

/// Point-in-time read of one document. A missing document is a valid snapshot with
/// `exists() == false`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    address: Address,
    data: Option<DocumentData>,
    version: Version,
    fetched_at: DateTime<Utc>,
    #[serde(default)]
    metadata: SnapshotMetadata,
}

impl Snapshot {
    pub fn new(
        address: Address,
        data: Option<DocumentData>,
        version: Version,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            address,
            data,
            version,
            fetched_at,
            metadata: SnapshotMetadata::default(),
        }
    }

    /// Snapshot of a document that does not exist.
    pub fn missing(address: Address) -> Self {
        Self::new(address, None, Version::absent(), Utc::now())
    }

    pub fn with_metadata(mut self, metadata: SnapshotMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn id(&self) -> Option<&str> {
        self.address.id()
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&DocumentData> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<DocumentData> {
        self.data
    }

    /// Value at a (dotted) field path, if the document exists and has it.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|data| get_field(data, field))
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn from_cache(&self) -> bool {
        self.metadata.from_cache()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes()
    }

    pub(crate) fn set_metadata(&mut self, metadata: SnapshotMetadata) {
        self.metadata = metadata;
    }
}
