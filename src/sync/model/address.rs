use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::sync::error::{invalid_argument, SyncResult};

/// Path to a collection (`id == None`) or to exactly one document inside it.
///
/// Collections may be nested below documents (`shows/s1/statusHistory`), so a path with an odd
/// number of segments names a collection and an even number names a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    collection: String,
    id: Option<String>,
}

impl Address {
    /// Parses `"<collection>"` or `"<collection>/<id>"` (collections arbitrarily nested).
    pub fn parse(path: &str) -> SyncResult<Self> {
        let segments = split_segments(path)?;
        if segments.len() % 2 == 1 {
            Ok(Self {
                collection: segments.join("/"),
                id: None,
            })
        } else {
            let (id, collection) = segments
                .split_last()
                .ok_or_else(|| invalid_argument("Address must not be empty"))?;
            Ok(Self {
                collection: collection.join("/"),
                id: Some((*id).to_string()),
            })
        }
    }

    /// Builds a collection address; `path` must have an odd number of segments.
    pub fn collection(path: &str) -> SyncResult<Self> {
        let address = Self::parse(path)?;
        if address.is_document() {
            return Err(invalid_argument(format!(
                "{path} points to a document, expected a collection"
            )));
        }
        Ok(address)
    }

    /// Builds a document address from a collection path and a document id.
    pub fn document(collection: &str, id: &str) -> SyncResult<Self> {
        Self::collection(collection)?.child(id)
    }

    /// Returns the document `id` inside this collection.
    pub fn child(&self, id: &str) -> SyncResult<Self> {
        if self.is_document() {
            return Err(invalid_argument(format!(
                "{self} is a document; documents only contain sub-collections"
            )));
        }
        validate_segment(id)?;
        Ok(Self {
            collection: self.collection.clone(),
            id: Some(id.to_string()),
        })
    }

    pub fn is_document(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_collection(&self) -> bool {
        self.id.is_none()
    }

    /// Path of the collection this address belongs to (or is).
    pub fn collection_path(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The collection address that contains this document, or `self` for a collection.
    pub fn parent_collection(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            id: None,
        }
    }

    /// Whether the document at `other` lives directly inside this collection.
    pub fn contains(&self, other: &Address) -> bool {
        self.is_collection() && other.is_document() && other.collection == self.collection
    }

    /// Canonical slash-separated path.
    pub fn path(&self) -> String {
        match &self.id {
            Some(id) => format!("{}/{}", self.collection, id),
            None => self.collection.clone(),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{}", self.collection, id),
            None => f.write_str(&self.collection),
        }
    }
}

impl FromStr for Address {
    type Err = crate::sync::error::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Conversion used by the façade so callers can pass either a path string or an [`Address`].
pub trait IntoAddress {
    fn into_address(self) -> SyncResult<Address>;
}

impl IntoAddress for Address {
    fn into_address(self) -> SyncResult<Address> {
        Ok(self)
    }
}

impl IntoAddress for &Address {
    fn into_address(self) -> SyncResult<Address> {
        Ok(self.clone())
    }
}

impl IntoAddress for &str {
    fn into_address(self) -> SyncResult<Address> {
        Address::parse(self)
    }
}

impl IntoAddress for String {
    fn into_address(self) -> SyncResult<Address> {
        Address::parse(&self)
    }
}

impl IntoAddress for &String {
    fn into_address(self) -> SyncResult<Address> {
        Address::parse(self)
    }
}

fn split_segments(path: &str) -> SyncResult<Vec<&str>> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(invalid_argument("Address must not be empty"));
    }
    if trimmed.contains("//") {
        return Err(invalid_argument(format!(
            "Found empty segment in address {path}"
        )));
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    for segment in &segments {
        validate_segment(segment)?;
    }
    Ok(segments)
}

fn validate_segment(segment: &str) -> SyncResult<()> {
    if segment.is_empty() || segment.contains('/') {
        return Err(invalid_argument(format!(
            "Invalid address segment {segment:?}"
        )));
    }
    if segment == "." || segment == ".." {
        return Err(invalid_argument("Address segments cannot be '.' or '..'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_document_and_collection() {
        let doc = Address::parse("props/p1").unwrap();
        assert!(doc.is_document());
        assert_eq!(doc.collection_path(), "props");
        assert_eq!(doc.id(), Some("p1"));

        let collection = Address::parse("props").unwrap();
        assert!(collection.is_collection());
        assert_eq!(collection.to_string(), "props");
    }

    #[test]
    fn nested_collection_under_document() {
        let history = Address::parse("shows/s1/statusHistory").unwrap();
        assert!(history.is_collection());
        assert_eq!(history.collection_path(), "shows/s1/statusHistory");

        let entry = history.child("h1").unwrap();
        assert_eq!(entry.path(), "shows/s1/statusHistory/h1");
        assert!(history.contains(&entry));
        assert_eq!(entry.parent_collection(), history);
    }

    #[test]
    fn rejects_malformed_paths() {
        for path in ["", "/", "props//p1", "props/.."] {
            let err = Address::parse(path).unwrap_err();
            assert_eq!(err.code_str(), "sync/invalid-argument", "{path}");
        }
    }

    #[test]
    fn collection_constructor_rejects_documents() {
        let err = Address::collection("props/p1").unwrap_err();
        assert_eq!(err.code_str(), "sync/invalid-argument");
        assert!(Address::document("props", "p1").unwrap().is_document());
    }

    #[test]
    fn documents_have_no_document_children() {
        let doc = Address::parse("props/p1").unwrap();
        assert!(doc.child("x").is_err());
    }

    #[test]
    fn surrounding_slashes_are_ignored() {
        let doc = Address::parse("/props/p1/").unwrap();
        assert_eq!(doc.path(), "props/p1");
    }
}
