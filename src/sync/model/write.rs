use serde::{Deserialize, Serialize};

use crate::sync::error::{invalid_argument, SyncResult};

use super::field_path::set_field;
use super::{Address, DocumentData};

/// A single mutation against one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Replaces the whole document.
    Set { address: Address, data: DocumentData },
    /// Merges `partial` into an existing document; keys may be dotted field paths.
    Update {
        address: Address,
        partial: DocumentData,
    },
    Delete { address: Address },
}

impl WriteOp {
    pub fn set(address: Address, data: DocumentData) -> Self {
        WriteOp::Set { address, data }
    }

    pub fn update(address: Address, partial: DocumentData) -> Self {
        WriteOp::Update { address, partial }
    }

    pub fn delete(address: Address) -> Self {
        WriteOp::Delete { address }
    }

    pub fn address(&self) -> &Address {
        match self {
            WriteOp::Set { address, .. }
            | WriteOp::Update { address, .. }
            | WriteOp::Delete { address } => address,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Set { .. } => "set",
            WriteOp::Update { .. } => "update",
            WriteOp::Delete { .. } => "delete",
        }
    }

    /// Checks the op is well formed before it touches the cache or the adapter.
    pub fn validate(&self) -> SyncResult<()> {
        if !self.address().is_document() {
            return Err(invalid_argument(format!(
                "{} requires a document address, got collection {}",
                self.kind(),
                self.address()
            )));
        }
        if let WriteOp::Update { partial, address } = self {
            if partial.is_empty() {
                return Err(invalid_argument(format!(
                    "update of {address} must change at least one field"
                )));
            }
            for key in partial.keys() {
                super::field_path::split_field_path(key)?;
            }
        }
        Ok(())
    }

    /// Applies the op to the current document state, returning the resulting state.
    ///
    /// `Update` on a missing document leaves it missing; the store rejects such writes and the
    /// cache rolls the optimistic state back when it does.
    pub fn apply_to(&self, current: Option<&DocumentData>) -> Option<DocumentData> {
        match self {
            WriteOp::Set { data, .. } => Some(data.clone()),
            WriteOp::Delete { .. } => None,
            WriteOp::Update { partial, .. } => {
                let mut merged = current?.clone();
                for (field, value) in partial {
                    if set_field(&mut merged, field, value.clone()).is_err() {
                        return Some(merged);
                    }
                }
                Some(merged)
            }
        }
    }
}

/// A [`WriteOp`] tagged with the client-session sequence number that orders it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequencedWrite {
    sequence: u64,
    op: WriteOp,
}

impl SequencedWrite {
    pub fn new(sequence: u64, op: WriteOp) -> Self {
        Self { sequence, op }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn op(&self) -> &WriteOp {
        &self.op
    }

    pub fn address(&self) -> &Address {
        self.op.address()
    }

    pub fn into_op(self) -> WriteOp {
        self.op
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn data(value: Value) -> DocumentData {
        value.as_object().cloned().unwrap()
    }

    fn address(path: &str) -> Address {
        Address::parse(path).unwrap()
    }

    #[test]
    fn update_merges_dotted_paths() {
        let op = WriteOp::update(
            address("props/p1"),
            data(json!({"dimensions.length": 100, "status": "ready"})),
        );
        let current = data(json!({"name": "Sword", "dimensions": {"length": 90, "width": 5}}));
        let merged = op.apply_to(Some(&current)).unwrap();
        assert_eq!(
            Value::Object(merged),
            json!({"name": "Sword", "status": "ready", "dimensions": {"length": 100, "width": 5}})
        );
    }

    #[test]
    fn update_of_missing_document_stays_missing() {
        let op = WriteOp::update(address("props/p1"), data(json!({"a": 1})));
        assert!(op.apply_to(None).is_none());
    }

    #[test]
    fn set_and_delete_replace_state() {
        let current = data(json!({"a": 1}));
        let set = WriteOp::set(address("props/p1"), data(json!({"b": 2})));
        assert_eq!(set.apply_to(Some(&current)), Some(data(json!({"b": 2}))));
        assert!(WriteOp::delete(address("props/p1")).apply_to(Some(&current)).is_none());
    }

    #[test]
    fn validation_rejects_collections_and_empty_updates() {
        let err = WriteOp::delete(address("props")).validate().unwrap_err();
        assert_eq!(err.code_str(), "sync/invalid-argument");
        let err = WriteOp::update(address("props/p1"), DocumentData::new())
            .validate()
            .unwrap_err();
        assert_eq!(err.code_str(), "sync/invalid-argument");
        let err = WriteOp::update(address("props/p1"), data(json!({"a..b": 1})))
            .validate()
            .unwrap_err();
        assert_eq!(err.code_str(), "sync/invalid-argument");
    }
}
