use crate::sync::error::{invalid_argument, SyncResult};

use super::{Address, Constraint};

/// What a `watch` or `read_many` call points at: one document, or a collection plus constraints.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchTarget {
    Document(Address),
    Query {
        collection: Address,
        constraints: Vec<Constraint>,
    },
}

impl WatchTarget {
    pub fn document(address: Address) -> SyncResult<Self> {
        if !address.is_document() {
            return Err(invalid_argument(format!(
                "{address} is a collection; document watches need a document address"
            )));
        }
        Ok(WatchTarget::Document(address))
    }

    pub fn query(collection: Address, constraints: Vec<Constraint>) -> SyncResult<Self> {
        if !collection.is_collection() {
            return Err(invalid_argument(format!(
                "{collection} is a document; queries need a collection address"
            )));
        }
        Ok(WatchTarget::Query {
            collection,
            constraints,
        })
    }

    /// Document addresses watch themselves; collection addresses watch the unconstrained query.
    pub fn from_address(address: Address) -> Self {
        if address.is_document() {
            WatchTarget::Document(address)
        } else {
            WatchTarget::Query {
                collection: address,
                constraints: Vec::new(),
            }
        }
    }

    pub fn address(&self) -> &Address {
        match self {
            WatchTarget::Document(address) => address,
            WatchTarget::Query { collection, .. } => collection,
        }
    }

    /// Whether a change to the document at `address` can affect this target.
    pub fn covers(&self, address: &Address) -> bool {
        match self {
            WatchTarget::Document(watched) => watched == address,
            WatchTarget::Query { collection, .. } => collection.contains(address),
        }
    }

    /// Stable identity used to deduplicate listeners: identical address plus identical
    /// constraint list (order included) yields identical keys.
    pub fn canonical_key(&self) -> SyncResult<String> {
        match self {
            WatchTarget::Document(address) => Ok(format!("doc:{address}")),
            WatchTarget::Query {
                collection,
                constraints,
            } => {
                let encoded = serde_json::to_string(constraints).map_err(|err| {
                    invalid_argument(format!("Failed to encode query constraints: {err}"))
                })?;
                Ok(format!("query:{collection}?{encoded}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::model::Direction;

    #[test]
    fn identical_queries_share_a_key() {
        let collection = Address::parse("props").unwrap();
        let constraints = vec![
            Constraint::equals("showId", "s1"),
            Constraint::order_by("name", Direction::Ascending),
        ];
        let first = WatchTarget::query(collection.clone(), constraints.clone()).unwrap();
        let second = WatchTarget::query(collection, constraints).unwrap();
        assert_eq!(first.canonical_key().unwrap(), second.canonical_key().unwrap());
    }

    #[test]
    fn constraint_order_changes_the_key() {
        let collection = Address::parse("props").unwrap();
        let a = WatchTarget::query(
            collection.clone(),
            vec![Constraint::equals("a", 1), Constraint::equals("b", 2)],
        )
        .unwrap();
        let b = WatchTarget::query(
            collection,
            vec![Constraint::equals("b", 2), Constraint::equals("a", 1)],
        )
        .unwrap();
        assert_ne!(a.canonical_key().unwrap(), b.canonical_key().unwrap());
    }

    #[test]
    fn covers_matches_documents_and_collections() {
        let doc = Address::parse("props/p1").unwrap();
        let other = Address::parse("props/p2").unwrap();
        let doc_target = WatchTarget::document(doc.clone()).unwrap();
        assert!(doc_target.covers(&doc));
        assert!(!doc_target.covers(&other));

        let query = WatchTarget::from_address(Address::parse("props").unwrap());
        assert!(query.covers(&doc));
        assert!(!query.covers(&Address::parse("shows/s1").unwrap()));
    }

    #[test]
    fn rejects_mismatched_address_kinds() {
        assert!(WatchTarget::document(Address::parse("props").unwrap()).is_err());
        assert!(WatchTarget::query(Address::parse("props/p1").unwrap(), vec![]).is_err());
    }
}
