use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::sync::adapter::web::{
    WebClient, WebClientError, WebDocumentSnapshot, WebListenTarget, WebObserver, WebPrecondition, WebQuery,
    WebSnapshot, WebUnsubscribe, WebWrite,
};
use crate::sync::error::{SyncError, SyncErrorKind};
use crate::sync::model::{Address, WatchTarget, WriteOp};
use crate::sync::translate::web_query_constraints;

use super::{revision_to_update_time, update_time_to_revision, MemoryStore, StoreDocument, StoreEvent};

/// Promise-style client over a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryWebClient {
    store: MemoryStore,
}

impl MemoryWebClient {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

fn client_error(err: SyncError) -> WebClientError {
    let code = err.kind.as_str().trim_start_matches("sync/");
    WebClientError::new(code, err.message())
}

fn storage_error(err: SyncError) -> WebClientError {
    let code = match err.kind {
        SyncErrorKind::Cancelled => "canceled",
        SyncErrorKind::NotFound => "object-not-found",
        SyncErrorKind::ResourceExhausted => "quota-exceeded",
        kind => kind.as_str().trim_start_matches("sync/"),
    };
    WebClientError::new(format!("storage/{code}"), err.message())
}

fn parse_path(path: &str) -> Result<Address, WebClientError> {
    Address::parse(path).map_err(client_error)
}

fn web_document(document: StoreDocument) -> WebDocumentSnapshot {
    let update_time = document
        .data
        .is_some()
        .then(|| revision_to_update_time(document.revision));
    WebDocumentSnapshot {
        path: document.address.path(),
        data: document.data,
        update_time,
        from_cache: false,
    }
}

#[async_trait]
impl WebClient for MemoryWebClient {
    async fn get_doc(&self, path: &str) -> Result<WebDocumentSnapshot, WebClientError> {
        let address = parse_path(path)?;
        let document = self.store.read(&address).await.map_err(client_error)?;
        Ok(web_document(document))
    }

    async fn get_docs(&self, query: &WebQuery) -> Result<Vec<WebDocumentSnapshot>, WebClientError> {
        let (collection, constraints) = web_query_constraints(query).map_err(client_error)?;
        let documents = self
            .store
            .query(&collection, &constraints)
            .await
            .map_err(client_error)?;
        Ok(documents.into_iter().map(web_document).collect())
    }

    fn on_snapshot(
        &self,
        target: WebListenTarget,
        next: WebObserver<WebSnapshot>,
        error: WebObserver<WebClientError>,
    ) -> WebUnsubscribe {
        let target = match target {
            WebListenTarget::Document(path) => parse_path(&path).map(WatchTarget::Document),
            WebListenTarget::Query(query) => web_query_constraints(&query)
                .map(|(collection, constraints)| WatchTarget::Query {
                    collection,
                    constraints,
                })
                .map_err(client_error),
        };
        let target = match target {
            Ok(target) => target,
            Err(err) => {
                error(err);
                return Box::new(|| {});
            }
        };

        let id = self.store.listen(
            target,
            Arc::new(move |event| match event {
                StoreEvent::Document(document) => next(WebSnapshot::Document(web_document(document))),
                StoreEvent::Query(documents) => {
                    next(WebSnapshot::Query(documents.into_iter().map(web_document).collect()))
                }
                StoreEvent::Error(err) => error(client_error(err)),
            }),
        );
        let store = self.store.clone();
        Box::new(move || store.unlisten(id))
    }

    async fn commit(
        &self,
        writes: Vec<WebWrite>,
        preconditions: Vec<WebPrecondition>,
    ) -> Result<String, WebClientError> {
        let ops = writes
            .into_iter()
            .map(|write| {
                Ok(match write {
                    WebWrite::Set { path, data } => WriteOp::set(parse_path(&path)?, data),
                    WebWrite::Update { path, fields } => WriteOp::update(parse_path(&path)?, fields),
                    WebWrite::Delete { path } => WriteOp::delete(parse_path(&path)?),
                })
            })
            .collect::<Result<Vec<_>, WebClientError>>()?;
        let expectations = preconditions
            .into_iter()
            .map(|precondition| {
                let address = parse_path(&precondition.path)?;
                let revision = match precondition.update_time {
                    None => None,
                    Some(update_time) => Some(update_time_to_revision(&update_time).ok_or_else(|| {
                        WebClientError::new("invalid-argument", format!("Malformed update time {update_time}"))
                    })?),
                };
                Ok((address, revision))
            })
            .collect::<Result<Vec<_>, WebClientError>>()?;
        let revision = self
            .store
            .commit(&ops, &expectations)
            .await
            .map_err(client_error)?;
        Ok(revision_to_update_time(revision))
    }

    async fn create_upload_session(&self, path: &str, total_bytes: u64) -> Result<String, WebClientError> {
        self.store
            .begin_upload(path, total_bytes)
            .await
            .map_err(storage_error)
    }

    async fn put_chunk(&self, session_url: &str, offset: u64, chunk: Bytes) -> Result<u64, WebClientError> {
        self.store
            .put_chunk(session_url, offset, chunk)
            .await
            .map_err(storage_error)
    }

    async fn finalize_upload(&self, session_url: &str, sha256: &str) -> Result<String, WebClientError> {
        self.store
            .finish_upload(session_url, sha256)
            .await
            .map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_documents_come_back_without_data() {
        let client = MemoryWebClient::new(MemoryStore::new());
        let snapshot = client.get_doc("shows/s1").await.unwrap();
        assert!(snapshot.data.is_none());
        assert!(snapshot.update_time.is_none());
    }

    #[tokio::test]
    async fn commit_returns_an_update_time() {
        let client = MemoryWebClient::new(MemoryStore::new());
        let data = json!({"name": "Sword"}).as_object().cloned().unwrap();
        let update_time = client
            .commit(
                vec![WebWrite::Set {
                    path: "props/p1".into(),
                    data,
                }],
                Vec::new(),
            )
            .await
            .unwrap();
        let snapshot = client.get_doc("props/p1").await.unwrap();
        assert_eq!(snapshot.update_time, Some(update_time));
    }

    #[test]
    fn storage_failures_carry_the_storage_prefix() {
        let err = storage_error(crate::sync::error::cancelled("stop"));
        assert_eq!(err.code, "storage/canceled");
    }
}
