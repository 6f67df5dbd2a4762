use std::sync::Arc;

use bytes::Bytes;

use crate::platform::runtime::spawn_detached;
use crate::sync::adapter::native::{
    status, NativeBatch, NativeCallback, NativeClient, NativeDocument, NativeError, NativeEvent,
    NativeListenTarget, NativeListener, NativeListenerToken, NativeMutation, NativeQuery,
};
use crate::sync::error::{SyncError, SyncErrorKind};
use crate::sync::model::{Address, WatchTarget, WriteOp};
use crate::sync::translate::native_query_constraints;

use super::{MemoryStore, StoreDocument, StoreEvent, StoreListenerId};

/// Callback-style client over a [`MemoryStore`]. Completions run on a background task, never on
/// the calling thread.
#[derive(Clone)]
pub struct MemoryNativeClient {
    store: MemoryStore,
}

impl MemoryNativeClient {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

fn client_error(err: SyncError) -> NativeError {
    let code = match err.kind {
        SyncErrorKind::NotFound => status::NOT_FOUND,
        SyncErrorKind::PermissionDenied => status::PERMISSION_DENIED,
        SyncErrorKind::InvalidArgument => status::INVALID_ARGUMENT,
        SyncErrorKind::AlreadyExists => status::ALREADY_EXISTS,
        SyncErrorKind::Aborted => status::ABORTED,
        SyncErrorKind::Unavailable => status::UNAVAILABLE,
        SyncErrorKind::Cancelled => status::CANCELLED,
        SyncErrorKind::ResourceExhausted => status::RESOURCE_EXHAUSTED,
        SyncErrorKind::Unknown => status::UNKNOWN,
    };
    NativeError::new(code, err.message())
}

fn parse_path(path: &str) -> Result<Address, NativeError> {
    Address::parse(path).map_err(client_error)
}

fn native_document(document: StoreDocument) -> NativeDocument {
    NativeDocument {
        path: document.address.path(),
        exists: document.data.is_some(),
        fields: document.data.unwrap_or_default(),
        revision: document.revision,
        is_from_cache: false,
    }
}

impl NativeClient for MemoryNativeClient {
    fn get_document(&self, path: &str, callback: NativeCallback<NativeDocument>) {
        let store = self.store.clone();
        let path = path.to_string();
        spawn_detached(async move {
            let result = match parse_path(&path) {
                Ok(address) => store.read(&address).await.map(native_document).map_err(client_error),
                Err(err) => Err(err),
            };
            callback(result);
        });
    }

    fn run_query(&self, query: &NativeQuery, callback: NativeCallback<Vec<NativeDocument>>) {
        let store = self.store.clone();
        let query = query.clone();
        spawn_detached(async move {
            let result = match native_query_constraints(&query) {
                Ok((collection, constraints)) => store
                    .query(&collection, &constraints)
                    .await
                    .map(|documents| documents.into_iter().map(native_document).collect())
                    .map_err(client_error),
                Err(err) => Err(client_error(err)),
            };
            callback(result);
        });
    }

    fn add_snapshot_listener(&self, target: NativeListenTarget, listener: NativeListener) -> NativeListenerToken {
        let target = match target {
            NativeListenTarget::Document(path) => parse_path(&path).map(WatchTarget::Document),
            NativeListenTarget::Query(query) => native_query_constraints(&query)
                .map(|(collection, constraints)| WatchTarget::Query {
                    collection,
                    constraints,
                })
                .map_err(client_error),
        };
        let target = match target {
            Ok(target) => target,
            Err(err) => {
                listener(Err(err));
                return NativeListenerToken(0);
            }
        };
        let StoreListenerId(id) = self.store.listen(
            target,
            Arc::new(move |event| match event {
                StoreEvent::Document(document) => listener(Ok(NativeEvent::Document(native_document(document)))),
                StoreEvent::Query(documents) => listener(Ok(NativeEvent::Query(
                    documents.into_iter().map(native_document).collect(),
                ))),
                StoreEvent::Error(err) => listener(Err(client_error(err))),
            }),
        );
        NativeListenerToken(id)
    }

    fn remove_snapshot_listener(&self, token: NativeListenerToken) {
        self.store.unlisten(StoreListenerId(token.0));
    }

    fn commit_batch(&self, batch: NativeBatch, callback: NativeCallback<u64>) {
        let store = self.store.clone();
        spawn_detached(async move {
            let result = match batch_ops(batch) {
                Ok((ops, expectations)) => store.commit(&ops, &expectations).await.map_err(client_error),
                Err(err) => Err(err),
            };
            callback(result);
        });
    }

    fn put_file_chunk(&self, path: &str, offset: u64, total_bytes: u64, chunk: Bytes, callback: NativeCallback<u64>) {
        let store = self.store.clone();
        let path = path.to_string();
        spawn_detached(async move {
            let result = async {
                let session = store.path_session(&path, total_bytes, offset == 0)?;
                store.put_chunk(&session, offset, chunk).await
            }
            .await
            .map_err(client_error);
            callback(result);
        });
    }

    fn get_download_url(&self, path: &str, sha256: &str, callback: NativeCallback<String>) {
        let store = self.store.clone();
        let path = path.to_string();
        let sha256 = sha256.to_string();
        spawn_detached(async move {
            let result = async {
                let session = store.find_path_session(&path)?;
                store.finish_upload(&session, &sha256).await
            }
            .await
            .map_err(client_error);
            callback(result);
        });
    }
}

type BatchOps = (Vec<WriteOp>, Vec<(Address, Option<u64>)>);

fn batch_ops(batch: NativeBatch) -> Result<BatchOps, NativeError> {
    let ops = batch
        .mutations
        .into_iter()
        .map(|mutation| {
            Ok(match mutation {
                NativeMutation::Set { path, fields } => WriteOp::set(parse_path(&path)?, fields),
                NativeMutation::Update { path, fields } => WriteOp::update(parse_path(&path)?, fields),
                NativeMutation::Delete { path } => WriteOp::delete(parse_path(&path)?),
            })
        })
        .collect::<Result<Vec<_>, NativeError>>()?;
    let expectations = batch
        .expected_revisions
        .into_iter()
        .map(|expectation| Ok((parse_path(&expectation.path)?, expectation.revision)))
        .collect::<Result<Vec<_>, NativeError>>()?;
    Ok((ops, expectations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::oneshot;

    #[tokio::test]
    async fn missing_documents_report_exists_false() {
        let client = MemoryNativeClient::new(MemoryStore::new());
        let (sender, receiver) = oneshot::channel();
        client.get_document(
            "shows/s1",
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        );
        let document = receiver.await.unwrap().unwrap();
        assert!(!document.exists);
        assert!(document.fields.is_empty());
    }

    #[tokio::test]
    async fn uploads_restart_when_offset_is_zero() {
        let store = MemoryStore::new();
        let first = store.path_session("photos/a.jpg", 4, true).unwrap();
        store.put_chunk(&first, 0, Bytes::from_static(b"ab")).await.unwrap();
        assert_eq!(store.path_session("photos/a.jpg", 4, false).unwrap(), first);
        let second = store.path_session("photos/a.jpg", 4, true).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.put_chunk(&second, 0, Bytes::from_static(b"ab")).await.unwrap(), 2);
    }
}
