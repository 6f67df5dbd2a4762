//! Transaction coordinator.
//!
//! A transaction body reads through a [`Transaction`], which pins the version of every document it
//! sees, and stages writes on it. The staged writes are committed with one precondition per read;
//! when any of them fails the body is run again from scratch with a fresh context.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_lock::Mutex;

use crate::platform::runtime::sleep;
use crate::sync::adapter::{Precondition, RuntimeAdapter};
use crate::sync::cache::OfflineCache;
use crate::sync::error::{aborted, invalid_argument, SyncErrorKind, SyncResult};
use crate::sync::model::{Address, DocumentData, IntoAddress, Snapshot, Version, WriteOp};
use crate::sync::settings::SyncSettings;
use crate::util::{calculate_backoff, BackoffConfig};

/// Retry policy for [`TransactionCoordinator::run`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransactionOptions {
    /// How many times the body is re-run after contention; the body runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl TransactionOptions {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            max_retries: settings.max_transaction_retries,
            backoff: settings.transaction_backoff,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[derive(Default)]
struct TransactionContext {
    reads: BTreeMap<Address, Version>,
    writes: Vec<WriteOp>,
    contended: bool,
}

/// Read set and write set of one transaction attempt. Clones share the same context.
#[derive(Clone)]
pub struct Transaction {
    adapter: Arc<dyn RuntimeAdapter>,
    context: Arc<Mutex<TransactionContext>>,
}

impl Transaction {
    fn new(adapter: Arc<dyn RuntimeAdapter>) -> Self {
        Self {
            adapter,
            context: Arc::new(Mutex::new(TransactionContext::default())),
        }
    }

    /// Reads a document from the store and records its version. All reads must happen before
    /// the first write.
    pub async fn get(&self, address: impl IntoAddress) -> SyncResult<Snapshot> {
        let address = address.into_address()?;
        if !address.is_document() {
            return Err(invalid_argument(format!(
                "Transactions read single documents, got collection {address}"
            )));
        }
        if !self.context.lock().await.writes.is_empty() {
            return Err(invalid_argument(
                "Every transaction read must be executed before all writes",
            ));
        }
        let snapshot = self.adapter.read_once(&address).await?;
        let mut context = self.context.lock().await;
        match context.reads.get(&address) {
            Some(previous) if previous != snapshot.version() => {
                context.contended = true;
                return Err(aborted(format!(
                    "{address} changed between two reads of the same transaction"
                )));
            }
            Some(_) => {}
            None => {
                context.reads.insert(address, snapshot.version().clone());
            }
        }
        Ok(snapshot)
    }

    pub async fn set(&self, address: impl IntoAddress, data: DocumentData) -> SyncResult<()> {
        self.stage(WriteOp::set(address.into_address()?, data)).await
    }

    pub async fn update(&self, address: impl IntoAddress, partial: DocumentData) -> SyncResult<()> {
        self.stage(WriteOp::update(address.into_address()?, partial)).await
    }

    pub async fn delete(&self, address: impl IntoAddress) -> SyncResult<()> {
        self.stage(WriteOp::delete(address.into_address()?)).await
    }

    async fn stage(&self, op: WriteOp) -> SyncResult<()> {
        op.validate()?;
        self.context.lock().await.writes.push(op);
        Ok(())
    }
}

pub struct TransactionCoordinator {
    adapter: Arc<dyn RuntimeAdapter>,
    cache: Arc<OfflineCache>,
}

impl TransactionCoordinator {
    pub fn new(adapter: Arc<dyn RuntimeAdapter>, cache: Arc<OfflineCache>) -> Self {
        Self { adapter, cache }
    }

    /// Runs `body` until its writes commit against unchanged reads, retrying on contention.
    /// Errors raised by the body itself are returned as is.
    pub async fn run<T, F, Fut>(&self, options: TransactionOptions, mut body: F) -> SyncResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let attempts = options.max_retries.saturating_add(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = calculate_backoff(attempt - 1, &options.backoff);
                log::debug!(
                    "retrying transaction (attempt {} of {attempts}) after {} ms",
                    attempt + 1,
                    delay.as_millis()
                );
                sleep(delay).await;
            }

            let transaction = Transaction::new(Arc::clone(&self.adapter));
            let outcome = body(transaction.clone()).await;
            let (preconditions, writes, value) = {
                let mut context = transaction.context.lock().await;
                let value = match outcome {
                    Ok(value) => value,
                    Err(err) if context.contended => {
                        last_error = Some(err);
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                let preconditions: Vec<Precondition> = context
                    .reads
                    .iter()
                    .map(|(address, version)| Precondition::new(address.clone(), version.clone()))
                    .collect();
                let writes = std::mem::take(&mut context.writes);
                if writes.is_empty() {
                    return Ok(value);
                }
                (preconditions, writes, value)
            };

            match self.adapter.transact(&preconditions, &writes).await {
                Ok(version) => {
                    self.cache.apply_committed(&writes, &version);
                    return Ok(value);
                }
                Err(err) if matches!(err.kind, SyncErrorKind::Aborted | SyncErrorKind::AlreadyExists) => {
                    log::debug!("transaction commit lost a race: {err}");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let detail = last_error
            .map(|err| err.message().to_string())
            .unwrap_or_else(|| "contention".to_string());
        log::warn!("transaction gave up after {attempts} attempts: {detail}");
        Err(aborted(format!(
            "Transaction failed after {attempts} attempts: {detail}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::adapter::WebAdapter;
    use crate::sync::backend::{MemoryStore, MemoryWebClient};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn data(value: Value) -> DocumentData {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (MemoryStore, TransactionCoordinator) {
        let store = MemoryStore::new();
        let adapter: Arc<dyn RuntimeAdapter> = Arc::new(WebAdapter::new(MemoryWebClient::new(store.clone())));
        let cache = Arc::new(OfflineCache::new(Duration::from_secs(60), None));
        (store, TransactionCoordinator::new(adapter, cache))
    }

    fn options(max_retries: u32) -> TransactionOptions {
        TransactionOptions {
            max_retries,
            backoff: BackoffConfig::immediate(),
        }
    }

    #[tokio::test]
    async fn increments_counter() {
        let (store, coordinator) = setup();
        let address = Address::parse("shows/s1").unwrap();
        store.external_write(&address, data(json!({"count": 1}))).unwrap();

        let result = coordinator
            .run(options(5), |tx| async move {
                let snapshot = tx.get("shows/s1").await?;
                let count = snapshot.get("count").and_then(Value::as_i64).unwrap_or(0);
                tx.update("shows/s1", data(json!({"count": count + 1}))).await?;
                Ok(count + 1)
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(store.document(&address).unwrap()["count"], json!(2));
    }

    #[tokio::test]
    async fn transient_contention_is_retried() {
        let (store, coordinator) = setup();
        let address = Address::parse("shows/s1").unwrap();
        store.external_write(&address, data(json!({"count": 1}))).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let result = coordinator
            .run(options(5), |tx| {
                let store = store.clone();
                let address = address.clone();
                let attempts = Arc::clone(&attempts);
                async move {
                    let snapshot = tx.get(&address).await?;
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        store.external_write(&address, data(json!({"count": 10})))?;
                    }
                    let count = snapshot.get("count").and_then(Value::as_i64).unwrap_or(0);
                    tx.set(&address, data(json!({"count": count + 1}))).await?;
                    Ok(count + 1)
                }
            })
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(result, 11);
        assert_eq!(store.document(&address).unwrap()["count"], json!(11));
    }

    #[tokio::test]
    async fn permanent_contention_aborts_without_writing() {
        let (store, coordinator) = setup();
        let address = Address::parse("shows/s1").unwrap();
        store.external_write(&address, data(json!({"count": 1}))).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let err = coordinator
            .run(options(2), |tx| {
                let store = store.clone();
                let address = address.clone();
                let attempts = Arc::clone(&attempts);
                async move {
                    tx.get(&address).await?;
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    store.external_write(&address, data(json!({"count": 100 + n})))?;
                    tx.set(&address, data(json!({"count": -1}))).await?;
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::Aborted);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(store.document(&address).unwrap()["count"], json!(102));
    }

    #[tokio::test]
    async fn body_errors_are_not_retried() {
        let (_store, coordinator) = setup();
        let attempts = Arc::new(AtomicU32::new(0));
        let err = coordinator
            .run(options(5), |_tx| {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(invalid_argument("quota check failed"))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::InvalidArgument);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reads_after_writes_are_rejected() {
        let (store, coordinator) = setup();
        let err = coordinator
            .run(options(0), |tx| async move {
                tx.set("props/p1", data(json!({"name": "Sword"}))).await?;
                tx.get("props/p1").await?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::InvalidArgument);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn read_of_missing_document_guards_creation() {
        let (store, coordinator) = setup();
        let address = Address::parse("props/p1").unwrap();
        let err = coordinator
            .run(options(0), |tx| {
                let store = store.clone();
                let address = address.clone();
                async move {
                    let snapshot = tx.get(&address).await?;
                    assert!(!snapshot.exists());
                    store.external_write(&address, data(json!({"name": "Axe"})))?;
                    tx.set(&address, data(json!({"name": "Sword"}))).await?;
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::Aborted);
        assert_eq!(store.document(&address).unwrap()["name"], json!("Axe"));
    }
}
