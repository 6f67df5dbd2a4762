//! Service façade.
//!
//! [`SyncService`] is the one type feature code talks to. It is built once per process around
//! whichever [`RuntimeAdapter`] the deployment chose and handed to consumers explicitly; clones are
//! cheap and share everything.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::platform::runtime::{sleep, with_deadline};
use crate::sync::adapter::{Precondition, RuntimeAdapter};
use crate::sync::cache::pipeline::WritePipeline;
use crate::sync::cache::{CacheEntry, CachePersistence, OfflineCache};
use crate::sync::error::{invalid_argument, SyncError, SyncErrorKind, SyncResult};
use crate::sync::model::{Constraint, DocumentData, IntoAddress, Snapshot, SnapshotMetadata, WatchTarget, WriteOp};
use crate::sync::settings::SyncSettings;
use crate::sync::subscription::{SubscriptionHandle, SubscriptionManager, WatchPayload};
use crate::sync::transaction::{Transaction, TransactionCoordinator, TransactionOptions};
use crate::sync::translate::validate_query;
use crate::sync::upload::{BlobUploader, UploadProgress};
use crate::util::calculate_backoff;

/// Identity of the signed-in user, supplied by the authentication collaborator. The layer only
/// carries it; consumers use it to scope addresses or evaluate quotas.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Principal(Arc<str>);

impl Principal {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Principal(..)")
    }
}

struct ServiceInner {
    adapter: Arc<dyn RuntimeAdapter>,
    settings: SyncSettings,
    cache: Arc<OfflineCache>,
    pipeline: WritePipeline,
    subscriptions: Arc<SubscriptionManager>,
    transactions: TransactionCoordinator,
    uploader: BlobUploader,
    principal: Option<Principal>,
}

#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
    deadline: Option<Duration>,
}

impl fmt::Debug for SyncService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncService")
            .field("adapter", &self.inner.adapter.name())
            .field("deadline", &self.deadline())
            .finish()
    }
}

pub struct SyncServiceBuilder {
    adapter: Arc<dyn RuntimeAdapter>,
    settings: SyncSettings,
    persistence: Option<Arc<dyn CachePersistence>>,
    principal: Option<Principal>,
}

impl SyncServiceBuilder {
    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Persists the offline cache through `persistence` and restores it on build.
    pub fn persistence(mut self, persistence: Arc<dyn CachePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Validates the settings, restores persisted state and starts the write pipeline. Writes
    /// that were still unacknowledged when the state was saved are sent again.
    pub fn build(self) -> SyncResult<SyncService> {
        let SyncServiceBuilder {
            adapter,
            settings,
            persistence,
            principal,
        } = self;
        settings.validate()?;

        let cache = Arc::new(OfflineCache::new(settings.cache_grace_period, persistence.clone()));
        let restored = match persistence.as_ref().map(|persistence| persistence.load()) {
            Some(Ok(Some(state))) => cache.restore(state),
            Some(Ok(None)) | None => Vec::new(),
            Some(Err(err)) => {
                log::warn!("ignoring unreadable offline cache: {err}");
                Vec::new()
            }
        };

        let pipeline = WritePipeline::start(Arc::clone(&adapter), Arc::clone(&cache));
        let subscriptions = SubscriptionManager::new(Arc::clone(&adapter), Arc::clone(&cache));
        if !restored.is_empty() {
            log::debug!("re-sending {} restored write batches", restored.len());
            pipeline.requeue(restored);
        }
        let transactions = TransactionCoordinator::new(Arc::clone(&adapter), Arc::clone(&cache));
        let uploader = BlobUploader::new(Arc::clone(&adapter), &settings);
        log::debug!("sync service started on the {} adapter", adapter.name());

        Ok(SyncService {
            inner: Arc::new(ServiceInner {
                adapter,
                settings,
                cache,
                pipeline,
                subscriptions,
                transactions,
                uploader,
                principal,
            }),
            deadline: None,
        })
    }
}

impl SyncService {
    pub fn new(adapter: Arc<dyn RuntimeAdapter>, settings: SyncSettings) -> SyncResult<Self> {
        Self::builder(adapter).settings(settings).build()
    }

    pub fn builder(adapter: Arc<dyn RuntimeAdapter>) -> SyncServiceBuilder {
        SyncServiceBuilder {
            adapter,
            settings: SyncSettings::default(),
            persistence: None,
            principal: None,
        }
    }

    /// Returns a view of this service whose asynchronous operations fail with `Cancelled` after
    /// `deadline`.
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            deadline: Some(deadline),
        }
    }

    fn deadline(&self) -> Option<Duration> {
        self.deadline.or(self.inner.settings.default_deadline)
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.inner.principal.as_ref()
    }

    pub fn adapter_name(&self) -> &'static str {
        self.inner.adapter.name()
    }

    /// Reads one document. Local writes that are still pending are visible immediately; when the
    /// store stays unreachable the last cached state is returned, marked as from cache.
    pub async fn get(&self, address: impl IntoAddress) -> SyncResult<Snapshot> {
        let address = address.into_address()?;
        if !address.is_document() {
            return Err(invalid_argument(format!(
                "get needs a document address, got collection {address}; use list"
            )));
        }
        with_deadline(self.deadline(), async {
            if self.inner.cache.entry(&address).is_dirty() {
                if let Some(view) = self.inner.cache.known_view(&address) {
                    return Ok(view);
                }
            }
            let adapter = &self.inner.adapter;
            let target = &address;
            match self.read_with_retry(move || adapter.read_once(target)).await {
                Ok(snapshot) => {
                    self.inner.cache.apply_remote(snapshot.clone());
                    Ok(self.inner.cache.lookup(&address).unwrap_or(snapshot))
                }
                Err(err) if err.kind == SyncErrorKind::Unavailable => match self.inner.cache.known_view(&address) {
                    Some(mut cached) => {
                        log::warn!("serving {address} from cache: {err}");
                        let pending = cached.has_pending_writes();
                        cached.set_metadata(SnapshotMetadata::new(true, pending));
                        Ok(cached)
                    }
                    None => Err(err),
                },
                Err(err) => Err(err),
            }
        })
        .await
    }

    /// Runs a query. Results reflect pending local writes; when the store stays unreachable the
    /// query is answered from cached documents.
    pub async fn list(&self, collection: impl IntoAddress, constraints: Vec<Constraint>) -> SyncResult<Vec<Snapshot>> {
        let collection = collection.into_address()?;
        validate_query(&collection, &constraints)?;
        with_deadline(self.deadline(), async {
            let adapter = &self.inner.adapter;
            let (target, filters) = (&collection, constraints.as_slice());
            match self.read_with_retry(move || adapter.read_many(target, filters)).await {
                Ok(remote) => {
                    self.inner.cache.apply_remote_batch(remote.clone());
                    Ok(self.inner.cache.overlay_query(&collection, &constraints, &remote))
                }
                Err(err) if err.kind == SyncErrorKind::Unavailable => {
                    log::warn!("answering query on {collection} from cache: {err}");
                    Ok(self.inner.cache.cached_query(&collection, &constraints))
                }
                Err(err) => Err(err),
            }
        })
        .await
    }

    async fn read_with_retry<T, F, Fut>(&self, mut read: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let settings = &self.inner.settings;
        let mut attempt = 0;
        loop {
            match read().await {
                Err(err) if err.kind == SyncErrorKind::Unavailable && attempt < settings.read_retry_attempts => {
                    let delay = calculate_backoff(attempt, &settings.read_backoff);
                    attempt += 1;
                    log::debug!(
                        "read failed ({err}); retry {attempt} of {} in {} ms",
                        settings.read_retry_attempts,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Watches a document or query. The first payload arrives asynchronously, possibly served
    /// from cache; updates follow until the handle is cancelled.
    pub fn watch<C, E>(&self, target: WatchTarget, on_change: C, on_error: E) -> SyncResult<SubscriptionHandle>
    where
        C: Fn(WatchPayload) + Send + Sync + 'static,
        E: Fn(SyncError) + Send + Sync + 'static,
    {
        self.inner
            .subscriptions
            .subscribe(target, Arc::new(on_change), Arc::new(on_error))
    }

    pub fn watch_document<C, E>(&self, address: impl IntoAddress, on_change: C, on_error: E) -> SyncResult<SubscriptionHandle>
    where
        C: Fn(Snapshot) + Send + Sync + 'static,
        E: Fn(SyncError) + Send + Sync + 'static,
    {
        let target = WatchTarget::document(address.into_address()?)?;
        self.watch(
            target,
            move |payload| {
                if let WatchPayload::Document(snapshot) = payload {
                    on_change(snapshot);
                }
            },
            on_error,
        )
    }

    pub fn watch_query<C, E>(
        &self,
        collection: impl IntoAddress,
        constraints: Vec<Constraint>,
        on_change: C,
        on_error: E,
    ) -> SyncResult<SubscriptionHandle>
    where
        C: Fn(Vec<Snapshot>) + Send + Sync + 'static,
        E: Fn(SyncError) + Send + Sync + 'static,
    {
        let target = WatchTarget::query(collection.into_address()?, constraints)?;
        self.watch(
            target,
            move |payload| {
                if let WatchPayload::Query(snapshots) = payload {
                    on_change(snapshots);
                }
            },
            on_error,
        )
    }

    /// Replaces a document. The write is applied to the cache as soon as this is called; the
    /// returned future resolves when the store accepts or rejects it.
    pub fn set(&self, address: impl IntoAddress, data: DocumentData) -> impl Future<Output = SyncResult<()>> + Send + 'static {
        let ops = address.into_address().map(|address| vec![WriteOp::set(address, data)]);
        self.submit(ops, Vec::new())
    }

    /// Merges `partial` into an existing document; keys may be dotted field paths.
    pub fn update(&self, address: impl IntoAddress, partial: DocumentData) -> impl Future<Output = SyncResult<()>> + Send + 'static {
        let ops = address.into_address().map(|address| vec![WriteOp::update(address, partial)]);
        self.submit(ops, Vec::new())
    }

    pub fn delete(&self, address: impl IntoAddress) -> impl Future<Output = SyncResult<()>> + Send + 'static {
        let ops = address.into_address().map(|address| vec![WriteOp::delete(address)]);
        self.submit(ops, Vec::new())
    }

    /// Creates a document, failing with `AlreadyExists` if the store already has one.
    pub fn create(&self, address: impl IntoAddress, data: DocumentData) -> impl Future<Output = SyncResult<()>> + Send + 'static {
        match address.into_address() {
            Ok(address) => {
                let precondition = Precondition::must_not_exist(address.clone());
                self.submit(Ok(vec![WriteOp::set(address, data)]), vec![precondition])
            }
            Err(err) => self.submit(Err(err), Vec::new()),
        }
    }

    /// Applies `ops` all-or-nothing, in order, without re-reading anything.
    pub fn batch(&self, ops: Vec<WriteOp>) -> impl Future<Output = SyncResult<()>> + Send + 'static {
        self.submit(Ok(ops), Vec::new())
    }

    fn submit(
        &self,
        ops: SyncResult<Vec<WriteOp>>,
        preconditions: Vec<Precondition>,
    ) -> impl Future<Output = SyncResult<()>> + Send + 'static {
        let ticket = ops.and_then(|ops| self.inner.pipeline.submit(ops, preconditions));
        let deadline = self.deadline();
        async move { ticket?.wait(deadline).await.map(|_| ()) }
    }

    /// Runs `body` as an optimistic transaction with the configured retry policy.
    pub async fn run_transaction<T, F, Fut>(&self, body: F) -> SyncResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let options = TransactionOptions::from_settings(&self.inner.settings);
        self.run_transaction_with(options, body).await
    }

    pub async fn run_transaction_with<T, F, Fut>(&self, options: TransactionOptions, body: F) -> SyncResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        with_deadline(self.deadline(), self.inner.transactions.run(options, body)).await
    }

    /// Uploads `bytes` to blob storage at `path` and resolves its download URL.
    pub async fn upload<P>(&self, path: &str, bytes: impl Into<Bytes>, on_progress: P) -> SyncResult<String>
    where
        P: FnMut(UploadProgress) + Send,
    {
        self.inner
            .uploader
            .upload(path, bytes.into(), on_progress, self.deadline())
            .await
    }

    /// Copy of the cache entry for `address`, created empty if the cache has none.
    pub fn cache_entry(&self, address: impl IntoAddress) -> SyncResult<CacheEntry> {
        Ok(self.inner.cache.entry(&address.into_address()?))
    }

    /// Number of documents the offline cache currently holds.
    pub fn cached_documents(&self) -> usize {
        self.inner.cache.len()
    }

    /// Evicts idle cache entries whose grace period has elapsed; returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        self.inner.cache.evict_idle()
    }

    /// Number of adapter-level listeners currently open.
    pub fn active_listeners(&self) -> usize {
        self.inner.subscriptions.listener_count()
    }

    /// Cancels every subscription and stops accepting writes. Writes already queued are still
    /// delivered.
    pub fn terminate(&self) {
        self.inner.subscriptions.terminate();
        self.inner.pipeline.close();
        log::debug!("sync service on the {} adapter terminated", self.inner.adapter.name());
    }
}
