//! Subscription manager.
//!
//! Identical watches (same address, same constraint list) share one adapter-level listener. Its
//! events are funnelled through a per-listener channel into a pump task that folds them into the
//! offline cache and fans the resulting view out to every local subscriber. Callbacks run inside a
//! process-wide dispatch gate, which is what lets [`SubscriptionHandle::cancel`] promise that no
//! callback fires once it has returned.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_channel::{Receiver, Sender};

use crate::platform::runtime::spawn_detached;
use crate::sync::adapter::{CancelFn, RuntimeAdapter, WatchEvent, WatchSink};
use crate::sync::cache::{CacheObserver, OfflineCache};
use crate::sync::error::{unavailable, SyncError, SyncResult};
use crate::sync::model::{Address, DocumentData, Snapshot, WatchTarget};
use crate::sync::translate::validate_query;

/// What a subscriber receives: one document for document watches, the result list for queries.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchPayload {
    Document(Snapshot),
    Query(Vec<Snapshot>),
}

impl WatchPayload {
    pub fn as_document(&self) -> Option<&Snapshot> {
        match self {
            WatchPayload::Document(snapshot) => Some(snapshot),
            WatchPayload::Query(_) => None,
        }
    }

    pub fn as_query(&self) -> Option<&[Snapshot]> {
        match self {
            WatchPayload::Document(_) => None,
            WatchPayload::Query(snapshots) => Some(snapshots),
        }
    }
}

pub type ChangeCallback = Arc<dyn Fn(WatchPayload) + Send + Sync + 'static>;
pub type ErrorCallback = Arc<dyn Fn(SyncError) + Send + Sync + 'static>;

static DISPATCH_GATE: Mutex<()> = Mutex::new(());

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

struct DispatchGuard;

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|flag| flag.set(false));
    }
}

/// Runs `deliver` while holding the dispatch gate. Nested calls on the same thread run directly.
fn dispatch(deliver: impl FnOnce()) {
    if DISPATCHING.with(Cell::get) {
        deliver();
        return;
    }
    let _gate = DISPATCH_GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    DISPATCHING.with(|flag| flag.set(true));
    let _guard = DispatchGuard;
    deliver();
}

/// Waits until no callback is running on another thread. Returns immediately when called from
/// inside a callback.
fn quiesce() {
    if DISPATCHING.with(Cell::get) {
        return;
    }
    drop(DISPATCH_GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
}

struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    primed: AtomicBool,
    on_change: ChangeCallback,
    on_error: ErrorCallback,
}

impl Subscriber {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

enum ListenerEvent {
    Remote(WatchEvent),
    LocalChange,
    Rejected(SyncError),
    Replay,
}

type SubscriberList = Arc<Mutex<Vec<Arc<Subscriber>>>>;

fn lock_list(list: &SubscriberList) -> MutexGuard<'_, Vec<Arc<Subscriber>>> {
    list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SharedListener {
    generation: u64,
    target: WatchTarget,
    events: Sender<ListenerEvent>,
    subscribers: SubscriberList,
    adapter_cancel: Option<CancelFn>,
}

#[derive(Default)]
struct ManagerState {
    listeners: HashMap<String, SharedListener>,
    subscriptions: HashMap<u64, String>,
    next_id: u64,
    next_generation: u64,
    terminated: bool,
}

pub struct SubscriptionManager {
    adapter: Arc<dyn RuntimeAdapter>,
    cache: Arc<OfflineCache>,
    state: Mutex<ManagerState>,
    this: Weak<SubscriptionManager>,
}

/// Handle returned by `watch`. Cloning shares the subscription; dropping does not cancel it.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: u64,
    active: Arc<AtomicBool>,
    manager: Weak<SubscriptionManager>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops delivery. Once this returns no callback of this subscription runs again, unless
    /// called from inside one of them (that callback finishes). Calling it again does nothing.
    pub fn cancel(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self.id);
        }
        quiesce();
    }
}

impl SubscriptionManager {
    pub fn new(adapter: Arc<dyn RuntimeAdapter>, cache: Arc<OfflineCache>) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this| Self {
            adapter,
            cache: Arc::clone(&cache),
            state: Mutex::new(ManagerState::default()),
            this: this.clone(),
        });
        let observer: Weak<SubscriptionManager> = Arc::downgrade(&manager);
        let observer: Weak<dyn CacheObserver> = observer;
        cache.set_observer(observer);
        manager
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a subscriber. The first payload arrives asynchronously, never from inside this
    /// call.
    pub fn subscribe(
        &self,
        target: WatchTarget,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> SyncResult<SubscriptionHandle> {
        if let WatchTarget::Query {
            collection,
            constraints,
        } = &target
        {
            validate_query(collection, constraints)?;
        }
        let key = target.canonical_key()?;
        let active = Arc::new(AtomicBool::new(true));

        let mut state = self.state();
        if state.terminated {
            return Err(unavailable("The sync service has been terminated"));
        }
        state.next_id += 1;
        let id = state.next_id;
        let subscriber = Arc::new(Subscriber {
            id,
            active: Arc::clone(&active),
            primed: AtomicBool::new(false),
            on_change,
            on_error,
        });
        state.subscriptions.insert(id, key.clone());

        if let Some(listener) = state.listeners.get(&key) {
            lock_list(&listener.subscribers).push(subscriber);
            let _ = listener.events.try_send(ListenerEvent::Replay);
            log::debug!("joined existing listener {key} (subscription {id})");
            return Ok(self.handle(id, active));
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let (events, receiver) = async_channel::unbounded();
        let subscribers: SubscriberList = Arc::new(Mutex::new(vec![subscriber]));
        state.listeners.insert(
            key.clone(),
            SharedListener {
                generation,
                target: target.clone(),
                events: events.clone(),
                subscribers: Arc::clone(&subscribers),
                adapter_cancel: None,
            },
        );
        drop(state);

        if let WatchTarget::Document(address) = &target {
            self.cache.retain(address);
            if self.cache.lookup(address).is_some() {
                let _ = events.try_send(ListenerEvent::Replay);
            }
        }
        spawn_detached(pump(Arc::clone(&self.cache), target.clone(), receiver, subscribers));

        let sink_events = events.clone();
        let sink: WatchSink = Arc::new(move |event| {
            let _ = sink_events.try_send(ListenerEvent::Remote(event));
        });
        match self.adapter.watch(&target, sink) {
            Ok(cancel) => {
                let mut state = self.state();
                match state.listeners.get_mut(&key) {
                    Some(listener) if listener.generation == generation => {
                        listener.adapter_cancel = Some(cancel);
                        drop(state);
                    }
                    _ => {
                        // Every subscriber left while the adapter was registering.
                        drop(state);
                        cancel();
                    }
                }
                log::debug!(
                    "{} adapter listener started for {key} (subscription {id})",
                    self.adapter.name()
                );
                Ok(self.handle(id, active))
            }
            Err(err) => {
                self.abandon(&key, generation, id, &err);
                active.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn handle(&self, id: u64, active: Arc<AtomicBool>) -> SubscriptionHandle {
        SubscriptionHandle {
            id,
            active,
            manager: self.this.clone(),
        }
    }

    /// The adapter refused the listener: drops it and tells any subscriber that joined meanwhile.
    fn abandon(&self, key: &str, generation: u64, id: u64, err: &SyncError) {
        let removed = {
            let mut state = self.state();
            state.subscriptions.remove(&id);
            let matches = state
                .listeners
                .get(key)
                .is_some_and(|listener| listener.generation == generation);
            if !matches {
                return;
            }
            let listener = state.listeners.remove(key);
            if let Some(listener) = &listener {
                for subscriber in lock_list(&listener.subscribers).iter() {
                    state.subscriptions.remove(&subscriber.id);
                }
            }
            listener
        };
        let Some(listener) = removed else {
            return;
        };
        listener.events.close();
        if let WatchTarget::Document(address) = &listener.target {
            self.cache.release(address);
        }
        let others: Vec<Arc<Subscriber>> = lock_list(&listener.subscribers)
            .iter()
            .filter(|subscriber| subscriber.id != id)
            .cloned()
            .collect();
        dispatch(|| {
            for subscriber in others {
                if subscriber.active.swap(false, Ordering::SeqCst) {
                    (subscriber.on_error)(err.clone());
                }
            }
        });
    }

    /// Detaches subscription `id`; the adapter listener goes away with its last subscriber.
    fn remove(&self, id: u64) {
        let teardown = {
            let mut state = self.state();
            let Some(key) = state.subscriptions.remove(&id) else {
                return;
            };
            let remaining = match state.listeners.get(&key) {
                Some(listener) => {
                    let mut subscribers = lock_list(&listener.subscribers);
                    subscribers.retain(|subscriber| subscriber.id != id);
                    subscribers.len()
                }
                None => return,
            };
            if remaining > 0 {
                None
            } else {
                state.listeners.remove(&key).map(|listener| (key, listener))
            }
        };
        if let Some((key, listener)) = teardown {
            self.teardown(&key, listener);
        }
    }

    fn teardown(&self, key: &str, mut listener: SharedListener) {
        listener.events.close();
        if let Some(cancel) = listener.adapter_cancel.take() {
            cancel();
        }
        if let WatchTarget::Document(address) = &listener.target {
            self.cache.release(address);
        }
        log::debug!("{} adapter listener for {key} stopped", self.adapter.name());
    }

    /// Cancels every subscription and refuses new ones.
    pub fn terminate(&self) {
        let listeners: Vec<(String, SharedListener)> = {
            let mut state = self.state();
            state.terminated = true;
            state.subscriptions.clear();
            state.listeners.drain().collect()
        };
        for (key, listener) in listeners {
            for subscriber in lock_list(&listener.subscribers).iter() {
                subscriber.active.store(false, Ordering::SeqCst);
            }
            self.teardown(&key, listener);
        }
        quiesce();
    }

    /// Number of adapter-level listeners currently open.
    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions.len()
    }

    fn broadcast(&self, address: &Address, event: impl Fn() -> ListenerEvent) {
        let state = self.state();
        for listener in state.listeners.values() {
            if listener.target.covers(address) {
                let _ = listener.events.try_send(event());
            }
        }
    }
}

impl CacheObserver for SubscriptionManager {
    fn entry_changed(&self, address: &Address) {
        self.broadcast(address, || ListenerEvent::LocalChange);
    }

    fn write_rejected(&self, address: &Address, error: &SyncError) {
        self.broadcast(address, || ListenerEvent::Rejected(error.clone()));
    }
}

type Fingerprint = Vec<(String, Option<DocumentData>, bool, bool)>;

fn fingerprint(payload: &WatchPayload) -> Fingerprint {
    let entry = |snapshot: &Snapshot| {
        (
            snapshot.address().path(),
            snapshot.data().cloned(),
            snapshot.has_pending_writes(),
            snapshot.from_cache(),
        )
    };
    match payload {
        WatchPayload::Document(snapshot) => vec![entry(snapshot)],
        WatchPayload::Query(snapshots) => snapshots.iter().map(entry).collect(),
    }
}

struct PumpState {
    cache: Arc<OfflineCache>,
    target: WatchTarget,
    subscribers: SubscriberList,
    remote_results: Option<Vec<Snapshot>>,
    last: Option<Fingerprint>,
}

impl PumpState {
    fn current_view(&self) -> Option<WatchPayload> {
        match &self.target {
            WatchTarget::Document(address) => self.cache.lookup(address).map(WatchPayload::Document),
            WatchTarget::Query {
                collection,
                constraints,
            } => self
                .remote_results
                .as_ref()
                .map(|remote| WatchPayload::Query(self.cache.overlay_query(collection, constraints, remote))),
        }
    }

    fn handle(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Remote(WatchEvent::Document(snapshot)) => {
                self.cache.apply_remote(snapshot.clone());
                let payload = self
                    .current_view()
                    .unwrap_or(WatchPayload::Document(snapshot));
                self.publish(payload);
            }
            ListenerEvent::Remote(WatchEvent::Query(snapshots)) => {
                self.cache.apply_remote_batch(snapshots.clone());
                self.remote_results = Some(snapshots);
                if let Some(payload) = self.current_view() {
                    self.publish(payload);
                }
            }
            ListenerEvent::Remote(WatchEvent::Error(err)) => {
                log::warn!("listener for {} failed: {err}", self.target.address());
                self.fail(err);
            }
            ListenerEvent::Rejected(err) => {
                if let Some(payload) = self.current_view() {
                    self.publish(payload);
                }
                self.fail(err);
            }
            ListenerEvent::LocalChange | ListenerEvent::Replay => {
                if let Some(payload) = self.current_view() {
                    self.publish(payload);
                }
            }
        }
    }

    /// Delivers `payload` to everyone when it differs from the last delivery, otherwise only to
    /// subscribers that have not seen anything yet.
    fn publish(&mut self, payload: WatchPayload) {
        let print = fingerprint(&payload);
        let changed = self.last.as_ref() != Some(&print);
        self.last = Some(print);
        let subscribers: Vec<Arc<Subscriber>> = lock_list(&self.subscribers).clone();
        dispatch(|| {
            for subscriber in subscribers {
                let first = !subscriber.primed.load(Ordering::SeqCst);
                if !(changed || first) || !subscriber.is_active() {
                    continue;
                }
                subscriber.primed.store(true, Ordering::SeqCst);
                (subscriber.on_change)(payload.clone());
            }
        });
    }

    fn fail(&self, err: SyncError) {
        let subscribers: Vec<Arc<Subscriber>> = lock_list(&self.subscribers).clone();
        dispatch(|| {
            for subscriber in subscribers {
                if subscriber.is_active() {
                    (subscriber.on_error)(err.clone());
                }
            }
        });
    }
}

async fn pump(
    cache: Arc<OfflineCache>,
    target: WatchTarget,
    receiver: Receiver<ListenerEvent>,
    subscribers: SubscriberList,
) {
    let mut state = PumpState {
        cache,
        target,
        subscribers,
        remote_results: None,
        last: None,
    };
    while let Ok(event) = receiver.recv().await {
        state.handle(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::adapter::NativeAdapter;
    use crate::sync::backend::{MemoryNativeClient, MemoryStore};
    use crate::sync::model::Constraint;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (MemoryStore, Arc<OfflineCache>, Arc<SubscriptionManager>) {
        let store = MemoryStore::new();
        let adapter: Arc<dyn RuntimeAdapter> = Arc::new(NativeAdapter::new(MemoryNativeClient::new(store.clone())));
        let cache = Arc::new(OfflineCache::new(Duration::from_secs(60), None));
        let manager = SubscriptionManager::new(adapter, Arc::clone(&cache));
        (store, cache, manager)
    }

    fn recorder() -> (Arc<Mutex<Vec<WatchPayload>>>, ChangeCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |payload| sink.lock().unwrap().push(payload)))
    }

    fn address_of(path: &str) -> Address {
        Address::parse(path).unwrap()
    }

    fn ignore_errors() -> ErrorCallback {
        Arc::new(|_| {})
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn identical_watches_share_one_listener() {
        let (store, _cache, manager) = setup();
        let target = WatchTarget::query(
            Address::parse("props").unwrap(),
            vec![Constraint::equals("show", "s1")],
        )
        .unwrap();
        let (first_seen, first) = recorder();
        let (second_seen, second) = recorder();
        let a = manager.subscribe(target.clone(), first, ignore_errors()).unwrap();
        let b = manager.subscribe(target, second, ignore_errors()).unwrap();

        assert_eq!(store.listen_registrations(), 1);
        assert_eq!(manager.listener_count(), 1);
        wait_for(|| !first_seen.lock().unwrap().is_empty() && !second_seen.lock().unwrap().is_empty()).await;

        a.cancel();
        assert_eq!(store.listen_removals(), 0);
        b.cancel();
        b.cancel();
        assert_eq!(store.listen_removals(), 1);
        assert_eq!(manager.listener_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_documents_arrive_as_empty_snapshots() {
        let (_store, _cache, manager) = setup();
        let (seen, on_change) = recorder();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let error_sink = Arc::clone(&errors);
        let handle = manager
            .subscribe(
                WatchTarget::document(Address::parse("shows/s1").unwrap()).unwrap(),
                on_change,
                Arc::new(move |err| error_sink.lock().unwrap().push(err)),
            )
            .unwrap();
        wait_for(|| !seen.lock().unwrap().is_empty()).await;
        let first = seen.lock().unwrap()[0].clone();
        let snapshot = first.as_document().unwrap();
        assert!(!snapshot.exists());
        assert!(snapshot.data().is_none());
        assert!(errors.lock().unwrap().is_empty());
        handle.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nothing_is_delivered_after_cancel_returns() {
        let (store, _cache, manager) = setup();
        let address = Address::parse("props/p1").unwrap();
        let (seen, on_change) = recorder();
        let handle = manager
            .subscribe(WatchTarget::document(address.clone()).unwrap(), on_change, ignore_errors())
            .unwrap();
        wait_for(|| !seen.lock().unwrap().is_empty()).await;
        handle.cancel();
        let delivered = seen.lock().unwrap().len();
        store
            .external_write(&address, json!({"name": "Sword"}).as_object().cloned().unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), delivered);
        assert!(!handle.is_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn callbacks_may_cancel_their_own_subscription() {
        let (store, _cache, manager) = setup();
        let address = Address::parse("props/p1").unwrap();
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(Mutex::new(0));
        let (inner_slot, inner_calls) = (Arc::clone(&slot), Arc::clone(&calls));
        let handle = manager
            .subscribe(
                WatchTarget::document(address).unwrap(),
                Arc::new(move |_| {
                    *inner_calls.lock().unwrap() += 1;
                    if let Some(handle) = inner_slot.lock().unwrap().as_ref() {
                        handle.cancel();
                    }
                }),
                ignore_errors(),
            )
            .unwrap();
        *slot.lock().unwrap() = Some(handle.clone());
        // Either the initial event or this change reaches the callback after the slot is filled.
        store
            .external_write(&address_of("props/p1"), json!({"name": "Sword"}).as_object().cloned().unwrap())
            .unwrap();
        wait_for(|| !handle.is_active()).await;
        assert!(*calls.lock().unwrap() >= 1);
        assert_eq!(store.listen_removals(), 1);
        handle.cancel();
        assert_eq!(store.listen_removals(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listener_errors_reach_every_subscriber() {
        let (store, _cache, manager) = setup();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let (_seen, on_change) = recorder();
        let _handle = manager
            .subscribe(
                WatchTarget::from_address(Address::parse("props").unwrap()),
                on_change,
                Arc::new(move |err: SyncError| sink.lock().unwrap().push(err.code_str())),
            )
            .unwrap();
        store.break_listeners(unavailable("connection lost"));
        wait_for(|| !errors.lock().unwrap().is_empty()).await;
        assert_eq!(errors.lock().unwrap()[0], "sync/unavailable");
    }

    #[tokio::test]
    async fn terminated_manager_refuses_new_watches() {
        let (_store, _cache, manager) = setup();
        manager.terminate();
        let (_seen, on_change) = recorder();
        let err = manager
            .subscribe(
                WatchTarget::from_address(Address::parse("props").unwrap()),
                on_change,
                ignore_errors(),
            )
            .unwrap_err();
        assert_eq!(err.code_str(), "sync/unavailable");
    }

    #[tokio::test]
    async fn untranslatable_queries_are_rejected_up_front() {
        let (store, _cache, manager) = setup();
        let (_seen, on_change) = recorder();
        let target = WatchTarget::query(
            Address::parse("props").unwrap(),
            vec![
                Constraint::greater_than("weight", 1),
                Constraint::less_than("price", 10),
            ],
        )
        .unwrap();
        let err = manager.subscribe(target, on_change, ignore_errors()).unwrap_err();
        assert_eq!(err.code_str(), "sync/invalid-argument");
        assert_eq!(store.listen_registrations(), 0);
        assert_eq!(manager.subscription_count(), 0);
    }
}
