//! Ordered delivery of local writes to the adapter.
//!
//! Batches are forwarded through one FIFO channel to a single writer task, so the store sees them
//! in the order [`OfflineCache::apply_local`] sequenced them. A caller that gives up waiting
//! (deadline) rolls its batch back; if the batch had not reached the adapter yet it is skipped.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;

use crate::platform::runtime::{spawn_detached, with_deadline};
use crate::sync::adapter::{Precondition, RuntimeAdapter};
use crate::sync::error::{cancelled, invalid_argument, unavailable, SyncErrorKind, SyncResult};
use crate::sync::model::{SequencedWrite, Version, WriteOp};

use super::{OfflineCache, PendingBatch};

const QUEUED: u8 = 0;
const IN_FLIGHT: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

struct WriteJob {
    batch: PendingBatch,
    state: AtomicU8,
    reply: Mutex<Option<oneshot::Sender<SyncResult<Version>>>>,
}

impl WriteJob {
    fn new(batch: PendingBatch, reply: Option<oneshot::Sender<SyncResult<Version>>>) -> Arc<Self> {
        Arc::new(Self {
            batch,
            state: AtomicU8::new(QUEUED),
            reply: Mutex::new(reply),
        })
    }

    fn respond(&self, result: SyncResult<Version>) {
        let reply = self
            .reply
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }
}

pub(crate) struct WritePipeline {
    cache: Arc<OfflineCache>,
    sender: Sender<Arc<WriteJob>>,
}

impl WritePipeline {
    pub(crate) fn start(adapter: Arc<dyn RuntimeAdapter>, cache: Arc<OfflineCache>) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        spawn_detached(run_writer(adapter, Arc::clone(&cache), receiver));
        Self { cache, sender }
    }

    /// Applies `ops` to the cache optimistically and queues them for the store. The returned
    /// ticket resolves once the store accepts or rejects the batch.
    pub(crate) fn submit(&self, ops: Vec<WriteOp>, preconditions: Vec<Precondition>) -> SyncResult<WriteTicket> {
        if ops.is_empty() {
            return Err(invalid_argument("A write batch needs at least one operation"));
        }
        for op in &ops {
            op.validate()?;
        }
        let (reply, receiver) = oneshot::channel();
        let mut reply = Some(reply);
        let mut queued = None;
        self.cache.apply_local(ops, preconditions, |batch| {
            let job = WriteJob::new(batch.clone(), reply.take());
            self.sender
                .try_send(Arc::clone(&job))
                .map_err(|_| unavailable("The write pipeline has been shut down"))?;
            queued = Some(job);
            Ok(())
        })?;
        let job = queued.ok_or_else(|| unavailable("The write pipeline has been shut down"))?;
        Ok(WriteTicket {
            job,
            receiver,
            cache: Arc::clone(&self.cache),
        })
    }

    /// Sends batches restored from persistence again, oldest first. Nobody waits on them.
    pub(crate) fn requeue(&self, batches: Vec<PendingBatch>) {
        for batch in batches {
            let writes = batch.writes.clone();
            if self.sender.try_send(WriteJob::new(batch, None)).is_err() {
                self.cache.rollback(&writes, &unavailable("The write pipeline has been shut down"));
            }
        }
    }

    pub(crate) fn close(&self) {
        self.sender.close();
    }
}

/// Pending outcome of a submitted batch.
pub(crate) struct WriteTicket {
    job: Arc<WriteJob>,
    receiver: oneshot::Receiver<SyncResult<Version>>,
    cache: Arc<OfflineCache>,
}

impl WriteTicket {
    #[cfg(test)]
    pub(crate) fn writes(&self) -> &[SequencedWrite] {
        &self.job.batch.writes
    }

    /// Waits for the store's verdict. When `deadline` elapses first the batch is rolled back
    /// locally and `Cancelled` is returned; a commit that still lands later is then treated as a
    /// remote change.
    pub(crate) async fn wait(self, deadline: Option<Duration>) -> SyncResult<Version> {
        let WriteTicket { job, receiver, cache } = self;
        let outcome = with_deadline(deadline, async move { Ok(receiver.await) }).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(cancelled("The write pipeline stopped before the write completed")),
            Err(err) => {
                let previous = job.state.swap(CANCELLED, Ordering::SeqCst);
                if previous != DONE {
                    log::debug!(
                        "write batch {} missed its deadline; rolling back",
                        job.batch.writes.first().map(SequencedWrite::sequence).unwrap_or_default()
                    );
                    cache.rollback(&job.batch.writes, &err);
                }
                Err(err)
            }
        }
    }
}

async fn run_writer(adapter: Arc<dyn RuntimeAdapter>, cache: Arc<OfflineCache>, receiver: Receiver<Arc<WriteJob>>) {
    while let Ok(job) = receiver.recv().await {
        if job
            .state
            .compare_exchange(QUEUED, IN_FLIGHT, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            continue;
        }
        let ops: Vec<WriteOp> = job.batch.writes.iter().map(|write| write.op().clone()).collect();
        let result = if job.batch.preconditions.is_empty() {
            adapter.write(&ops).await
        } else {
            adapter.transact(&job.batch.preconditions, &ops).await
        };
        let previous = job.state.swap(DONE, Ordering::SeqCst);
        match &result {
            Ok(version) => cache.acknowledge(&job.batch.writes, version),
            Err(err) => {
                if err.kind == SyncErrorKind::Unavailable {
                    log::warn!("{} adapter could not deliver a write batch: {err}", adapter.name());
                }
                if previous != CANCELLED {
                    cache.rollback(&job.batch.writes, err);
                }
            }
        }
        job.respond(result);
    }
    log::debug!("write pipeline for {} adapter stopped", adapter.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::adapter::WebAdapter;
    use crate::sync::backend::{MemoryStore, MemoryWebClient};
    use crate::sync::model::{Address, DocumentData};
    use serde_json::json;

    fn data(value: serde_json::Value) -> DocumentData {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (MemoryStore, Arc<OfflineCache>, WritePipeline) {
        let store = MemoryStore::new();
        let adapter: Arc<dyn RuntimeAdapter> = Arc::new(WebAdapter::new(MemoryWebClient::new(store.clone())));
        let cache = Arc::new(OfflineCache::new(Duration::from_secs(60), None));
        let pipeline = WritePipeline::start(adapter, Arc::clone(&cache));
        (store, cache, pipeline)
    }

    #[tokio::test]
    async fn writes_reach_the_store_in_submission_order() {
        let (store, cache, pipeline) = setup();
        let address = Address::parse("props/p1").unwrap();
        let first = pipeline
            .submit(vec![WriteOp::set(address.clone(), data(json!({"name": "Sword"})))], Vec::new())
            .unwrap();
        let second = pipeline
            .submit(vec![WriteOp::set(address.clone(), data(json!({"name": "Shield"})))], Vec::new())
            .unwrap();
        assert!(second.writes()[0].sequence() > first.writes()[0].sequence());
        second.wait(None).await.unwrap();
        first.wait(None).await.unwrap();
        assert_eq!(store.document(&address).unwrap()["name"], json!("Shield"));
        assert!(!cache.is_dirty(&address));
        assert_eq!(store.commit_count(), 2);
    }

    #[tokio::test]
    async fn rejected_writes_roll_back() {
        let (_store, cache, pipeline) = setup();
        let address = Address::parse("props/missing").unwrap();
        let ticket = pipeline
            .submit(vec![WriteOp::update(address.clone(), data(json!({"weight": 3})))], Vec::new())
            .unwrap();
        assert!(cache.lookup(&address).unwrap().has_pending_writes());
        let err = ticket.wait(None).await.unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::NotFound);
        assert!(cache.lookup(&address).is_none());
    }

    #[tokio::test]
    async fn deadline_rolls_back_and_late_commit_is_adopted() {
        let (store, cache, pipeline) = setup();
        let address = Address::parse("props/p1").unwrap();
        store.pause_commits();
        let ticket = pipeline
            .submit(vec![WriteOp::set(address.clone(), data(json!({"name": "Sword"})))], Vec::new())
            .unwrap();
        let err = ticket.wait(Some(Duration::from_millis(20))).await.unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::Cancelled);
        assert!(cache.lookup(&address).is_none());

        store.resume_commits();
        for _ in 0..200 {
            if cache.lookup(&address).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let adopted = cache.lookup(&address).unwrap();
        assert_eq!(adopted.get("name"), Some(&json!("Sword")));
        assert!(!adopted.has_pending_writes());
    }

    #[tokio::test]
    async fn closed_pipeline_refuses_new_writes() {
        let (_store, cache, pipeline) = setup();
        pipeline.close();
        let address = Address::parse("props/p1").unwrap();
        let err = pipeline
            .submit(vec![WriteOp::delete(address.clone())], Vec::new())
            .err()
            .unwrap();
        assert_eq!(err.kind, SyncErrorKind::Unavailable);
        assert!(cache.lookup(&address).is_none());
        assert!(pipeline.submit(Vec::new(), Vec::new()).is_err());
    }
}
