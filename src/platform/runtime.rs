use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::sync::error::{cancelled, SyncResult};

static BACKGROUND_RUNTIME: LazyLock<Option<Runtime>> = LazyLock::new(|| {
    match Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("propstore-sync-background")
        .enable_all()
        .build()
    {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            log::warn!("failed to build background tokio runtime: {err}");
            None
        }
    }
});

/// Spawns `future` in the background.
///
/// Uses the ambient tokio runtime when one is entered and falls back to a lazily built,
/// crate-private worker otherwise, so listener pumps and the write pipeline keep running when the
/// service is driven from synchronous code.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    } else {
        log::warn!("no runtime available; dropping background task");
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

/// Runs `future` under an optional deadline.
///
/// Resolves to a `sync/cancelled` error when the deadline elapses first; `None` waits forever.
pub async fn with_deadline<F, T>(deadline: Option<Duration>, future: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(cancelled(format!(
                "operation exceeded its deadline of {} ms",
                limit.as_millis()
            ))),
        },
        None => future.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::error::SyncErrorKind;

    #[tokio::test]
    async fn deadline_expiry_maps_to_cancelled() {
        let result: SyncResult<()> = with_deadline(Some(Duration::from_millis(10)), async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn no_deadline_passes_result_through() {
        let value = with_deadline(None, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn spawn_detached_runs_without_ambient_runtime() {
        let (sender, receiver) = std::sync::mpsc::channel();
        spawn_detached(async move {
            let _ = sender.send(42);
        });
        let value = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("background task ran");
        assert_eq!(value, 42);
    }
}
