// Fleet-wide exactly-once execution.

use super::{PROGRESS_DONE, PROGRESS_KEY};
use crate::config::LeaseConfig;
use crate::errors::CoordinationError;
use crate::lease::LeaseHandle;
use crate::store::LeaseStore;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

/// Knobs for [`do_once`].
#[derive(Debug, Clone)]
pub struct OnceOptions {
    pub lease: LeaseConfig,
    /// How long a contended caller waits before checking the marker again.
    pub poll_interval: Duration,
}

impl Default for OnceOptions {
    fn default() -> Self {
        Self {
            lease: LeaseConfig::default(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Run `action` exactly once across the whole fleet.
///
/// Every caller, whenever it calls, returns once the completion marker is
/// observable. If the winning caller's action fails, the marker stays unset
/// and the error surfaces to that caller alone; other fleet members keep
/// polling and one of them retries the action.
#[instrument(skip(store, action, options), fields(lease_target = %target))]
pub async fn do_once<F, Fut>(
    store: Arc<dyn LeaseStore>,
    target: &str,
    action: F,
    options: &OnceOptions,
) -> Result<(), CoordinationError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        if store.exists(target).await? {
            let metadata = store.read_metadata(target).await?;
            if is_done(&metadata) {
                debug!("Action already completed fleet-wide");
                return Ok(());
            }
        }

        let mut handle = LeaseHandle::acquire(store.clone(), target, &options.lease).await?;
        if !handle.has_lease() {
            debug!("Lease contended, polling for completion");
            sleep(options.poll_interval).await;
            continue;
        }

        // Re-check under the lease: another member may have completed the
        // action between our unleased read and this acquisition. Without
        // this the action can run twice.
        let metadata = match handle.read_metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                handle.release().await;
                return Err(e.into());
            }
        };
        if is_done(&metadata) {
            debug!("Another member completed the action before this lease");
            handle.release().await;
            return Ok(());
        }

        info!("Running one-time action under lease");
        if let Err(e) = action().await {
            warn!(error = %e, "One-time action failed, completion marker left unset");
            handle.release().await;
            return Err(CoordinationError::Action(e));
        }

        let marker = HashMap::from([(PROGRESS_KEY.to_string(), PROGRESS_DONE.to_string())]);
        let written = handle.write_metadata(marker).await;
        handle.release().await;
        written?;

        info!("Completion marker written");
        return Ok(());
    }
}

fn is_done(metadata: &HashMap<String, String>) -> bool {
    metadata.get(PROGRESS_KEY).map(String::as_str) == Some(PROGRESS_DONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLeaseStore;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_options() -> OnceOptions {
        OnceOptions {
            lease: LeaseConfig {
                duration: Duration::from_secs(60),
                renew_interval: Duration::from_secs(40),
            },
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_run_action_exactly_once() {
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let callers = (0..8).map(|_| {
            let store = store.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                do_once(
                    store,
                    "bootstrap",
                    move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    &fast_options(),
                )
                .await
            })
        });

        for joined in join_all(callers).await {
            joined.unwrap().unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let metadata = store.read_metadata("bootstrap").await.unwrap();
        assert_eq!(
            metadata.get(PROGRESS_KEY).map(String::as_str),
            Some(PROGRESS_DONE)
        );
    }

    #[tokio::test]
    async fn test_later_callers_observe_marker_without_running() {
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let runs = runs.clone();
            do_once(
                store.clone(),
                "bootstrap",
                move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                &fast_options(),
            )
            .await
            .unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_action_leaves_marker_unset_and_is_retried() {
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());

        let err = do_once(
            store.clone(),
            "bootstrap",
            || async { Err(anyhow::anyhow!("first attempt fails")) },
            &fast_options(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoordinationError::Action(_)));

        let metadata = store.read_metadata("bootstrap").await.unwrap();
        assert!(metadata.get(PROGRESS_KEY).is_none());

        // The failed attempt released the lease, so a second caller can
        // acquire, retry the action, and set the marker.
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        do_once(
            store.clone(),
            "bootstrap",
            move || async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            &fast_options(),
        )
        .await
        .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let metadata = store.read_metadata("bootstrap").await.unwrap();
        assert_eq!(
            metadata.get(PROGRESS_KEY).map(String::as_str),
            Some(PROGRESS_DONE)
        );
    }

    #[tokio::test]
    async fn test_contended_caller_waits_for_winner() {
        let memory = InMemoryLeaseStore::new();
        let store: Arc<dyn LeaseStore> = Arc::new(memory.clone());

        // A competitor holds the lease; the do_once caller must poll
        // instead of erroring, then observe the marker the competitor
        // writes.
        let token = store
            .acquire_lease("bootstrap", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let caller = {
            let store = store.clone();
            tokio::spawn(async move {
                do_once(
                    store,
                    "bootstrap",
                    || async { Err(anyhow::anyhow!("must not run, marker already set")) },
                    &fast_options(),
                )
                .await
            })
        };

        sleep(Duration::from_millis(30)).await;
        let marker = HashMap::from([(PROGRESS_KEY.to_string(), PROGRESS_DONE.to_string())]);
        store
            .write_metadata("bootstrap", marker, &token)
            .await
            .unwrap();
        store.release_lease("bootstrap", &token).await.unwrap();

        caller.await.unwrap().unwrap();
    }
}
