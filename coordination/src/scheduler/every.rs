// Fleet-wide at-most-once-per-interval recurring execution.

use super::LAST_PERFORMED_KEY;
use crate::config::LeaseConfig;
use crate::errors::StoreError;
use crate::lease::LeaseHandle;
use crate::store::LeaseStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

/// Knobs for [`do_every`].
#[derive(Debug, Clone)]
pub struct EveryOptions {
    pub lease: LeaseConfig,
    /// Floor on the gap between ticks, so a fleet of instances does not
    /// hot-poll the shared target.
    pub minimum_spacing: Duration,
}

impl Default for EveryOptions {
    fn default() -> Self {
        Self {
            lease: LeaseConfig::default(),
            minimum_spacing: Duration::from_secs(5),
        }
    }
}

/// Cancellation handle for a recurring schedule.
///
/// Cancellation is cooperative: after [`cancel`](Self::cancel) returns no
/// further tick fires, but an action already in flight finishes normally
/// and its lease is released as usual. Dropping the handle without
/// cancelling also stops the loop at its next tick boundary.
pub struct RecurringTask {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl RecurringTask {
    /// Stop future ticks and wait for the loop to wind down.
    pub async fn cancel(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Recurrence loop panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Schedule `action` to run at most once per `interval` across the fleet.
///
/// The caller is not blocked; the schedule runs in the background until
/// cancelled. Action failures are logged and the recurrence marker is left
/// alone, so the action is retried once the lease frees up, by whichever
/// instance gets there first.
pub fn do_every<F, Fut>(
    store: Arc<dyn LeaseStore>,
    target: &str,
    interval: Duration,
    action: F,
    options: &EveryOptions,
) -> RecurringTask
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(recurrence_loop(
        store,
        target.to_string(),
        interval,
        action,
        options.clone(),
        shutdown_rx,
    ));
    RecurringTask {
        shutdown_tx,
        handle,
    }
}

async fn recurrence_loop<F, Fut>(
    store: Arc<dyn LeaseStore>,
    target: String,
    interval: Duration,
    action: F,
    options: EveryOptions,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    let interval_chrono = ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::MAX);

    loop {
        let mut last_performed = match read_last_performed(store.as_ref(), &target).await {
            Ok(last) => last,
            Err(e) => {
                warn!(lease_target = %target, error = %e, "Failed to read recurrence marker");
                None
            }
        };

        if is_due(last_performed, interval_chrono) {
            if let Some(performed) =
                run_if_still_due(&store, &target, interval_chrono, &action, &options.lease).await
            {
                last_performed = Some(performed);
            }
        } else {
            debug!(lease_target = %target, "Recurring action not due yet");
        }

        let wait = next_wait(last_performed, interval_chrono, options.minimum_spacing);
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(lease_target = %target, "Recurrence loop cancelled");
                return;
            }
            _ = sleep(wait) => {}
        }
    }
}

/// Acquire the lease and, if the marker still says the action is due, run
/// it. Returns the freshest known `lastPerformed` value.
#[instrument(skip(store, action, lease), fields(lease_target = %target))]
async fn run_if_still_due<F, Fut>(
    store: &Arc<dyn LeaseStore>,
    target: &str,
    interval: ChronoDuration,
    action: &F,
    lease: &LeaseConfig,
) -> Option<DateTime<Utc>>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    let mut handle = match LeaseHandle::acquire(store.clone(), target, lease).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "Store failure while acquiring recurrence lease");
            return None;
        }
    };
    if !handle.has_lease() {
        debug!("Recurrence lease contended, another member may be running the action");
        return None;
    }

    // Re-read the marker under the lease; a competitor may have run the
    // action after our unleased read.
    let fresh = match handle.read_metadata().await {
        Ok(metadata) => parse_last_performed(&metadata),
        Err(e) => {
            warn!(error = %e, "Failed to re-read recurrence marker under lease");
            handle.release().await;
            return None;
        }
    };
    if !is_due(fresh, interval) {
        debug!("Another member performed the action recently");
        handle.release().await;
        return fresh;
    }

    info!("Running recurring action under lease");
    match action().await {
        Ok(()) => {
            let performed_at = Utc::now();
            let entries = HashMap::from([(
                LAST_PERFORMED_KEY.to_string(),
                performed_at.to_rfc3339(),
            )]);
            let updated = match handle.write_metadata(entries).await {
                Ok(()) => Some(performed_at),
                Err(e) => {
                    warn!(error = %e, "Failed to advance recurrence marker");
                    fresh
                }
            };
            handle.release().await;
            updated
        }
        Err(e) => {
            // Release even on failure so other instances are not starved;
            // the marker is untouched and the action retries next time the
            // interval is due.
            warn!(error = %e, "Recurring action failed, lease released");
            handle.release().await;
            fresh
        }
    }
}

async fn read_last_performed(
    store: &dyn LeaseStore,
    target: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    if !store.exists(target).await? {
        return Ok(None);
    }
    let metadata = store.read_metadata(target).await?;
    Ok(parse_last_performed(&metadata))
}

fn parse_last_performed(metadata: &HashMap<String, String>) -> Option<DateTime<Utc>> {
    metadata
        .get(LAST_PERFORMED_KEY)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn is_due(last_performed: Option<DateTime<Utc>>, interval: ChronoDuration) -> bool {
    match last_performed.and_then(|last| last.checked_add_signed(interval)) {
        Some(due) => Utc::now() >= due,
        None => last_performed.is_none(),
    }
}

fn next_wait(
    last_performed: Option<DateTime<Utc>>,
    interval: ChronoDuration,
    minimum_spacing: Duration,
) -> Duration {
    let until_due = last_performed
        .and_then(|last| last.checked_add_signed(interval))
        .map(|due| due - Utc::now())
        .and_then(|remaining| remaining.to_std().ok())
        .unwrap_or(Duration::ZERO);
    until_due.max(minimum_spacing)
}
