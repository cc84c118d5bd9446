// Lease lifecycle: acquire, background renewal, loss detection, release.

use crate::config::LeaseConfig;
use crate::errors::{CoordinationError, StoreError};
use crate::store::{LeaseStore, LeaseToken, RenewOutcome, WriteOutcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Exclusive, auto-renewing ownership of one coordination target.
///
/// An acquisition attempt always yields a handle: if someone else holds the
/// lease, the handle simply reports `has_lease() == false`. A successful
/// attempt owns the lease and its renewal task until `release` is called.
pub struct LeaseHandle {
    store: Arc<dyn LeaseStore>,
    target: String,
    held: Option<HeldLease>,
}

struct HeldLease {
    token: LeaseToken,
    lost: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    renewal: JoinHandle<()>,
}

impl LeaseHandle {
    /// Attempt to acquire the lease on `target`, creating the target first
    /// if it does not exist yet.
    ///
    /// Contention is not an error; transient store failures are.
    #[instrument(skip(store, config), fields(lease_target = %target))]
    pub async fn acquire(
        store: Arc<dyn LeaseStore>,
        target: &str,
        config: &LeaseConfig,
    ) -> Result<Self, StoreError> {
        store.create_if_absent(target).await?;

        let token = match store.acquire_lease(target, config.duration).await? {
            Some(token) => token,
            None => {
                debug!("Lease already held by another fleet member");
                return Ok(Self {
                    store,
                    target: target.to_string(),
                    held: None,
                });
            }
        };

        info!(token = %token, "Lease acquired, starting renewal task");

        let lost = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        // Anchor the renewal cadence at acquisition time, before the task
        // is first polled, so paused-clock tests observe the same schedule
        // as real time.
        let mut ticker = interval_at(
            Instant::now() + config.renew_interval,
            config.renew_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let renewal = tokio::spawn(renewal_loop(
            store.clone(),
            target.to_string(),
            token.clone(),
            ticker,
            lost.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            store,
            target: target.to_string(),
            held: Some(HeldLease {
                token,
                lost,
                shutdown_tx,
                renewal,
            }),
        })
    }

    /// Whether this handle currently owns a lease it believes to be valid.
    /// Turns false after a rejected renewal or after `release`.
    pub fn has_lease(&self) -> bool {
        self.held
            .as_ref()
            .map(|held| !held.lost.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Read the target's metadata map.
    pub async fn read_metadata(&self) -> Result<HashMap<String, String>, StoreError> {
        self.store.read_metadata(&self.target).await
    }

    /// Merge `entries` into the target's metadata, conditioned on the held
    /// token. Refused locally once the lease is lost or released; a stale
    /// token detected by the store also marks the lease lost.
    pub async fn write_metadata(
        &self,
        entries: HashMap<String, String>,
    ) -> Result<(), CoordinationError> {
        let Some(held) = self.held.as_ref() else {
            return Err(CoordinationError::LeaseLost {
                target: self.target.clone(),
            });
        };
        if held.lost.load(Ordering::SeqCst) {
            return Err(CoordinationError::LeaseLost {
                target: self.target.clone(),
            });
        }

        match self
            .store
            .write_metadata(&self.target, entries, &held.token)
            .await?
        {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::Conflict => {
                warn!(lease_target = %self.target, "Conditional write rejected, lease is stale");
                held.lost.store(true, Ordering::SeqCst);
                Err(CoordinationError::LeaseLost {
                    target: self.target.clone(),
                })
            }
        }
    }

    /// Hand the lease back. Idempotent.
    ///
    /// The renewal task is stopped and joined first, so no renewal carrying
    /// this token can be issued after `release` returns; a late renewal
    /// could resurrect a lease the store has already granted to someone
    /// else. Store failures during teardown are logged, not propagated.
    #[instrument(skip(self), fields(lease_target = %self.target))]
    pub async fn release(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };

        let _ = held.shutdown_tx.send(());
        if let Err(e) = held.renewal.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Renewal task panicked");
            }
        }

        if held.lost.load(Ordering::SeqCst) {
            debug!("Lease already lost, skipping release call");
            return;
        }

        match self.store.release_lease(&self.target, &held.token).await {
            Ok(()) => info!("Lease released"),
            Err(e) => warn!(error = %e, "Failed to release lease during teardown"),
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        // No finalizer-style release: callers release explicitly on every
        // exit path. A handle dropped while held stops renewing and lets
        // the lease lapse server-side.
        if let Some(held) = self.held.take() {
            held.renewal.abort();
            warn!(
                lease_target = %self.target,
                "Lease handle dropped without release; lease will lapse on its own"
            );
        }
    }
}

async fn renewal_loop(
    store: Arc<dyn LeaseStore>,
    target: String,
    token: LeaseToken,
    mut ticker: tokio::time::Interval,
    lost: Arc<AtomicBool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(lease_target = %target, "Renewal task stopped");
                return;
            }
            _ = ticker.tick() => {
                match store.renew_lease(&target, &token).await {
                    Ok(RenewOutcome::Renewed) => {
                        debug!(lease_target = %target, "Lease renewed");
                    }
                    Ok(RenewOutcome::Rejected) => {
                        // The grant lapsed or went to someone else. Writes
                        // through the handle must now fail fast.
                        warn!(lease_target = %target, "Lease renewal rejected, marking lease lost");
                        lost.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        // The lease may still be valid server-side; keep
                        // trying until the store answers or shutdown.
                        warn!(lease_target = %target, error = %e, "Transient failure renewing lease");
                    }
                }
            }
        }
    }
}
