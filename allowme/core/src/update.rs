use crate::{
    address::{self, Address, Rejection},
    store::{AllowListStore, Snapshot, StoreError},
};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{net::IpAddr, num::NonZeroU32};
use thiserror::Error;
use tokio::time;
use tracing::{debug, instrument};

/// Ensures addresses are members of a store's allow-list without losing
/// concurrent updates.
#[derive(Debug)]
pub struct Updater<S> {
    store: S,
    policy: RetryPolicy,
    metrics: UpdateMetrics,
}

/// Bounds the read-merge-write loop when writes race.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The total number of write attempts, including the first.
    pub max_attempts: NonZeroU32,

    /// Multiplied by the attempt number to get the delay before the next
    /// attempt. Zero disables the delay.
    pub backoff: time::Duration,
}

#[derive(Clone, Debug, Default)]
pub struct UpdateMetrics {
    conflicts: Counter,
}

/// The result of a successful membership check.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ensured {
    AlreadyPresent,
    Added,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("conflict-retries-exhausted")]
    RetriesExhausted { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The result of admitting a peer to the allow-list.
#[derive(Debug)]
pub enum UpdateOutcome {
    AlreadyPresent(Address),
    Added(Address),
    Rejected(Rejection),
    Failed(Address, UpdateError),
}

// === impl RetryPolicy ===

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: NonZeroU32 = match NonZeroU32::new(5) {
        Some(n) => n,
        None => unreachable!(),
    };
    pub const DEFAULT_BACKOFF: time::Duration = time::Duration::from_millis(50);

    fn delay(&self, attempt: u32) -> time::Duration {
        self.backoff.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff: Self::DEFAULT_BACKOFF,
        }
    }
}

// === impl UpdateMetrics ===

impl UpdateMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let conflicts = Counter::default();
        reg.register(
            "conflicts",
            "Total number of allow-list writes rejected due to a concurrent modification",
            conflicts.clone(),
        );
        Self { conflicts }
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.get()
    }
}

// === impl Updater ===

impl<S: AllowListStore> Updater<S> {
    pub fn new(store: S, policy: RetryPolicy, metrics: UpdateMetrics) -> Self {
        Self {
            store,
            policy,
            metrics,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validates a peer address and, if it is admissible, ensures it is a
    /// member of the allow-list.
    pub async fn admit(&self, peer: IpAddr) -> UpdateOutcome {
        let addr = match address::classify_ip(peer) {
            Ok(addr) => addr,
            Err(rejection) => return UpdateOutcome::Rejected(rejection),
        };

        match self.ensure_member(&addr).await {
            Ok(Ensured::AlreadyPresent) => UpdateOutcome::AlreadyPresent(addr),
            Ok(Ensured::Added) => UpdateOutcome::Added(addr),
            Err(error) => UpdateOutcome::Failed(addr, error),
        }
    }

    /// Adds `addr` to the allow-list unless it is already present.
    ///
    /// Each attempt reads a fresh snapshot and writes it back conditionally on
    /// the snapshot's version, so entries added by concurrent writers are never
    /// overwritten. Attempts that lose a race are retried up to the policy's
    /// bound; all other store errors fail immediately.
    #[instrument(skip_all, fields(%addr))]
    pub async fn ensure_member(&self, addr: &Address) -> Result<Ensured, UpdateError> {
        let max_attempts = self.policy.max_attempts.get();
        for attempt in 1..=max_attempts {
            let Snapshot { list, version } = self.store.fetch().await?;
            if list.contains(addr) {
                debug!(%version, "Already present");
                return Ok(Ensured::AlreadyPresent);
            }

            match self
                .store
                .conditional_replace(list.with_member(addr), &version)
                .await
            {
                Ok(()) => {
                    debug!(%version, attempt, "Added");
                    return Ok(Ensured::Added);
                }
                Err(StoreError::VersionConflict) => {
                    self.metrics.conflicts.inc();
                    debug!(%version, attempt, "Allow-list modified concurrently");
                    let delay = self.policy.delay(attempt);
                    if attempt < max_attempts && !delay.is_zero() {
                        time::sleep(delay).await;
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(UpdateError::RetriesExhausted {
            attempts: max_attempts,
        })
    }
}
