use keel_traits::{DashboardSnapshot, EpochCountdown, SnapshotSource, Tuning};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Clears the in-flight guard on every exit path out of `poll`, error
/// included. A stuck guard would silence polling forever.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct PollerInner {
    source: Arc<dyn SnapshotSource>,
    snapshot: RwLock<Option<DashboardSnapshot>>,
    countdown: Mutex<EpochCountdown>,
    last_error: RwLock<Option<String>>,
    in_flight: AtomicBool,
    polls_completed: AtomicU64,
    tuning: Tuning,
}

/// Periodically gathers the composite network snapshot.
///
/// Three triggers exist: the fixed interval, the one-second countdown
/// tick when it detects staleness, and a manual refresh from the shell.
/// All of them pass the same in-flight guard, so at most one poll body
/// executes at any instant and a constrained transport is never
/// saturated by overlapping cycles.
pub struct DashboardPoller {
    inner: Arc<PollerInner>,
    shutdown_tx: watch::Sender<bool>,
}

impl DashboardPoller {
    pub fn new(source: Arc<dyn SnapshotSource>, tuning: Tuning) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(PollerInner {
                source,
                snapshot: RwLock::new(None),
                countdown: Mutex::new(EpochCountdown::default()),
                last_error: RwLock::new(None),
                in_flight: AtomicBool::new(false),
                polls_completed: AtomicU64::new(0),
                tuning,
            }),
            shutdown_tx,
        }
    }

    pub fn snapshot(&self) -> Option<DashboardSnapshot> {
        self.inner.snapshot.read().clone()
    }

    pub fn countdown(&self) -> EpochCountdown {
        *self.inner.countdown.lock()
    }

    /// Set only while no snapshot exists yet; the shell shows an
    /// explicit first-load error with retry. After the first success,
    /// failures keep the last-known-good snapshot instead.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    pub fn polls_completed(&self) -> u64 {
        self.inner.polls_completed.load(Ordering::Relaxed)
    }

    /// Run one poll cycle unless one is already in flight. Returns
    /// whether the body ran.
    pub async fn poll(&self) -> bool {
        Self::poll_inner(&self.inner).await
    }

    async fn poll_inner(inner: &Arc<PollerInner>) -> bool {
        if inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _guard = InFlightGuard(&inner.in_flight);

        match inner.source.fetch_snapshot().await {
            Ok(snapshot) => {
                // The countdown only trusts a strictly positive server
                // value. A reported 0 can legitimately occur exactly at
                // an epoch boundary; accepting it would pin the display
                // at zero. The stale-tick escape recovers once the new
                // epoch's positive value shows up.
                if let Some(reward) = &snapshot.reward {
                    if reward.remaining_secs > 0 {
                        let mut cd = inner.countdown.lock();
                        cd.remaining_secs = reward.remaining_secs;
                        cd.epoch_duration_secs = reward.epoch_duration_secs;
                        cd.stale_ticks = 0;
                    }
                }
                *inner.snapshot.write() = Some(snapshot);
                *inner.last_error.write() = None;
                inner.polls_completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("poll failed, keeping previous snapshot: {:#}", e);
                if inner.snapshot.read().is_none() {
                    *inner.last_error.write() = Some(e.to_string());
                }
            }
        }
        true
    }

    /// One local countdown tick. Returns whether this tick forced a
    /// refresh outside the fixed schedule.
    pub fn tick_once(&self) -> bool {
        Self::tick_inner(&self.inner)
    }

    fn tick_inner(inner: &Arc<PollerInner>) -> bool {
        let force = {
            let mut cd = inner.countdown.lock();
            if cd.remaining_secs > 0 {
                cd.remaining_secs -= 1;
                if cd.remaining_secs == 0 {
                    // The boundary itself warrants an immediate look.
                    cd.stale_ticks = 0;
                    true
                } else {
                    false
                }
            } else {
                cd.stale_ticks += 1;
                if cd.stale_ticks >= inner.tuning.stale_tick_threshold
                    && !inner.in_flight.load(Ordering::Acquire)
                {
                    // Re-arm so a dead server forces one poll per
                    // threshold window, not one per tick.
                    cd.stale_ticks = 0;
                    true
                } else {
                    false
                }
            }
        };

        if force {
            debug!("countdown tick forcing a refresh");
            let inner = inner.clone();
            tokio::spawn(async move {
                Self::poll_inner(&inner).await;
            });
        }
        force
    }

    /// Manual refresh. Same guard as every other trigger.
    pub fn request_refresh(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            Self::poll_inner(&inner).await;
        });
    }

    /// Start the fixed-interval scheduler and the one-second tick.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(inner.tuning.poll_interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        Self::poll_inner(&inner).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        let inner = self.inner.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        Self::tick_inner(&inner);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// Cancel both timers. Required on teardown so no callback fires
    /// against disposed state.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for DashboardPoller {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
