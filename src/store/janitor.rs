//! Periodic eviction of expired local entries.

use super::memory::LocalState;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub counters: usize,
    pub windows: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.counters + self.windows
    }
}

/// Removes counters past their expiry and windows with no timestamp left
/// inside their own horizon. Live entries are never touched, so a request
/// racing a sweep sees either the entry or a lazily recreated one.
pub(super) fn sweep(state: &LocalState) -> Result<SweepStats> {
    let now = state.clock.now_ms();

    let counters = {
        let mut counters = state.counters_mut()?;
        let before = counters.len();
        counters.retain(|_, counter| now < counter.expires_at_ms);
        before - counters.len()
    };

    let windows = {
        let mut windows = state.windows_mut()?;
        let before = windows.len();
        windows.retain(|_, window| {
            window.prune(now);
            !window.timestamps.is_empty()
        });
        before - windows.len()
    };

    Ok(SweepStats { counters, windows })
}

/// Background sweep task owned by a [`LocalStore`](super::LocalStore).
pub struct Janitor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Janitor {
    pub(super) fn spawn(state: Arc<LocalState>, every: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately; skip that first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => match sweep(&state) {
                        Ok(stats) => debug!(
                            counters = stats.counters,
                            windows = stats.windows,
                            "janitor sweep completed"
                        ),
                        Err(e) => warn!(error = %e, "janitor sweep failed"),
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("janitor stopped");
        });

        debug!(interval_ms = every.as_millis() as u64, "janitor started");
        Self { shutdown, handle }
    }

    /// Signals the task and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "janitor task ended abnormally");
            }
        }
    }

    pub(super) fn abort(self) {
        self.handle.abort();
    }
}
