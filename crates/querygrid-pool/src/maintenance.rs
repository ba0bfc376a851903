//! Pool maintenance — background task that keeps the pool healthy and
//! sized to its load.
//!
//! Each tick probes idle connections, adjusts the warm target from the
//! exhaustion and utilization seen since the previous tick, reaps connections idle past `idle_timeout`, and dials
//! replacements up to the warm target.

use std::collections::VecDeque;
use std::sync::Arc;

use querygrid_metrics::names;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pool::{ConnectionPool, PressureSample, SlotState};

/// Outcome of one maintenance tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Idle connections closed after failing a probe.
    pub unhealthy: usize,
    /// Idle connections closed after `idle_timeout`.
    pub reaped: usize,
    /// Connections dialed to reach the warm target.
    pub created: usize,
    pub warm_target: usize,
}

/// Handle to a running maintenance task.
pub struct MaintenanceHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl MaintenanceHandle {
    /// Signal the task to stop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

impl ConnectionPool {
    /// Start the maintenance loop, ticking every `health_check_interval`.
    pub fn spawn_maintenance(self: &Arc<Self>) -> MaintenanceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            pool.run_maintenance(shutdown_rx).await;
        });
        info!(interval = ?self.config.health_check_interval, "pool maintenance started");
        MaintenanceHandle {
            handle,
            shutdown_tx,
        }
    }

    async fn run_maintenance(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.health_check_interval) => {
                    if self.is_closed() {
                        break;
                    }
                    let report = self.maintain().await;
                    debug!(
                        unhealthy = report.unhealthy,
                        reaped = report.reaped,
                        created = report.created,
                        warm_target = report.warm_target,
                        "pool maintenance tick"
                    );
                }
                _ = shutdown.changed() => {
                    debug!("pool maintenance shutting down");
                    break;
                }
            }
        }
    }

    /// Run one maintenance pass.
    pub async fn maintain(&self) -> MaintenanceReport {
        let unhealthy = self.health_check_idle().await;
        let warm_target = self.adjust_warm_target();
        let reaped = self.reap_idle().await;
        let created = self.replenish().await;
        MaintenanceReport {
            unhealthy,
            reaped,
            created,
            warm_target,
        }
    }

    /// Ping every idle connection, closing the ones that fail.
    ///
    /// A connection under probe holds a capacity permit, so probing stops
    /// early when every permit is leased. Returns the number removed.
    pub async fn health_check_idle(&self) -> usize {
        let candidates = self.state.lock().idle.len();
        let mut removed = 0;

        for _ in 0..candidates {
            let Ok(_permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let next = self.state.lock().idle.pop_front();
            let Some(mut idle) = next else {
                break;
            };

            if idle.conn.ping().await {
                self.state.lock().idle.push_back(idle);
                continue;
            }

            if let Some(slot) = self.state.lock().slots.get_mut(&idle.id) {
                slot.state = SlotState::Unhealthy;
            }
            warn!(slot = idle.id, "removed unhealthy idle connection");
            self.metrics.increment(names::POOL_HEALTH_CHECK_FAILED);
            self.close_slot(idle.id, idle.conn, "unhealthy").await;
            removed += 1;
        }

        removed
    }

    /// Close idle connections unused for `idle_timeout`, never shrinking
    /// the pool below its warm target. Returns the number closed.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let expired = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let floor = state.warm_target.max(self.config.min_size);
            let mut surplus = state.total().saturating_sub(floor);
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());

            while let Some(idle) = state.idle.pop_front() {
                let stale = surplus > 0
                    && state
                        .slots
                        .get(&idle.id)
                        .is_some_and(|slot| slot.last_used_at.elapsed() >= idle_timeout);
                if stale {
                    surplus -= 1;
                    expired.push(idle);
                } else {
                    kept.push_back(idle);
                }
            }
            state.idle = kept;
            expired
        };

        let reaped = expired.len();
        for idle in expired {
            self.close_slot(idle.id, idle.conn, "idle timeout").await;
        }
        if reaped > 0 {
            let stats = self.stats();
            info!(reaped, remaining_idle = stats.idle, total = stats.total, "reaped idle connections");
        }
        reaped
    }

    /// Move the warm target toward `max_size` when acquires timed out since
    /// the previous adjustment, and toward `min_size` when utilization
    /// stayed low. Returns the new target.
    pub fn adjust_warm_target(&self) -> usize {
        let (min, max) = (self.config.min_size, self.config.max_size);

        let mut state = self.state.lock();
        let exhausted = state.exhausted_count - state.pressure.exhausted_seen;
        let samples = state.pressure.utilization_samples;
        let mean_utilization = if samples > 0 {
            state.pressure.utilization_sum / samples as f64
        } else {
            0.0
        };
        state.pressure = PressureSample {
            exhausted_seen: state.exhausted_count,
            ..PressureSample::default()
        };

        let before = state.warm_target;
        let after = if exhausted > 0 {
            let step = (max.saturating_sub(before) / 2).max(1);
            (before + step).min(max)
        } else if samples == 0 || mean_utilization < self.config.low_utilization {
            before.saturating_sub(1).max(min)
        } else {
            before
        };
        state.warm_target = after;
        drop(state);

        if after != before {
            info!(
                before,
                after,
                exhausted,
                mean_utilization,
                "pool warm target adjusted"
            );
            self.metrics.record(names::POOL_WARM_TARGET, after as f64);
        }
        after
    }

    /// Dial idle connections until the pool reaches its warm target.
    /// Returns the number created.
    pub async fn replenish(&self) -> usize {
        let mut created = 0;
        loop {
            if self.is_closed() {
                break;
            }
            let below_target = {
                let state = self.state.lock();
                state.total() < state.warm_target.max(self.config.min_size)
            };
            if !below_target {
                break;
            }
            match self.create_idle().await {
                Ok(true) => created += 1,
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "failed to replenish pool connection");
                    break;
                }
            }
        }
        created
    }
}
