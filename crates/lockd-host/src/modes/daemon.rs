//! Daemon mode: the long-lived enforcement loop.
//!
//! One `select!` loop drives everything:
//! 1. The executor tick while commands are pending
//! 2. Heartbeats, with backoff after failures
//! 3. The capability self-check, spawned as a cancellable task
//! 4. Control messages and graceful shutdown

use std::sync::Arc;
use std::time::Duration;

use lockd_kernel::{
    Backoff, DeviceKernel, HeartbeatReport, KernelStatus, PinOutcome, Processed, RecoveryOutcome,
};
use lockd_types::{Incident, OfflineCommand, Severity, WireCommand};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Intervals;
use crate::error::HostError;

/// Control message for the daemon.
#[derive(Debug)]
pub enum ControlMsg {
    Status {
        resp: oneshot::Sender<KernelStatus>,
    },
    /// Pending commands, or the finished history when `history` is set.
    Queue {
        history: bool,
        resp: oneshot::Sender<Vec<OfflineCommand>>,
    },
    Incidents {
        min: Severity,
        resp: oneshot::Sender<Vec<Incident>>,
    },
    /// Dispatch every pending command now.
    Drain {
        resp: oneshot::Sender<Result<Vec<Processed>, HostError>>,
    },
    /// Run a heartbeat immediately and reschedule the next one.
    Heartbeat {
        resp: oneshot::Sender<Result<HeartbeatReport, HostError>>,
    },
    /// Run the capability self-check (and recovery if needed) inline.
    SelfCheck {
        resp: oneshot::Sender<Result<RecoveryOutcome, HostError>>,
    },
    Submit {
        command: WireCommand,
        resp: oneshot::Sender<Result<Vec<Processed>, HostError>>,
    },
    PinUnlock {
        lock_id: String,
        pin: String,
        resp: oneshot::Sender<Result<PinOutcome, HostError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), HostError>>,
        /// Optional sender to propagate shutdown to the control server.
        shutdown_tx: broadcast::Sender<()>,
    },
}

/// Next due time for each periodic job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub executor_at: Instant,
    pub heartbeat_at: Instant,
    pub self_check_at: Instant,
}

impl Schedule {
    /// Everything is due at boot.
    pub fn at_boot(now: Instant) -> Self {
        Self {
            executor_at: now,
            heartbeat_at: now,
            self_check_at: now,
        }
    }

    /// The executor deadline only counts while commands are pending.
    pub fn next_deadline(&self, executor_pending: bool) -> Instant {
        let next = self.heartbeat_at.min(self.self_check_at);
        if executor_pending {
            next.min(self.executor_at)
        } else {
            next
        }
    }

    /// Delay before the next heartbeat after `failures` consecutive failures.
    /// Past the backoff ceiling the regular interval applies again.
    pub fn heartbeat_delay(intervals: &Intervals, backoff: &Backoff, failures: u32) -> Duration {
        backoff
            .delay_ms(failures)
            .map(Duration::from_millis)
            .unwrap_or(intervals.heartbeat)
    }
}

/// Lock daemon for long-lived enforcement.
///
/// The daemon owns:
/// - The shared `DeviceKernel`
/// - The job schedule and heartbeat backoff
/// - A control channel for operator commands
/// - A shutdown channel for graceful termination
pub struct LockDaemon {
    kernel: Arc<DeviceKernel>,
    intervals: Intervals,
    backoff: Backoff,
    schedule: Schedule,
    control_rx: mpsc::Receiver<ControlMsg>,
    shutdown_rx: broadcast::Receiver<()>,
    control_server: Option<JoinHandle<()>>,
    recovery: Option<JoinHandle<()>>,
}

impl LockDaemon {
    pub fn new(
        kernel: Arc<DeviceKernel>,
        intervals: Intervals,
        backoff: Backoff,
        control_rx: mpsc::Receiver<ControlMsg>,
        shutdown_rx: broadcast::Receiver<()>,
        control_server: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            kernel,
            intervals,
            backoff,
            schedule: Schedule::at_boot(Instant::now()),
            control_rx,
            shutdown_rx,
            control_server,
            recovery: None,
        }
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Run the daemon's main loop.
    ///
    /// Persisted locks are reasserted before anything touches the network.
    /// Each turn waits for the earliest due job, a control message, or
    /// shutdown; a failing job is logged and rescheduled, never fatal.
    pub async fn run(&mut self) -> Result<(), HostError> {
        tracing::info!(device_id = self.kernel.device_id(), "lock daemon started");
        self.kernel.start()?;
        self.schedule = Schedule::at_boot(Instant::now());

        let mut control_open = true;
        loop {
            let deadline = self.schedule.next_deadline(self.kernel.executor().has_pending());

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    self.run_due_jobs().await;
                }

                msg = self.control_rx.recv(), if control_open => {
                    match msg {
                        Some(cmd) => {
                            let should_stop = matches!(cmd, ControlMsg::Shutdown { .. });
                            self.apply_control(cmd).await;
                            if should_stop {
                                tracing::info!("shutdown requested via control channel");
                                break;
                            }
                        }
                        None => {
                            tracing::debug!("control channel closed");
                            control_open = false;
                        }
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    tracing::info!("shutdown signal received");
                    break;
                }
            }
        }

        self.stop().await;
        tracing::info!("lock daemon stopped");
        Ok(())
    }

    async fn run_due_jobs(&mut self) {
        let now = Instant::now();
        if now >= self.schedule.heartbeat_at {
            // A heartbeat drains delivered commands itself.
            let _ = self.heartbeat().await;
        }
        if now >= self.schedule.executor_at {
            self.executor_tick().await;
        }
        if now >= self.schedule.self_check_at {
            self.spawn_self_check();
            self.schedule.self_check_at = now + self.intervals.self_check;
        }
    }

    /// Dispatch one pending command.
    async fn executor_tick(&mut self) {
        self.schedule.executor_at = Instant::now() + self.intervals.executor;
        match self.kernel.executor().process_next().await {
            Ok(Some(done)) => {
                tracing::info!(
                    command_id = %done.command_id,
                    kind = ?done.kind,
                    status = ?done.status,
                    "command processed"
                );
            }
            Ok(None) => {}
            Err(err) => tracing::error!(%err, "executor tick failed"),
        }
    }

    async fn heartbeat(&mut self) -> Result<HeartbeatReport, HostError> {
        let result = self.kernel.heartbeat_cycle().await;
        let now = Instant::now();
        match &result {
            Ok(report) => {
                self.schedule.heartbeat_at = now + self.intervals.heartbeat;
                tracing::info!(
                    blocked = report.cycle.blocked,
                    deactivated = report.cycle.deactivated,
                    enqueued = report.cycle.enqueued,
                    rejected = report.cycle.rejected,
                    state = ?self.kernel.lock_state(),
                    "heartbeat exchanged"
                );
                let delivered = self.kernel.flush_alerts().await;
                if delivered > 0 {
                    tracing::info!(delivered, "alerts delivered");
                }
            }
            Err(err) => {
                let failures = self.kernel.heartbeat().state().consecutive_failures;
                let delay = Schedule::heartbeat_delay(&self.intervals, &self.backoff, failures);
                self.schedule.heartbeat_at = now + delay;
                tracing::warn!(%err, failures, retry_in_secs = delay.as_secs(), "heartbeat failed");
            }
        }
        result.map_err(HostError::from)
    }

    fn spawn_self_check(&mut self) {
        if self.recovery.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("self-check still running; skipping");
            return;
        }
        let kernel = self.kernel.clone();
        self.recovery = Some(tokio::spawn(async move {
            match kernel.recovery().check_and_recover().await {
                Ok(RecoveryOutcome::Healthy) => tracing::debug!("capability healthy"),
                Ok(outcome) => tracing::warn!(?outcome, "capability recovery ran"),
                Err(err) => tracing::error!(%err, "capability self-check failed"),
            }
        }));
    }

    async fn apply_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Status { resp } => {
                let _ = resp.send(self.kernel.status());
            }
            ControlMsg::Queue { history, resp } => {
                let queue = self.kernel.queue();
                let _ = resp.send(if history { queue.history() } else { queue.pending() });
            }
            ControlMsg::Incidents { min, resp } => {
                let _ = resp.send(self.kernel.incidents(min));
            }
            ControlMsg::Drain { resp } => {
                let res = self.kernel.executor().drain_all().await.map_err(HostError::from);
                let _ = resp.send(res);
            }
            ControlMsg::Heartbeat { resp } => {
                let res = self.heartbeat().await;
                let _ = resp.send(res);
            }
            ControlMsg::SelfCheck { resp } => {
                let res = self.kernel.recovery().check_and_recover().await.map_err(HostError::from);
                let _ = resp.send(res);
            }
            ControlMsg::Submit { command, resp } => {
                let id = command.id.clone();
                let res = self
                    .kernel
                    .receive_command(command)
                    .await
                    .map(|(_, processed)| processed)
                    .map_err(HostError::from);
                if let Err(err) = &res {
                    tracing::warn!(command_id = %id, %err, "submitted command rejected");
                }
                let _ = resp.send(res);
            }
            ControlMsg::PinUnlock { lock_id, pin, resp } => {
                let res = self.kernel.pin_unlock(&lock_id, &pin).map_err(HostError::from);
                if let Ok(outcome) = &res {
                    tracing::info!(lock_id = %lock_id, ?outcome, "pin unlock attempted");
                }
                let _ = resp.send(res);
            }
            ControlMsg::Shutdown { resp, shutdown_tx } => {
                let _ = shutdown_tx.send(());
                let _ = resp.send(Ok(()));
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(handle) = self.recovery.take() {
            // Dropping a recovery mid-run leaves the emergency lock in place.
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = self.control_server.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_only_counts_while_pending() {
        let now = Instant::now();
        let schedule = Schedule {
            executor_at: now,
            heartbeat_at: now + Duration::from_secs(60),
            self_check_at: now + Duration::from_secs(30),
        };
        assert_eq!(schedule.next_deadline(true), now);
        assert_eq!(schedule.next_deadline(false), now + Duration::from_secs(30));
    }

    #[test]
    fn heartbeat_backs_off_then_falls_back_to_interval() {
        let intervals = Intervals::default();
        let backoff = Backoff::default();
        assert_eq!(Schedule::heartbeat_delay(&intervals, &backoff, 0), intervals.heartbeat);
        assert_eq!(Schedule::heartbeat_delay(&intervals, &backoff, 1), Duration::from_secs(30));
        assert_eq!(Schedule::heartbeat_delay(&intervals, &backoff, 3), Duration::from_secs(120));
        assert_eq!(
            Schedule::heartbeat_delay(&intervals, &backoff, backoff.max_attempts + 1),
            intervals.heartbeat
        );
    }
}
