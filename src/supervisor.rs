use regex::Regex;
use std::thread;
use std::time::Duration;

use crate::claim::Claimer;
use crate::logger::Logger;
use crate::pool_state::{PoolState, ShutdownToken};
use crate::recovery::{reconcile_orphans, RecoveryReport};
use crate::run_loop::{LoopSummary, PollSettings, WorkerLoop};
use crate::store::{ClaimableStore, StoreError};
use crate::task_types::{DuplicatePolicy, OrphanPolicy};
use crate::worker::JobSettings;

const MIN_WATCH_SLICE: Duration = Duration::from_millis(10);
const NO_TIMEOUT_SLICE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub(crate) struct PoolSettings {
    pub(crate) workers: usize,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) start_stagger: Duration,
    pub(crate) ignore: Option<Regex>,
    pub(crate) duplicates: DuplicatePolicy,
    pub(crate) orphans: OrphanPolicy,
}

#[derive(Debug)]
pub(crate) struct PoolReport {
    pub(crate) reason: String,
    pub(crate) terminated: bool,
    pub(crate) summary: LoopSummary,
    pub(crate) recovery: RecoveryReport,
}

/// Owns the worker slots for one pool run.
pub(crate) struct Supervisor<'a, S: ClaimableStore + ?Sized> {
    pub(crate) store: &'a S,
    pub(crate) pool: &'a PoolSettings,
    pub(crate) poll: &'a PollSettings,
    pub(crate) job: &'a JobSettings,
    pub(crate) logger: &'a Logger,
    pub(crate) token: &'a ShutdownToken,
}

impl<'a, S: ClaimableStore + ?Sized> Supervisor<'a, S> {
    /// Reconciles orphans, runs the pool until idle-timeout or a signal,
    /// drains in-flight tasks and joins every worker.
    pub(crate) fn run(&self) -> Result<PoolReport, StoreError> {
        // Held until the pool exits; other pools see our running tasks as live.
        let mut membership = self.store.join_pool()?;
        let recovery = if membership.is_sole() {
            reconcile_orphans(
                self.store,
                self.pool.orphans,
                self.job.logs_dir.as_deref(),
                self.logger,
            )?
        } else {
            self.logger.log_transition("recovery skipped reason=pool_active");
            RecoveryReport::default()
        };
        membership.share()?;
        if recovery.total() > 0 {
            self.logger.log_transition(&format!(
                "recovery policy={} requeued={} failed={} ignored={} errors={}",
                self.pool.orphans.as_str(),
                recovery.requeued.len(),
                recovery.failed.len(),
                recovery.ignored.len(),
                recovery.errors
            ));
        }

        let workers = self.pool.workers.max(1);
        let state = PoolState::new(workers);
        self.logger.log_transition(&format!(
            "pool start workers={} idle_timeout={} poll={:.3}s post_move_delay={:.3}s",
            workers,
            describe_timeout(self.pool.idle_timeout),
            self.poll.poll_interval.as_secs_f64(),
            self.poll.post_move_delay.as_secs_f64()
        ));

        let summary = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for slot in 0..workers {
                if slot > 0
                    && !self.pool.start_stagger.is_zero()
                    && self.token.sleep(self.pool.start_stagger)
                {
                    break;
                }
                let worker_loop = WorkerLoop {
                    slot,
                    store: self.store,
                    claimer: Claimer::new(slot, self.pool.ignore.clone(), self.pool.duplicates),
                    poll: self.poll,
                    job: self.job,
                    pool: &state,
                    logger: self.logger,
                    token: self.token,
                };
                handles.push((slot, scope.spawn(move || worker_loop.run())));
            }

            self.watch(&state);

            for view in state.executing() {
                self.logger.log_transition(&format!(
                    "drain worker={} task={} running_for={:.2}s",
                    view.id,
                    view.task.as_ref().map(|task| task.as_str()).unwrap_or("none"),
                    view.last_activity.elapsed().as_secs_f64()
                ));
            }

            let mut summary = LoopSummary::default();
            for (slot, handle) in handles {
                match handle.join() {
                    Ok(worker_summary) => summary.merge(worker_summary),
                    Err(_) => self
                        .logger
                        .log_transition(&format!("worker={} panicked", slot)),
                }
            }
            summary
        });

        let reason = self.token.reason().unwrap_or_else(|| "unknown".to_string());
        let terminated = self.token.is_terminated();
        self.logger.log_transition(&format!(
            "shutdown reason={} terminated={} finished={} failed={} stranded={} abandoned={}",
            reason,
            terminated,
            summary.finished,
            summary.failed,
            summary.stranded,
            summary.abandoned
        ));

        drop(membership);
        Ok(PoolReport {
            reason,
            terminated,
            summary,
            recovery,
        })
    }

    /// Blocks until the token is cancelled, cancelling it itself once the pool
    /// has been idle for the configured timeout.
    fn watch(&self, state: &PoolState) {
        while !self.token.is_cancelled() {
            let Some(limit) = self.pool.idle_timeout else {
                self.token.sleep(NO_TIMEOUT_SLICE);
                continue;
            };
            let idle = state.idle_duration();
            if idle >= limit {
                self.logger.log_transition(&format!(
                    "idle_timeout idle={:.2}s limit={:.2}s empty_polls={} claims={}",
                    idle.as_secs_f64(),
                    limit.as_secs_f64(),
                    state.empty_polls(),
                    state.claims()
                ));
                self.token.cancel("idle_timeout");
                return;
            }
            let slice = (limit - idle).min(self.poll.poll_interval).max(MIN_WATCH_SLICE);
            self.token.sleep(slice);
        }
    }
}

fn describe_timeout(timeout: Option<Duration>) -> String {
    match timeout {
        Some(value) => format!("{:.3}s", value.as_secs_f64()),
        None => "never".to_string(),
    }
}

