use rand::Rng;
use std::time::Duration;

use crate::claim::Claimer;
use crate::logger::Logger;
use crate::pool_state::{PoolState, ShutdownLevel, ShutdownToken};
use crate::store::ClaimableStore;
use crate::task_types::Phase;
use crate::worker::{backoff_delay, JobSettings, Worker, WorkerOutcome};

#[derive(Debug, Clone)]
pub(crate) struct PollSettings {
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) post_move_delay: Duration,
    pub(crate) store_retry_limit: u32,
}

impl PollSettings {
    fn idle_sleep(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter.as_secs_f64());
        self.poll_interval + Duration::from_secs_f64(extra)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoopSummary {
    pub(crate) finished: u64,
    pub(crate) failed: u64,
    pub(crate) stranded: u64,
    pub(crate) abandoned: u64,
}

impl LoopSummary {
    fn tally(&mut self, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::Finished => self.finished += 1,
            WorkerOutcome::Failed => self.failed += 1,
            WorkerOutcome::Stranded => self.stranded += 1,
            WorkerOutcome::Abandoned => self.abandoned += 1,
        }
    }

    pub(crate) fn merge(&mut self, other: LoopSummary) {
        self.finished += other.finished;
        self.failed += other.failed;
        self.stranded += other.stranded;
        self.abandoned += other.abandoned;
    }
}

/// One worker slot's scheduler loop: Idle → Claiming → Executing → Idle.
pub(crate) struct WorkerLoop<'a, S: ClaimableStore + ?Sized> {
    pub(crate) slot: usize,
    pub(crate) store: &'a S,
    pub(crate) claimer: Claimer,
    pub(crate) poll: &'a PollSettings,
    pub(crate) job: &'a JobSettings,
    pub(crate) pool: &'a PoolState,
    pub(crate) logger: &'a Logger,
    pub(crate) token: &'a ShutdownToken,
}

impl<'a, S: ClaimableStore + ?Sized> WorkerLoop<'a, S> {
    /// Runs until the token is cancelled. The token is consulted only at the
    /// top of each iteration, so a claimed task always runs to a terminal move
    /// unless a terminate request kills it.
    pub(crate) fn run(mut self) -> LoopSummary {
        let mut summary = LoopSummary::default();
        let mut store_failures: u32 = 0;

        while !self.token.is_cancelled() {
            self.pool.set_phase(self.slot, Phase::Claiming);
            match self.claimer.claim_next(self.store, self.logger) {
                Ok(Some(claimed)) => {
                    store_failures = 0;
                    let name = claimed.name;
                    self.pool.record_claim(self.slot, &name);
                    self.logger.log_transition(&format!(
                        "worker={} claim task={} rerun={}",
                        self.slot, name, claimed.rerun
                    ));

                    let outcome = if !self.poll.post_move_delay.is_zero()
                        && self
                            .token
                            .wait_for(ShutdownLevel::Terminate, self.poll.post_move_delay)
                    {
                        self.logger.log_transition(&format!(
                            "worker={} terminated task={} left_in=running",
                            self.slot, name
                        ));
                        WorkerOutcome::Abandoned
                    } else {
                        Worker {
                            slot: self.slot,
                            store: self.store,
                            settings: self.job,
                            logger: self.logger,
                            token: self.token,
                        }
                        .run(&name)
                    };

                    self.pool.record_release(self.slot);
                    summary.tally(outcome);
                    if outcome == WorkerOutcome::Abandoned {
                        break;
                    }
                }
                Ok(None) => {
                    store_failures = 0;
                    self.pool.set_phase(self.slot, Phase::Idle);
                    self.pool.record_empty_poll();
                    self.token.sleep(self.poll.idle_sleep());
                }
                Err(err) => {
                    store_failures += 1;
                    self.pool.set_phase(self.slot, Phase::Idle);
                    self.logger.log_transition(&format!(
                        "worker={} store_error op=list attempt={} err={}",
                        self.slot, store_failures, err
                    ));
                    let limit = self.poll.store_retry_limit.max(1);
                    if store_failures % limit == 0 {
                        self.logger.log_transition(&format!(
                            "worker={} store_escalated failures={} err={}",
                            self.slot, store_failures, err
                        ));
                    }
                    let delay = backoff_delay(
                        self.poll.poll_interval.max(Duration::from_millis(10)),
                        (store_failures - 1).min(limit),
                    );
                    self.token.sleep(delay);
                }
            }
        }

        self.pool.set_phase(self.slot, Phase::Idle);
        summary
    }
}
