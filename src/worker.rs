use chrono::Local;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use crate::logger::{sanitize_log_value, Logger};
use crate::pool_state::ShutdownToken;
use crate::run_record::{RunRecord, TIMESTAMP_FORMAT};
use crate::shell::{
    first_command_line, render_command, run_job, task_args, CommandEnv, JobOutcome, JobOutput,
};
use crate::store::{ClaimableStore, MoveOutcome};
use crate::task_types::{Area, TaskName};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// How claimed tasks are executed. Shared read-only by every worker.
#[derive(Debug, Clone)]
pub(crate) struct JobSettings {
    pub(crate) shell: String,
    /// Command template run for every task with the task path as `$1`.
    /// When absent the task's first non-empty line is the command.
    pub(crate) job: Option<String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) logs_dir: Option<PathBuf>,
    pub(crate) retry_limit: u32,
    pub(crate) retry_base: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerOutcome {
    Finished,
    Failed,
    /// The job ended but the terminal move kept failing; the task is an orphan.
    Stranded,
    /// Forced termination killed the job; the task stays in running.
    Abandoned,
}

pub(crate) struct Worker<'a, S: ClaimableStore + ?Sized> {
    pub(crate) slot: usize,
    pub(crate) store: &'a S,
    pub(crate) settings: &'a JobSettings,
    pub(crate) logger: &'a Logger,
    pub(crate) token: &'a ShutdownToken,
}

pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

impl<'a, S: ClaimableStore + ?Sized> Worker<'a, S> {
    /// Executes a task already resident in running and moves it to its
    /// terminal area.
    pub(crate) fn run(&self, name: &TaskName) -> WorkerOutcome {
        let task_path = self.store.locate(Area::Running, name);
        let (command, args, launch_error) = self.resolve_command(name);

        let mut record = self.settings.logs_dir.as_ref().and_then(|dir| {
            match RunRecord::create(dir, name, &command) {
                Ok(record) => Some(record),
                Err(err) => {
                    self.logger.log_transition(&format!(
                        "worker={} run_record_error task={} err={}",
                        self.slot, name, err
                    ));
                    None
                }
            }
        });

        let started_at = Local::now();
        let started = Instant::now();
        self.logger.log_transition(&format!(
            "worker={} start task={} at={} cmd={}",
            self.slot,
            name,
            started_at.format(TIMESTAMP_FORMAT),
            sanitize_log_value(&render_command(&self.settings.shell, &command, &args))
        ));

        let outcome = match launch_error {
            Some(err) => JobOutcome::LaunchFailed(err),
            None => {
                let env = CommandEnv {
                    cwd: self.settings.cwd.clone(),
                    task_name: name.to_string(),
                    task_path,
                    worker_id: self.slot,
                    run_record: record.as_ref().map(|record| record.path().to_path_buf()),
                };
                let output = match record.as_ref().map(RunRecord::output_handle) {
                    Some(Ok(file)) => JobOutput::Record(file),
                    Some(Err(err)) => {
                        self.logger.log_transition(&format!(
                            "worker={} run_record_error task={} err={}",
                            self.slot, name, err
                        ));
                        JobOutput::Inherit
                    }
                    None => JobOutput::Inherit,
                };
                run_job(&self.settings.shell, &command, &args, &env, output, self.token)
            }
        };
        let elapsed = started.elapsed();
        let ended_at = Local::now();

        if let Some(record) = record.as_mut() {
            let written = record
                .write_status(&outcome.status_line())
                .and_then(|_| record.write_timing(started_at, ended_at, elapsed));
            if let Err(err) = written {
                self.logger.log_transition(&format!(
                    "worker={} run_record_error task={} err={}",
                    self.slot, name, err
                ));
            }
        }

        if outcome == JobOutcome::Terminated {
            self.logger.log_transition(&format!(
                "worker={} terminated task={} duration={:.2}s left_in=running",
                self.slot,
                name,
                elapsed.as_secs_f64()
            ));
            return WorkerOutcome::Abandoned;
        }

        let target = if outcome.succeeded() {
            Area::Finished
        } else {
            Area::Failed
        };
        if let JobOutcome::LaunchFailed(err) = &outcome {
            self.logger.log_transition(&format!(
                "worker={} launch_failed task={} err={}",
                self.slot, name, err
            ));
        }
        if !self.terminal_move(name, target) {
            return WorkerOutcome::Stranded;
        }

        self.logger.log_transition(&format!(
            "worker={} {} task={} at={} duration={:.2}s rc={} to={}",
            self.slot,
            if target == Area::Finished { "finish" } else { "fail" },
            name,
            ended_at.format(TIMESTAMP_FORMAT),
            elapsed.as_secs_f64(),
            outcome.rc(),
            target
        ));
        if target == Area::Finished {
            WorkerOutcome::Finished
        } else {
            WorkerOutcome::Failed
        }
    }

    /// Returns the command string, its positional args, and a launch error
    /// when nothing can be run.
    fn resolve_command(&self, name: &TaskName) -> (String, Vec<String>, Option<String>) {
        if let Some(job) = &self.settings.job {
            let path = self.store.locate(Area::Running, name);
            return (job.clone(), task_args(&path), None);
        }
        match self.store.payload(Area::Running, name) {
            Ok(payload) => match first_command_line(&payload) {
                Some(line) => (line.to_string(), Vec::new(), None),
                None => (String::new(), Vec::new(), Some("empty task descriptor".to_string())),
            },
            Err(err) => (String::new(), Vec::new(), Some(err.to_string())),
        }
    }

    /// Moves running → `target`, retrying I/O failures with bounded backoff.
    /// A failure that outlasts the retries leaves the task in running.
    fn terminal_move(&self, name: &TaskName, target: Area) -> bool {
        let attempts = self.settings.retry_limit.max(1);
        for attempt in 0..attempts {
            match self.store.transition(name, Area::Running, target) {
                Ok(MoveOutcome::Moved) => return true,
                Ok(MoveOutcome::Vanished) => {
                    self.logger.log_transition(&format!(
                        "worker={} move_failed task={} to={} err=vanished_from_running",
                        self.slot, name, target
                    ));
                    return false;
                }
                Err(err) => {
                    self.logger.log_transition(&format!(
                        "worker={} store_error op=terminal_move task={} to={} attempt={}/{} err={}",
                        self.slot,
                        name,
                        target,
                        attempt + 1,
                        attempts,
                        err
                    ));
                    if attempt + 1 < attempts {
                        thread::sleep(backoff_delay(self.settings.retry_base, attempt));
                    }
                }
            }
        }
        self.logger.log_transition(&format!(
            "worker={} move_failed task={} to={} left_in=running",
            self.slot, name, target
        ));
        false
    }
}
