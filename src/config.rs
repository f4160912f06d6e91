use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::claim::compile_ignore;
use crate::run_loop::PollSettings;
use crate::store::StoreLayout;
use crate::supervisor::PoolSettings;
use crate::task_types::{DuplicatePolicy, OrphanPolicy, Seconds};
use crate::worker::JobSettings;

pub(crate) const DEFAULT_IGNORE_PATTERN: &str = r"^\.|\.(swp|tmp|part)$";
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_POLL_INTERVAL: Seconds = Seconds::constant(1.0);
const DEFAULT_POST_MOVE_DELAY: Seconds = Seconds::constant(0.2);
const DEFAULT_IDLE_TIMEOUT: Seconds = Seconds::constant(1800.0);
const DEFAULT_JITTER: Seconds = Seconds::constant(0.2);
const DEFAULT_START_STAGGER: Seconds = Seconds::constant(0.1);
const DEFAULT_SHELL: &str = "sh";
const DEFAULT_STORE_RETRY_LIMIT: u32 = 5;
const TERMINAL_MOVE_BACKOFF: Duration = Duration::from_millis(200);

const ALLOWED_KEYS: [&str; 19] = [
    "tasks_dir",
    "running_dir",
    "finished_dir",
    "failed_dir",
    "logs_dir",
    "workers",
    "poll_interval",
    "post_move_delay",
    "idle_timeout",
    "jitter",
    "start_stagger",
    "shell",
    "job",
    "cwd",
    "ignore_pattern",
    "duplicate_policy",
    "orphan_policy",
    "store_retry_limit",
    "log_path",
];

/// Every option is optional here; the file and the command line are merged
/// before defaults and validation apply.
#[derive(Debug, Default, Clone, Deserialize)]
pub(crate) struct FileConfig {
    pub(crate) tasks_dir: Option<PathBuf>,
    pub(crate) running_dir: Option<PathBuf>,
    pub(crate) finished_dir: Option<PathBuf>,
    pub(crate) failed_dir: Option<PathBuf>,
    pub(crate) logs_dir: Option<PathBuf>,
    pub(crate) workers: Option<usize>,
    pub(crate) poll_interval: Option<Seconds>,
    pub(crate) post_move_delay: Option<Seconds>,
    pub(crate) idle_timeout: Option<Seconds>,
    pub(crate) jitter: Option<Seconds>,
    pub(crate) start_stagger: Option<Seconds>,
    pub(crate) shell: Option<String>,
    pub(crate) job: Option<String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) ignore_pattern: Option<String>,
    pub(crate) duplicate_policy: Option<DuplicatePolicy>,
    pub(crate) orphan_policy: Option<OrphanPolicy>,
    pub(crate) store_retry_limit: Option<u32>,
    pub(crate) log_path: Option<PathBuf>,
}

impl FileConfig {
    /// Values set in `over` win.
    pub(crate) fn merge(self, over: FileConfig) -> FileConfig {
        FileConfig {
            tasks_dir: over.tasks_dir.or(self.tasks_dir),
            running_dir: over.running_dir.or(self.running_dir),
            finished_dir: over.finished_dir.or(self.finished_dir),
            failed_dir: over.failed_dir.or(self.failed_dir),
            logs_dir: over.logs_dir.or(self.logs_dir),
            workers: over.workers.or(self.workers),
            poll_interval: over.poll_interval.or(self.poll_interval),
            post_move_delay: over.post_move_delay.or(self.post_move_delay),
            idle_timeout: over.idle_timeout.or(self.idle_timeout),
            jitter: over.jitter.or(self.jitter),
            start_stagger: over.start_stagger.or(self.start_stagger),
            shell: over.shell.or(self.shell),
            job: over.job.or(self.job),
            cwd: over.cwd.or(self.cwd),
            ignore_pattern: over.ignore_pattern.or(self.ignore_pattern),
            duplicate_policy: over.duplicate_policy.or(self.duplicate_policy),
            orphan_policy: over.orphan_policy.or(self.orphan_policy),
            store_retry_limit: over.store_retry_limit.or(self.store_retry_limit),
            log_path: over.log_path.or(self.log_path),
        }
    }
}

#[derive(Debug)]
pub(crate) struct LoadedConfig {
    pub(crate) config: FileConfig,
    pub(crate) warnings: Vec<String>,
}

pub(crate) fn load_config(path: &Path) -> Result<LoadedConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read config {}: {}", path.display(), err))?;
    let value: Value = serde_yaml::from_str(&content)
        .map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))?;
    let mapping = match value {
        Value::Mapping(mapping) => mapping,
        // An empty file is an empty config.
        Value::Null => Mapping::new(),
        _ => {
            return Err(format!(
                "Config {} must be a YAML mapping",
                path.display()
            ))
        }
    };

    let warnings = unknown_top_level_keys(&mapping);
    emit_unknown_key_warnings(&warnings);

    let config: FileConfig = serde_path_to_error::deserialize(Value::Mapping(mapping))
        .map_err(|err| {
            format!(
                "Invalid config {}: {}: {}",
                path.display(),
                err.path(),
                err.inner()
            )
        })?;

    Ok(LoadedConfig { config, warnings })
}

fn emit_unknown_key_warnings(keys: &[String]) {
    for key in keys {
        eprintln!("Warning: unknown config key: {}", key);
    }
}

fn unknown_top_level_keys(mapping: &Mapping) -> Vec<String> {
    mapping
        .keys()
        .filter_map(|key| key.as_str().map(|value| value.to_string()))
        .filter(|key| !ALLOWED_KEYS.contains(&key.as_str()))
        .collect()
}

/// Fully resolved and validated runner configuration.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) layout: StoreLayout,
    pub(crate) logs_dir: Option<PathBuf>,
    pub(crate) workers: usize,
    pub(crate) poll_interval: Seconds,
    pub(crate) post_move_delay: Seconds,
    pub(crate) idle_timeout: Seconds,
    pub(crate) jitter: Seconds,
    pub(crate) start_stagger: Seconds,
    pub(crate) shell: String,
    pub(crate) job: Option<String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) ignore_pattern: String,
    pub(crate) duplicate_policy: DuplicatePolicy,
    pub(crate) orphan_policy: OrphanPolicy,
    pub(crate) store_retry_limit: u32,
    pub(crate) log_path: Option<PathBuf>,
}

fn require_dir(value: Option<PathBuf>, label: &str) -> Result<PathBuf, String> {
    match value {
        None => Err(format!("Missing required config value: {}", label)),
        Some(path) if path.as_os_str().is_empty() => Err(format!("{} must not be empty", label)),
        Some(path) => Ok(path),
    }
}

impl Config {
    pub(crate) fn resolve(file: FileConfig) -> Result<Self, String> {
        let pending = require_dir(file.tasks_dir, "tasks_dir")?;
        let running = require_dir(file.running_dir, "running_dir")?;
        let finished = require_dir(file.finished_dir, "finished_dir")?;

        let mut areas: Vec<(&str, &Path)> = vec![
            ("tasks_dir", pending.as_path()),
            ("running_dir", running.as_path()),
            ("finished_dir", finished.as_path()),
        ];
        if let Some(failed) = &file.failed_dir {
            areas.push(("failed_dir", failed.as_path()));
        }
        // A log file in an area would be listed as a task.
        if let Some(parent) = file.log_path.as_deref().and_then(Path::parent) {
            if let Some((label, _)) = areas.iter().find(|(_, area)| *area == parent) {
                return Err(format!(
                    "log_path must not be inside {} ({})",
                    label,
                    parent.display()
                ));
            }
        }
        if let Some(logs) = &file.logs_dir {
            areas.push(("logs_dir", logs.as_path()));
        }
        for (index, (label, path)) in areas.iter().enumerate() {
            for (other_label, other) in areas.iter().skip(index + 1) {
                if path == other {
                    return Err(format!(
                        "{} and {} must be different directories (both {})",
                        label,
                        other_label,
                        path.display()
                    ));
                }
            }
        }

        let workers = file.workers.unwrap_or(DEFAULT_WORKERS);
        if workers < 1 {
            return Err(format!("workers must be a positive integer (got {}).", workers));
        }

        let shell = file.shell.unwrap_or_else(|| DEFAULT_SHELL.to_string());
        if shell.trim().is_empty() {
            return Err("shell must not be empty.".to_string());
        }
        if let Some(job) = &file.job {
            if job.trim().is_empty() {
                return Err("job must not be empty when set.".to_string());
            }
        }

        let store_retry_limit = file.store_retry_limit.unwrap_or(DEFAULT_STORE_RETRY_LIMIT);
        if store_retry_limit < 1 {
            return Err("store_retry_limit must be a positive integer (got 0).".to_string());
        }

        let ignore_pattern = file
            .ignore_pattern
            .unwrap_or_else(|| DEFAULT_IGNORE_PATTERN.to_string());
        compile_ignore(&ignore_pattern)?;

        let poll_interval = file.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        if poll_interval.get() == 0.0 {
            return Err("poll_interval must be greater than zero.".to_string());
        }

        let failed = file.failed_dir;
        Ok(Self {
            layout: StoreLayout {
                pending,
                running,
                finished,
                failed,
            },
            logs_dir: file.logs_dir,
            workers,
            poll_interval,
            post_move_delay: file.post_move_delay.unwrap_or(DEFAULT_POST_MOVE_DELAY),
            idle_timeout: file.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            jitter: file.jitter.unwrap_or(DEFAULT_JITTER),
            start_stagger: file.start_stagger.unwrap_or(DEFAULT_START_STAGGER),
            shell,
            job: file.job,
            cwd: file.cwd,
            ignore_pattern,
            duplicate_policy: file.duplicate_policy.unwrap_or_default(),
            orphan_policy: file.orphan_policy.unwrap_or_default(),
            store_retry_limit,
            log_path: file.log_path,
        })
    }

    pub(crate) fn pool_settings(&self) -> Result<PoolSettings, String> {
        Ok(PoolSettings {
            workers: self.workers,
            idle_timeout: self.idle_timeout.as_timeout(),
            start_stagger: self.start_stagger.as_duration(),
            ignore: compile_ignore(&self.ignore_pattern)?,
            duplicates: self.duplicate_policy,
            orphans: self.orphan_policy,
        })
    }

    pub(crate) fn poll_settings(&self) -> PollSettings {
        PollSettings {
            poll_interval: self.poll_interval.as_duration(),
            jitter: self.jitter.as_duration(),
            post_move_delay: self.post_move_delay.as_duration(),
            store_retry_limit: self.store_retry_limit,
        }
    }

    pub(crate) fn job_settings(&self) -> JobSettings {
        JobSettings {
            shell: self.shell.clone(),
            job: self.job.clone(),
            cwd: self.cwd.clone(),
            logs_dir: self.logs_dir.clone(),
            retry_limit: self.store_retry_limit,
            retry_base: TERMINAL_MOVE_BACKOFF,
        }
    }
}
