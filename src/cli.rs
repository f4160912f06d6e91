use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::FileConfig;
use crate::task_types::{DuplicatePolicy, OrphanPolicy, Seconds};

#[derive(Debug, Parser)]
#[command(
    name = "dirqueue",
    about = "Run queued task files from a shared directory with a pool of workers.",
    long_about = "dirqueue claims task files from a pending directory by atomically moving them into a running directory, executes each one, and files it under finished or failed.\n\nEach task file's first non-empty line is the command to run, unless --job supplies a command template that receives the task file path as $1.",
    disable_help_subcommand = true
)]
pub(crate) struct Cli {
    /// Load options from a YAML file; command-line flags override it.
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        value_name = "PATH",
        help = "Load options from a YAML file; command-line flags override it."
    )]
    pub(crate) config: Option<PathBuf>,

    #[command(flatten)]
    pub(crate) options: RunOptions,

    #[command(subcommand)]
    pub(crate) command: Option<CliCommand>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    #[command(about = "Show how many tasks are in each area without changing anything.")]
    /// Show how many tasks are in each area without changing anything.
    Status {
        #[arg(long, help = "Print the counts as JSON.")]
        json: bool,
    },
}

#[derive(Debug, Default, Args)]
pub(crate) struct RunOptions {
    #[arg(long = "tasks", global = true, value_name = "DIR", help = "Directory holding pending task files.")]
    pub(crate) tasks: Option<PathBuf>,

    #[arg(long = "running", global = true, value_name = "DIR", help = "Directory for tasks being executed.")]
    pub(crate) running: Option<PathBuf>,

    #[arg(long = "finished", global = true, value_name = "DIR", help = "Directory for tasks whose job succeeded.")]
    pub(crate) finished: Option<PathBuf>,

    #[arg(
        long = "failed",
        global = true,
        value_name = "DIR",
        help = "Directory for tasks whose job failed (defaults to the finished directory)."
    )]
    pub(crate) failed: Option<PathBuf>,

    #[arg(
        long = "logs",
        global = true,
        value_name = "DIR",
        help = "Directory for per-task run records; without it job output goes to the terminal."
    )]
    pub(crate) logs: Option<PathBuf>,

    #[arg(short = 'w', long = "workers", value_name = "N", help = "Number of concurrent workers [default: 1].")]
    pub(crate) workers: Option<usize>,

    #[arg(long = "poll", value_name = "SECONDS", help = "Sleep between listings when nothing is pending [default: 1].")]
    pub(crate) poll: Option<Seconds>,

    #[arg(
        long = "post-move-delay",
        value_name = "SECONDS",
        help = "Pause after claiming a task before running it [default: 0.2]."
    )]
    pub(crate) post_move_delay: Option<Seconds>,

    #[arg(
        long = "idle-timeout",
        value_name = "SECONDS",
        help = "Drain and exit after this long without activity; 0 disables [default: 1800]."
    )]
    pub(crate) idle_timeout: Option<Seconds>,

    #[arg(long = "jitter", value_name = "SECONDS", help = "Random extra added to each idle sleep [default: 0.2].")]
    pub(crate) jitter: Option<Seconds>,

    #[arg(long = "start-stagger", value_name = "SECONDS", help = "Spacing between worker starts [default: 0.1].")]
    pub(crate) start_stagger: Option<Seconds>,

    #[arg(long = "shell", value_name = "PROGRAM", help = "Shell used as `PROGRAM -c COMMAND` [default: sh].")]
    pub(crate) shell: Option<String>,

    #[arg(long = "job", value_name = "COMMAND", help = "Command run for every task, with the task file path as $1.")]
    pub(crate) job: Option<String>,

    #[arg(long = "cwd", value_name = "DIR", help = "Working directory for jobs.")]
    pub(crate) cwd: Option<PathBuf>,

    #[arg(long = "ignore", value_name = "REGEX", help = "Pending file names matching this are never claimed.")]
    pub(crate) ignore: Option<String>,

    #[arg(
        long = "on-duplicate",
        value_enum,
        value_name = "POLICY",
        help = "Pending name already finished or failed: skip it or rerun it [default: skip]."
    )]
    pub(crate) on_duplicate: Option<DuplicatePolicy>,

    #[arg(
        long = "on-orphan",
        value_enum,
        value_name = "POLICY",
        help = "Tasks left in running at startup: requeue, fail or ignore [default: requeue]."
    )]
    pub(crate) on_orphan: Option<OrphanPolicy>,

    #[arg(
        long = "store-retries",
        value_name = "N",
        help = "Store failures tolerated before escalating; terminal-move attempts [default: 5]."
    )]
    pub(crate) store_retries: Option<u32>,

    #[arg(long = "log-file", value_name = "PATH", help = "Also append the transition log to PATH.")]
    pub(crate) log_file: Option<PathBuf>,
}

impl RunOptions {
    pub(crate) fn into_overrides(self) -> FileConfig {
        FileConfig {
            tasks_dir: self.tasks,
            running_dir: self.running,
            finished_dir: self.finished,
            failed_dir: self.failed,
            logs_dir: self.logs,
            workers: self.workers,
            poll_interval: self.poll,
            post_move_delay: self.post_move_delay,
            idle_timeout: self.idle_timeout,
            jitter: self.jitter,
            start_stagger: self.start_stagger,
            shell: self.shell,
            job: self.job,
            cwd: self.cwd,
            ignore_pattern: self.ignore,
            duplicate_policy: self.on_duplicate,
            orphan_policy: self.on_orphan,
            store_retry_limit: self.store_retries,
            log_path: self.log_file,
        }
    }
}
