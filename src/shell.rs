use shell_escape::unix::escape;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use crate::pool_state::{ShutdownLevel, ShutdownToken};

const WAIT_SLICE: Duration = Duration::from_millis(50);

pub(crate) fn render_command(shell: &str, command: &str, args: &[String]) -> String {
    let mut rendered = format!("{} -c {}", escape(shell.into()), escape(command.into()));
    if !args.is_empty() {
        rendered.push_str(" --");
    }
    for arg in args {
        rendered.push(' ');
        rendered.push_str(escape(arg.as_str().into()).as_ref());
    }
    rendered
}

/// First non-empty line of a task descriptor, trimmed.
pub(crate) fn first_command_line(payload: &str) -> Option<&str> {
    payload.lines().map(str::trim).find(|line| !line.is_empty())
}

#[derive(Debug, Clone)]
pub(crate) struct CommandEnv {
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) task_name: String,
    pub(crate) task_path: PathBuf,
    pub(crate) worker_id: usize,
    pub(crate) run_record: Option<PathBuf>,
}

impl CommandEnv {
    pub(crate) fn apply(&self, cmd: &mut Command) {
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.env("DIRQUEUE_TASK_NAME", &self.task_name);
        cmd.env("DIRQUEUE_TASK_PATH", &self.task_path);
        cmd.env("DIRQUEUE_WORKER_ID", self.worker_id.to_string());
        match &self.run_record {
            Some(path) => {
                cmd.env("DIRQUEUE_RUN_RECORD", path);
            }
            None => {
                cmd.env_remove("DIRQUEUE_RUN_RECORD");
            }
        }
    }
}

/// Where the job's stdout and stderr go.
#[derive(Debug)]
pub(crate) enum JobOutput {
    Inherit,
    Record(File),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Exited(i32),
    /// Killed by a signal not sent by this runner.
    Signaled(i32),
    LaunchFailed(String),
    /// Killed on a forced terminate request.
    Terminated,
}

impl JobOutcome {
    pub(crate) fn succeeded(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Numeric code for transition logs; signals are reported negated.
    pub(crate) fn rc(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(signal) => -signal,
            Self::LaunchFailed(_) => 127,
            Self::Terminated => -9,
        }
    }

    pub(crate) fn status_line(&self) -> String {
        match self {
            Self::Exited(_) | Self::Signaled(_) => format!("RETURN_CODE: {}", self.rc()),
            Self::LaunchFailed(err) => format!("LAUNCH_ERROR: {}", err),
            Self::Terminated => "TERMINATED".to_string(),
        }
    }
}

fn outcome_from_status(status: ExitStatus) -> JobOutcome {
    if let Some(code) = status.code() {
        return JobOutcome::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return JobOutcome::Signaled(signal);
        }
    }
    JobOutcome::Exited(1)
}

fn build_command(shell: &str, command: &str, args: &[String], env: &CommandEnv) -> Command {
    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(command);
    if !args.is_empty() {
        cmd.arg("--");
        cmd.args(args);
    }
    cmd.stdin(Stdio::null());
    // Own process group: a terminal Ctrl-C drains the pool instead of
    // reaching in-flight jobs.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    env.apply(&mut cmd);
    cmd
}

fn attach_output(cmd: &mut Command, output: JobOutput) -> std::io::Result<()> {
    match output {
        JobOutput::Inherit => {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
        JobOutput::Record(file) => {
            let err = file.try_clone()?;
            cmd.stdout(Stdio::from(file));
            cmd.stderr(Stdio::from(err));
        }
    }
    Ok(())
}

/// Runs `<shell> -c <command> -- <args>` and waits for it. The wait is never
/// interrupted by a drain; only `ShutdownLevel::Terminate` kills the child.
pub(crate) fn run_job(
    shell: &str,
    command: &str,
    args: &[String],
    env: &CommandEnv,
    output: JobOutput,
    token: &ShutdownToken,
) -> JobOutcome {
    let mut cmd = build_command(shell, command, args, env);
    if let Err(err) = attach_output(&mut cmd, output) {
        return JobOutcome::LaunchFailed(format!("cannot attach run record: {}", err));
    }
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return JobOutcome::LaunchFailed(format!("failed to run '{}': {}", shell, err))
        }
    };
    // The Command still holds the parent's copies of the output handles.
    drop(cmd);
    supervise(child, token)
}

fn supervise(mut child: Child, token: &ShutdownToken) -> JobOutcome {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return outcome_from_status(status),
            Ok(None) => {}
            Err(err) => {
                kill_job(&mut child);
                return JobOutcome::LaunchFailed(format!("wait failed: {}", err));
            }
        }
        if token.wait_for(ShutdownLevel::Terminate, WAIT_SLICE) {
            kill_job(&mut child);
            return JobOutcome::Terminated;
        }
    }
}

/// Kills the job's whole process group, so subshells and pipeline members
/// die with the shell, then reaps the shell.
fn kill_job(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        // The shell leads its own group (`process_group(0)`), so its pid is the pgid.
        let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

pub(crate) fn task_args(task_path: &Path) -> Vec<String> {
    vec![task_path.display().to_string()]
}
