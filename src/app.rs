use clap::Parser;
use std::env;
use std::ffi::OsString;
use std::process::ExitCode;
use std::sync::Arc;

use crate::cli::{Cli, CliCommand};
use crate::config::{load_config, Config, FileConfig};
use crate::logger::{sanitize_log_value, Logger};
use crate::pool_state::ShutdownToken;
use crate::status::{collect_status, render_json, render_text};
use crate::store::DirStore;
use crate::supervisor::Supervisor;

const EXIT_TERMINATED: i32 = 130;

#[derive(Debug)]
pub(crate) struct Quit {
    pub(crate) code: i32,
}

impl Quit {
    pub(crate) fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code as u8)
    }
}

pub(crate) fn quit(logger: &Logger, reason: &str, code: i32) -> Quit {
    let sanitized = if reason.trim().is_empty() {
        "unknown".to_string()
    } else {
        sanitize_log_value(reason)
    };
    logger.log_transition(&format!("quit reason={}", sanitized));
    Quit { code }
}

/// Errors before the logger exists go to stderr only.
fn startup_error(message: String) -> Quit {
    eprintln!("{}", message);
    Quit { code: 1 }
}

fn resolve_config(cli: &mut Cli) -> Result<Config, Quit> {
    let from_file = match &cli.config {
        Some(path) => load_config(path).map_err(startup_error)?.config,
        None => FileConfig::default(),
    };
    let overrides = std::mem::take(&mut cli.options).into_overrides();
    Config::resolve(from_file.merge(overrides)).map_err(startup_error)
}

fn run_status(config: &Config, json: bool) -> Result<(), Quit> {
    let store = DirStore::attach(config.layout.clone());
    let report = collect_status(&store, store.has_failed_area())
        .map_err(|err| startup_error(err.to_string()))?;
    let rendered = if json {
        render_json(&report).map_err(startup_error)?
    } else {
        render_text(&report)
    };
    println!("{}", rendered.trim_end());
    Ok(())
}

fn install_signal_handler(token: &Arc<ShutdownToken>, logger: &Arc<Logger>) {
    let token = Arc::clone(token);
    let logger = Arc::clone(logger);
    if let Err(err) = ctrlc::set_handler(move || {
        if token.cancel("signal") {
            logger.log_transition("signal action=drain");
        } else if token.terminate("signal") {
            logger.log_transition("signal action=terminate");
        }
    }) {
        eprintln!("Failed to set interrupt handler: {}", err);
    }
}

fn run_pool(config: Config) -> Result<(), Quit> {
    let logger = Arc::new(Logger::new(config.log_path.clone()));
    let pool = config
        .pool_settings()
        .map_err(|message| quit(&logger, &message, 1))?;
    let store = DirStore::open(config.layout.clone())
        .map_err(|err| quit(&logger, &err.to_string(), 1))?;
    if let Some(logs_dir) = &config.logs_dir {
        std::fs::create_dir_all(logs_dir).map_err(|err| {
            quit(
                &logger,
                &format!("cannot create logs directory {}: {}", logs_dir.display(), err),
                1,
            )
        })?;
    }

    let token = Arc::new(ShutdownToken::new());
    install_signal_handler(&token, &logger);

    let poll = config.poll_settings();
    let job = config.job_settings();
    let supervisor = Supervisor {
        store: &store,
        pool: &pool,
        poll: &poll,
        job: &job,
        logger: &logger,
        token: &token,
    };
    let report = supervisor
        .run()
        .map_err(|err| quit(&logger, &err.to_string(), 1))?;

    if report.terminated {
        return Err(quit(&logger, "terminated", EXIT_TERMINATED));
    }
    Ok(())
}

pub(crate) fn run_with_cli(mut cli: Cli) -> Result<(), Quit> {
    let config = resolve_config(&mut cli)?;
    match cli.command {
        Some(CliCommand::Status { json }) => run_status(&config, json),
        None => run_pool(config),
    }
}

pub(crate) fn run_with_args(args: Vec<OsString>) -> Result<(), Quit> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            // clap's `Error::print()` uses termcolor and can bypass Rust's test output
            // capturing. Rendering it ourselves keeps CLI errors capture-friendly.
            eprintln!("{err}");
            return Err(Quit {
                code: err.exit_code(),
            });
        }
    };
    run_with_cli(cli)
}

pub(crate) fn main_with_args(args: Vec<OsString>) -> ExitCode {
    let result = run_with_args(args);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(quit) => quit.exit_code(),
    }
}

pub(crate) fn main() -> ExitCode {
    main_with_args(env::args_os().collect())
}
