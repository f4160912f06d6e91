use std::process::ExitCode;

mod app;
mod claim;
mod cli;
mod config;
mod logger;
mod pool_state;
mod recovery;
mod run_loop;
mod run_record;
mod shell;
mod status;
mod store;
mod supervisor;
mod task_types;
mod worker;


fn main() -> ExitCode {
    app::main()
}
