use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::GlobalArgs;

mod commands;
mod output;
mod tty;

use commands::{env, plan, run, task};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "groundwork")]
#[command(version = VERSION)]
#[command(about = "Provision and deploy a Django web stack over SSH")]
struct Cli {
    /// Path to a groundwork.json config file (defaults to ./groundwork.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an operation (setup, deploy, push, test) against an environment
    Run(run::RunArgs),
    /// Show the ordered task plan for an operation without running it
    Plan(plan::PlanArgs),
    /// List or inspect environments
    Env(env::EnvArgs),
    /// Run a single catalog task against an environment
    Task(task::TaskArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let global = GlobalArgs { config: cli.config };

    let (json_result, exit_code) = commands::run_json(cli.command, &global);

    if let Err(err) = output::print_json_result(json_result) {
        eprintln!("{}", err.message);
        return std::process::ExitCode::from(1);
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
