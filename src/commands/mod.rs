use std::path::PathBuf;

use groundwork::defaults::{self, GroundworkConfig};
use groundwork::executor::DryRunRunner;
use groundwork::orchestrator::{Connector, DryRunConnector, Orchestrator, RunReport, SshConnector};
use groundwork::prompt::{Confirm, FixedAnswer};
use groundwork::ssh::LocalRunner;
use groundwork::target::VagrantCli;
use groundwork::tasks::Operation;

pub mod env;
pub mod plan;
pub mod run;
pub mod task;

pub type CmdResult<T> = groundwork::Result<(T, i32)>;

/// Exit code for a run that completed with at least one fatal task failure.
pub const EXIT_RUN_FAILED: i32 = 20;

pub(crate) struct GlobalArgs {
    pub config: Option<PathBuf>,
}

impl GlobalArgs {
    pub fn load_config(&self) -> groundwork::Result<GroundworkConfig> {
        defaults::load(self.config.as_deref())
    }
}

/// Flags shared by commands that execute tasks.
#[derive(clap::Args, Debug, Default)]
pub struct ExecutionArgs {
    /// Print the commands that would run without contacting any host
    #[arg(long)]
    pub dry_run: bool,

    /// Answer yes to every confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Override an overlay value (key=value, repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
}

/// Resolve, build and run `operation` against `selector` with real or
/// dry-run runners depending on `exec.dry_run`.
pub(crate) fn execute(
    selector: &str,
    operation: &Operation,
    exec: ExecutionArgs,
    global: &GlobalArgs,
) -> CmdResult<RunReport> {
    let config = global.load_config()?;
    let local_source = VagrantCli;

    let terminal = crate::tty::TerminalConfirm;
    let always = FixedAnswer(true);
    let confirm: &dyn Confirm = if exec.yes { &always } else { &terminal };

    let report = if exec.dry_run {
        let local = DryRunRunner::new("local");
        Orchestrator::new(&config, &local_source, &DryRunConnector, &local, confirm)
            .with_overrides(exec.vars)
            .with_dry_run(true)
            .run(selector, operation)?
    } else {
        let connector: &dyn Connector = &SshConnector;
        Orchestrator::new(&config, &local_source, connector, &LocalRunner, confirm)
            .with_overrides(exec.vars)
            .run(selector, operation)?
    };

    let exit_code = if report.success { 0 } else { EXIT_RUN_FAILED };
    Ok((report, exit_code))
}

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (groundwork::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Run(args) => dispatch!(args, global, run),
        crate::Commands::Plan(args) => dispatch!(args, global, plan),
        crate::Commands::Env(args) => dispatch!(args, global, env),
        crate::Commands::Task(args) => dispatch!(args, global, task),
    }
}
