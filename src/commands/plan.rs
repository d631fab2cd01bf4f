use clap::Args;

use groundwork::executor::DryRunRunner;
use groundwork::orchestrator::{DryRunConnector, Orchestrator, RunPlan};
use groundwork::prompt::FixedAnswer;
use groundwork::target::VagrantCli;
use groundwork::tasks::Operation;

use super::CmdResult;

#[derive(Args)]
pub struct PlanArgs {
    /// Environment selector
    pub selector: String,

    /// Operation to plan: setup, deploy, push, test, or task:<name>
    pub operation: String,

    /// Override an overlay value (key=value, repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
}

pub fn run(args: PlanArgs, global: &crate::commands::GlobalArgs) -> CmdResult<RunPlan> {
    let operation = match args.operation.strip_prefix("task:") {
        Some(name) => Operation::task(name)?,
        None => Operation::parse(&args.operation)?,
    };

    let config = global.load_config()?;
    let local = DryRunRunner::new("local");
    let confirm = FixedAnswer(false);
    let plan = Orchestrator::new(&config, &VagrantCli, &DryRunConnector, &local, &confirm)
        .with_overrides(args.vars)
        .plan(&args.selector, &operation)?;

    Ok((plan, 0))
}
