use clap::Args;

use groundwork::orchestrator::RunReport;
use groundwork::tasks::Operation;

use super::{CmdResult, ExecutionArgs};

#[derive(Args)]
pub struct TaskArgs {
    /// Environment selector
    pub selector: String,

    /// Catalog task to run on its own, without its usual predecessors
    pub name: String,

    #[command(flatten)]
    pub exec: ExecutionArgs,
}

pub fn run(args: TaskArgs, global: &crate::commands::GlobalArgs) -> CmdResult<RunReport> {
    let operation = Operation::task(&args.name)?;
    super::execute(&args.selector, &operation, args.exec, global)
}
