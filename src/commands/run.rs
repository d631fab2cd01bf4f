use clap::Args;

use groundwork::orchestrator::RunReport;
use groundwork::tasks::Operation;

use super::{CmdResult, ExecutionArgs};

#[derive(Args)]
pub struct RunArgs {
    /// Environment selector (production, staging, vagrant, vagrant_web, vagrant_db, ...)
    pub selector: String,

    /// Operation to run: setup, deploy, push or test
    pub operation: String,

    #[command(flatten)]
    pub exec: ExecutionArgs,
}

pub fn run(args: RunArgs, global: &crate::commands::GlobalArgs) -> CmdResult<RunReport> {
    // Operation names are easy to swap with the selector.
    if Operation::NAMES.contains(&args.selector.as_str())
        && !Operation::NAMES.contains(&args.operation.as_str())
    {
        return Err(groundwork::Error::validation_invalid_argument(
            "selector",
            format!(
                "'{}' is an operation, not an environment. Usage: groundwork run <selector> <operation>",
                args.selector
            ),
            None,
        ));
    }

    let operation = Operation::parse(&args.operation)?;
    super::execute(&args.selector, &operation, args.exec, global)
}
