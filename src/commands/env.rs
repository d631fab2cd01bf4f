use clap::{Args, Subcommand};
use serde::Serialize;

use groundwork::overlay::Overlay;
use groundwork::target::{TargetDescriptor, TargetResolver, VagrantCli};

use super::CmdResult;

#[derive(Args)]
pub struct EnvArgs {
    #[command(subcommand)]
    command: EnvCommand,
}

#[derive(Subcommand)]
enum EnvCommand {
    /// List every environment selector
    List,
    /// Resolve a selector and show its target and overlay
    Show {
        /// Environment selector
        selector: String,

        /// Override an overlay value (key=value, repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },
}

#[derive(Serialize)]
pub struct EnvSummary {
    pub selector: String,
    /// "static" for configured environments, "local" for vagrant machines.
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum EnvOutput {
    List { environments: Vec<EnvSummary> },
    Show { target: TargetDescriptor, overlay: Overlay },
}

pub fn run(args: EnvArgs, global: &crate::commands::GlobalArgs) -> CmdResult<EnvOutput> {
    let config = global.load_config()?;
    let resolver = TargetResolver::new(&config, &VagrantCli);

    match args.command {
        EnvCommand::List => {
            let environments = resolver
                .selectors()
                .into_iter()
                .map(|selector| match config.environments.get(&selector) {
                    Some(env) => EnvSummary {
                        kind: "static",
                        hosts: Some(env.hosts.clone()),
                        branch: Some(env.branch.clone()),
                        selector,
                    },
                    None => EnvSummary {
                        kind: "local",
                        hosts: None,
                        branch: None,
                        selector,
                    },
                })
                .collect();
            Ok((EnvOutput::List { environments }, 0))
        }
        EnvCommand::Show { selector, vars } => {
            let resolved = resolver.resolve_with(&selector, &vars)?;
            Ok((
                EnvOutput::Show {
                    target: resolved.descriptor,
                    overlay: resolved.overlay,
                },
                0,
            ))
        }
    }
}
