//! Operations and the task graphs they run.
//!
//! - `catalog` - Task bodies (one per remote or local step)
//!
//! Each operation is a single dependency chain: every task depends on the one
//! declared before it, so steps run strictly in declaration order.

pub mod catalog;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::graph::TaskGraph;
use crate::overlay::Overlay;

const SETUP_FULL: &[&str] = &[
    "stop_processes",
    "add_deploy_user",
    "install_packages",
    "make_virtualenv",
    "setup_sites_dir",
    "setup_db",
    "clone_repo",
    "pull",
    "requirements",
    "migrate",
    "collectstatic",
    "gunicorn_config",
    "nginx_config",
    "start_processes",
];

const SETUP_DB: &[&str] = &["add_deploy_user", "install_packages", "setup_db"];

const DEPLOY: &[&str] = &[
    "pull",
    "requirements",
    "migrate",
    "collectstatic",
    "gunicorn_config",
    "nginx_config",
    "restart_gunicorn",
    "reload_nginx",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Setup,
    Deploy,
    Push,
    Test,
    /// A single catalog task with no dependencies.
    Task(String),
}

impl Operation {
    pub const NAMES: &'static [&'static str] = &["setup", "deploy", "push", "test"];

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "setup" => Ok(Operation::Setup),
            "deploy" => Ok(Operation::Deploy),
            "push" => Ok(Operation::Push),
            "test" => Ok(Operation::Test),
            other => Err(Error::validation_invalid_argument(
                "operation",
                format!("Unknown operation '{}'", other),
                Some(Self::NAMES.iter().map(|n| n.to_string()).collect()),
            )),
        }
    }

    pub fn task(name: &str) -> Result<Self> {
        if catalog::lookup(name).is_none() {
            return Err(Error::validation_invalid_argument(
                "task",
                format!("Unknown task '{}'", name),
                Some(catalog::names()),
            ));
        }
        Ok(Operation::Task(name.to_string()))
    }

    pub fn name(&self) -> String {
        match self {
            Operation::Setup => "setup".to_string(),
            Operation::Deploy => "deploy".to_string(),
            Operation::Push => "push".to_string(),
            Operation::Test => "test".to_string(),
            Operation::Task(name) => format!("task:{}", name),
        }
    }
}

/// Build the task graph for `operation`. The package list in `overlay`
/// selects the setup variant (`web` hosts get no database, `db` hosts only
/// get the user, packages and database).
pub fn build_graph(operation: &Operation, overlay: &Overlay) -> Result<TaskGraph> {
    let package_list = overlay
        .text("package_list")
        .unwrap_or_else(|| "full".to_string());

    let steps: Vec<&str> = match operation {
        Operation::Setup => match package_list.as_str() {
            "db" => SETUP_DB.to_vec(),
            "web" => SETUP_FULL
                .iter()
                .copied()
                .filter(|name| *name != "setup_db")
                .collect(),
            _ => SETUP_FULL.to_vec(),
        },
        Operation::Deploy => DEPLOY.to_vec(),
        Operation::Push => vec!["push"],
        Operation::Test => vec!["test"],
        Operation::Task(name) => vec![name.as_str()],
    };

    chain(&operation.name(), &steps)
}

/// True when every task of `graph` runs on the invoking machine.
pub fn runs_locally(graph: &TaskGraph) -> bool {
    !graph.is_empty() && graph.tasks().iter().all(|task| catalog::is_local(&task.name))
}

fn chain(graph_name: &str, steps: &[&str]) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new(graph_name);
    let mut previous: Option<&str> = None;

    for step in steps {
        let entry = catalog::lookup(step).ok_or_else(|| {
            Error::validation_invalid_argument(
                "task",
                format!("Unknown task '{}'", step),
                Some(catalog::names()),
            )
        })?;
        let depends_on: Vec<&str> = previous.into_iter().collect();
        graph.add_task(entry.name, &depends_on, entry.body, entry.policy);
        previous = Some(entry.name);
    }

    graph.validate()?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(package_list: &str) -> Overlay {
        Overlay::builder().set("package_list", package_list).build()
    }

    fn order(operation: Operation, package_list: &str) -> Vec<String> {
        build_graph(&operation, &overlay(package_list))
            .unwrap()
            .plan()
            .unwrap()
            .into_iter()
            .map(|task| task.name)
            .collect()
    }

    #[test]
    fn setup_runs_full_sequence_in_order() {
        assert_eq!(order(Operation::Setup, "full"), SETUP_FULL.to_vec());
    }

    #[test]
    fn setup_variants_follow_package_list() {
        let web = order(Operation::Setup, "web");
        assert!(!web.contains(&"setup_db".to_string()));
        assert_eq!(web.len(), SETUP_FULL.len() - 1);

        assert_eq!(order(Operation::Setup, "db"), SETUP_DB.to_vec());
    }

    #[test]
    fn deploy_ends_with_service_refresh() {
        let deploy = order(Operation::Deploy, "full");
        assert_eq!(deploy.first().map(String::as_str), Some("pull"));
        assert_eq!(deploy.last().map(String::as_str), Some("reload_nginx"));
    }

    #[test]
    fn only_push_and_test_graphs_run_locally() {
        let local = |operation| runs_locally(&build_graph(&operation, &overlay("full")).unwrap());
        assert!(local(Operation::Push));
        assert!(local(Operation::Test));
        assert!(local(Operation::Task("push".to_string())));
        assert!(!local(Operation::Deploy));
        assert!(!local(Operation::Task("pull".to_string())));
    }

    #[test]
    fn operation_parsing() {
        assert_eq!(Operation::parse("deploy").unwrap(), Operation::Deploy);
        assert!(Operation::parse("Deploy").is_err());
        assert_eq!(
            Operation::task("migrate").unwrap(),
            Operation::Task("migrate".to_string())
        );
        assert!(Operation::task("format_disk").is_err());
        assert_eq!(Operation::Task("pull".to_string()).name(), "task:pull");
    }

    #[test]
    fn every_catalog_task_builds_as_single_task_graph() {
        for entry in catalog::entries() {
            let graph =
                build_graph(&Operation::Task(entry.name.to_string()), &overlay("full")).unwrap();
            assert_eq!(graph.len(), 1);
        }
    }
}
