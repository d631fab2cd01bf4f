use serde::Serialize;
use std::time::Instant;

use crate::defaults::GroundworkConfig;
use crate::error::{Error, ErrorCode, Hint, Result};
use crate::executor::{CommandRunner, DryRunRunner, Executor, IssuedCommand};
use crate::graph::{FailurePolicy, PlannedTask, TaskContext, TaskGraph};
use crate::overlay::Overlay;
use crate::prompt::Confirm;
use crate::ssh::{CommandOutput, SshClient};
use crate::target::{LocalConnectionSource, TargetDescriptor, TargetResolver};
use crate::tasks::{self, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    NotRun,
    Succeeded,
    FailedTolerated,
    FailedFatal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<Hint>,
}

impl From<&Error> for TaskFailure {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            details: err.details.clone(),
            hints: err.hints.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub name: String,
    pub policy: FailurePolicy,
    pub outcome: TaskOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<IssuedCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostReport {
    pub host: String,
    pub success: bool,
    pub tasks: Vec<TaskReport>,
    /// Set when the host could not be reached at all (no task ran).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

impl HostReport {
    pub fn outcome_of(&self, task: &str) -> Option<TaskOutcome> {
        self.tasks.iter().find(|t| t.name == task).map(|t| t.outcome)
    }

    /// Names of tasks that ran (succeeded or failed), in execution order.
    pub fn executed(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.outcome != TaskOutcome::NotRun)
            .map(|t| t.name.as_str())
            .collect()
    }

    fn unreachable(host: &str, order: &[usize], graph: &TaskGraph, err: &Error) -> Self {
        let tasks = order
            .iter()
            .map(|&idx| not_run(&graph.tasks()[idx].name, graph.tasks()[idx].policy))
            .collect();
        Self {
            host: host.to_string(),
            success: false,
            tasks,
            error: Some(TaskFailure::from(err)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub environment: String,
    pub operation: String,
    pub dry_run: bool,
    pub started_at: String,
    pub finished_at: String,
    pub success: bool,
    pub hosts: Vec<HostReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPlan {
    pub environment: String,
    pub operation: String,
    /// Every task runs on the invoking machine, so no host is contacted.
    pub local_only: bool,
    pub target: TargetDescriptor,
    pub overlay: Overlay,
    pub tasks: Vec<PlannedTask>,
}

/// Opens a remote runner for one host of a target.
pub trait Connector {
    fn connect(&self, target: &TargetDescriptor, host: &str) -> Result<Box<dyn CommandRunner>>;
}

pub struct SshConnector;

impl Connector for SshConnector {
    fn connect(&self, target: &TargetDescriptor, host: &str) -> Result<Box<dyn CommandRunner>> {
        Ok(Box::new(SshClient::for_host(target, host)?))
    }
}

pub struct DryRunConnector;

impl Connector for DryRunConnector {
    fn connect(&self, _target: &TargetDescriptor, host: &str) -> Result<Box<dyn CommandRunner>> {
        Ok(Box::new(DryRunRunner::new(host)))
    }
}

pub struct Orchestrator<'a> {
    config: &'a GroundworkConfig,
    local_source: &'a dyn LocalConnectionSource,
    connector: &'a dyn Connector,
    local_runner: &'a dyn CommandRunner,
    confirm: &'a dyn Confirm,
    overrides: Vec<String>,
    dry_run: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a GroundworkConfig,
        local_source: &'a dyn LocalConnectionSource,
        connector: &'a dyn Connector,
        local_runner: &'a dyn CommandRunner,
        confirm: &'a dyn Confirm,
    ) -> Self {
        Self {
            config,
            local_source,
            connector,
            local_runner,
            confirm,
            overrides: Vec::new(),
            dry_run: false,
        }
    }

    /// `key=value` overlay overrides applied at resolution time.
    pub fn with_overrides(mut self, overrides: Vec<String>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Mark reports as dry runs. The caller supplies the dry-run runners.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Resolve and build without touching any host.
    pub fn plan(&self, selector: &str, operation: &Operation) -> Result<RunPlan> {
        let resolved = TargetResolver::new(self.config, self.local_source)
            .resolve_with(selector, &self.overrides)?;
        let graph = tasks::build_graph(operation, &resolved.overlay)?;
        let planned = graph
            .plan()?
            .into_iter()
            .map(|mut task| {
                task.description = tasks::catalog::lookup(&task.name)
                    .map(|entry| entry.description.to_string());
                task
            })
            .collect();

        Ok(RunPlan {
            environment: selector.to_string(),
            operation: operation.name(),
            local_only: tasks::runs_locally(&graph),
            tasks: planned,
            target: resolved.descriptor,
            overlay: resolved.overlay,
        })
    }

    /// Resolve `selector`, build the graph for `operation`, and run it on
    /// every host in turn. Resolution and graph errors are returned before any
    /// host is contacted; task failures are reported per host.
    ///
    /// A graph made only of local tasks runs once, under the host name
    /// `local`, without connecting to any host.
    pub fn run(&self, selector: &str, operation: &Operation) -> Result<RunReport> {
        let started_at = chrono::Utc::now().to_rfc3339();
        let resolved = TargetResolver::new(self.config, self.local_source)
            .resolve_with(selector, &self.overrides)?;
        let graph = tasks::build_graph(operation, &resolved.overlay)?;
        let order = graph.execution_order()?;

        let local_only = tasks::runs_locally(&graph);
        let targets: Vec<String> = if local_only {
            vec![LOCAL_HOST.to_string()]
        } else {
            resolved.descriptor.hosts.clone()
        };

        log_status!(
            "run",
            "{} on '{}' ({} host(s), {} task(s))",
            operation.name(),
            selector,
            targets.len(),
            order.len()
        );

        let mut hosts = Vec::with_capacity(targets.len());
        for host in &targets {
            if local_only {
                hosts.push(run_ordered(
                    &graph,
                    &order,
                    &resolved.overlay,
                    host,
                    &NoRemote,
                    self.local_runner,
                    self.confirm,
                    selector,
                ));
                continue;
            }

            let report = match self.connector.connect(&resolved.descriptor, host) {
                Ok(remote) => run_ordered(
                    &graph,
                    &order,
                    &resolved.overlay,
                    host,
                    remote.as_ref(),
                    self.local_runner,
                    self.confirm,
                    selector,
                ),
                Err(err) => {
                    log_status!("run", "[{}] cannot connect: {}", host, err.message);
                    HostReport::unreachable(host, &order, &graph, &err)
                }
            };
            hosts.push(report);
        }

        let success = hosts.iter().all(|h| h.success);
        Ok(RunReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            environment: selector.to_string(),
            operation: operation.name(),
            dry_run: self.dry_run,
            started_at,
            finished_at: chrono::Utc::now().to_rfc3339(),
            success,
            hosts,
        })
    }
}

/// Host name reported for runs that never leave the invoking machine.
pub const LOCAL_HOST: &str = "local";

/// Remote side of a local-only run. Any remote command fails.
struct NoRemote;

impl CommandRunner for NoRemote {
    fn label(&self) -> String {
        LOCAL_HOST.to_string()
    }

    fn run(&self, _command: &str, _stdin_file: Option<&std::path::Path>) -> CommandOutput {
        CommandOutput::failed(255, "No remote host is connected for a local-only run")
    }
}

/// Run a validated graph against one host.
pub fn run_host(
    graph: &TaskGraph,
    overlay: &Overlay,
    host: &str,
    remote: &dyn CommandRunner,
    local: &dyn CommandRunner,
    confirm: &dyn Confirm,
    environment: &str,
) -> Result<HostReport> {
    let order = graph.execution_order()?;
    Ok(run_ordered(
        graph,
        &order,
        overlay,
        host,
        remote,
        local,
        confirm,
        environment,
    ))
}

#[allow(clippy::too_many_arguments)]
fn run_ordered(
    graph: &TaskGraph,
    order: &[usize],
    overlay: &Overlay,
    host: &str,
    remote: &dyn CommandRunner,
    local: &dyn CommandRunner,
    confirm: &dyn Confirm,
    environment: &str,
) -> HostReport {
    let exec = Executor::new(overlay, remote, local, environment);
    let ctx = TaskContext {
        overlay,
        exec: &exec,
        confirm,
        host,
    };

    let mut halted = false;
    let mut reports = Vec::with_capacity(order.len());

    for &idx in order {
        let task = &graph.tasks()[idx];
        if halted {
            reports.push(not_run(&task.name, task.policy));
            continue;
        }

        log_status!("task", "[{}] {}", host, task.name);
        let started = Instant::now();
        let result = task.run(&ctx);
        let duration_ms = Some(started.elapsed().as_millis() as u64);
        let commands = exec.take_issued();

        let (outcome, error) = match result {
            Ok(()) => (TaskOutcome::Succeeded, None),
            Err(err) if is_tolerated(task.policy, &err) => {
                log_status!(
                    "task",
                    "warning: '{}' failed (tolerated): {}",
                    task.name,
                    err.message
                );
                (TaskOutcome::FailedTolerated, Some(TaskFailure::from(&err)))
            }
            Err(err) => {
                report_fatal(host, &task.name, &err);
                halted = true;
                (TaskOutcome::FailedFatal, Some(TaskFailure::from(&err)))
            }
        };

        reports.push(TaskReport {
            name: task.name.clone(),
            policy: task.policy,
            outcome,
            commands,
            error,
            duration_ms,
        });
    }

    HostReport {
        host: host.to_string(),
        success: !halted,
        tasks: reports,
        error: None,
    }
}

fn is_tolerated(policy: FailurePolicy, err: &Error) -> bool {
    policy == FailurePolicy::Tolerant && err.code != ErrorCode::RunUserAborted
}

fn not_run(name: &str, policy: FailurePolicy) -> TaskReport {
    TaskReport {
        name: name.to_string(),
        policy,
        outcome: TaskOutcome::NotRun,
        commands: Vec::new(),
        error: None,
        duration_ms: None,
    }
}

fn report_fatal(host: &str, task: &str, err: &Error) {
    log_status!("task", "[{}] '{}' failed: {}", host, task, err.message);
    if err.code == ErrorCode::RemoteCommandFailed {
        for stream in ["stdout", "stderr"] {
            if let Some(text) = err.details[stream].as_str().filter(|s| !s.trim().is_empty()) {
                log_status!("task", "{}:\n{}", stream, text.trim_end());
            }
        }
    }
}
