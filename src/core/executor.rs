// Command execution for task bodies.
//
// ## Composition of one call
//
// 1. The `CommandTemplate` is rendered against the run's overlay. Values are
//    substituted verbatim: nothing is quoted, so overlay values reach the shell
//    exactly as written.
// 2. Per-call scopes are prepended: `cd <dir> && <prefix> && <command>`. They
//    live only inside that one command line, so nothing leaks into the next
//    call whether this one succeeded or not.
// 3. Remote calls are wrapped in a login shell (`bash -l -c '...'`), under
//    `sudo -n -H [-u <user>]` when `as_user` is set. Only this wrapper quotes.
//
// ## Failure handling
//
// A non-zero exit is an `Err(remote.command_failed)` unless the call is
// tolerant, in which case the failed `CommandResult` is returned for the task
// body to branch on. Nothing is ever retried.

use serde::Serialize;
use std::cell::RefCell;
use std::path::Path;

use crate::error::{Error, RemoteCommandFailedDetails, Result, TargetDetails};
use crate::overlay::Overlay;
use crate::ssh::CommandOutput;
use crate::utils::shell;

/// Identity that maps to plain `sudo` (no `-u`).
pub const ROOT: &str = "root";

/// Transport for fully composed command lines.
pub trait CommandRunner {
    /// Short name used in logs and failure details (host or `local`).
    fn label(&self) -> String;

    /// Run `command`, feeding `stdin_file` to it when given.
    fn run(&self, command: &str, stdin_file: Option<&Path>) -> CommandOutput;
}

/// A command to run, rendered against the overlay only at execution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTemplate {
    /// Shell text kept exactly as written; only placeholders change.
    Literal(String),
    /// Program plus arguments, joined by single spaces when rendered.
    Argv { program: String, args: Vec<String> },
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        CommandTemplate::Argv {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(self, arg: impl Into<String>) -> Self {
        self.args([arg])
    }

    pub fn args<I, S>(self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self {
            CommandTemplate::Argv { program, mut args } => {
                args.extend(extra.into_iter().map(Into::into));
                CommandTemplate::Argv { program, args }
            }
            CommandTemplate::Literal(mut text) => {
                for arg in extra {
                    text.push(' ');
                    text.push_str(&arg.into());
                }
                CommandTemplate::Literal(text)
            }
        }
    }

    /// Overlay-substituted command text.
    pub fn render(&self, overlay: &Overlay) -> Result<String> {
        match self {
            CommandTemplate::Literal(text) => overlay.render(text),
            CommandTemplate::Argv { program, args } => {
                let mut parts = Vec::with_capacity(args.len() + 1);
                parts.push(overlay.render(program)?);
                for arg in args {
                    parts.push(overlay.render(arg)?);
                }
                Ok(parts.join(" "))
            }
        }
    }
}

impl From<&str> for CommandTemplate {
    fn from(text: &str) -> Self {
        CommandTemplate::Literal(text.to_string())
    }
}

impl From<String> for CommandTemplate {
    fn from(text: String) -> Self {
        CommandTemplate::Literal(text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub as_user: Option<String>,
    pub tolerate_failure: bool,
    pub working_directory: Option<String>,
    pub environment_prefix: Option<String>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run as root.
    pub fn sudo() -> Self {
        Self::new().as_user(ROOT)
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.as_user = Some(user.into());
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.environment_prefix = Some(prefix.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl CommandResult {
    pub fn failed(&self) -> bool {
        !self.success
    }

    pub fn succeeded(&self) -> bool {
        self.success
    }
}

/// One command issued during a task, kept for the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCommand {
    pub command: String,
    pub target: String,
    pub success: bool,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub tolerated: bool,
}

/// Executor bound to one host of a resolved target.
pub struct Executor<'a> {
    overlay: &'a Overlay,
    remote: &'a dyn CommandRunner,
    local: &'a dyn CommandRunner,
    environment: String,
    issued: RefCell<Vec<IssuedCommand>>,
}

impl<'a> Executor<'a> {
    pub fn new(
        overlay: &'a Overlay,
        remote: &'a dyn CommandRunner,
        local: &'a dyn CommandRunner,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            overlay,
            remote,
            local,
            environment: environment.into(),
            issued: RefCell::new(Vec::new()),
        }
    }

    /// Run a command on the remote host.
    pub fn execute(
        &self,
        command: impl Into<CommandTemplate>,
        options: &ExecOptions,
    ) -> Result<CommandResult> {
        let text = command.into().render(self.overlay)?;
        let composed = self.compose(&text, options)?;
        let line = self.wrap_remote(&composed, options)?;
        log_status!("exec", "[{}] {}", self.remote.label(), composed);

        let output = self.remote.run(&line, None);
        self.finish(self.remote, text, output, options)
    }

    /// Run a command on the invoking machine. `as_user` is not supported here.
    pub fn execute_local(
        &self,
        command: impl Into<CommandTemplate>,
        options: &ExecOptions,
    ) -> Result<CommandResult> {
        if options.as_user.is_some() {
            return Err(Error::validation_invalid_argument(
                "as_user",
                "Local commands always run as the invoking user",
                None,
            ));
        }

        let text = command.into().render(self.overlay)?;
        let composed = self.compose(&text, options)?;
        log_status!("local", "{}", composed);

        let output = self.local.run(&composed, None);
        self.finish(self.local, text, output, options)
    }

    /// Copy a local file byte-for-byte to `remote_path` on the remote host.
    pub fn upload(
        &self,
        local_path: &str,
        remote_path: &str,
        options: &ExecOptions,
    ) -> Result<CommandResult> {
        let local_path = self.overlay.render(local_path)?;
        let remote_path = self.overlay.render(remote_path)?;
        if !Path::new(&local_path).is_file() {
            return Err(Error::internal_io(
                format!("Local file not found: {}", local_path),
                Some("upload".to_string()),
            ));
        }

        let write = format!("cat > {}", shell::quote_path(&remote_path));
        let line = self.wrap_remote(&write, options)?;
        let text = format!("put {} {}", local_path, remote_path);
        log_status!("exec", "[{}] {}", self.remote.label(), text);

        let output = self.remote.run(&line, Some(Path::new(&local_path)));
        self.finish(self.remote, text, output, options)
    }

    /// Drain the commands issued since the last call.
    pub fn take_issued(&self) -> Vec<IssuedCommand> {
        std::mem::take(&mut *self.issued.borrow_mut())
    }

    fn compose(&self, text: &str, options: &ExecOptions) -> Result<String> {
        let mut parts = Vec::with_capacity(3);
        if let Some(dir) = &options.working_directory {
            parts.push(format!("cd {}", self.overlay.render(dir)?));
        }
        if let Some(prefix) = &options.environment_prefix {
            parts.push(self.overlay.render(prefix)?);
        }
        parts.push(text.to_string());
        Ok(parts.join(" && "))
    }

    fn wrap_remote(&self, composed: &str, options: &ExecOptions) -> Result<String> {
        let shell_line = format!("bash -l -c {}", shell::escape_command_for_shell(composed));
        let line = match &options.as_user {
            None => shell_line,
            Some(user) => {
                let user = self.overlay.render(user)?;
                if user == ROOT {
                    format!("sudo -n -H {}", shell_line)
                } else {
                    format!("sudo -n -H -u {} {}", user, shell_line)
                }
            }
        };
        Ok(line)
    }

    fn finish(
        &self,
        runner: &dyn CommandRunner,
        text: String,
        output: CommandOutput,
        options: &ExecOptions,
    ) -> Result<CommandResult> {
        let target = runner.label();
        self.issued.borrow_mut().push(IssuedCommand {
            command: text.clone(),
            target: target.clone(),
            success: output.success,
            exit_code: output.exit_code,
            tolerated: !output.success && options.tolerate_failure,
        });

        if !output.success && !options.tolerate_failure {
            return Err(Error::remote_command_failed(RemoteCommandFailedDetails {
                command: text,
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
                target: TargetDetails {
                    environment: Some(self.environment.clone()),
                    host: Some(target),
                },
            }));
        }

        if !output.success {
            log_status!(
                "exec",
                "warning: '{}' exited with {} (tolerated)",
                text,
                output.exit_code
            );
        }

        Ok(CommandResult {
            command: text,
            success: output.success,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Prints what would run and reports success without running anything.
pub struct DryRunRunner {
    label: String,
}

impl DryRunRunner {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl CommandRunner for DryRunRunner {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn run(&self, command: &str, _stdin_file: Option<&Path>) -> CommandOutput {
        log_status!("dry-run", "[{}] {}", self.label, command);
        CommandOutput::ok("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::collections::VecDeque;

    /// Records every line and answers from a queue (success once it runs dry).
    struct Recorder {
        lines: RefCell<Vec<String>>,
        answers: RefCell<VecDeque<CommandOutput>>,
    }

    impl Recorder {
        fn new(answers: Vec<CommandOutput>) -> Self {
            Self {
                lines: RefCell::new(Vec::new()),
                answers: RefCell::new(answers.into()),
            }
        }
    }

    impl CommandRunner for Recorder {
        fn label(&self) -> String {
            "web1".to_string()
        }

        fn run(&self, command: &str, _stdin_file: Option<&Path>) -> CommandOutput {
            self.lines.borrow_mut().push(command.to_string());
            self.answers
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| CommandOutput::ok(""))
        }
    }

    fn overlay() -> Overlay {
        Overlay::builder()
            .set("code_dir", "/srv/sites/webapp")
            .set("virtualenv", "webapp")
            .set("deploy_user", "deploy")
            .build()
    }

    #[test]
    fn template_renders_overlay_values_verbatim() {
        let template = CommandTemplate::new("git")
            .arg("clone")
            .args(["{{code_dir}}", "--branch"]);
        assert_eq!(
            template.render(&overlay()).unwrap(),
            "git clone /srv/sites/webapp --branch"
        );
    }

    #[test]
    fn string_commands_keep_their_exact_text() {
        let overlay = overlay();
        let remote = Recorder::new(vec![]);
        let local = Recorder::new(vec![]);
        let exec = Executor::new(&overlay, &remote, &local, "staging");

        exec.execute_local("echo 'a    b'", &ExecOptions::new())
            .unwrap();
        exec.execute_local("printf '%s\\t%s\\n'\t{{virtualenv}}  x", &ExecOptions::new())
            .unwrap();

        let lines = local.lines.borrow();
        assert_eq!(lines[0], "echo 'a    b'");
        assert_eq!(lines[1], "printf '%s\\t%s\\n'\twebapp  x");
        assert_eq!(
            CommandTemplate::from("echo   {{virtualenv}}").arg("done").render(&overlay).unwrap(),
            "echo   webapp done"
        );
    }

    #[test]
    fn sudo_as_user_wraps_in_login_shell() {
        let overlay = overlay();
        let remote = Recorder::new(vec![]);
        let exec = Executor::new(&overlay, &remote, &remote, "staging");

        exec.execute(
            "pip install -r requirements.txt",
            &ExecOptions::new()
                .as_user("{{deploy_user}}")
                .cwd("{{code_dir}}")
                .prefix("workon {{virtualenv}}"),
        )
        .unwrap();

        assert_eq!(
            remote.lines.borrow()[0],
            "sudo -n -H -u deploy bash -l -c 'cd /srv/sites/webapp && workon webapp && pip install -r requirements.txt'"
        );
    }

    #[test]
    fn root_uses_plain_sudo() {
        let overlay = overlay();
        let remote = Recorder::new(vec![]);
        let exec = Executor::new(&overlay, &remote, &remote, "staging");

        exec.execute("aptitude update", &ExecOptions::sudo()).unwrap();
        assert_eq!(remote.lines.borrow()[0], "sudo -n -H bash -l -c 'aptitude update'");
    }

    #[test]
    fn failure_is_fatal_unless_tolerated() {
        let overlay = overlay();
        let remote = Recorder::new(vec![
            CommandOutput::failed(1, "no such user"),
            CommandOutput::failed(1, "no such user"),
        ]);
        let exec = Executor::new(&overlay, &remote, &remote, "staging");

        let err = exec.execute("id deploy", &ExecOptions::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
        assert_eq!(err.details["stderr"], "no such user");
        assert_eq!(err.details["target"]["host"], "web1");

        let result = exec
            .execute("id deploy", &ExecOptions::new().tolerant())
            .unwrap();
        assert!(result.failed());

        let issued = exec.take_issued();
        assert_eq!(issued.len(), 2);
        assert!(!issued[0].tolerated);
        assert!(issued[1].tolerated);
        assert!(exec.take_issued().is_empty());
    }

    #[test]
    fn scoped_directory_and_prefix_do_not_leak_after_failure() {
        let overlay = overlay();
        let remote = Recorder::new(vec![CommandOutput::failed(2, "boom")]);
        let exec = Executor::new(&overlay, &remote, &remote, "staging");

        let scoped = ExecOptions::new()
            .cwd("{{code_dir}}")
            .prefix("workon {{virtualenv}}");
        assert!(exec.execute("git pull", &scoped).is_err());
        exec.execute("uptime", &ExecOptions::new()).unwrap();

        let lines = remote.lines.borrow();
        assert!(lines[0].contains("cd /srv/sites/webapp && workon webapp && git pull"));
        assert_eq!(lines[1], "bash -l -c 'uptime'");
    }

    #[test]
    fn missing_overlay_key_never_reaches_runner() {
        let overlay = overlay();
        let remote = Recorder::new(vec![]);
        let exec = Executor::new(&overlay, &remote, &remote, "staging");

        let err = exec
            .execute("createdb {{db_name}}", &ExecOptions::sudo())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigMissingKey);
        assert!(remote.lines.borrow().is_empty());
    }

    #[test]
    fn local_execution_rejects_as_user_and_skips_wrapper() {
        let overlay = overlay();
        let remote = Recorder::new(vec![]);
        let local = Recorder::new(vec![]);
        let exec = Executor::new(&overlay, &remote, &local, "staging");

        assert!(exec
            .execute_local("git push origin master", &ExecOptions::sudo())
            .is_err());
        exec.execute_local("git push origin master", &ExecOptions::new())
            .unwrap();

        assert_eq!(local.lines.borrow()[0], "git push origin master");
        assert!(remote.lines.borrow().is_empty());
    }

    #[test]
    fn upload_streams_file_to_quoted_remote_path() {
        let overlay = overlay();
        let remote = Recorder::new(vec![]);
        let exec = Executor::new(&overlay, &remote, &remote, "staging");
        let file = tempfile::NamedTempFile::new().unwrap();
        let local_path = file.path().display().to_string();

        let result = exec
            .upload(
                &local_path,
                "/home/{{deploy_user}}/.bash_profile",
                &ExecOptions::sudo(),
            )
            .unwrap();

        assert!(result.succeeded());
        assert_eq!(
            remote.lines.borrow()[0],
            "sudo -n -H bash -l -c 'cat > '\\''/home/deploy/.bash_profile'\\'''"
        );
    }

    #[test]
    fn upload_of_missing_local_file_fails_before_running() {
        let overlay = overlay();
        let remote = Recorder::new(vec![]);
        let exec = Executor::new(&overlay, &remote, &remote, "staging");

        let err = exec
            .upload("/nonexistent/.bash_profile", "/tmp/x", &ExecOptions::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalIoError);
        assert!(remote.lines.borrow().is_empty());
    }
}
