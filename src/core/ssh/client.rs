use crate::error::{Error, Result};
use crate::executor::CommandRunner;
use crate::target::{Credential, TargetDescriptor};
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};

/// Connection to one host of a target. Commands run through the system `ssh`.
pub struct SshClient {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            exit_code,
        }
    }
}

impl SshClient {
    /// Build a client for `host_entry` (`host` or `host:port`) of `target`.
    pub fn for_host(target: &TargetDescriptor, host_entry: &str) -> Result<Self> {
        let (host, port) = split_host_port(host_entry)?;

        let (identity_file, password) = match &target.credential {
            Some(Credential::KeyFile(path)) if !path.is_empty() => {
                let expanded = shellexpand::tilde(path).to_string();
                if !Path::new(&expanded).exists() {
                    return Err(Error::ssh_identity_file_not_found(host_entry, expanded));
                }
                (Some(expanded), None)
            }
            Some(Credential::Password(password)) => (None, Some(password.clone())),
            _ => (None, None),
        };

        Ok(Self {
            host,
            user: target.user.clone(),
            port,
            identity_file,
            password,
        })
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Key-based runs must never stop at a prompt; password runs are fed by sshpass.
        if self.password.is_none() {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        args.extend([
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        args.push(format!("{}@{}", self.user, self.host));
        args.push(command.to_string());

        args
    }

    fn build_command(&self, command: &str) -> Command {
        let args = self.build_ssh_args(command);
        match &self.password {
            Some(password) => {
                // sshpass -e reads the password from SSHPASS.
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").args(&args).env("SSHPASS", password);
                cmd
            }
            None => {
                let mut cmd = Command::new("ssh");
                cmd.args(&args);
                cmd
            }
        }
    }
}

impl CommandRunner for SshClient {
    fn label(&self) -> String {
        if self.port == 22 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn run(&self, command: &str, stdin_file: Option<&Path>) -> CommandOutput {
        let mut cmd = self.build_command(command);
        if let Err(failed) = attach_stdin(&mut cmd, stdin_file) {
            return failed;
        }
        capture(cmd, "SSH")
    }
}

/// Runs commands on the invoking machine through `sh -c`.
pub struct LocalRunner;

impl CommandRunner for LocalRunner {
    fn label(&self) -> String {
        "local".to_string()
    }

    fn run(&self, command: &str, stdin_file: Option<&Path>) -> CommandOutput {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        if let Err(failed) = attach_stdin(&mut cmd, stdin_file) {
            return failed;
        }
        capture(cmd, "Command")
    }
}

fn attach_stdin(
    cmd: &mut Command,
    stdin_file: Option<&Path>,
) -> std::result::Result<(), CommandOutput> {
    match stdin_file {
        Some(path) => match File::open(path) {
            Ok(file) => {
                cmd.stdin(file);
                Ok(())
            }
            Err(err) => Err(CommandOutput::failed(
                -1,
                format!("Failed to open stdin file: {}", err),
            )),
        },
        None => {
            cmd.stdin(Stdio::null());
            Ok(())
        }
    }
}

fn capture(mut cmd: Command, context: &str) -> CommandOutput {
    match cmd.output() {
        Ok(out) => CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            success: out.status.success(),
            exit_code: out.status.code().unwrap_or(-1),
        },
        Err(e) => CommandOutput::failed(-1, format!("{} error: {}", context, e)),
    }
}

/// Split `host[:port]`. Bare IPv6 addresses are accepted only in `[addr]:port` form.
pub fn split_host_port(entry: &str) -> Result<(String, u16)> {
    let invalid = || {
        Error::config_invalid_value(
            "hosts",
            Some(entry.to_string()),
            "Expected 'host' or 'host:port'",
        )
    };

    if entry.trim().is_empty() {
        return Err(invalid());
    }

    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None if tail.is_empty() => 22,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }

    match entry.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(invalid()),
        None => Ok((entry.to_string(), 22)),
    }
}
