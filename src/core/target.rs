//! Target resolution: environment selector -> connection descriptor + overlay.
//!
//! Resolution never contacts the remote target. The only side effect is the
//! optional local `vagrant ssh-config` query for the dynamic environments.

use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::process::Command;

use crate::defaults::{GroundworkConfig, StaticEnvironment};
use crate::error::{Error, Result};
use crate::overlay::Overlay;

/// Dynamic selectors and the vagrant machine each one queries.
const VAGRANT_SELECTORS: &[(&str, Option<&str>, &str)] = &[
    ("vagrant", None, "full"),
    ("vagrant_web", Some("web"), "web"),
    ("vagrant_db", Some("db"), "db"),
];

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    KeyFile(String),
    Password(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

fn serialize_credential<S: Serializer>(
    credential: &Option<Credential>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match credential {
        Some(Credential::KeyFile(path)) => serializer.serialize_str(&format!("key_file:{}", path)),
        Some(Credential::Password(_)) => serializer.serialize_str("password:<redacted>"),
        None => serializer.serialize_none(),
    }
}

/// Where commands run. Built once per invocation and never modified.
#[derive(Debug, Clone, Serialize)]
pub struct TargetDescriptor {
    pub environment: String,
    pub hosts: Vec<String>,
    pub user: String,
    #[serde(serialize_with = "serialize_credential")]
    pub credential: Option<Credential>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_list: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub descriptor: TargetDescriptor,
    pub overlay: Overlay,
}

/// Source of `ssh-config` style connection info for local virtual machines.
pub trait LocalConnectionSource {
    /// Raw `Key Value` lines for `machine` (or the default machine).
    fn ssh_config(&self, machine: Option<&str>) -> std::result::Result<String, LocalQueryError>;
}

#[derive(Debug, Clone)]
pub struct LocalQueryError {
    pub problem: String,
    pub output: String,
}

/// Queries `vagrant ssh-config` on the invoking machine.
pub struct VagrantCli;

impl LocalConnectionSource for VagrantCli {
    fn ssh_config(&self, machine: Option<&str>) -> std::result::Result<String, LocalQueryError> {
        let mut cmd = Command::new("vagrant");
        cmd.arg("ssh-config");
        if let Some(machine) = machine {
            cmd.arg(machine);
        }

        let output = cmd.output().map_err(|e| LocalQueryError {
            problem: format!("Failed to run vagrant: {}", e),
            output: String::new(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            return Err(LocalQueryError {
                problem: format!(
                    "vagrant ssh-config exited with {}",
                    output.status.code().unwrap_or(-1)
                ),
                output: format!("{}{}", stdout, String::from_utf8_lossy(&output.stderr)),
            });
        }

        Ok(stdout)
    }
}

pub struct TargetResolver<'a> {
    config: &'a GroundworkConfig,
    local: &'a dyn LocalConnectionSource,
}

impl<'a> TargetResolver<'a> {
    pub fn new(config: &'a GroundworkConfig, local: &'a dyn LocalConnectionSource) -> Self {
        Self { config, local }
    }

    /// Every selector this resolver accepts.
    pub fn selectors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.config.environments.keys().cloned().collect();
        for (name, _, _) in VAGRANT_SELECTORS {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    pub fn resolve(&self, selector: &str) -> Result<ResolvedTarget> {
        self.resolve_with(selector, &[])
    }

    /// Resolve `selector`, then apply `key=value` overrides to the overlay.
    pub fn resolve_with(&self, selector: &str, overrides: &[String]) -> Result<ResolvedTarget> {
        let (descriptor, settings, service_manager) =
            if let Some(env) = self.config.environments.get(selector) {
                log_status!("resolve", "Using static environment '{}'", selector);
                static_descriptor(selector, env)
            } else if let Some((_, machine, list)) =
                VAGRANT_SELECTORS.iter().find(|(name, _, _)| *name == selector)
            {
                log_status!("resolve", "Querying vagrant for '{}'", selector);
                self.vagrant_descriptor(selector, *machine, list)?
            } else {
                return Err(Error::unknown_environment(selector, self.selectors()));
            };

        let overlay = self.build_overlay(&descriptor, &settings, &service_manager, overrides)?;
        let descriptor = TargetDescriptor {
            package_list: overlay.text("package_list"),
            ..descriptor
        };
        Ok(ResolvedTarget {
            descriptor,
            overlay,
        })
    }

    fn vagrant_descriptor(
        &self,
        selector: &str,
        machine: Option<&str>,
        package_list: &str,
    ) -> Result<(TargetDescriptor, EnvironmentSettings, String)> {
        let unavailable = |problem: String, output: String| {
            Error::local_environment_unavailable(selector, "vagrant", problem, output)
        };

        let raw = self
            .local
            .ssh_config(machine)
            .map_err(|e| unavailable(e.problem, e.output))?;
        let parsed = parse_ssh_config(&raw);

        let field = |key: &str| {
            parsed
                .get(key)
                .cloned()
                .ok_or_else(|| unavailable(format!("ssh-config is missing '{}'", key), raw.clone()))
        };

        let port = field("Port")?;
        if port.parse::<u16>().is_err() {
            return Err(unavailable(format!("Invalid port '{}'", port), raw.clone()));
        }
        let host = parsed
            .get("HostName")
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let descriptor = TargetDescriptor {
            environment: selector.to_string(),
            hosts: vec![format!("{}:{}", host, port)],
            user: field("User")?,
            credential: Some(Credential::KeyFile(field("IdentityFile")?)),
            package_list: Some(package_list.to_string()),
        };
        let settings = EnvironmentSettings {
            django_settings: "settings.development".to_string(),
            branch: "master".to_string(),
        };

        Ok((descriptor, settings, "upstart".to_string()))
    }

    fn build_overlay(
        &self,
        descriptor: &TargetDescriptor,
        settings: &EnvironmentSettings,
        service_manager: &str,
        overrides: &[String],
    ) -> Result<Overlay> {
        let project = &self.config.project;
        let package_list = descriptor.package_list.as_deref().unwrap_or("full");

        let base = Overlay::builder()
            .set("environment", descriptor.environment.as_str())
            .set("user", descriptor.user.as_str())
            .set("django_settings", settings.django_settings.as_str())
            .set("branch", settings.branch.as_str())
            .set("package_list", package_list)
            .set("service_manager", service_manager)
            .set("sites_dir", project.sites_dir.as_str())
            .set("virtualenv_dir", project.virtualenv_dir.as_str())
            .set("git_repo", project.git_repo.as_str())
            .set("virtualenv", project.virtualenv.as_str())
            .set("nginx_conf", project.nginx_conf.as_str())
            .set("nginx", project.nginx.as_str())
            .set("gunicorn_conf", project.gunicorn_conf.as_str())
            .set("gunicorn", project.gunicorn.as_str())
            .set("project_name", project.project_name.as_str())
            .set("deploy_user", project.deploy_user.as_str())
            .set("deploy_user_home", project.deploy_user_home.as_str())
            .set("db_user", project.db_user.as_str())
            .set("db_name", project.db_name.as_str())
            .set("bash_profile_source", project.bash_profile_source.as_str())
            .set("test_command", project.test_command.as_str())
            .set("push_command", project.push_command.as_str())
            .set_default("migrate_app", "")
            .apply_overrides(overrides)?
            .build();

        // Derived keys follow the overridden base values unless overridden themselves.
        let package_list = base.require("package_list")?;
        let packages = self.config.packages(&package_list)?.to_vec();
        let code_dir = join_path(&base.require("sites_dir")?, &base.require("virtualenv")?);
        let project_dir = join_path(&code_dir, &base.require("project_name")?);

        Ok(base
            .into_builder()
            .set_default("packages", packages)
            .set_default("code_dir", code_dir)
            .set_default("project_dir", project_dir)
            .build())
    }
}

struct EnvironmentSettings {
    django_settings: String,
    branch: String,
}

fn static_descriptor(
    selector: &str,
    env: &StaticEnvironment,
) -> (TargetDescriptor, EnvironmentSettings, String) {
    let credential = match (&env.key_filename, &env.password) {
        (Some(key), _) => Some(Credential::KeyFile(key.clone())),
        (None, Some(password)) => Some(Credential::Password(password.clone())),
        (None, None) => None,
    };

    let descriptor = TargetDescriptor {
        environment: selector.to_string(),
        hosts: env.hosts.clone(),
        user: env.user.clone(),
        credential,
        package_list: Some(env.package_list.clone()),
    };
    let settings = EnvironmentSettings {
        django_settings: env.django_settings.clone(),
        branch: env.branch.clone(),
    };

    (descriptor, settings, env.service_manager.clone())
}

/// Parse `Key Value` lines (as printed by `vagrant ssh-config`).
/// The first occurrence of a key wins; surrounding quotes are stripped.
pub fn parse_ssh_config(raw: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        values
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }
    values
}

fn join_path(base: &str, child: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    struct FixedSource(std::result::Result<String, LocalQueryError>);

    impl LocalConnectionSource for FixedSource {
        fn ssh_config(&self, _machine: Option<&str>) -> std::result::Result<String, LocalQueryError> {
            self.0.clone()
        }
    }

    const SSH_CONFIG: &str = "Host default\n  HostName 127.0.0.1\n  User vagrant\n  Port 2222\n  UserKnownHostsFile /dev/null\n  IdentityFile \"/home/me/.vagrant.d/insecure_private_key\"\n";

    #[test]
    fn resolves_production_with_stable_branch() {
        let config = GroundworkConfig::default();
        let source = FixedSource(Ok(String::new()));
        let resolved = TargetResolver::new(&config, &source)
            .resolve("production")
            .unwrap();

        assert_eq!(resolved.descriptor.user, "ubuntu");
        assert_eq!(
            resolved.descriptor.credential,
            Some(Credential::KeyFile("~/.ec2/ubuntu1.pem".to_string()))
        );
        assert_eq!(resolved.overlay.text("branch").as_deref(), Some("stable"));
        assert_eq!(
            resolved.overlay.text("code_dir").as_deref(),
            Some("/srv/sites/webapp")
        );
        assert_eq!(
            resolved.overlay.text("project_dir").as_deref(),
            Some("/srv/sites/webapp/myproject")
        );
    }

    #[test]
    fn unknown_selector_fails_fast() {
        let config = GroundworkConfig::default();
        let source = FixedSource(Ok(String::new()));
        let err = TargetResolver::new(&config, &source)
            .resolve("does-not-exist")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EnvironmentUnknown);
    }

    #[test]
    fn selectors_are_case_sensitive() {
        let config = GroundworkConfig::default();
        let source = FixedSource(Ok(String::new()));
        let err = TargetResolver::new(&config, &source)
            .resolve("Production")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EnvironmentUnknown);
    }

    #[test]
    fn vagrant_uses_ssh_config_port_and_key() {
        let config = GroundworkConfig::default();
        let source = FixedSource(Ok(SSH_CONFIG.to_string()));
        let resolved = TargetResolver::new(&config, &source)
            .resolve("vagrant_web")
            .unwrap();

        assert_eq!(resolved.descriptor.hosts, vec!["127.0.0.1:2222".to_string()]);
        assert_eq!(resolved.descriptor.user, "vagrant");
        assert_eq!(
            resolved.descriptor.credential,
            Some(Credential::KeyFile(
                "/home/me/.vagrant.d/insecure_private_key".to_string()
            ))
        );
        assert_eq!(resolved.overlay.text("package_list").as_deref(), Some("web"));
    }

    #[test]
    fn vagrant_query_failure_is_local_unavailable() {
        let config = GroundworkConfig::default();
        let source = FixedSource(Err(LocalQueryError {
            problem: "Failed to run vagrant: not found".to_string(),
            output: String::new(),
        }));
        let err = TargetResolver::new(&config, &source)
            .resolve("vagrant")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EnvironmentLocalUnavailable);
    }

    #[test]
    fn garbled_ssh_config_is_local_unavailable() {
        let config = GroundworkConfig::default();
        let source = FixedSource(Ok("VM not created. Run `vagrant up` first.".to_string()));
        let err = TargetResolver::new(&config, &source)
            .resolve("vagrant_db")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EnvironmentLocalUnavailable);
        assert!(err.details["output"].as_str().unwrap().contains("vagrant up"));
    }

    #[test]
    fn derived_keys_follow_overridden_base_values() {
        let config = GroundworkConfig::default();
        let source = FixedSource(Ok(String::new()));
        let resolved = TargetResolver::new(&config, &source)
            .resolve_with(
                "production",
                &[
                    "virtualenv=shop".to_string(),
                    "sites_dir=/opt/sites/".to_string(),
                    "package_list=db".to_string(),
                ],
            )
            .unwrap();

        let overlay = &resolved.overlay;
        assert_eq!(overlay.text("code_dir").as_deref(), Some("/opt/sites/shop"));
        assert_eq!(
            overlay.text("project_dir").as_deref(),
            Some("/opt/sites/shop/myproject")
        );
        assert_eq!(
            overlay.text("packages"),
            Some(config.package_lists["db"].join(" "))
        );
        assert_eq!(resolved.descriptor.package_list.as_deref(), Some("db"));
    }

    #[test]
    fn explicit_derived_override_wins_and_unknown_list_is_rejected() {
        let config = GroundworkConfig::default();
        let source = FixedSource(Ok(String::new()));
        let resolver = TargetResolver::new(&config, &source);

        let resolved = resolver
            .resolve_with(
                "staging",
                &["virtualenv=shop".to_string(), "code_dir=/srv/custom".to_string()],
            )
            .unwrap();
        assert_eq!(resolved.overlay.text("code_dir").as_deref(), Some("/srv/custom"));

        let err = resolver
            .resolve_with("staging", &["package_list=cache".to_string()])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn overrides_are_applied_before_run() {
        let config = GroundworkConfig::default();
        let source = FixedSource(Ok(String::new()));
        let resolved = TargetResolver::new(&config, &source)
            .resolve_with("staging", &["migrate_app=blog".to_string()])
            .unwrap();
        assert_eq!(resolved.overlay.text("migrate_app").as_deref(), Some("blog"));
    }

    #[test]
    fn password_is_never_serialized() {
        let descriptor = TargetDescriptor {
            environment: "qa".to_string(),
            hosts: vec!["qa.internal".to_string()],
            user: "ci".to_string(),
            credential: Some(Credential::Password("hunter2".to_string())),
            package_list: None,
        };
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!format!("{:?}", descriptor).contains("hunter2"));
    }
}
