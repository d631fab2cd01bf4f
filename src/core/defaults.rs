use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Config file looked up in the working directory when `--config` is not given.
pub const CONFIG_FILE_NAME: &str = "groundwork.json";

/// Root configuration structure for groundwork.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundworkConfig {
    #[serde(default)]
    pub project: ProjectSettings,

    #[serde(default = "default_package_lists")]
    pub package_lists: BTreeMap<String, Vec<String>>,

    /// Static environments keyed by selector. Entries here replace built-ins of
    /// the same name.
    #[serde(default = "default_environments")]
    pub environments: BTreeMap<String, StaticEnvironment>,
}

impl Default for GroundworkConfig {
    fn default() -> Self {
        Self {
            project: ProjectSettings::default(),
            package_lists: default_package_lists(),
            environments: default_environments(),
        }
    }
}

/// Settings shared by every environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub sites_dir: String,
    pub virtualenv_dir: String,
    pub git_repo: String,
    pub virtualenv: String,
    pub nginx_conf: String,
    pub nginx: String,
    pub gunicorn_conf: String,
    pub gunicorn: String,
    pub project_name: String,
    pub deploy_user: String,
    pub deploy_user_home: String,
    pub db_user: String,
    pub db_name: String,
    pub bash_profile_source: String,
    pub test_command: String,
    pub push_command: String,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            sites_dir: "/srv/sites".to_string(),
            virtualenv_dir: ".virtualenvs".to_string(),
            git_repo: "git://github.com/munchie/django-example-project.git".to_string(),
            virtualenv: "webapp".to_string(),
            nginx_conf: "nginx_webapp.conf".to_string(),
            nginx: "nginx_webapp".to_string(),
            gunicorn_conf: "gunicorn_webapp.conf".to_string(),
            gunicorn: "gunicorn_webapp".to_string(),
            project_name: "myproject".to_string(),
            deploy_user: "deploy".to_string(),
            deploy_user_home: "/home/deploy".to_string(),
            db_user: "myproject".to_string(),
            db_name: "myproject".to_string(),
            bash_profile_source: "config/.bash_profile".to_string(),
            test_command: "./manage.py test".to_string(),
            push_command: "git push origin master".to_string(),
        }
    }
}

/// A statically configured environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticEnvironment {
    pub hosts: Vec<String>,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_filename: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub django_settings: String,
    pub branch: String,
    #[serde(default = "default_package_list_name")]
    pub package_list: String,
    #[serde(default = "default_service_manager")]
    pub service_manager: String,
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_package_list_name() -> String {
    "full".to_string()
}

fn default_service_manager() -> String {
    "upstart".to_string()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_package_lists() -> BTreeMap<String, Vec<String>> {
    let base = ["ntp", "git", "python2.7-dev", "python-setuptools", "build-essential"];
    let web = ["subversion", "mercurial", "nginx", "libevent-dev", "libpq-dev"];
    let db = ["postgresql", "postgresql-server-dev-9.1", "libpq-dev"];

    let mut full = strings(&base);
    full.extend(strings(&["subversion", "mercurial", "nginx", "libevent-dev"]));
    full.extend(strings(&db));

    let mut web_only = strings(&base);
    web_only.extend(strings(&web));

    let mut db_only = strings(&base);
    db_only.extend(strings(&db));

    BTreeMap::from([
        ("full".to_string(), full),
        ("web".to_string(), web_only),
        ("db".to_string(), db_only),
    ])
}

fn default_environments() -> BTreeMap<String, StaticEnvironment> {
    let ec2_host = "ec2-107-22-109-221.compute-1.amazonaws.com".to_string();

    BTreeMap::from([
        (
            "production".to_string(),
            StaticEnvironment {
                hosts: vec![ec2_host.clone()],
                user: "ubuntu".to_string(),
                key_filename: Some("~/.ec2/ubuntu1.pem".to_string()),
                password: None,
                django_settings: "settings.production".to_string(),
                branch: "stable".to_string(),
                package_list: default_package_list_name(),
                service_manager: default_service_manager(),
            },
        ),
        (
            "staging".to_string(),
            StaticEnvironment {
                hosts: vec![ec2_host],
                user: "ubuntu".to_string(),
                key_filename: Some("~/.ec2/ubuntu1.pem".to_string()),
                password: None,
                django_settings: "settings.development".to_string(),
                branch: "master".to_string(),
                package_list: default_package_list_name(),
                service_manager: default_service_manager(),
            },
        ),
    ])
}

// =============================================================================
// Loading
// =============================================================================

/// Load configuration from an explicit path, or from `groundwork.json` in the
/// working directory when it exists. Falls back to built-in defaults.
pub fn load(explicit: Option<&Path>) -> Result<GroundworkConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let candidate = PathBuf::from(CONFIG_FILE_NAME);
            if !candidate.exists() {
                return Ok(GroundworkConfig::default());
            }
            candidate
        }
    };

    load_from_file(&path)
}

pub fn load_from_file(path: &Path) -> Result<GroundworkConfig> {
    let display = path.display().to_string();
    let content = fs::read_to_string(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("read {}", display))))?;
    let mut config: GroundworkConfig = serde_json::from_str(&content)
        .map_err(|e| Error::config_invalid_json(display.clone(), e))?;

    // Built-in environments stay available unless the file redefines them.
    for (name, env) in default_environments() {
        config.environments.entry(name).or_insert(env);
    }

    config.validate()?;
    Ok(config)
}

impl GroundworkConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, env) in &self.environments {
            if env.hosts.is_empty() {
                return Err(Error::config_invalid_value(
                    format!("environments.{}.hosts", name),
                    None,
                    "At least one host is required",
                ));
            }
            if !self.package_lists.contains_key(&env.package_list) {
                return Err(Error::config_invalid_value(
                    format!("environments.{}.package_list", name),
                    Some(env.package_list.clone()),
                    "Package list is not defined in package_lists",
                ));
            }
            if !matches!(env.service_manager.as_str(), "upstart" | "service") {
                return Err(Error::config_invalid_value(
                    format!("environments.{}.service_manager", name),
                    Some(env.service_manager.clone()),
                    "Expected 'upstart' or 'service'",
                ));
            }
        }
        Ok(())
    }

    pub fn packages(&self, list: &str) -> Result<&[String]> {
        self.package_lists
            .get(list)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                Error::config_invalid_value(
                    "package_list",
                    Some(list.to_string()),
                    "Package list is not defined in package_lists",
                )
            })
    }
}
