//! Task bodies for provisioning and deploying the web stack.
//!
//! Every "create X" body checks for X in tolerant mode first and only issues
//! the creation command when the check says X is absent.

use crate::error::{Error, Result};
use crate::executor::{CommandTemplate, ExecOptions};
use crate::graph::{FailurePolicy, TaskContext};

pub type TaskFn = fn(&TaskContext<'_>) -> Result<()>;

pub struct CatalogEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub policy: FailurePolicy,
    pub body: TaskFn,
}

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "stop_processes",
        description: "Stop nginx and gunicorn",
        policy: FailurePolicy::Tolerant,
        body: stop_processes,
    },
    CatalogEntry {
        name: "add_deploy_user",
        description: "Create the deploy user when missing",
        policy: FailurePolicy::Fatal,
        body: add_deploy_user,
    },
    CatalogEntry {
        name: "install_packages",
        description: "Install system packages, pip and virtualenvwrapper",
        policy: FailurePolicy::Fatal,
        body: install_packages,
    },
    CatalogEntry {
        name: "make_virtualenv",
        description: "Create the virtualenv and its settings hooks",
        policy: FailurePolicy::Fatal,
        body: make_virtualenv,
    },
    CatalogEntry {
        name: "setup_sites_dir",
        description: "Create the sites directory owned by the deploy user",
        policy: FailurePolicy::Fatal,
        body: setup_sites_dir,
    },
    CatalogEntry {
        name: "setup_db",
        description: "Create the database role and database when missing",
        policy: FailurePolicy::Fatal,
        body: setup_db,
    },
    CatalogEntry {
        name: "clone_repo",
        description: "Clone the repository into the code directory when missing",
        policy: FailurePolicy::Fatal,
        body: clone_repo,
    },
    CatalogEntry {
        name: "pull",
        description: "Pull new code",
        policy: FailurePolicy::Fatal,
        body: pull,
    },
    CatalogEntry {
        name: "requirements",
        description: "Install requirements into the virtualenv",
        policy: FailurePolicy::Fatal,
        body: requirements,
    },
    CatalogEntry {
        name: "syncdb",
        description: "Sync the database",
        policy: FailurePolicy::Fatal,
        body: syncdb,
    },
    CatalogEntry {
        name: "migrate",
        description: "Run schema migrations (all apps, or migrate_app)",
        policy: FailurePolicy::Fatal,
        body: migrate,
    },
    CatalogEntry {
        name: "collectstatic",
        description: "Collect static files",
        policy: FailurePolicy::Tolerant,
        body: collectstatic,
    },
    CatalogEntry {
        name: "gunicorn_config",
        description: "Install the gunicorn service config",
        policy: FailurePolicy::Fatal,
        body: gunicorn_config,
    },
    CatalogEntry {
        name: "nginx_config",
        description: "Install and enable the nginx site config",
        policy: FailurePolicy::Fatal,
        body: nginx_config,
    },
    CatalogEntry {
        name: "start_processes",
        description: "Start nginx and gunicorn",
        policy: FailurePolicy::Fatal,
        body: start_processes,
    },
    CatalogEntry {
        name: "restart_gunicorn",
        description: "Stop and start gunicorn",
        policy: FailurePolicy::Tolerant,
        body: restart_gunicorn,
    },
    CatalogEntry {
        name: "reload_nginx",
        description: "Reload nginx",
        policy: FailurePolicy::Tolerant,
        body: reload_nginx,
    },
    CatalogEntry {
        name: "push",
        description: "Push local commits to origin",
        policy: FailurePolicy::Fatal,
        body: push,
    },
    CatalogEntry {
        name: "test",
        description: "Run the test suite locally, confirming on failure",
        policy: FailurePolicy::Fatal,
        body: test,
    },
];

/// Tasks that only run commands on the invoking machine.
const LOCAL_TASKS: &[&str] = &["push", "test"];

pub fn is_local(name: &str) -> bool {
    LOCAL_TASKS.contains(&name)
}

pub fn entries() -> &'static [CatalogEntry] {
    CATALOG
}

pub fn lookup(name: &str) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|entry| entry.name == name)
}

pub fn names() -> Vec<String> {
    CATALOG.iter().map(|entry| entry.name.to_string()).collect()
}

// ============================================================================
// Helpers
// ============================================================================

fn as_deploy() -> ExecOptions {
    ExecOptions::new().as_user("{{deploy_user}}")
}

fn in_virtualenv() -> ExecOptions {
    as_deploy().prefix("workon {{virtualenv}}")
}

/// Service control line for the target's service manager.
fn service(ctx: &TaskContext<'_>, action: &str, service_key: &str) -> CommandTemplate {
    let placeholder = format!("{{{{{}}}}}", service_key);
    match ctx.overlay.text("service_manager").as_deref() {
        Some("service") => CommandTemplate::new("service").args([placeholder.as_str(), action]),
        _ => CommandTemplate::new(action).arg(placeholder),
    }
}

fn flag(ctx: &TaskContext<'_>, key: &str) -> bool {
    matches!(ctx.overlay.text(key).as_deref(), Some("true" | "1" | "yes"))
}

fn package_list(ctx: &TaskContext<'_>) -> String {
    ctx.overlay
        .text("package_list")
        .unwrap_or_else(|| "full".to_string())
}

// ============================================================================
// Bodies
// ============================================================================

fn stop_processes(ctx: &TaskContext<'_>) -> Result<()> {
    let stop = ExecOptions::sudo().tolerant();
    ctx.exec.execute(service(ctx, "stop", "nginx"), &stop)?;
    ctx.exec.execute(service(ctx, "stop", "gunicorn"), &stop)?;
    Ok(())
}

fn add_deploy_user(ctx: &TaskContext<'_>) -> Result<()> {
    let check = ctx
        .exec
        .execute("id {{deploy_user}}", &ExecOptions::new().tolerant())?;
    if check.succeeded() {
        log_status!("task", "[{}] Deploy user already exists, skipping", ctx.host);
        return Ok(());
    }

    ctx.exec.execute(
        "useradd -d {{deploy_user_home}} -m -s /bin/bash {{deploy_user}}",
        &ExecOptions::sudo(),
    )?;
    Ok(())
}

fn install_packages(ctx: &TaskContext<'_>) -> Result<()> {
    let sudo = ExecOptions::sudo();
    ctx.exec.execute("aptitude update", &sudo)?;
    ctx.exec.execute("aptitude -y install {{packages}}", &sudo)?;
    ctx.exec.execute("easy_install pip", &sudo)?;
    ctx.exec
        .execute("pip install virtualenv virtualenvwrapper", &sudo)?;

    if package_list(ctx) != "db" {
        ctx.exec
            .execute("rm -f /etc/nginx/sites-enabled/default", &sudo)?;
        ctx.exec.execute("mkdir -p /var/log/gunicorn", &sudo)?;
    }
    Ok(())
}

fn make_virtualenv(ctx: &TaskContext<'_>) -> Result<()> {
    // virtualenvwrapper is loaded from .bash_profile; bash -l sources it.
    ctx.exec.upload(
        "{{bash_profile_source}}",
        "{{deploy_user_home}}/.bash_profile",
        &ExecOptions::sudo(),
    )?;
    ctx.exec.execute(
        "chown {{deploy_user}}:{{deploy_user}} {{deploy_user_home}}/.bash_profile",
        &ExecOptions::sudo(),
    )?;

    let sourced = ctx.exec.execute(
        "grep \"source /usr/local/bin/virtualenvwrapper.sh\" ~/.bashrc",
        &as_deploy().tolerant(),
    )?;
    if sourced.failed() {
        ctx.exec
            .execute("cat ~/.bash_profile >> ~/.bashrc", &as_deploy())?;
    }

    if flag(ctx, "recreate_virtualenv") {
        ctx.exec
            .execute("rmvirtualenv {{virtualenv}}", &as_deploy().tolerant())?;
    } else {
        let existing = ctx.exec.execute(
            "test -d ~/{{virtualenv_dir}}/{{virtualenv}}",
            &as_deploy().tolerant(),
        )?;
        if existing.succeeded() {
            log_status!("task", "[{}] Virtualenv already exists, skipping", ctx.host);
            return Ok(());
        }
    }

    ctx.exec.execute(
        "mkvirtualenv --no-site-packages {{virtualenv}}",
        &as_deploy(),
    )?;
    ctx.exec
        .execute("add2virtualenv {{project_dir}}", &in_virtualenv())?;
    ctx.exec.execute(
        "echo \"export DJANGO_SETTINGS_MODULE={{django_settings}}\" >> ~/{{virtualenv_dir}}/{{virtualenv}}/bin/postactivate",
        &as_deploy(),
    )?;
    ctx.exec.execute(
        "echo \"unset DJANGO_SETTINGS_MODULE\" >> ~/{{virtualenv_dir}}/{{virtualenv}}/bin/postdeactivate",
        &as_deploy(),
    )?;
    Ok(())
}

fn setup_sites_dir(ctx: &TaskContext<'_>) -> Result<()> {
    let sudo = ExecOptions::sudo();
    ctx.exec.execute("mkdir -p {{sites_dir}}", &sudo)?;
    ctx.exec
        .execute("chown {{deploy_user}}:{{deploy_user}} {{sites_dir}}", &sudo)?;
    Ok(())
}

fn setup_db(ctx: &TaskContext<'_>) -> Result<()> {
    let postgres = ExecOptions::new().as_user("postgres");

    let role = ctx.exec.execute(
        "psql -tAc \"SELECT 1 FROM pg_roles WHERE rolname='{{db_user}}'\"",
        &postgres.clone().tolerant(),
    )?;
    if role.succeeded() && role.stdout.trim() == "1" {
        log_status!("task", "[{}] Database role already exists, skipping", ctx.host);
    } else {
        // Not a superuser, can create databases, cannot create roles.
        ctx.exec.execute("createuser {{db_user}} -S -d -R", &postgres)?;
    }

    let database = ctx.exec.execute(
        "psql -tAc \"SELECT 1 FROM pg_database WHERE datname='{{db_name}}'\"",
        &postgres.clone().tolerant(),
    )?;
    if database.succeeded() && database.stdout.trim() == "1" {
        log_status!("task", "[{}] Database already exists, skipping", ctx.host);
    } else {
        ctx.exec
            .execute("createdb {{db_name}} -O {{db_user}}", &postgres)?;
    }
    Ok(())
}

fn clone_repo(ctx: &TaskContext<'_>) -> Result<()> {
    let existing = ctx
        .exec
        .execute("test -d {{code_dir}}", &ExecOptions::new().tolerant())?;
    if existing.succeeded() {
        log_status!("task", "[{}] Code directory already exists, skipping clone", ctx.host);
        return Ok(());
    }

    ctx.exec.execute(
        "git clone -b {{branch}} {{git_repo}} {{code_dir}}",
        &as_deploy(),
    )?;
    Ok(())
}

fn pull(ctx: &TaskContext<'_>) -> Result<()> {
    ctx.exec
        .execute("git pull origin {{branch}}", &as_deploy().cwd("{{code_dir}}"))?;
    Ok(())
}

fn requirements(ctx: &TaskContext<'_>) -> Result<()> {
    ctx.exec.execute(
        "pip install -r requirements.txt",
        &in_virtualenv().cwd("{{code_dir}}"),
    )?;
    Ok(())
}

fn syncdb(ctx: &TaskContext<'_>) -> Result<()> {
    ctx.exec
        .execute("django-admin.py syncdb --noinput", &in_virtualenv())?;
    Ok(())
}

fn migrate(ctx: &TaskContext<'_>) -> Result<()> {
    let app = ctx.overlay.text("migrate_app").unwrap_or_default();
    let command = if app.trim().is_empty() {
        "django-admin.py migrate"
    } else {
        "django-admin.py migrate {{migrate_app}}"
    };
    ctx.exec.execute(command, &in_virtualenv())?;
    Ok(())
}

fn collectstatic(ctx: &TaskContext<'_>) -> Result<()> {
    ctx.exec
        .execute("django-admin.py collectstatic -l --noinput", &in_virtualenv())?;
    Ok(())
}

fn gunicorn_config(ctx: &TaskContext<'_>) -> Result<()> {
    ctx.exec.execute(
        "cp -f {{code_dir}}/config/{{gunicorn_conf}} /etc/init/{{gunicorn_conf}}",
        &ExecOptions::sudo(),
    )?;
    Ok(())
}

fn nginx_config(ctx: &TaskContext<'_>) -> Result<()> {
    let sudo = ExecOptions::sudo();
    ctx.exec.execute(
        "cp -f {{code_dir}}/config/{{nginx_conf}} /etc/nginx/sites-available/{{nginx_conf}}",
        &sudo,
    )?;
    ctx.exec.execute(
        "ln -sf /etc/nginx/sites-available/{{nginx_conf}} /etc/nginx/sites-enabled",
        &sudo,
    )?;
    Ok(())
}

fn start_processes(ctx: &TaskContext<'_>) -> Result<()> {
    let sudo = ExecOptions::sudo();
    ctx.exec.execute(service(ctx, "start", "nginx"), &sudo)?;
    ctx.exec.execute(service(ctx, "start", "gunicorn"), &sudo)?;
    Ok(())
}

fn restart_gunicorn(ctx: &TaskContext<'_>) -> Result<()> {
    // Upstart reload does not pick up changes to the conf file.
    let sudo = ExecOptions::sudo().tolerant();
    ctx.exec.execute(service(ctx, "stop", "gunicorn"), &sudo)?;
    ctx.exec.execute(service(ctx, "start", "gunicorn"), &sudo)?;
    Ok(())
}

fn reload_nginx(ctx: &TaskContext<'_>) -> Result<()> {
    ctx.exec
        .execute("nginx -s reload", &ExecOptions::sudo().tolerant())?;
    Ok(())
}

fn push(ctx: &TaskContext<'_>) -> Result<()> {
    ctx.exec
        .execute_local("{{push_command}}", &ExecOptions::new())?;
    Ok(())
}

fn test(ctx: &TaskContext<'_>) -> Result<()> {
    let result = ctx
        .exec
        .execute_local("{{test_command}}", &ExecOptions::new().tolerant())?;
    if result.failed() && !ctx.confirm.confirm("Tests failed. Continue anyway?") {
        return Err(Error::user_aborted("Tests failed and the run was not confirmed"));
    }
    Ok(())
}
