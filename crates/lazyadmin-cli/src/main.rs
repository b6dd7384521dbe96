#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! lazyadmin - operator front-end for the declarative admin control plane
//!
//! Commands:
//! - lazyadmin ops - List operations visible to the session principal
//! - lazyadmin tasks - List visible tasks
//! - lazyadmin run <id> - Execute one operation
//! - lazyadmin task <id> - Run one task
//! - lazyadmin log - Show the most recent audit records
//! - lazyadmin whoami - Show the resolved principal
//! - lazyadmin users add/list/rm - Administer store-backed users
//! - lazyadmin register - Register a hardware credential

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lazyadmin::catalog::{self, Catalog, Operation};
use lazyadmin::clients::Clients;
use lazyadmin::identity::{self, Principal};
use lazyadmin::openapi::Projector;
use lazyadmin::token::{self, DevicePort, UnavailableDevice};
use lazyadmin::users::UserStore;
use lazyadmin::{AuditLog, Environment, Error, Executor, Runner};

const OPERATION_DEADLINE_SECS: u64 = 5;
const TASK_DEADLINE_SECS: u64 = 60;

/// Stable exit codes for `lazyadmin` commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
enum ExitCode {
    /// Command succeeded.
    Ok = 0,
    /// The requested action ran and failed (remote error, failed task).
    ActionFailed = 1,
    /// Identity could not be resolved or the principal lacks a role.
    Unauthorized = 2,
    /// Configuration could not be loaded or is invalid.
    ConfigError = 3,
    /// Runtime error (audit store, I/O, internal).
    RuntimeError = 4,
    /// CLI usage error (invalid arguments).
    InvalidArgs = 5,
}

impl ExitCode {
    fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Parser, Debug)]
#[command(name = "lazyadmin")]
#[command(version, about = "Auditable admin operations from the terminal", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List operations visible to the session principal
    Ops,

    /// List tasks visible to the session principal
    Tasks,

    /// Execute one operation
    Run {
        /// Operation id
        id: String,

        /// Deadline in seconds
        #[arg(long, default_value_t = OPERATION_DEADLINE_SECS)]
        timeout_secs: u64,
    },

    /// Run one task
    Task {
        /// Task id
        id: String,

        /// Deadline in seconds, spanning the whole task
        #[arg(long, default_value_t = TASK_DEADLINE_SECS)]
        timeout_secs: u64,
    },

    /// Show the most recent audit records
    Log {
        /// Maximum number of records
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the resolved principal
    Whoami,

    /// Administer store-backed users (admin only)
    Users {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Register a hardware credential for a store-backed user (admin only)
    Register {
        /// Relying party id
        #[arg(long)]
        rp_id: String,

        /// Relying party display name
        #[arg(long, default_value = "lazyadmin")]
        rp_name: String,

        /// Store user to attach the credential to
        #[arg(long)]
        user_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    /// Create a user in the store
    Add {
        /// User id
        id: String,

        /// SSH user names that resolve to this user (repeatable)
        #[arg(long = "ssh-user", required = true)]
        ssh_users: Vec<String>,

        /// Roles held by this user (repeatable)
        #[arg(long = "role", required = true)]
        roles: Vec<String>,
    },

    /// List store-backed users
    List,

    /// Delete a user (cascades to credentials)
    Rm {
        /// User id
        id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::Ok
                }
                _ => ExitCode::InvalidArgs,
            };

            let _ = err.print();
            std::process::exit(code.as_i32());
        }
    };

    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::filter::LevelFilter::from_level(
            log_level,
        ))
        .init();

    let code = run(cli).await;
    std::process::exit(code.as_i32());
}

/// Everything a session needs, wired once at startup.
struct App {
    catalog: Arc<Catalog>,
    audit: Arc<AuditLog>,
    store: Option<Arc<UserStore>>,
    principal: Principal,
    executor: Executor,
    runner: Runner,
    device: Arc<dyn DevicePort>,
}

async fn run(cli: Cli) -> ExitCode {
    let env = Environment::from_process();
    let app = match bootstrap(&env).await {
        Ok(app) => app,
        Err(code) => return code,
    };

    match cli.command {
        Commands::Ops => cmd_ops(&app),
        Commands::Tasks => cmd_tasks(&app),
        Commands::Run { id, timeout_secs } => cmd_run(&app, &id, timeout_secs).await,
        Commands::Task { id, timeout_secs } => cmd_task(&app, &id, timeout_secs).await,
        Commands::Log { limit } => cmd_log(&app, limit),
        Commands::Whoami => cmd_whoami(&app),
        Commands::Users { command } => cmd_users(&app, command),
        Commands::Register {
            rp_id,
            rp_name,
            user_id,
        } => cmd_register(&app, &rp_id, &rp_name, &user_id).await,
    }
}

async fn bootstrap(env: &Environment) -> Result<App, ExitCode> {
    let config = match catalog::load_file(env) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return Err(ExitCode::ConfigError);
        }
    };

    let projected = if config.openapi.backends.is_empty() {
        Vec::new()
    } else {
        Projector::new().project(&config.openapi.backends).await
    };

    let sqlite_path = config.logging.sqlite_path.clone();
    let catalog = match Catalog::build(config, projected, env) {
        Ok(catalog) => Arc::new(catalog),
        Err(err) => {
            eprintln!("error: {err}");
            return Err(ExitCode::ConfigError);
        }
    };

    let (audit, store) = match &sqlite_path {
        Some(path) => {
            let audit = match AuditLog::open(path) {
                Ok(audit) => Arc::new(audit),
                Err(err) => {
                    eprintln!("error: open audit store: {err}");
                    return Err(ExitCode::RuntimeError);
                }
            };
            let store = match UserStore::open(path) {
                Ok(store) => Some(Arc::new(store)),
                Err(err) => {
                    eprintln!("error: open user store: {err}");
                    return Err(ExitCode::RuntimeError);
                }
            };
            (audit, store)
        }
        None => (Arc::new(AuditLog::null()), None),
    };

    let principal = match identity::resolve_principal(&catalog, store.as_deref(), env) {
        Ok(principal) => principal,
        Err(err) => {
            eprintln!("error: {err}");
            return Err(ExitCode::Unauthorized);
        }
    };

    let device: Arc<dyn DevicePort> = Arc::new(UnavailableDevice);

    if catalog.auth().require_yubikey {
        let cancel = deadline_token(Duration::from_secs(30));
        if let Err(err) =
            token::require_second_factor(&principal.user, device.as_ref(), &cancel).await
        {
            eprintln!("error: second factor: {err}");
            return Err(ExitCode::Unauthorized);
        }
    }

    let clients = Arc::new(Clients::connect(&catalog).await);
    let executor = Executor::new(catalog.clone(), audit.clone(), clients.clone());
    let runner = Runner::new(audit.clone(), clients, device.clone());

    Ok(App {
        catalog,
        audit,
        store,
        principal,
        executor,
        runner,
        device,
    })
}

/// Cancellation token wired to the deadline and Ctrl-C.
fn deadline_token(deadline: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => {
                tracing::info!("deadline reached, cancelling");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt, cancelling");
            }
        }
        trigger.cancel();
    });
    token
}

fn exit_code_for(err: &Error) -> ExitCode {
    match err {
        Error::Unauthorized(_) => ExitCode::Unauthorized,
        Error::NotFound(_) => ExitCode::InvalidArgs,
        _ => ExitCode::ActionFailed,
    }
}

fn cmd_ops(app: &App) -> ExitCode {
    for op in app.catalog.operations_visible_to(&app.principal) {
        let kind = match op {
            Operation::Http(_) => "http",
            Operation::Sql(_) => "sql",
        };
        println!("{:<32} {:<5} {:<16} {}", op.id(), kind, op.target(), op.label());
    }
    ExitCode::Ok
}

fn cmd_tasks(app: &App) -> ExitCode {
    for task in app.catalog.tasks_visible_to(&app.principal) {
        let factor = if task.require_second_factor { " [2fa]" } else { "" };
        println!(
            "{:<32} {:<6} {:>2} step(s){} {}",
            task.id,
            task.risk_level,
            task.steps.len(),
            factor,
            task.label
        );
    }
    ExitCode::Ok
}

async fn cmd_run(app: &App, id: &str, timeout_secs: u64) -> ExitCode {
    let cancel = deadline_token(Duration::from_secs(timeout_secs));
    match app.executor.execute(&cancel, &app.principal, id).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::Ok
        }
        Err(err) => {
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}

async fn cmd_task(app: &App, id: &str, timeout_secs: u64) -> ExitCode {
    let Some(task) = app.catalog.resolve_task(id) else {
        eprintln!("error: not found: task {id:?}");
        return ExitCode::InvalidArgs;
    };
    if !app.principal.has_any_role(&task.allowed_roles) {
        eprintln!(
            "error: unauthorized: user {:?} may not run task {id:?}",
            app.principal.user.id
        );
        return ExitCode::Unauthorized;
    }

    let cancel = deadline_token(Duration::from_secs(timeout_secs));
    let outcome = app.runner.run(&cancel, &app.principal, task).await;

    for step_id in &outcome.order {
        let Some(step) = outcome.outcomes.get(step_id) else {
            continue;
        };
        match &step.error {
            None => println!("{step_id}: ok {}", step.output),
            Some(error) => println!("{step_id}: FAILED {error}"),
        }
    }
    if let Some(summary) = &outcome.summary {
        println!("---\n{summary}");
    }

    if outcome.success {
        println!("task {id}: success");
        ExitCode::Ok
    } else {
        println!("task {id}: FAILED");
        ExitCode::ActionFailed
    }
}

fn cmd_log(app: &App, limit: usize) -> ExitCode {
    let records = match app.audit.recent(limit) {
        Ok(records) => records,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::RuntimeError;
        }
    };

    for r in records {
        let status = if r.success { "ok" } else { "FAIL" };
        let error = r.error.as_deref().unwrap_or("");
        println!(
            "{:>6} {} {:<12} {:<12} {:<40} {:<4} {}",
            r.seq,
            r.occurred_at.to_rfc3339(),
            r.user_id,
            r.ssh_user,
            r.operation_id,
            status,
            error
        );
    }
    ExitCode::Ok
}

fn cmd_whoami(app: &App) -> ExitCode {
    let roles: Vec<_> = app.principal.user.roles.iter().map(|r| r.as_str()).collect();
    println!("user:     {}", app.principal.user.id);
    println!("ssh user: {}", app.principal.ssh_user);
    println!("roles:    {}", roles.join(", "));
    println!("project:  {} ({})", app.catalog.project(), app.catalog.env_name());
    ExitCode::Ok
}

fn require_store(app: &App) -> Result<&Arc<UserStore>, ExitCode> {
    if !app.principal.is_admin() {
        eprintln!("error: unauthorized: user administration requires the admin role");
        return Err(ExitCode::Unauthorized);
    }
    app.store.as_ref().ok_or_else(|| {
        eprintln!("error: no user store configured (logging.sqlite_path is unset)");
        ExitCode::ConfigError
    })
}

fn cmd_users(app: &App, command: UserCommands) -> ExitCode {
    let store = match require_store(app) {
        Ok(store) => store,
        Err(code) => return code,
    };

    let result = match command {
        UserCommands::Add {
            id,
            ssh_users,
            roles,
        } => store.create_user(&id, &ssh_users, &roles).map(|user| {
            println!("created user {}", user.id);
        }),
        UserCommands::List => store.list_users().map(|users| {
            for user in users {
                println!(
                    "{:<16} ssh=[{}] roles=[{}]",
                    user.id,
                    user.ssh_users.join(", "),
                    user.roles.join(", ")
                );
            }
        }),
        UserCommands::Rm { id } => store.delete_user(&id).map(|()| {
            println!("deleted user {id}");
        }),
    };

    match result {
        Ok(()) => ExitCode::Ok,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::ActionFailed
        }
    }
}

async fn cmd_register(app: &App, rp_id: &str, rp_name: &str, user_id: &str) -> ExitCode {
    let store = match require_store(app) {
        Ok(store) => store,
        Err(code) => return code,
    };

    let user = match store.get_user(user_id) {
        Ok(user) => user,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::ActionFailed;
        }
    };

    println!("registering credential for {} at rp {rp_id}, touch your key...", user.id);
    let cancel = deadline_token(Duration::from_secs(60));
    let registration = tokio::select! {
        _ = cancel.cancelled() => {
            eprintln!("error: registration cancelled");
            return ExitCode::ActionFailed;
        }
        res = app.device.register(rp_id, rp_name, &user.id, user.id.as_bytes()) => match res {
            Ok(registration) => registration,
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::ActionFailed;
            }
        },
    };

    match store.add_credential(
        &user.id,
        rp_id,
        &registration.credential_id,
        &registration.public_key,
    ) {
        Ok(_) => {
            println!("registered credential {}", registration.credential_id);
            ExitCode::Ok
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::ActionFailed
        }
    }
}
