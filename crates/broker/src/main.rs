use std::{io, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokenvault_broker::{
    settings::{self, BrokerSettings, CliSettingsOverrides},
    store::{NewProject, SqliteStore, VaultStore},
    BrokerEvent, BrokerOptions, BrokerService, StopOutcome,
};
use tokenvault_build_info::BuildInfo;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

const BROKER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "tokenvault-broker", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to tokenvault.toml
    #[arg(long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite database location
    #[arg(long = "database", value_name = "FILE", global = true)]
    database: Option<PathBuf>,

    /// Log filter (e.g. info, debug, tokenvault_broker=trace)
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker until interrupted (default)
    Serve(ServeArgs),
    /// Inspect or edit registered projects
    #[command(subcommand)]
    Projects(ProjectsCommand),
    /// Inspect or remove stored tokens
    #[command(subcommand)]
    Tokens(TokensCommand),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Loopback port to listen on
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Wait for SIGHUP instead of starting the listener right away
    #[arg(long = "no-auto-start")]
    no_auto_start: bool,
}

#[derive(Subcommand, Debug)]
enum ProjectsCommand {
    List,
    /// Register a project or update the one with the same name
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 0)]
        port: u16,
        #[arg(long = "base-url")]
        base_url: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Remove a project and its token
    Remove { name: String },
}

#[derive(Subcommand, Debug)]
enum TokensCommand {
    List,
    /// Print the raw token of a project
    Show { project: String },
    Remove { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    let serve_args = match &cli.command {
        Some(Command::Serve(args)) => Some(args),
        _ => None,
    };
    let overrides = CliSettingsOverrides {
        config: cli.config.clone(),
        database: cli.database.clone(),
        port: serve_args.and_then(|args| args.port),
        auto_start_server: serve_args.and_then(|args| args.no_auto_start.then_some(false)),
    };
    let settings = settings::load_settings(&overrides)?;

    match cli.command {
        None => serve(settings).await,
        Some(Command::Serve(_)) => serve(settings).await,
        Some(Command::Projects(command)) => run_projects(&open_store(&settings)?, command),
        Some(Command::Tokens(command)) => run_tokens(&open_store(&settings)?, command),
    }
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => {
            EnvFilter::try_new(level).with_context(|| format!("Invalid log level '{level}'"))?
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    let _ = builder.try_init();
    Ok(())
}

fn open_store(settings: &BrokerSettings) -> Result<SqliteStore> {
    SqliteStore::open(&settings.database).with_context(|| {
        format!(
            "Failed to open token database at {}",
            settings.database.display()
        )
    })
}

async fn serve(settings: BrokerSettings) -> Result<()> {
    tracing::info!(
        "{}",
        BuildInfo::current().banner("tokenvault-broker", BROKER_VERSION)
    );
    tracing::info!(
        "database={} port={} auto_start={} minimize_to_tray={} start_with_windows={}",
        settings.database.display(),
        settings.server_port,
        settings.auto_start_server,
        settings.minimize_to_tray,
        settings.start_with_windows
    );

    let store = Arc::new(open_store(&settings)?);
    let service = BrokerService::new(store, BrokerOptions::from(&settings));

    let mut events = service.notifier().subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BrokerEvent::TokenReceived {
                    project_name,
                    received_at,
                }) => {
                    tracing::info!("token received for '{project_name}' at {received_at}");
                }
                Ok(BrokerEvent::StatusChanged { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("event log fell behind, skipped {skipped} notifications");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    if settings.auto_start_server {
        if let Err(err) = service.start().await {
            tracing::error!("{err}; send SIGHUP to retry");
        }
    } else {
        tracing::info!("auto start disabled; send SIGHUP to start the broker");
    }

    let mut reload = ReloadSignal::new()?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = reload.recv() => {
                tracing::info!("SIGHUP received, restarting broker");
                if let Err(err) = service.restart().await {
                    tracing::error!("restart failed: {err}");
                }
            }
        }
    }

    match service.shutdown().await {
        Ok(StopOutcome::TimedOut) => {
            tracing::warn!("forced shutdown after {:?}", settings.stop_timeout)
        }
        Ok(_) => {}
        Err(err) => tracing::error!("shutdown failed: {err}"),
    }
    drop(service);
    event_log.abort();
    Ok(())
}

/// SIGHUP on unix; never fires elsewhere.
struct ReloadSignal {
    #[cfg(unix)]
    inner: tokio::signal::unix::Signal,
}

impl ReloadSignal {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        let inner = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        Ok(Self { inner })
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) {
        if self.inner.recv().await.is_none() {
            std::future::pending::<()>().await
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

fn run_projects(store: &dyn VaultStore, command: ProjectsCommand) -> Result<()> {
    match command {
        ProjectsCommand::List => {
            let projects = store.list_projects()?;
            if projects.is_empty() {
                println!("no projects");
            }
            for project in projects {
                println!(
                    "{:>4}  {:<24} port={:<5} {}{}",
                    project.id,
                    project.name,
                    project.port,
                    project.api_base_url.as_deref().unwrap_or("-"),
                    project
                        .description
                        .map(|text| format!("  # {text}"))
                        .unwrap_or_default()
                );
            }
        }
        ProjectsCommand::Add {
            name,
            port,
            base_url,
            description,
        } => {
            let mut input = NewProject::new(name, port);
            if let Some(url) = base_url {
                input = input.with_base_url(url);
            }
            if let Some(text) = description {
                input = input.with_description(text);
            }
            let project = store.save_project(input)?;
            println!("saved project '{}' (id {})", project.name, project.id);
        }
        ProjectsCommand::Remove { name } => {
            let Some(project) = store.find_project_by_name(&name)? else {
                bail!("no project named '{name}'");
            };
            store.delete_project(project.id)?;
            println!("removed project '{}'", project.name);
        }
    }
    Ok(())
}

fn run_tokens(store: &dyn VaultStore, command: TokensCommand) -> Result<()> {
    match command {
        TokensCommand::List => {
            let tokens = store.list_tokens()?;
            if tokens.is_empty() {
                println!("no tokens");
            }
            for token in tokens {
                println!(
                    "{:>4}  {:<24} {} {}  updated {}{}",
                    token.id,
                    token.project_name,
                    token.token_type,
                    token.masked_value(),
                    token.updated_at.to_rfc3339(),
                    if token.is_expired() { "  [expired]" } else { "" }
                );
            }
        }
        TokensCommand::Show { project } => match store.latest_token(&project)? {
            Some(token) => println!("{}", token.token_value),
            None => bail!("no token stored for '{project}'"),
        },
        TokensCommand::Remove { id } => {
            if !store.delete_token(id)? {
                bail!("no token with id {id}");
            }
            println!("removed token {id}");
        }
    }
    Ok(())
}
