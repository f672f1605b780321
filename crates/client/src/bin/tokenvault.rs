use std::io;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokenvault_client::{BrokerClient, URL_ENV};

#[derive(Parser, Debug)]
#[command(name = "tokenvault", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Broker base url (defaults to $TOKENVAULT_URL, then http://127.0.0.1:9999)
    #[arg(long = "url", value_name = "URL", global = true)]
    url: Option<String>,

    /// Optional log filter (e.g. info, debug)
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the broker answers
    Ping,
    /// Store TOKEN as the current token of PROJECT
    Push { project: String, token: String },
    /// Print the current token of PROJECT
    Fetch { project: String },
    /// List projects known to the broker
    Projects,
    /// Show the broker's running state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let client = match &cli.url {
        Some(url) => BrokerClient::new(url),
        None => BrokerClient::from_env(),
    }
    .with_context(|| format!("Invalid broker url (check --url or ${URL_ENV})"))?;
    tracing::debug!("using broker at {}", client.base_url());

    match cli.command {
        Command::Ping => {
            let pong = client.ping().await?;
            println!("{} (version {})", pong.status, pong.version);
        }
        Command::Push { project, token } => {
            let receipt = client.push_token(&project, &token).await?;
            println!("{} token for '{}'", receipt.status, receipt.project);
        }
        Command::Fetch { project } => match client.fetch_token(&project).await? {
            Some(token) => println!("{token}"),
            None => bail!("no token stored for '{project}'"),
        },
        Command::Projects => {
            for project in client.list_projects().await? {
                println!(
                    "{:<24} port={:<5} {}",
                    project.name,
                    project.port,
                    project.api_base_url.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Status => {
            let status = client.status().await?;
            let state = status
                .state
                .unwrap_or_else(|| if status.running { "running" } else { "stopped" }.into());
            println!("{state} on port {}", status.port);
        }
    }

    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = level
        .and_then(|level| tracing_subscriber::EnvFilter::try_new(level).ok())
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    let _ = builder.try_init();
}
