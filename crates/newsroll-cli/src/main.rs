use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use newsroll_core::{parse_timezone, FetchKey};
use newsroll_sync::SyncConfig;
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "newsroll")]
#[command(about = "Hourly news refresh cache")]
struct Cli {
    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the refresh gate once for a user and print the outcome as JSON.
    Refresh {
        #[arg(long)]
        user: String,
    },
    /// Create a user's refresh record and finish registration after the settle delay.
    Register {
        #[arg(long)]
        user: String,
    },
    /// Print the hour-bucket key for now, or for `--at` (RFC 3339).
    Bucket {
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level)?;

    match cli.command {
        Commands::Refresh { user } => {
            let outcome = newsroll_sync::refresh_once_from_env(&user).await?;
            info!(
                user_id = %user,
                decision = ?outcome.decision,
                added = outcome.added,
                "refresh command finished"
            );
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Register { user } => {
            newsroll_sync::register_from_env(&user).await?;
            info!(user_id = %user, "registration finished");
            println!("registered {user}");
        }
        Commands::Bucket { at } => {
            let config = SyncConfig::from_env();
            let reference = parse_timezone(&config.reference_timezone)
                .context("resolving NEWSROLL_TIMEZONE")?;
            println!("{}", FetchKey::for_instant(at.unwrap_or_else(Utc::now), reference));
        }
        Commands::Serve => {
            info!("starting web server");
            newsroll_web::serve_from_env().await?
        }
    }

    Ok(())
}
