//! # Schoolbell: Guardian Notification Dispatch
//!
//! Turns attendance, fee and payment events into SMS, email and in-app
//! notifications for guardians, at most once per event per guardian.
//!
//! Usage:
//!   schoolbell run                          # Today's batch sweep, all institutions
//!   schoolbell run --ids att-001 --mode realtime
//!   schoolbell serve --port 8080            # HTTP API
//!   schoolbell categories                   # Print the category catalog
//!   schoolbell init                         # Create config + database schema

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use schoolbell_core::config::SchoolbellConfig;
use schoolbell_core::types::RunMode;
use schoolbell_dispatch::{Catalog, NotifyDb, RunRequest, TriggerEvaluator};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "schoolbell",
    version,
    about = "🔔 Schoolbell: guardian notification dispatch engine"
)]
struct Cli {
    /// Config file (default: ~/.schoolbell/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate pending events once and print the JSON summary
    Run {
        /// Only events of this institution
        #[arg(long)]
        institution: Option<String>,

        /// Targeted re-run of these reference ids (comma separated); ignores --day
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,

        /// Only these event types (comma separated)
        #[arg(long = "types", value_delimiter = ',')]
        event_types: Vec<String>,

        /// realtime | batch (audit only)
        #[arg(long, default_value = "batch")]
        mode: RunMode,

        /// Day to evaluate, YYYY-MM-DD (default: today, UTC)
        #[arg(long)]
        day: Option<NaiveDate>,
    },
    /// Start the HTTP API
    Serve {
        /// Override gateway port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the category catalog (built-ins plus config overrides)
    Categories,
    /// Write a default config (if missing) and create the database schema
    Init,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: Option<&str>) -> Result<SchoolbellConfig> {
    let config = match path {
        Some(p) => SchoolbellConfig::load_from(&expand_path(p))?,
        None => SchoolbellConfig::load()?,
    };
    Ok(config)
}

fn open_db(config: &SchoolbellConfig) -> Result<Arc<NotifyDb>> {
    let path = expand_path(&config.database.path);
    let db = NotifyDb::open(&path, Duration::from_millis(config.database.busy_timeout_ms))
        .with_context(|| format!("opening database {}", path.display()))?;
    tracing::debug!("💾 Database: {}", path.display());
    Ok(Arc::new(db))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "schoolbell=debug,schoolbell_dispatch=debug,schoolbell_channels=debug,schoolbell_gateway=debug,tower_http=debug"
    } else {
        "schoolbell=info,schoolbell_dispatch=info,schoolbell_channels=info,schoolbell_gateway=info"
    };
    // Logs go to stderr so `run` output stays valid JSON.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Init => init(cli.config.as_deref()),
        Command::Categories => {
            let config = load_config(cli.config.as_deref())?;
            let catalog = Catalog::with_overrides(&config.categories);
            for c in catalog.iter() {
                let channels: Vec<String> = c.channels.iter().map(|ch| ch.to_string()).collect();
                println!("{:<22} {:<9?} [{}]  {}", c.id, c.cadence, channels.join(", "), c.label);
            }
            Ok(())
        }
        Command::Run {
            institution,
            ids,
            event_types,
            mode,
            day,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let db = open_db(&config)?;
            let evaluator = TriggerEvaluator::from_config(&config, db)?;
            let summary = evaluator
                .run(RunRequest {
                    institution_id: institution,
                    reference_ids: ids,
                    event_types,
                    mode,
                    day,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Serve { port } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let db = open_db(&config)?;
            schoolbell_gateway::start(&config, db).await
        }
    }
}

fn init(config_path: Option<&str>) -> Result<()> {
    println!("🔔 Schoolbell Setup\n");
    let path = config_path
        .map(expand_path)
        .unwrap_or_else(SchoolbellConfig::default_path);

    let config = if path.exists() {
        println!("⚠️  Config already exists: {}", path.display());
        SchoolbellConfig::load_from(&path)?
    } else {
        let config = SchoolbellConfig::default();
        config.save_to(&path)?;
        println!("✅ Config written: {}", path.display());
        config
    };

    let db = open_db(&config)?;
    drop(db);
    println!("✅ Database ready: {}", expand_path(&config.database.path).display());
    if !config.sms.is_configured() {
        println!("   Set SCHOOLBELL_SMS_URL and SCHOOLBELL_SMS_TOKEN to enable SMS.");
    }
    if !config.email.is_configured() {
        println!("   Set [email] smtp_host, SCHOOLBELL_EMAIL_API_KEY and SCHOOLBELL_EMAIL_FROM to enable email.");
    }
    Ok(())
}
