use std::sync::Arc;

use changuard::config::Config;
use changuard::scheduler::{RevalidationScheduler, SchedulerSettings};
use changuard::{db, logging, runtime};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(
    name = "changuard",
    version = VERSION,
    about = "Validates that bots can publish to their accounts' channels"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<MainCommand>,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Start the API server and the revalidation scheduler
    Start,
    /// Revalidate one account's channel now
    Revalidate { account_id: String },
    /// Revalidate every configured channel now, ignoring staleness
    RevalidateAll,
    /// Delete validation history older than the retention window
    Prune,
    /// Show version
    Version,
}

fn load_config() -> anyhow::Result<Config> {
    let mut config = Config::load()?;
    config.data_dir = config.runtime_data_dir();
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(MainCommand::Start) => {
            let config = load_config()?;
            logging::init_file_logging(std::path::Path::new(&config.data_dir))?;
            info!("Starting changuard {VERSION}");
            let db = db::Database::new(&config.data_dir)?;
            info!("Database initialized");
            runtime::run(config, db).await?;
        }
        Some(MainCommand::Revalidate { account_id }) => {
            logging::init_console_logging();
            let config = load_config()?;
            let db = Arc::new(db::Database::new(&config.data_dir)?);
            let validator = runtime::build_validator(&config, db)?;
            let outcome = validator.revalidate(&account_id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Some(MainCommand::RevalidateAll) => {
            logging::init_console_logging();
            let config = load_config()?;
            let db = Arc::new(db::Database::new(&config.data_dir)?);
            let validator = Arc::new(runtime::build_validator(&config, db)?);
            let scheduler =
                RevalidationScheduler::new(validator, SchedulerSettings::from_config(&config));
            let report = scheduler.run_now(None).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some(MainCommand::Prune) => {
            logging::init_console_logging();
            let config = load_config()?;
            let db = Arc::new(db::Database::new(&config.data_dir)?);
            let validator = Arc::new(runtime::build_validator(&config, db)?);
            let scheduler =
                RevalidationScheduler::new(validator, SchedulerSettings::from_config(&config));
            let removed = scheduler.run_prune().await?;
            println!("Removed {removed} history record(s)");
        }
        Some(MainCommand::Version) => {
            println!("changuard {VERSION}");
        }
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
        }
    }
    Ok(())
}
