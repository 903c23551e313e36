use std::sync::Arc;

use anyhow::anyhow;
use tracing::info;

use crate::clock::SystemClock;
use crate::config::Config;
use crate::credentials::CredentialChain;
use crate::db::Database;
use crate::gateway::{RetryPolicy, RetryingGateway, TelegramGateway};
use crate::scheduler::{RevalidationScheduler, SchedulerSettings};
use crate::validator::ChannelValidator;

/// Wire the production gateway, credential chain and clock around `db`.
pub fn build_validator(
    config: &Config,
    db: Arc<Database>,
) -> Result<ChannelValidator, crate::error::ChanguardError> {
    let gateway = RetryingGateway::new(
        TelegramGateway::from_config(config)?,
        RetryPolicy::from_config(config),
    );
    let credentials = CredentialChain::from_config(config)?;
    Ok(ChannelValidator::new(
        db,
        Arc::new(gateway),
        Arc::new(credentials),
        Arc::new(SystemClock),
        config.validation_deadline(),
    ))
}

pub async fn run(config: Config, db: Database) -> anyhow::Result<()> {
    let db = Arc::new(db);
    let validator = Arc::new(build_validator(&config, db)?);

    let scheduler = Arc::new(RevalidationScheduler::new(
        validator.clone(),
        SchedulerSettings::from_config(&config),
    ));
    if config.revalidation_enabled {
        scheduler.start();
    } else {
        info!("Scheduled revalidation disabled");
    }

    if config.web_enabled {
        info!(
            "Starting channel API on {}:{}",
            config.web_host, config.web_port
        );
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        crate::web::serve(&config, validator, scheduler.clone(), shutdown).await?;
    } else if config.revalidation_enabled {
        info!("Runtime active; waiting for Ctrl-C");
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow!("Failed to listen for Ctrl-C: {e}"))?;
    } else {
        return Err(anyhow!(
            "Nothing to run. Enable web_enabled or revalidation_enabled in the config."
        ));
    }

    info!("Shutting down");
    scheduler.stop().await;
    Ok(())
}
