use anyhow::Context;
use tracing_subscriber::fmt::init;

use quiz_duel_api::{
    config::{Config, StorageBackend},
    services::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();

    let config = Config::load().context("Failed to load configuration")?;
    if config.storage == StorageBackend::Memory {
        anyhow::bail!("Standalone timeout worker needs shared storage; set STORAGE_BACKEND=mongo");
    }

    let app_state = AppState::new(config)
        .await
        .context("Failed to initialize app state")?;

    app_state.timeout_worker().run().await?;

    Ok(())
}
