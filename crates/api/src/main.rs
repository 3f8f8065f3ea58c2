//! Helmet Relay - Main Entry Point

use anyhow::Context;
use api::settings::RelaySettings;
use api::{init_logging, run};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = RelaySettings::load().context("loading settings")?;
    init_logging(&settings.logging)?;

    info!("=== Helmet Relay v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "Storage: {:?}, MQTT: {}, escalation: {:?}",
        settings.storage.backend, settings.mqtt.enabled, settings.notify.channel
    );

    run(settings).await
}
