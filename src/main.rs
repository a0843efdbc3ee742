use ecobulles_monitor::{
    AppConfig, ConfigFlow, EcobullesClient, EntityPublisher, InMemoryDeviceRegistry,
    Integration, SensorState,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Publishes sensor states to the log.
struct LogPublisher;

impl EntityPublisher for LogPublisher {
    fn publish(&self, state: &SensorState) {
        match state.value {
            Some(value) if state.available => {
                info!("{}: {} {} {:?}", state.name, value, state.unit, state.attributes)
            }
            Some(value) => info!("{}: {} {} (stale)", state.name, value, state.unit),
            None => info!("{}: unavailable", state.name),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Ecobulles usage monitor");
    let config = AppConfig::from_env()?;
    let client = EcobullesClient::with_base_url(config.base_url.clone());

    let entry_id = format!("ecobulles_{}", config.credentials.email);
    let entry = ConfigFlow::new(client.clone())
        .submit(entry_id.clone(), config.credentials)
        .await?;

    let mut integration = Integration::new(
        client,
        InMemoryDeviceRegistry::default(),
        Arc::new(LogPublisher),
    );
    integration.setup_entry(entry).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    integration.shutdown();
    Ok(())
}
