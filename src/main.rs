use energylink::bridge;
use energylink::config::{self, Config};
use energylink::BrokerClient;
use log::{error, info};
use std::error::Error;
use std::path::Path;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    let default_filter = std::env::var("ELINK_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let explicit = std::env::args().nth(1);
    let path = config::locate(Path::new("."), explicit.as_deref())?;
    let config = Config::load(&path)?;

    let client = BrokerClient::new(config.mqtt.clone());
    client.connect().await?;
    info!("Reading {} every {}s", config.meter.port, config.bridge.interval_secs);

    let result = bridge::run(&client, &config).await;
    client.close().await?;
    if let Err(e) = &result {
        error!("Bridge stopped: {e}");
    }
    result?;
    Ok(())
}
