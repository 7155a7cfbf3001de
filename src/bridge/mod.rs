use chrono::{DateTime, Utc};
use log::{debug, error, info};
use std::time::Duration;
use thiserror::Error;

use crate::config::{BridgeConfig, Config};
use crate::metering_62056::meter_definitions::get_meter_definition_by_manufacturer;
use crate::metering_62056::{read_meter, MeterError, MeterIdentification, MeterSettings, Readout};
use crate::mqtt::payload::PayloadValue;
use crate::mqtt::{qos_from_u8, BrokerClient, BrokerError};
use crate::obis_utils;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Meter readout failed: {0}")]
    Meter(#[from] MeterError),
    #[error("Publishing failed: {0}")]
    Broker(#[from] BrokerError),
    #[error("Readout task failed: {0}")]
    Task(String),
}

/// Topic for a meter, identification characters that are special in MQTT
/// topics are replaced.
pub fn meter_topic(base_topic: &str, identification: &MeterIdentification) -> String {
    let id: String = identification
        .identification
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' | ' ' => '_',
            c => c,
        })
        .collect();
    return format!("{}/{}/{}", base_topic, identification.manufacturer, id);
}

/// JSON report of one readout. Datasets are keyed by the friendly name of
/// the meter profile when there is one, by the OBIS address otherwise.
pub fn build_report(identification: &MeterIdentification, readout: &Readout, read_at: DateTime<Utc>) -> PayloadValue {
    let definition = get_meter_definition_by_manufacturer(&identification.manufacturer);

    let mut values = PayloadValue::object();
    for dataset in &readout.datasets {
        let key = definition
            .as_ref()
            .and_then(|d| d.friendly_name(&dataset.address))
            .map(|s| s.to_string())
            .unwrap_or_else(|| dataset.address.clone());

        let mut entry = PayloadValue::object();
        entry.insert("obis", dataset.address.as_str());
        match dataset.numeric_value() {
            Some(number) => entry.insert("value", number),
            None => entry.insert("value", dataset.value.as_str()),
        }
        entry.insert("unit", dataset.unit.clone());
        if let Some(description) = obis_utils::get_obis_description(&dataset.address) {
            entry.insert("description", description);
        }
        values.insert(&key, entry);
    }

    let mut report = PayloadValue::object();
    report.insert("manufacturer", identification.manufacturer.as_str());
    report.insert("identification", identification.identification.as_str());
    report.insert("read_at", read_at);
    report.insert("values", values);
    return report;
}

/// Reads the meter once and publishes the report.
pub async fn run_once(client: &BrokerClient, settings: &MeterSettings, bridge: &BridgeConfig) -> Result<(), BridgeError> {
    let blocking_settings = settings.clone();
    let (identification, readout) = tokio::task::spawn_blocking(move || read_meter(&blocking_settings))
        .await
        .map_err(|e| BridgeError::Task(e.to_string()))??;

    info!("Read {} datasets from {}", readout.datasets.len(), identification.full_id());
    let topic = meter_topic(&bridge.base_topic, &identification);
    let report = build_report(&identification, &readout, Utc::now());
    client.publish(&topic, report, qos_from_u8(bridge.qos), bridge.retain).await?;
    debug!("Published readout to {topic}");
    Ok(())
}

/// Reads and publishes every `interval_secs` until the broker session ends.
/// Failed readouts are logged and retried on the next tick.
pub async fn run(client: &BrokerClient, config: &Config) -> Result<(), BridgeError> {
    let mut interval = tokio::time::interval(Duration::from_secs(config.bridge.interval_secs));
    loop {
        interval.tick().await;
        match run_once(client, &config.meter, &config.bridge).await {
            Ok(()) => {}
            Err(BridgeError::Broker(e @ BrokerError::InvalidState(_))) => {
                error!("Broker session is gone: {e}");
                return Err(BridgeError::Broker(e));
            }
            Err(e) => error!("{e}"),
        }
    }
}
