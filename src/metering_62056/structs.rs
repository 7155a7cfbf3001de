use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::obis_utils;

/// Identification frame sent by the meter in reply to the sign-on request,
/// `/<mfr><baud>[\<W>]<id>\r\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterIdentification {
    pub manufacturer: String,
    pub baud_char: char,
    /// Enhanced capability character following a backslash, if present.
    pub enhanced: Option<char>,
    pub identification: String,
}

impl MeterIdentification {
    pub fn full_id(&self) -> String {
        return format!("{}{}", self.manufacturer, self.identification);
    }
}

/// One `address(value*unit)` occurrence of a data block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSet {
    pub address: String,
    pub value: String,
    pub unit: Option<String>,
}

impl DataSet {
    pub fn numeric_value(&self) -> Option<f64> {
        obis_utils::extract_numeric_value(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readout {
    pub datasets: Vec<DataSet>,
    pub bcc: u8,
}

impl Readout {
    pub fn get(&self, address: &str) -> Option<&DataSet> {
        self.datasets.iter().find(|d| d.address == address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    SignedOn,
    ReadingOut,
    Done,
    Aborted,
}

/// Mode character of the option select message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
    Readout,
    Programming,
    /// Manufacturer specific table, 6 to 9.
    Manufacturer(u8),
}

impl DataMode {
    pub fn as_char(&self) -> Option<char> {
        match self {
            DataMode::Readout => Some('0'),
            DataMode::Programming => Some('1'),
            DataMode::Manufacturer(n @ 6..=9) => char::from_digit(*n as u32, 10),
            DataMode::Manufacturer(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

fn settings_initial_baud_default() -> u32 { return 300 }
fn settings_parity_default() -> Parity { return Parity::Even }
fn settings_data_bits_default() -> DataBits { return DataBits::Seven }
fn settings_stop_bits_default() -> StopBits { return StopBits::One }
fn settings_identify_timeout_default() -> u64 { return 1500 }
fn settings_readout_timeout_default() -> u64 { return 30000 }
fn settings_mode_default() -> DataMode { return DataMode::Readout }

/// Everything needed to open a session. `port` is either a serial device
/// path or `tcp://host:port` for a transparent serial gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterSettings {
    pub port: String,
    #[serde(default)]
    pub device_address: Option<String>,
    #[serde(default="settings_initial_baud_default")]
    pub initial_baud: u32,
    #[serde(default="settings_parity_default")]
    pub parity: Parity,
    #[serde(default="settings_data_bits_default")]
    pub data_bits: DataBits,
    #[serde(default="settings_stop_bits_default")]
    pub stop_bits: StopBits,
    #[serde(default="settings_identify_timeout_default")]
    pub identify_timeout_ms: u64,
    #[serde(default="settings_readout_timeout_default")]
    pub readout_timeout_ms: u64,
    #[serde(default="settings_mode_default")]
    pub mode: DataMode,
}

impl MeterSettings {
    pub fn new(port: &str) -> Self {
        return MeterSettings {
            port: port.to_string(),
            device_address: None,
            initial_baud: settings_initial_baud_default(),
            parity: settings_parity_default(),
            data_bits: settings_data_bits_default(),
            stop_bits: settings_stop_bits_default(),
            identify_timeout_ms: settings_identify_timeout_default(),
            readout_timeout_ms: settings_readout_timeout_default(),
            mode: settings_mode_default(),
        };
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeterType {
    EasyMeter,
    EBZ,
    Generic,
}

#[derive(Debug, Clone)]
pub struct MeterDefinition {
    pub meter_type: MeterType,
    pub manufacturer_code: String,
    pub default_baud_rate: u32,
    pub obis_mapping: HashMap<String, String>,
}
