//! Meter readout and broker session clients.
//!
//! `metering_62056` talks IEC 62056-21 mode C to electricity meters over a
//! serial line or a serial gateway, `mqtt` keeps a publish/subscribe session
//! with an MQTT broker alive across connection losses. `bridge` ties both
//! together for the `energylink` binary.

pub mod bridge;
pub mod config;
pub mod metering_62056;
pub mod mqtt;
pub mod obis_utils;

pub use config::Config;
pub use metering_62056::{MeterError, MeterSession};
pub use mqtt::{BrokerClient, BrokerError, BrokerOptions};

/// Error classes shared by both clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    Rejected,
    BackpressureExceeded,
    State,
}
