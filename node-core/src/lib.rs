//! Platform-agnostic core of an RS-485 sensor telemetry node.
//!
//! The node answers RTU requests on a half-duplex bus, exposing sensor
//! telemetry and configuration through a register map. Everything here is
//! `no_std` and allocation-free; the firmware supplies a [`Bus`], a
//! [`ByteStore`], an identify LED and the fitted sensors.
//!
//! # Architecture
//!
//! ```text
//! Bus --> Dispatcher --> RegisterMap <-- SensorManager <-- Sensor...
//!                          |    |
//!             CommandApplier   Identify --> LED
//!                   |
//!           PersistentStore
//! ```
//!
//! Stages run cooperatively from [`Node::run_cycle`] and share state only
//! through the [`RegisterMap`]. Each register has exactly one writer role.
//!
//! # Features
//!
//! - **`std`**: Enable standard library support (for host testing)
//! - **`defmt`**: Log through defmt (for embedded targets)
//! - **`log`**: Log through the `log` facade

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

// must come first so the logging macros are visible to every module
#[macro_use]
mod fmt;

pub mod bus;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod identify;
pub mod node;
pub mod registers;
pub mod sensor;
pub mod stats;
pub mod store;

pub use bus::{Bus, BusError, Rs485, SerialPort};
pub use command::{CommandApplier, Health, ImuHealth, LineSettings};
pub use config::{NodeConfig, DEFAULT_CONFIG};
pub use dispatcher::Dispatcher;
pub use identify::{Identify, IdentifyState};
pub use node::Node;
pub use registers::{Bank, RegisterError, RegisterMap};
pub use sensor::{
    Anemometer, Channel, MillivoltSource, Sensor, SensorError, SensorKind, SensorManager,
    SensorSet, TelemetryDelta, WindSample,
};
pub use stats::{TumblingWindow, WindowSummary};
pub use store::{ByteStore, PersistentStore, RamStore, StoreError, StoreStatus};

pub use rtu_proto;
