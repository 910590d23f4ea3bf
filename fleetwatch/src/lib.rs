//! fleetwatch library crate.
//!
//! Polls a network-device inventory API on fixed cadences, keeps a durable
//! registry of devices that are down, and enriches those devices with
//! rate-limited detail lookups. The binary wires these pieces together via
//! [`services::ServiceContainer`].

pub mod config;
pub mod enricher;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod tracker;
pub mod utils;

pub use error::{Error, Result};
