// lib.rs
#![warn(clippy::large_futures)]

pub use std::{net, pin::Pin, sync::Arc};

pub use anyhow::bail;
pub use chrono::*;
pub use esp_idf_hal::prelude::*;
pub use esp_idf_hal::{delay::FreeRtos, uart};
pub use log::*;
pub use serde::{Deserialize, Serialize};
pub use tokio::time::{sleep, timeout, Duration};

pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

mod frame;
pub use frame::*;

mod telegram;
pub use telegram::*;

mod store;
pub use store::*;

mod logger;
pub use logger::*;

mod predict;
pub use predict::*;

mod serial;
pub use serial::*;

mod config;
pub use config::*;

mod state;
pub use state::*;

mod apiserver;
pub use apiserver::*;

mod wifi;
pub use wifi::*;

mod error;
pub use error::*;

// EOF
