//! Transaction integrity engine for offline-first peer-to-peer payments.
//!
//! Devices sync batches of transactions they accepted offline. Each one is
//! deduplicated by id, scored for risk, classified, categorized and written
//! to the ledger exactly once; single-use tokens guard against double spend.
//! A separate batch sweep looks for collusion, circular loops and bursts.

pub mod anomaly;
pub mod category;
pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod reconcile;
pub mod reliability;
pub mod risk;
pub mod service;
pub mod signature;
pub mod storage;
pub mod trust;
pub mod verify;

pub use config::Config;
pub use error::IntegrityError;
pub use service::IntegrityEngine;
