//! Registry fleet orchestrator: routes HTTP requests to a long-lived child service per
//! tenant account and keeps the fleet converged against the account set known to a
//! database, via one of two interchangeable backends.

pub mod account;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod metrics;
pub mod storage;
pub mod telemetry;

pub use error::{Error, Result};
pub use metrics::Metrics;
