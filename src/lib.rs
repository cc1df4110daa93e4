//! Meal shortage engine
//!
//! Two predictive engines for school meal programs:
//! - [`ml::RiskModel`]: gradient-boosted regression from 15 operational
//!   features to a 0-100 shortage risk score and level
//! - [`forecast::DemandModel`]: per-school additive time-series forecast of
//!   daily meal demand with prediction intervals, capacity analysis and
//!   anomaly detection
//!
//! [`service::PredictionService`] wires both engines together for the binaries.

pub mod config;
pub mod error;
pub mod forecast;
pub mod metrics;
pub mod ml;
pub mod service;

pub use config::Config;
pub use error::{AppError, Result};
pub use service::PredictionService;
