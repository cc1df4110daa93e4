/// Per-school meal demand forecasting
///
/// This module provides:
/// - An additive trend + seasonality + holiday model with simulated intervals
/// - An injectable holiday/exam calendar
/// - Capacity-aware shortage analysis and anomaly detection
/// - A reproducible synthetic history for schools without recorded demand

pub mod calendar;
pub mod engine;
pub mod linalg;
pub mod model;
pub mod models;
pub mod seasonality;
pub mod synthetic;
pub mod trend;

pub use calendar::{AnchorRule, HolidayCalendar, HolidayEvent};
pub use engine::DemandModel;
pub use models::{
    Anomaly, AnomalyKind, ComponentPoint, DemandModelConfig, DemandPoint, ForecastReport,
    ForecastRiskLevel, Observation, ShortageDay, TrendComponents, MAX_FORECAST_DAYS,
};
