use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Longest forecast horizon served, in days
pub const MAX_FORECAST_DAYS: u32 = 30;

/// Demand model configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DemandModelConfig {
    /// Length of the synthetic fallback history
    #[serde(default = "default_history_days")]
    #[validate(range(min = 2, max = 3650))]
    pub history_days: u32,

    /// Number of potential trend changepoints
    #[serde(default = "default_n_changepoints")]
    #[validate(range(max = 500))]
    pub n_changepoints: usize,

    /// Share of the history in which changepoints may be placed
    #[serde(default = "default_changepoint_range")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub changepoint_range: f64,

    /// Laplace prior scale on trend rate changes
    #[serde(default = "default_changepoint_prior_scale")]
    #[validate(range(min = 0.000001))]
    pub changepoint_prior_scale: f64,

    /// Normal prior scale on Fourier coefficients
    #[serde(default = "default_prior_scale")]
    #[validate(range(min = 0.000001))]
    pub seasonality_prior_scale: f64,

    /// Normal prior scale on holiday effects
    #[serde(default = "default_prior_scale")]
    #[validate(range(min = 0.000001))]
    pub holidays_prior_scale: f64,

    #[serde(default = "default_weekly_order")]
    #[validate(range(max = 50))]
    pub weekly_fourier_order: usize,

    #[serde(default = "default_yearly_order")]
    #[validate(range(max = 50))]
    pub yearly_fourier_order: usize,

    /// Period in days of the custom monthly seasonality
    #[serde(default = "default_monthly_period")]
    #[validate(range(min = 1.0))]
    pub monthly_period: f64,

    #[serde(default = "default_monthly_order")]
    #[validate(range(max = 50))]
    pub monthly_fourier_order: usize,

    /// Probability mass covered by the prediction interval
    #[serde(default = "default_interval_width")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub interval_width: f64,

    /// Monte Carlo draws used to estimate intervals
    #[serde(default = "default_uncertainty_samples")]
    #[validate(range(min = 1, max = 100000))]
    pub uncertainty_samples: usize,

    /// "Today" for the synthetic fallback history; defaults to the current UTC date
    #[serde(default)]
    pub reference_date: Option<NaiveDate>,
}

impl Default for DemandModelConfig {
    fn default() -> Self {
        Self {
            history_days: default_history_days(),
            n_changepoints: default_n_changepoints(),
            changepoint_range: default_changepoint_range(),
            changepoint_prior_scale: default_changepoint_prior_scale(),
            seasonality_prior_scale: default_prior_scale(),
            holidays_prior_scale: default_prior_scale(),
            weekly_fourier_order: default_weekly_order(),
            yearly_fourier_order: default_yearly_order(),
            monthly_period: default_monthly_period(),
            monthly_fourier_order: default_monthly_order(),
            interval_width: default_interval_width(),
            uncertainty_samples: default_uncertainty_samples(),
            reference_date: None,
        }
    }
}

impl DemandModelConfig {
    /// Hyperparameters as strings, for model metadata
    pub fn describe(&self) -> std::collections::HashMap<String, String> {
        [
            ("n_changepoints", self.n_changepoints.to_string()),
            ("changepoint_range", self.changepoint_range.to_string()),
            ("changepoint_prior_scale", self.changepoint_prior_scale.to_string()),
            ("seasonality_prior_scale", self.seasonality_prior_scale.to_string()),
            ("holidays_prior_scale", self.holidays_prior_scale.to_string()),
            ("weekly_fourier_order", self.weekly_fourier_order.to_string()),
            ("yearly_fourier_order", self.yearly_fourier_order.to_string()),
            ("monthly_period", self.monthly_period.to_string()),
            ("monthly_fourier_order", self.monthly_fourier_order.to_string()),
            ("interval_width", self.interval_width.to_string()),
            ("uncertainty_samples", self.uncertainty_samples.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

fn default_history_days() -> u32 {
    90
}

fn default_n_changepoints() -> usize {
    25
}

fn default_changepoint_range() -> f64 {
    0.8
}

fn default_changepoint_prior_scale() -> f64 {
    0.05
}

fn default_prior_scale() -> f64 {
    10.0
}

fn default_weekly_order() -> usize {
    3
}

fn default_yearly_order() -> usize {
    10
}

fn default_monthly_period() -> f64 {
    30.5
}

fn default_monthly_order() -> usize {
    5
}

fn default_interval_width() -> f64 {
    0.95
}

fn default_uncertainty_samples() -> usize {
    1000
}

/// One day of observed demand
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub value: f64,
}

impl Observation {
    pub fn new(date: NaiveDate, value: f64) -> Self {
        Self { date, value }
    }
}

/// Forecast for one calendar day, in whole meals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandPoint {
    pub date: NaiveDate,
    pub predicted_demand: u32,
    pub lower_bound: u32,
    pub upper_bound: u32,
}

/// Forecast day whose demand exceeds capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortageDay {
    pub date: NaiveDate,
    pub predicted_demand: u32,
    pub capacity: u32,
    pub shortage: u32,
}

/// Capacity risk of a forecast window, by number of shortage days
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum ForecastRiskLevel {
    Low,
    Medium,
    High,
}

impl ForecastRiskLevel {
    /// More than two shortage days is High, one or two is Medium
    pub fn from_shortage_count(count: usize) -> Self {
        match count {
            0 => ForecastRiskLevel::Low,
            1 | 2 => ForecastRiskLevel::Medium,
            _ => ForecastRiskLevel::High,
        }
    }
}

/// Forecast with capacity analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastReport {
    pub school_id: String,
    pub forecast: Vec<DemandPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    pub avg_predicted_demand: f64,
    pub max_predicted_demand: u32,
    /// Mean demand as a percentage of capacity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity_utilization: Option<f64>,
    pub shortage_days: Vec<ShortageDay>,
    pub risk_level: ForecastRiskLevel,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AnomalyKind {
    /// Above the upper bound
    Spike,
    /// Below the lower bound
    Drop,
}

/// Observation outside the model's prediction interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub date: NaiveDate,
    pub actual_demand: f64,
    pub predicted_demand: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub deviation_percent: f64,
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
}

/// Value of one additive component on one day
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// Additive decomposition over the next 30 days, in meals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendComponents {
    pub trend: Vec<ComponentPoint>,
    pub weekly: Vec<ComponentPoint>,
    pub yearly: Vec<ComponentPoint>,
    pub monthly: Vec<ComponentPoint>,
    pub holidays: Vec<ComponentPoint>,
}
