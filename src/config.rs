use crate::forecast::DemandModelConfig;
use crate::ml::RiskModelConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Risk model (gradient boosting) configuration
    #[serde(default)]
    #[validate(nested)]
    pub risk_model: RiskModelConfig,

    /// Demand forecasting configuration
    #[serde(default)]
    #[validate(nested)]
    pub demand_model: DemandModelConfig,

    /// Model artifact locations
    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> crate::error::Result<Self> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/default.toml".to_string());

        let config: Config = config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(&config_path).required(false))
            // Override with environment variables (prefix: MEAL_ENGINE)
            .add_source(
                config::Environment::with_prefix("MEAL_ENGINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Risk ensemble artifact; loaded at startup when present
    pub risk_model_path: Option<PathBuf>,

    /// Directory holding one demand artifact per school
    pub demand_model_dir: Option<PathBuf>,

    /// Persist freshly trained models on startup
    #[serde(default)]
    pub save_on_startup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Service name
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            service_name: default_service_name(),
            prometheus_enabled: true,
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "meal-shortage-engine".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_defaults_deserialize() {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.risk_model.boosting.num_leaves, 31);
        assert_eq!(config.risk_model.boosting.max_depth, 7);
        assert_eq!(config.demand_model.history_days, 90);
        assert!((config.demand_model.interval_width - 0.95).abs() < 1e-12);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_invalid_interval_width_rejected() {
        let mut config = Config::default();
        config.demand_model.interval_width = 1.5;
        assert!(config.validate().is_err());
    }
}
