use crate::config::Config;
use crate::error::{AppError, Result};
use crate::forecast::{
    Anomaly, DemandModel, ForecastReport, HolidayCalendar, Observation, TrendComponents,
};
use crate::ml::{
    FeatureVector, ModelMetadata, ModelMetrics, PredictionExplanation, RiskModel, RiskPrediction,
};
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// File extension of per-school demand artifacts
const DEMAND_ARTIFACT_EXTENSION: &str = "bin";

/// In-process façade over both engines.
///
/// Owns one risk engine and a registry of demand engines keyed by school.
/// Training runs on the blocking thread pool so async callers are not stalled.
pub struct PredictionService {
    /// Configuration
    config: Config,

    /// Shortage risk engine
    risk: Arc<RiskModel>,

    /// Per-school demand engines
    demand: Arc<DashMap<String, Arc<DemandModel>>>,

    /// Calendar given to every new demand engine
    calendar: HolidayCalendar,

    /// Service running state
    running: Arc<RwLock<bool>>,
}

/// Metadata of every trained model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceModelMetrics {
    pub risk: Option<ModelMetadata>,
    pub demand: HashMap<String, ModelMetadata>,
}

/// Service statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub running: bool,
    pub risk_model_ready: bool,
    pub risk_rounds: usize,
    pub demand_schools: usize,
}

impl PredictionService {
    /// Create a new service; engines stay untrained until [`start`](Self::start)
    pub fn new(config: Config) -> Self {
        Self::with_calendar(config, HolidayCalendar::tamil_nadu())
    }

    /// Create a service whose demand engines use `calendar`
    pub fn with_calendar(config: Config, calendar: HolidayCalendar) -> Self {
        let risk = Arc::new(RiskModel::new(config.risk_model.clone()));
        Self {
            config,
            risk,
            demand: Arc::new(DashMap::new()),
            calendar,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the service: load saved artifacts, or train the bootstrap risk model
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(AppError::Internal(
                "prediction service already running".to_string(),
            ));
        }
        *running = true;
        drop(running);

        info!("Starting prediction service");

        if let Err(e) = self.initialize_models().await {
            error!("Failed to initialize models: {}", e);
            warn!("Prediction service will continue without a trained risk model");
        }

        Ok(())
    }

    /// Stop the service
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopping prediction service");
        Ok(())
    }

    /// Check if service is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Load saved models. Demand artifacts are optional: a failure there is
    /// logged and never blocks the risk engine. A risk artifact that cannot
    /// be read is replaced by the bootstrap model.
    async fn initialize_models(&self) -> Result<()> {
        if let Some(dir) = self.config.artifacts.demand_model_dir.clone() {
            if dir.exists() {
                match self.load_demand_artifacts(&dir) {
                    Ok(loaded) => {
                        info!(schools = loaded, dir = %dir.display(), "Loaded demand artifacts")
                    }
                    Err(e) => warn!(
                        dir = %dir.display(),
                        error = %e,
                        "Could not read demand artifacts; schools will train on first use"
                    ),
                }
            }
        }

        if let Some(path) = self.config.artifacts.risk_model_path.clone() {
            if path.exists() {
                let risk = Arc::clone(&self.risk);
                let artifact = path.clone();
                match run_blocking(move || risk.load(&artifact)).await {
                    Ok(()) => return Ok(()),
                    Err(e) => error!(
                        path = %path.display(),
                        error = %e,
                        "Risk artifact is unreadable; training bootstrap model instead"
                    ),
                }
            } else {
                info!(path = %path.display(), "No risk artifact found; training bootstrap model");
            }
        }

        let risk = Arc::clone(&self.risk);
        run_blocking(move || risk.train_default()).await?;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The risk engine
    pub fn risk_model(&self) -> Arc<RiskModel> {
        Arc::clone(&self.risk)
    }

    // ------------------------------------------------------------------
    // Risk
    // ------------------------------------------------------------------

    pub fn predict_risk(&self, vector: &FeatureVector) -> Result<RiskPrediction> {
        self.risk.predict(vector)
    }

    pub fn predict_risk_batch(&self, vectors: &[FeatureVector]) -> Result<Vec<RiskPrediction>> {
        self.risk.predict_batch(vectors)
    }

    pub fn explain_risk(&self, vector: &FeatureVector) -> Result<PredictionExplanation> {
        self.risk.explain_prediction(vector)
    }

    pub fn feature_importance(&self) -> Result<HashMap<String, f64>> {
        self.risk.feature_importance()
    }

    /// Retrain the risk model on the blocking pool
    pub async fn retrain_risk(&self, rows: Vec<Vec<f64>>, labels: Vec<f64>) -> Result<ModelMetrics> {
        let risk = Arc::clone(&self.risk);
        run_blocking(move || risk.retrain_from_rows(rows, labels)).await
    }

    // ------------------------------------------------------------------
    // Demand
    // ------------------------------------------------------------------

    /// Fit (or refit) the demand model of one school
    pub async fn train_demand(
        &self,
        school_id: &str,
        series: Option<Vec<Observation>>,
    ) -> Result<ModelMetrics> {
        let model = match self.demand.get(school_id) {
            Some(existing) => Arc::clone(existing.value()),
            None => Arc::new(DemandModel::with_calendar(
                self.config.demand_model.clone(),
                self.calendar.clone(),
            )?),
        };

        let id = school_id.to_string();
        let trainer = Arc::clone(&model);
        let metrics = run_blocking(move || trainer.train(&id, series.as_deref())).await?;

        self.demand.insert(school_id.to_string(), model);
        Ok(metrics)
    }

    /// Demand engine of a school, trained on the fallback history on first use
    pub async fn demand_model(&self, school_id: &str) -> Result<Arc<DemandModel>> {
        if let Some(existing) = self.demand.get(school_id) {
            return Ok(Arc::clone(existing.value()));
        }

        info!(school_id, "No demand model for school; training on first use");
        self.train_demand(school_id, None).await?;
        self.demand
            .get(school_id)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| AppError::ModelNotReady(format!("no demand model for {}", school_id)))
    }

    /// Forecast with capacity analysis when a capacity is given
    pub async fn forecast_demand(
        &self,
        school_id: &str,
        days: u32,
        capacity: Option<u32>,
    ) -> Result<ForecastReport> {
        let model = self.demand_model(school_id).await?;
        match capacity {
            Some(capacity) => model.forecast_with_capacity(days, capacity),
            None => model.forecast_summary(days),
        }
    }

    pub async fn demand_components(&self, school_id: &str) -> Result<TrendComponents> {
        self.demand_model(school_id).await?.get_trend_components()
    }

    pub async fn detect_demand_anomalies(
        &self,
        school_id: &str,
        values: &[f64],
        dates: &[NaiveDate],
    ) -> Result<Vec<Anomaly>> {
        self.demand_model(school_id)
            .await?
            .detect_anomalies(values, dates)
    }

    /// Schools with a trained demand model, sorted
    pub fn demand_schools(&self) -> Vec<String> {
        let mut schools: Vec<String> = self.demand.iter().map(|e| e.key().clone()).collect();
        schools.sort();
        schools
    }

    // ------------------------------------------------------------------
    // Introspection and persistence
    // ------------------------------------------------------------------

    pub fn model_metrics(&self) -> ServiceModelMetrics {
        ServiceModelMetrics {
            risk: self.risk.metadata(),
            demand: self
                .demand
                .iter()
                .filter_map(|e| e.value().metadata().map(|m| (e.key().clone(), m)))
                .collect(),
        }
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            running: self.is_running().await,
            risk_model_ready: self.risk.is_ready(),
            risk_rounds: self.risk.metadata().map(|m| m.n_rounds).unwrap_or(0),
            demand_schools: self.demand.len(),
        }
    }

    /// Write every trained model to the configured artifact locations
    pub fn save_artifacts(&self) -> Result<()> {
        if let Some(path) = &self.config.artifacts.risk_model_path {
            if self.risk.is_ready() {
                self.risk.save(path)?;
            }
        }
        if let Some(dir) = &self.config.artifacts.demand_model_dir {
            for entry in self.demand.iter() {
                if entry.value().is_ready() {
                    entry.value().save(demand_artifact_path(dir, entry.key())?)?;
                }
            }
        }
        Ok(())
    }

    fn load_demand_artifacts(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DEMAND_ARTIFACT_EXTENSION) {
                continue;
            }
            let model = DemandModel::with_calendar(
                self.config.demand_model.clone(),
                self.calendar.clone(),
            )?;
            match model.load(&path) {
                Ok(()) => {
                    if let Some(school_id) = model.school_id() {
                        self.demand.insert(school_id, Arc::new(model));
                        loaded += 1;
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable demand artifact"),
            }
        }
        Ok(loaded)
    }
}

/// Artifact file of one school inside `dir`
pub fn demand_artifact_path(dir: &Path, school_id: &str) -> Result<PathBuf> {
    let safe = !school_id.is_empty()
        && school_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !safe {
        return Err(AppError::Validation(format!(
            "school_id '{}' cannot be used as an artifact file name",
            school_id
        )));
    }
    Ok(dir.join(format!("{}.{}", school_id, DEMAND_ARTIFACT_EXTENSION)))
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::features::tests::sample_vector;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.risk_model.synthetic_samples = 300;
        config.demand_model.uncertainty_samples = 200;
        config.demand_model.reference_date = NaiveDate::from_ymd_opt(2025, 7, 1);
        config
    }

    #[tokio::test]
    async fn test_service_creation() {
        let service = PredictionService::new(test_config());
        assert!(!service.is_running().await);
        assert!(!service.risk_model().is_ready());
    }

    #[tokio::test]
    async fn test_service_start_stop() {
        let service = PredictionService::new(test_config());

        service.start().await.unwrap();
        assert!(service.is_running().await);
        assert!(service.risk_model().is_ready());
        assert!(service.start().await.is_err());

        service.stop().await.unwrap();
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn test_risk_prediction_after_start() {
        let service = PredictionService::new(test_config());
        service.start().await.unwrap();

        let single = service.predict_risk(&sample_vector()).unwrap();
        let batch = service.predict_risk_batch(&[sample_vector()]).unwrap();
        assert_eq!(batch, vec![single]);
    }

    #[tokio::test]
    async fn test_forecast_trains_school_on_first_use() {
        let service = PredictionService::new(test_config());
        assert!(service.demand_schools().is_empty());

        let report = service.forecast_demand("S1", 7, Some(400)).await.unwrap();
        assert_eq!(report.forecast.len(), 7);
        assert_eq!(report.school_id, "S1");
        assert_eq!(service.demand_schools(), vec!["S1".to_string()]);

        let summary = service.forecast_demand("S1", 7, None).await.unwrap();
        assert_eq!(summary.forecast, report.forecast);

        let stats = service.stats().await;
        assert_eq!(stats.demand_schools, 1);
        assert!(service.model_metrics().demand.contains_key("S1"));
    }

    #[tokio::test]
    async fn test_unreadable_demand_dir_does_not_block_risk_model() {
        let dir = tempfile::TempDir::new().unwrap();
        let not_a_dir = dir.path().join("demand");
        std::fs::write(&not_a_dir, b"plain file").unwrap();

        let mut config = test_config();
        config.artifacts.demand_model_dir = Some(not_a_dir);
        let service = PredictionService::new(config);
        service.start().await.unwrap();

        assert!(service.risk_model().is_ready());
        assert!(service.demand_schools().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_risk_artifact_falls_back_to_bootstrap() {
        let dir = tempfile::TempDir::new().unwrap();
        let artifact = dir.path().join("risk.bin");
        std::fs::write(&artifact, b"truncated").unwrap();

        let mut config = test_config();
        config.artifacts.risk_model_path = Some(artifact);
        let service = PredictionService::new(config);
        service.start().await.unwrap();

        assert!(service.risk_model().is_ready());
        assert!(service.predict_risk(&sample_vector()).is_ok());
    }

    #[test]
    fn test_artifact_path_rejects_traversal() {
        let dir = Path::new("/tmp/models");
        assert!(demand_artifact_path(dir, "S-01_a").is_ok());
        assert!(demand_artifact_path(dir, "../etc").is_err());
        assert!(demand_artifact_path(dir, "").is_err());
    }
}
