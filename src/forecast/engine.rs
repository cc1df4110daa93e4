use crate::error::{AppError, Result};
use crate::forecast::calendar::HolidayCalendar;
use crate::forecast::model::{DayComponents, DayPrediction, FittedDemandModel};
use crate::forecast::models::{
    Anomaly, AnomalyKind, ComponentPoint, DemandModelConfig, DemandPoint, ForecastReport,
    ForecastRiskLevel, Observation, ShortageDay, TrendComponents, MAX_FORECAST_DAYS,
};
use crate::forecast::synthetic;
use crate::metrics;
use crate::ml::models::{round2, ModelMetadata, ModelMetrics, ModelType};
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Bumped whenever the artifact layout changes
const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Days covered by [`DemandModel::get_trend_components`]
const COMPONENT_HORIZON_DAYS: u32 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrainedDemandModel {
    fitted: FittedDemandModel,
    metadata: ModelMetadata,
}

#[derive(Serialize, Deserialize)]
struct DemandArtifact {
    format_version: u32,
    model: TrainedDemandModel,
}

/// Per-school demand forecasting engine.
///
/// Holds at most one fitted school at a time. Forecasts read a snapshot of
/// the fitted parameters; `train` fits a replacement and swaps it in, so a
/// failed fit leaves the previous school's model serving.
pub struct DemandModel {
    config: DemandModelConfig,
    calendar: HolidayCalendar,
    state: RwLock<Option<Arc<TrainedDemandModel>>>,
}

impl DemandModel {
    /// Untrained engine using the default regional calendar
    pub fn new(config: DemandModelConfig) -> Self {
        Self {
            config,
            calendar: HolidayCalendar::tamil_nadu(),
            state: RwLock::new(None),
        }
    }

    /// Untrained engine with a custom holiday calendar
    pub fn with_calendar(config: DemandModelConfig, calendar: HolidayCalendar) -> Result<Self> {
        // Deserialized calendars skip the constructor checks
        let calendar = HolidayCalendar::new(calendar.events().to_vec())?;
        Ok(Self {
            config,
            calendar,
            state: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &DemandModelConfig {
        &self.config
    }

    pub fn calendar(&self) -> &HolidayCalendar {
        &self.calendar
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().is_some()
    }

    /// School the current parameters were fit for
    pub fn school_id(&self) -> Option<String> {
        self.state
            .read()
            .as_ref()
            .map(|m| m.fitted.school_id().to_string())
    }

    pub fn metadata(&self) -> Option<ModelMetadata> {
        self.state.read().as_ref().map(|m| m.metadata.clone())
    }

    /// Date the synthetic fallback history ends before
    pub fn reference_date(&self) -> NaiveDate {
        self.config
            .reference_date
            .unwrap_or_else(|| chrono::Utc::now().date_naive())
    }

    fn snapshot(&self) -> Result<Arc<TrainedDemandModel>> {
        self.state.read().clone().ok_or_else(|| {
            AppError::ModelNotReady("demand model has not been trained or loaded".to_string())
        })
    }

    /// Fit the model for `school_id`, replacing whatever is currently held.
    ///
    /// Without a series a reproducible synthetic history seeded by the school
    /// id is used.
    pub fn train(&self, school_id: &str, series: Option<&[Observation]>) -> Result<ModelMetrics> {
        let started = Instant::now();
        let result = self.build(school_id, series);
        metrics::MODEL_TRAINING_DURATION_SECONDS
            .with_label_values(&["demand"])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(trained) => {
                let training_metrics = trained.metadata.training_metrics.clone();
                info!(
                    school_id,
                    observations = trained.fitted.n_observations(),
                    changepoints = trained.fitted.n_changepoints(),
                    rmse = training_metrics.rmse,
                    "Demand model trained"
                );
                *self.state.write() = Some(Arc::new(trained));
                metrics::MODEL_TRAINING_TOTAL
                    .with_label_values(&["demand", "success"])
                    .inc();
                Ok(training_metrics)
            }
            Err(e) => {
                warn!(school_id, error = %e, "Demand model training failed; keeping previous model");
                metrics::MODEL_TRAINING_TOTAL
                    .with_label_values(&["demand", "failure"])
                    .inc();
                Err(e)
            }
        }
    }

    fn build(&self, school_id: &str, series: Option<&[Observation]>) -> Result<TrainedDemandModel> {
        if school_id.trim().is_empty() {
            return Err(AppError::Validation("school_id must not be empty".to_string()));
        }

        let synthetic_history;
        let series = match series {
            Some(series) => series,
            None => {
                warn!(
                    school_id,
                    days = self.config.history_days,
                    "No demand history supplied; fitting synthetic fallback series"
                );
                synthetic_history = synthetic::generate_history(
                    school_id,
                    self.config.history_days,
                    self.reference_date(),
                )?;
                &synthetic_history[..]
            }
        };

        let fitted = FittedDemandModel::fit(
            school_id,
            series,
            &self.config,
            &self.calendar,
            synthetic::school_seed(school_id),
        )?;

        let metadata = ModelMetadata {
            id: uuid::Uuid::new_v4(),
            name: format!("Demand Forecast {}", school_id),
            model_type: ModelType::AdditiveTimeSeries,
            trained_at: chrono::Utc::now(),
            n_training_samples: fitted.n_observations(),
            n_features: fitted.n_regressors(),
            n_rounds: 0,
            training_metrics: fitted.training_metrics().clone(),
            hyperparameters: self.config.describe(),
        };

        Ok(TrainedDemandModel { fitted, metadata })
    }

    /// Refit the current school on a new series
    pub fn update_with_new_data(&self, series: &[Observation]) -> Result<ModelMetrics> {
        let model = self.snapshot()?;
        info!(
            school_id = model.fitted.school_id(),
            observations = series.len(),
            "Updating demand model with new data"
        );
        self.train(model.fitted.school_id(), Some(series))
    }

    /// Daily demand for the `days` days after the training history
    pub fn forecast(&self, days: u32) -> Result<Vec<DemandPoint>> {
        let model = self.snapshot()?;
        let points = Self::forecast_points(&model, days)?;
        metrics::DEMAND_FORECASTS_TOTAL
            .with_label_values(&["forecast"])
            .inc();
        Ok(points)
    }

    fn forecast_points(model: &TrainedDemandModel, days: u32) -> Result<Vec<DemandPoint>> {
        if !(1..=MAX_FORECAST_DAYS).contains(&days) {
            return Err(AppError::Validation(format!(
                "days must be between 1 and {}, got {}",
                MAX_FORECAST_DAYS, days
            )));
        }
        let dates = model.fitted.future_dates(days);
        let predictions = model.fitted.predict(&dates)?;
        Ok(predictions.iter().map(to_demand_point).collect())
    }

    /// Forecast compared against a daily meal capacity
    pub fn forecast_with_capacity(&self, days: u32, capacity: u32) -> Result<ForecastReport> {
        let model = self.snapshot()?;
        if capacity == 0 {
            return Err(AppError::Validation("capacity must be positive".to_string()));
        }
        let forecast = Self::forecast_points(&model, days)?;

        let shortage_days: Vec<ShortageDay> = forecast
            .iter()
            .filter(|p| p.predicted_demand > capacity)
            .map(|p| ShortageDay {
                date: p.date,
                predicted_demand: p.predicted_demand,
                capacity,
                shortage: p.predicted_demand - capacity,
            })
            .collect();

        let avg = mean_demand(&forecast);
        let risk_level = ForecastRiskLevel::from_shortage_count(shortage_days.len());

        metrics::DEMAND_FORECASTS_TOTAL
            .with_label_values(&["capacity"])
            .inc();
        metrics::SHORTAGE_DAYS_TOTAL.inc_by(shortage_days.len() as f64);

        Ok(ForecastReport {
            school_id: model.fitted.school_id().to_string(),
            max_predicted_demand: max_demand(&forecast),
            avg_predicted_demand: round2(avg),
            capacity: Some(capacity),
            capacity_utilization: Some(round2(avg / capacity as f64 * 100.0)),
            shortage_days,
            risk_level,
            forecast,
        })
    }

    /// Forecast report without a capacity comparison
    pub fn forecast_summary(&self, days: u32) -> Result<ForecastReport> {
        let model = self.snapshot()?;
        let forecast = Self::forecast_points(&model, days)?;

        metrics::DEMAND_FORECASTS_TOTAL
            .with_label_values(&["summary"])
            .inc();

        Ok(ForecastReport {
            school_id: model.fitted.school_id().to_string(),
            max_predicted_demand: max_demand(&forecast),
            avg_predicted_demand: round2(mean_demand(&forecast)),
            capacity: None,
            capacity_utilization: None,
            shortage_days: Vec::new(),
            risk_level: ForecastRiskLevel::Low,
            forecast,
        })
    }

    /// Additive components over the 30 days after the training history
    pub fn get_trend_components(&self) -> Result<TrendComponents> {
        let model = self.snapshot()?;
        let fitted = &model.fitted;
        let components = fitted.components(&fitted.future_dates(COMPONENT_HORIZON_DAYS));

        metrics::DEMAND_FORECASTS_TOTAL
            .with_label_values(&["components"])
            .inc();

        Ok(TrendComponents {
            trend: component_series(&components, |c| c.trend),
            weekly: component_series(&components, |c| fitted.seasonal_value(c, "weekly")),
            yearly: component_series(&components, |c| fitted.seasonal_value(c, "yearly")),
            monthly: component_series(&components, |c| fitted.seasonal_value(c, "monthly")),
            holidays: component_series(&components, |c| c.holidays),
        })
    }

    /// Flag observations outside the prediction interval for their date
    pub fn detect_anomalies(&self, values: &[f64], dates: &[NaiveDate]) -> Result<Vec<Anomaly>> {
        let model = self.snapshot()?;
        if values.len() != dates.len() {
            return Err(AppError::Validation(format!(
                "values ({}) and dates ({}) differ in length",
                values.len(),
                dates.len()
            )));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(AppError::Validation(format!(
                "observed value {} is not finite",
                idx
            )));
        }

        let predictions = model.fitted.predict(dates)?;
        let anomalies: Vec<Anomaly> = values
            .iter()
            .zip(predictions.iter())
            .filter_map(|(&actual, p)| {
                let kind = if actual > p.upper {
                    AnomalyKind::Spike
                } else if actual < p.lower {
                    AnomalyKind::Drop
                } else {
                    return None;
                };
                let deviation = if p.yhat > 0.0 {
                    (actual - p.yhat).abs() / p.yhat * 100.0
                } else {
                    0.0
                };
                Some(Anomaly {
                    date: p.date,
                    actual_demand: actual,
                    predicted_demand: round2(p.yhat),
                    lower_bound: round2(p.lower),
                    upper_bound: round2(p.upper),
                    deviation_percent: round2(deviation),
                    kind,
                })
            })
            .collect();

        metrics::DEMAND_FORECASTS_TOTAL
            .with_label_values(&["anomalies"])
            .inc();
        metrics::DEMAND_ANOMALIES_TOTAL.inc_by(anomalies.len() as f64);

        Ok(anomalies)
    }

    /// Persist the fitted parameters of the current school
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let model = self.snapshot()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let artifact = DemandArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            model: (*model).clone(),
        };
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, &artifact)?;

        info!(
            path = %path.display(),
            school_id = model.fitted.school_id(),
            "Demand model saved"
        );
        Ok(())
    }

    /// Replace the current parameters with ones read from disk
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let artifact: DemandArtifact = bincode::deserialize_from(reader)?;

        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(AppError::Serialization(format!(
                "unsupported demand artifact version {}",
                artifact.format_version
            )));
        }

        let school_id = artifact.model.fitted.school_id().to_string();
        *self.state.write() = Some(Arc::new(artifact.model));
        info!(path = %path.display(), school_id = %school_id, "Demand model loaded");
        Ok(())
    }

    /// Create an engine from a saved artifact
    pub fn from_artifact(config: DemandModelConfig, path: impl AsRef<Path>) -> Result<Self> {
        let model = Self::new(config);
        model.load(path)?;
        Ok(model)
    }
}

fn component_series(
    components: &[DayComponents],
    value: impl Fn(&DayComponents) -> f64,
) -> Vec<ComponentPoint> {
    components
        .iter()
        .map(|c| ComponentPoint {
            date: c.date,
            value: round2(value(c)),
        })
        .collect()
}

/// Whole, non-negative meals with `lower <= predicted <= upper`
fn to_demand_point(p: &DayPrediction) -> DemandPoint {
    DemandPoint {
        date: p.date,
        predicted_demand: to_meals(p.yhat),
        lower_bound: to_meals(p.lower.min(p.yhat)),
        upper_bound: to_meals(p.upper.max(p.yhat)),
    }
}

/// Clip at zero and round; the cast saturates and maps NaN to 0
fn to_meals(value: f64) -> u32 {
    value.max(0.0).round() as u32
}

fn mean_demand(points: &[DemandPoint]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    points.iter().map(|p| p.predicted_demand as f64).sum::<f64>() / points.len() as f64
}

fn max_demand(points: &[DemandPoint]) -> u32 {
    points.iter().map(|p| p.predicted_demand).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DemandModelConfig {
        DemandModelConfig {
            reference_date: NaiveDate::from_ymd_opt(2025, 7, 1),
            uncertainty_samples: 300,
            ..Default::default()
        }
    }

    fn trained(school_id: &str) -> DemandModel {
        let model = DemandModel::new(config());
        model.train(school_id, None).unwrap();
        model
    }

    #[test]
    fn test_untrained_model_not_ready() {
        let model = DemandModel::new(config());
        assert!(!model.is_ready());
        assert!(model.school_id().is_none());
        assert!(matches!(model.forecast(7), Err(AppError::ModelNotReady(_))));
        assert!(matches!(
            model.forecast_with_capacity(7, 400),
            Err(AppError::ModelNotReady(_))
        ));
        assert!(matches!(
            model.get_trend_components(),
            Err(AppError::ModelNotReady(_))
        ));
        assert!(matches!(
            model.detect_anomalies(&[], &[]),
            Err(AppError::ModelNotReady(_))
        ));
        assert!(matches!(
            model.update_with_new_data(&[]),
            Err(AppError::ModelNotReady(_))
        ));
    }

    #[test]
    fn test_forecast_starts_after_history() {
        let model = trained("S1");
        assert_eq!(model.school_id().as_deref(), Some("S1"));

        let forecast = model.forecast(7).unwrap();
        assert_eq!(forecast.len(), 7);
        assert_eq!(forecast[0].date, NaiveDate::from_ymd_opt(2025, 7, 1).unwrap());
        for p in &forecast {
            assert!(p.lower_bound <= p.predicted_demand);
            assert!(p.predicted_demand <= p.upper_bound);
        }
    }

    #[test]
    fn test_days_out_of_range_rejected() {
        let model = trained("S1");
        assert!(matches!(model.forecast(0), Err(AppError::Validation(_))));
        assert!(matches!(model.forecast(31), Err(AppError::Validation(_))));
        assert!(matches!(
            model.forecast_with_capacity(7, 0),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_capacity_report_matches_forecast() {
        let model = trained("S2");
        let forecast = model.forecast(14).unwrap();
        let capacity = 300;
        let report = model.forecast_with_capacity(14, capacity).unwrap();

        assert_eq!(report.forecast, forecast);
        let expected: Vec<NaiveDate> = forecast
            .iter()
            .filter(|p| p.predicted_demand > capacity)
            .map(|p| p.date)
            .collect();
        let got: Vec<NaiveDate> = report.shortage_days.iter().map(|s| s.date).collect();
        assert_eq!(got, expected);
        for s in &report.shortage_days {
            assert_eq!(s.shortage, s.predicted_demand - capacity);
        }
        assert_eq!(
            report.risk_level,
            ForecastRiskLevel::from_shortage_count(expected.len())
        );
        assert_eq!(report.capacity, Some(capacity));
    }

    #[test]
    fn test_summary_has_no_capacity_analysis() {
        let model = trained("S3");
        let summary = model.forecast_summary(5).unwrap();
        assert_eq!(summary.forecast.len(), 5);
        assert!(summary.capacity.is_none());
        assert!(summary.shortage_days.is_empty());
        assert_eq!(summary.risk_level, ForecastRiskLevel::Low);
        assert_eq!(
            summary.max_predicted_demand,
            summary.forecast.iter().map(|p| p.predicted_demand).max().unwrap()
        );
    }

    #[test]
    fn test_trend_components_cover_thirty_days() {
        let model = trained("S1");
        let components = model.get_trend_components().unwrap();
        assert_eq!(components.trend.len(), 30);
        assert_eq!(components.weekly.len(), 30);
        assert_eq!(components.yearly.len(), 30);
        assert_eq!(components.trend[0].date, NaiveDate::from_ymd_opt(2025, 7, 1).unwrap());
    }

    #[test]
    fn test_anomaly_detection_flags_spike_and_drop() {
        let model = trained("S1");
        let forecast = model.forecast(3).unwrap();
        let dates: Vec<NaiveDate> = forecast.iter().map(|p| p.date).collect();
        let values = vec![
            forecast[0].upper_bound as f64 * 3.0 + 100.0,
            forecast[1].predicted_demand as f64,
            -500.0,
        ];

        let anomalies = model.detect_anomalies(&values, &dates).unwrap();
        assert_eq!(anomalies.len(), 2);
        assert_eq!(anomalies[0].kind, AnomalyKind::Spike);
        assert_eq!(anomalies[0].date, dates[0]);
        assert!(anomalies[0].deviation_percent > 100.0);
        assert_eq!(anomalies[1].kind, AnomalyKind::Drop);
        assert_eq!(anomalies[1].date, dates[2]);

        assert!(matches!(
            model.detect_anomalies(&values[..2], &dates),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_failed_training_keeps_previous_school() {
        let model = trained("S1");
        let before = model.forecast(7).unwrap();

        let bad = vec![Observation::new(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), 10.0)];
        assert!(matches!(
            model.train("S2", Some(&bad)),
            Err(AppError::InvalidTrainingData(_))
        ));
        assert!(matches!(model.train("  ", None), Err(AppError::Validation(_))));

        assert_eq!(model.school_id().as_deref(), Some("S1"));
        assert_eq!(model.forecast(7).unwrap(), before);
    }

    #[test]
    fn test_update_with_new_data_refits_same_school() {
        let model = trained("S4");
        let first_id = model.metadata().unwrap().id;
        let series: Vec<Observation> = (0..40)
            .map(|i| {
                Observation::new(
                    NaiveDate::from_ymd_opt(2025, 3, 1).unwrap() + chrono::Duration::days(i),
                    200.0,
                )
            })
            .collect();

        model.update_with_new_data(&series).unwrap();
        assert_eq!(model.school_id().as_deref(), Some("S4"));
        assert_ne!(model.metadata().unwrap().id, first_id);
        let forecast = model.forecast(1).unwrap();
        assert_eq!(forecast[0].date, NaiveDate::from_ymd_opt(2025, 4, 10).unwrap());
    }

    #[test]
    fn test_custom_calendar_is_validated() {
        let calendar: HolidayCalendar = serde_json::from_str(
            r#"{"events":[{"name":"x","anchor":{"fixed":{"month":2,"day":31}}}]}"#,
        )
        .unwrap();
        assert!(DemandModel::with_calendar(config(), calendar).is_err());
        assert!(DemandModel::with_calendar(config(), HolidayCalendar::empty()).is_ok());
    }

    #[test]
    fn test_to_meals_preserves_order() {
        let p = DayPrediction {
            date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            yhat: 10.4,
            lower: 12.0,
            upper: -3.0,
        };
        let point = to_demand_point(&p);
        assert_eq!(point.predicted_demand, 10);
        assert!(point.lower_bound <= point.predicted_demand);
        assert!(point.predicted_demand <= point.upper_bound);
        assert_eq!(to_meals(-4.2), 0);
        assert_eq!(to_meals(f64::NAN), 0);
    }
}
