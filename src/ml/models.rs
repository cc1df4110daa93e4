use crate::error::{AppError, Result};
use crate::ml::features::{FeatureVector, NUM_FEATURES};
use crate::ml::gbdt::BoostingParams;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use validator::Validate;

/// Risk model configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RiskModelConfig {
    /// Gradient boosting hyperparameters
    #[serde(default)]
    #[validate(nested)]
    pub boosting: BoostingParams,

    /// Rows generated for the bootstrap ensemble when no artifact is available
    #[serde(default = "default_synthetic_samples")]
    #[validate(range(min = 1))]
    pub synthetic_samples: usize,

    /// Seed for the bootstrap training data
    #[serde(default = "default_synthetic_seed")]
    pub synthetic_seed: u64,

    /// Confidence reported alongside every prediction (0.0 - 1.0)
    #[serde(default = "default_confidence")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
}

impl Default for RiskModelConfig {
    fn default() -> Self {
        Self {
            boosting: BoostingParams::default(),
            synthetic_samples: default_synthetic_samples(),
            synthetic_seed: default_synthetic_seed(),
            confidence: default_confidence(),
        }
    }
}

fn default_synthetic_samples() -> usize {
    1000
}

fn default_synthetic_seed() -> u64 {
    42
}

fn default_confidence() -> f64 {
    0.85
}

/// Discrete shortage risk bucket
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
    strum::EnumIter,
)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Lower bound (inclusive) of the Critical bucket
    pub const CRITICAL_THRESHOLD: f64 = 70.0;
    /// Lower bound (inclusive) of the High bucket
    pub const HIGH_THRESHOLD: f64 = 50.0;
    /// Lower bound (inclusive) of the Medium bucket
    pub const MEDIUM_THRESHOLD: f64 = 30.0;

    /// Bucket a score; the score is clamped into [0, 100] first.
    pub fn from_score(score: f64) -> Self {
        let score = clamp_score(score);
        if score >= Self::CRITICAL_THRESHOLD {
            RiskLevel::Critical
        } else if score >= Self::HIGH_THRESHOLD {
            RiskLevel::High
        } else if score >= Self::MEDIUM_THRESHOLD {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Clamp a raw regression output into the risk score domain. NaN maps to 0.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Risk prediction for one school
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPrediction {
    /// Score in [0, 100]
    pub risk_score: f64,

    /// Bucket derived from `risk_score`
    pub risk_level: RiskLevel,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,
}

impl RiskPrediction {
    pub fn from_raw_score(raw: f64, confidence: f64) -> Self {
        let risk_score = round2(clamp_score(raw));
        Self {
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Per-feature entry of a prediction explanation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub value: f64,
    pub importance: f64,
    pub contribution: f64,
}

/// Prediction together with importance-scaled feature contributions.
///
/// Contributions are total split gain scaled by a constant; they are a coarse
/// diagnostic and do not decompose the prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionExplanation {
    pub prediction: RiskPrediction,
    pub feature_contributions: HashMap<String, FeatureContribution>,
}

/// Kind of trained model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ModelType {
    GradientBoostedTrees,
    AdditiveTimeSeries,
}

/// Regression quality metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub r_squared: f64,
}

impl ModelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute metrics from aligned label/prediction slices
    pub fn from_predictions(y_true: &[f64], y_pred: &[f64]) -> Self {
        let n = y_true.len().min(y_pred.len());
        if n == 0 {
            return Self::new();
        }

        let mean = y_true[..n].iter().sum::<f64>() / n as f64;
        let mut sse = 0.0;
        let mut sae = 0.0;
        let mut sst = 0.0;
        for (t, p) in y_true.iter().zip(y_pred.iter()) {
            let err = t - p;
            sse += err * err;
            sae += err.abs();
            sst += (t - mean) * (t - mean);
        }

        Self {
            rmse: (sse / n as f64).sqrt(),
            mae: sae / n as f64,
            r_squared: if sst > 0.0 { 1.0 - sse / sst } else { 0.0 },
        }
    }
}

/// Model metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Unique identifier of this training run
    pub id: uuid::Uuid,

    /// Model name
    pub name: String,

    /// Model type
    pub model_type: ModelType,

    /// Training timestamp
    pub trained_at: chrono::DateTime<chrono::Utc>,

    /// Number of training samples
    pub n_training_samples: usize,

    /// Number of features
    pub n_features: usize,

    /// Boosting rounds kept in the ensemble (0 for time-series models)
    pub n_rounds: usize,

    /// Training metrics
    pub training_metrics: ModelMetrics,

    /// Hyperparameters
    pub hyperparameters: HashMap<String, String>,
}

/// Training dataset for the risk model
#[derive(Debug, Clone)]
pub struct TrainingDataset {
    /// Feature matrix (n_samples × 15)
    pub features: Array2<f64>,

    /// Risk score labels
    pub labels: Array1<f64>,
}

impl TrainingDataset {
    /// Validate and wrap a feature matrix and label vector.
    pub fn new(features: Array2<f64>, labels: Array1<f64>) -> Result<Self> {
        let (n_samples, n_features) = features.dim();

        if n_samples == 0 || labels.is_empty() {
            return Err(AppError::InvalidTrainingData(
                "feature matrix and labels must be non-empty".to_string(),
            ));
        }
        if n_samples != labels.len() {
            return Err(AppError::InvalidTrainingData(format!(
                "feature rows ({}) and labels ({}) differ in length",
                n_samples,
                labels.len()
            )));
        }
        if n_features != NUM_FEATURES {
            return Err(AppError::InvalidTrainingData(format!(
                "expected {} feature columns, got {}",
                NUM_FEATURES, n_features
            )));
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(AppError::InvalidTrainingData(
                "feature matrix contains non-finite values".to_string(),
            ));
        }
        if labels.iter().any(|v| !v.is_finite()) {
            return Err(AppError::InvalidTrainingData(
                "labels contain non-finite values".to_string(),
            ));
        }

        Ok(Self { features, labels })
    }

    /// Build from row-major nested vectors
    pub fn from_rows(rows: Vec<Vec<f64>>, labels: Vec<f64>) -> Result<Self> {
        let n_samples = rows.len();
        let n_features = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != n_features) {
            return Err(AppError::InvalidTrainingData(
                "feature rows have differing lengths".to_string(),
            ));
        }

        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let features = Array2::from_shape_vec((n_samples, n_features), flat)
            .map_err(|e| AppError::InvalidTrainingData(e.to_string()))?;

        Self::new(features, Array1::from(labels))
    }

    /// Build from validated feature vectors
    pub fn from_vectors(vectors: &[FeatureVector], labels: Vec<f64>) -> Result<Self> {
        let rows = vectors.iter().map(|v| v.to_array().to_vec()).collect();
        Self::from_rows(rows, labels)
    }

    pub fn n_samples(&self) -> usize {
        self.features.nrows()
    }
}
