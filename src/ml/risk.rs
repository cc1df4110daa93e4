use crate::error::{AppError, Result};
use crate::metrics;
use crate::ml::features::{FeatureVector, FEATURE_NAMES, NUM_FEATURES};
use crate::ml::gbdt::GradientBoostedTrees;
use crate::ml::models::{
    round2, FeatureContribution, ModelMetadata, ModelMetrics, ModelType, PredictionExplanation,
    RiskModelConfig, RiskPrediction, TrainingDataset,
};
use crate::ml::synthetic;
use ndarray::ArrayView1;
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Scale applied to gain importance by [`RiskModel::explain_prediction`]
const CONTRIBUTION_SCALE: f64 = 0.01;

/// Bumped whenever the artifact layout changes
const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Immutable trained state; swapped wholesale on retrain.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrainedRiskModel {
    ensemble: GradientBoostedTrees,
    feature_names: Vec<String>,
    metadata: ModelMetadata,
}

#[derive(Serialize, Deserialize)]
struct RiskArtifact {
    format_version: u32,
    model: TrainedRiskModel,
}

/// Shortage risk scoring engine.
///
/// Inference takes a snapshot of the current ensemble under a short read
/// lock; retraining builds a complete replacement before taking the write lock,
/// so readers never observe a partially built model.
pub struct RiskModel {
    config: RiskModelConfig,
    state: RwLock<Option<Arc<TrainedRiskModel>>>,
}

impl RiskModel {
    /// Create an untrained engine
    pub fn new(config: RiskModelConfig) -> Self {
        Self {
            config,
            state: RwLock::new(None),
        }
    }

    /// Create an engine warmed up on the synthetic bootstrap dataset
    pub fn with_default_model(config: RiskModelConfig) -> Result<Self> {
        let model = Self::new(config);
        model.train_default()?;
        Ok(model)
    }

    /// (Re)train on the synthetic bootstrap dataset
    pub fn train_default(&self) -> Result<ModelMetrics> {
        info!(
            samples = self.config.synthetic_samples,
            "Initializing default risk model from synthetic data"
        );
        let dataset =
            synthetic::generate_training_data(self.config.synthetic_samples, self.config.synthetic_seed)?;
        self.retrain(&dataset)
    }

    pub fn config(&self) -> &RiskModelConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().is_some()
    }

    fn snapshot(&self) -> Result<Arc<TrainedRiskModel>> {
        self.state
            .read()
            .clone()
            .ok_or_else(|| AppError::ModelNotReady("risk model has not been trained or loaded".to_string()))
    }

    fn score(&self, model: &TrainedRiskModel, vector: &FeatureVector) -> RiskPrediction {
        let row = vector.to_array();
        let raw = model.ensemble.predict_row(ArrayView1::from(&row[..]));
        RiskPrediction::from_raw_score(raw, self.config.confidence)
    }

    /// Predict the shortage risk for a single school
    pub fn predict(&self, vector: &FeatureVector) -> Result<RiskPrediction> {
        let model = self.snapshot()?;
        self.predict_with(&model, vector)
    }

    fn predict_with(&self, model: &TrainedRiskModel, vector: &FeatureVector) -> Result<RiskPrediction> {
        let started = Instant::now();
        vector.validate_domain()?;

        let prediction = self.score(model, vector);

        metrics::RISK_PREDICTIONS_TOTAL
            .with_label_values(&["single"])
            .inc();
        metrics::RISK_LEVEL_TOTAL
            .with_label_values(&[&prediction.risk_level.to_string()])
            .inc();
        metrics::RISK_PREDICTION_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        Ok(prediction)
    }

    /// Predict for many schools; output order matches input order.
    ///
    /// Every vector is validated before any is scored, so the call either
    /// returns one prediction per input or fails as a whole.
    pub fn predict_batch(&self, vectors: &[FeatureVector]) -> Result<Vec<RiskPrediction>> {
        let started = Instant::now();
        let model = self.snapshot()?;

        for (idx, vector) in vectors.iter().enumerate() {
            vector
                .validate_domain()
                .map_err(|e| AppError::Validation(format!("vector {}: {}", idx, e)))?;
        }

        let predictions: Vec<RiskPrediction> = vectors
            .par_iter()
            .map(|v| self.score(&model, v))
            .collect();

        metrics::RISK_PREDICTIONS_TOTAL
            .with_label_values(&["batch"])
            .inc_by(predictions.len() as f64);
        for p in &predictions {
            metrics::RISK_LEVEL_TOTAL
                .with_label_values(&[&p.risk_level.to_string()])
                .inc();
        }
        metrics::RISK_PREDICTION_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        Ok(predictions)
    }

    /// Total split gain per feature name
    pub fn feature_importance(&self) -> Result<HashMap<String, f64>> {
        let model = self.snapshot()?;
        Ok(importance_of(&model))
    }

    /// Feature importance sorted by descending gain
    pub fn ranked_feature_importance(&self) -> Result<Vec<(String, f64)>> {
        let mut ranked: Vec<(String, f64)> = self.feature_importance()?.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(ranked)
    }

    /// Prediction plus importance-scaled per-feature contributions.
    ///
    /// The contribution is `importance * 0.01`; it is the same for every input
    /// and must not be read as a per-prediction attribution.
    pub fn explain_prediction(&self, vector: &FeatureVector) -> Result<PredictionExplanation> {
        // Score and importances must come from the same ensemble.
        let model = self.snapshot()?;
        let prediction = self.predict_with(&model, vector)?;
        let importance = importance_of(&model);
        let values = vector.to_array();

        let feature_contributions = FEATURE_NAMES
            .iter()
            .zip(values)
            .map(|(name, value)| {
                let imp = importance.get(*name).copied().unwrap_or(0.0);
                (
                    name.to_string(),
                    FeatureContribution {
                        value,
                        importance: round2(imp),
                        contribution: round2(imp * CONTRIBUTION_SCALE),
                    },
                )
            })
            .collect();

        Ok(PredictionExplanation {
            prediction,
            feature_contributions,
        })
    }

    /// Retrain on a validated dataset and swap the ensemble in atomically.
    ///
    /// On failure the previously trained ensemble keeps serving.
    pub fn retrain(&self, dataset: &TrainingDataset) -> Result<ModelMetrics> {
        let started = Instant::now();
        let result = self.build(dataset);
        metrics::MODEL_TRAINING_DURATION_SECONDS
            .with_label_values(&["risk"])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(trained) => {
                let training_metrics = trained.metadata.training_metrics.clone();
                info!(
                    rounds = trained.metadata.n_rounds,
                    samples = trained.metadata.n_training_samples,
                    rmse = training_metrics.rmse,
                    "Risk model retrained"
                );
                *self.state.write() = Some(Arc::new(trained));
                metrics::MODEL_TRAINING_TOTAL
                    .with_label_values(&["risk", "success"])
                    .inc();
                Ok(training_metrics)
            }
            Err(e) => {
                warn!(error = %e, "Risk model retraining failed; keeping previous model");
                metrics::MODEL_TRAINING_TOTAL
                    .with_label_values(&["risk", "failure"])
                    .inc();
                Err(e)
            }
        }
    }

    fn build(&self, dataset: &TrainingDataset) -> Result<TrainedRiskModel> {
        // Datasets can be built by hand with pub fields; re-check them here.
        let dataset = TrainingDataset::new(dataset.features.clone(), dataset.labels.clone())?;

        let ensemble = GradientBoostedTrees::fit(
            &self.config.boosting,
            dataset.features.view(),
            dataset.labels.view(),
        )?;

        let predictions = ensemble.predict(dataset.features.view()).to_vec();
        let training_metrics =
            ModelMetrics::from_predictions(&dataset.labels.to_vec(), &predictions);

        let metadata = ModelMetadata {
            id: uuid::Uuid::new_v4(),
            name: "Shortage Risk GBDT".to_string(),
            model_type: ModelType::GradientBoostedTrees,
            trained_at: chrono::Utc::now(),
            n_training_samples: dataset.n_samples(),
            n_features: NUM_FEATURES,
            n_rounds: ensemble.n_trees(),
            training_metrics,
            hyperparameters: self.config.boosting.describe(),
        };

        Ok(TrainedRiskModel {
            ensemble,
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            metadata,
        })
    }

    /// Retrain from raw arrays
    pub fn retrain_from_rows(&self, rows: Vec<Vec<f64>>, labels: Vec<f64>) -> Result<ModelMetrics> {
        let dataset = TrainingDataset::from_rows(rows, labels).map_err(|e| {
            metrics::MODEL_TRAINING_TOTAL
                .with_label_values(&["risk", "failure"])
                .inc();
            e
        })?;
        self.retrain(&dataset)
    }

    pub fn metadata(&self) -> Option<ModelMetadata> {
        self.state.read().as_ref().map(|m| m.metadata.clone())
    }

    /// Persist the ensemble and feature schema
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let model = self.snapshot()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let artifact = RiskArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            model: (*model).clone(),
        };
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, &artifact)?;

        info!(path = %path.display(), "Risk model saved");
        Ok(())
    }

    /// Replace the current ensemble with one read from disk
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let artifact: RiskArtifact = bincode::deserialize_from(reader)?;

        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(AppError::Serialization(format!(
                "unsupported risk artifact version {}",
                artifact.format_version
            )));
        }
        if artifact.model.feature_names != FEATURE_NAMES
            || artifact.model.ensemble.n_features() != NUM_FEATURES
        {
            return Err(AppError::Validation(
                "artifact feature schema does not match the engine's feature schema".to_string(),
            ));
        }

        *self.state.write() = Some(Arc::new(artifact.model));
        info!(path = %path.display(), "Risk model loaded");
        Ok(())
    }

    /// Create an engine from a saved artifact
    pub fn from_artifact(config: RiskModelConfig, path: impl AsRef<Path>) -> Result<Self> {
        let model = Self::new(config);
        model.load(path)?;
        Ok(model)
    }
}

fn importance_of(model: &TrainedRiskModel) -> HashMap<String, f64> {
    model
        .feature_names
        .iter()
        .cloned()
        .zip(model.ensemble.feature_gain().iter().copied())
        .collect()
}
