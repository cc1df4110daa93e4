/// Shortage risk scoring
///
/// This module provides:
/// - The fixed 15-feature schema and its domain validation
/// - A gradient-boosted regression tree ensemble
/// - The risk engine: single/batch inference, feature importance, retraining
/// - Artifact persistence
/// - Synthetic bootstrap training data

pub mod features;
pub mod gbdt;
pub mod models;
pub mod risk;
pub mod synthetic;

pub use features::{FeatureVector, FEATURE_NAMES, NUM_FEATURES};
pub use gbdt::{BoostingParams, GradientBoostedTrees, RegressionTree};
pub use models::{
    FeatureContribution, ModelMetadata, ModelMetrics, ModelType, PredictionExplanation,
    RiskLevel, RiskModelConfig, RiskPrediction, TrainingDataset,
};
pub use risk::RiskModel;
