/// Integration tests for the shortage risk engine
///
/// These tests verify:
/// - Bootstrap training and scoring of known schools
/// - Batch inference order and consistency with single inference
/// - Artifact round-trips
/// - Failed retraining leaving the serving model untouched
/// - Concurrent inference during retraining
/// - Explanations drawn from a single ensemble while models are swapped

mod common;

use common::{calm_school, stressed_school};
use meal_shortage_engine::{
    error::AppError,
    ml::{
        synthetic::generate_training_data, FeatureVector, RiskLevel, RiskModel, RiskModelConfig,
        FEATURE_NAMES,
    },
};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

fn trained_model() -> RiskModel {
    RiskModel::with_default_model(RiskModelConfig::default()).unwrap()
}

#[test]
fn test_stressed_school_is_critical() {
    let model = trained_model();
    let prediction = model.predict(&stressed_school()).unwrap();

    assert!(prediction.risk_score >= 70.0, "score {}", prediction.risk_score);
    assert_eq!(prediction.risk_level, RiskLevel::Critical);
    assert_eq!(prediction.confidence, 0.85);
}

#[test]
fn test_stressed_school_scores_above_calm_school() {
    let model = trained_model();
    let predictions = model
        .predict_batch(&[stressed_school(), calm_school()])
        .unwrap();

    assert_eq!(predictions.len(), 2);
    assert!(predictions[0].risk_score > predictions[1].risk_score);
}

#[test]
fn test_batch_matches_single_predictions() {
    let model = trained_model();
    let vectors = vec![calm_school(), stressed_school(), calm_school()];

    let batch = model.predict_batch(&vectors).unwrap();
    let singles: Vec<_> = vectors.iter().map(|v| model.predict(v).unwrap()).collect();
    assert_eq!(batch, singles);

    assert_eq!(
        model.predict_batch(&[stressed_school()]).unwrap(),
        vec![model.predict(&stressed_school()).unwrap()]
    );
    assert!(model.predict_batch(&[]).unwrap().is_empty());
}

#[test]
fn test_batch_fails_atomically_on_invalid_member() {
    let model = trained_model();
    let mut invalid = calm_school();
    invalid.attendance_rate = 1.5;

    let result = model.predict_batch(&[stressed_school(), invalid]);
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[test]
fn test_prediction_from_feature_map() {
    let model = trained_model();
    let map: HashMap<String, f64> = stressed_school().to_map();
    let vector = FeatureVector::from_map(&map).unwrap();

    assert_eq!(
        model.predict(&vector).unwrap(),
        model.predict(&stressed_school()).unwrap()
    );
}

#[test]
fn test_feature_importance_is_ranked_over_schema() {
    let model = trained_model();
    let importance = model.feature_importance().unwrap();
    assert_eq!(importance.len(), FEATURE_NAMES.len());
    assert!(importance.values().all(|v| *v >= 0.0));

    let ranked = model.ranked_feature_importance().unwrap();
    assert!(ranked.windows(2).all(|w| w[0].1 >= w[1].1));
}

#[test]
fn test_save_load_reproduces_predictions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("risk").join("model.bin");

    let model = trained_model();
    model.save(&path).unwrap();

    let restored = RiskModel::from_artifact(RiskModelConfig::default(), &path).unwrap();
    let inputs = [stressed_school(), calm_school()];
    assert_eq!(
        model.predict_batch(&inputs).unwrap(),
        restored.predict_batch(&inputs).unwrap()
    );
    assert_eq!(
        model.feature_importance().unwrap(),
        restored.feature_importance().unwrap()
    );
}

#[test]
fn test_load_rejects_garbage_artifact() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    std::fs::write(&path, b"not a model").unwrap();

    let model = RiskModel::new(RiskModelConfig::default());
    assert!(model.load(&path).is_err());
    assert!(!model.is_ready());
}

#[test]
fn test_invalid_retrain_keeps_serving_model() {
    let model = trained_model();
    let before = model.predict(&stressed_school()).unwrap();
    let before_id = model.metadata().unwrap().id;

    let empty = model.retrain_from_rows(Vec::new(), Vec::new());
    assert!(matches!(empty, Err(AppError::InvalidTrainingData(_))));

    let mismatched = model.retrain_from_rows(vec![vec![0.5; FEATURE_NAMES.len()]; 3], vec![10.0; 2]);
    assert!(matches!(mismatched, Err(AppError::InvalidTrainingData(_))));

    let mut rows = vec![vec![0.5; FEATURE_NAMES.len()]; 3];
    rows[1][4] = f64::NAN;
    let non_finite = model.retrain_from_rows(rows, vec![10.0; 3]);
    assert!(matches!(non_finite, Err(AppError::InvalidTrainingData(_))));

    assert_eq!(model.predict(&stressed_school()).unwrap(), before);
    assert_eq!(model.metadata().unwrap().id, before_id);
}

#[test]
fn test_retrain_replaces_model() {
    let model = trained_model();
    let before_id = model.metadata().unwrap().id;

    let dataset = generate_training_data(300, 7).unwrap();
    let metrics = model.retrain(&dataset).unwrap();

    assert!(metrics.rmse.is_finite());
    let metadata = model.metadata().unwrap();
    assert_ne!(metadata.id, before_id);
    assert_eq!(metadata.n_training_samples, 300);
}

#[tokio::test]
async fn test_concurrent_inference_during_retrain() {
    let model = Arc::new(trained_model());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let model = Arc::clone(&model);
        handles.push(tokio::task::spawn_blocking(move || {
            for _ in 0..50 {
                let prediction = model.predict(&stressed_school()).unwrap();
                assert!((0.0..=100.0).contains(&prediction.risk_score));
            }
        }));
    }

    let trainer = Arc::clone(&model);
    let retrain = tokio::task::spawn_blocking(move || {
        let dataset = generate_training_data(300, 11).unwrap();
        trainer.retrain(&dataset)
    });

    for handle in handles {
        handle.await.unwrap();
    }
    assert!(retrain.await.unwrap().is_ok());
    assert!(model.is_ready());
}

#[test]
fn test_explanation_comes_from_one_ensemble_during_swaps() {
    let dir = TempDir::new().unwrap();
    let first_path = dir.path().join("first.bin");
    let second_path = dir.path().join("second.bin");

    let first = trained_model();
    first.save(&first_path).unwrap();
    let second = trained_model();
    second.retrain(&generate_training_data(300, 7).unwrap()).unwrap();
    second.save(&second_path).unwrap();

    let expected = [
        first.explain_prediction(&stressed_school()).unwrap(),
        second.explain_prediction(&stressed_school()).unwrap(),
    ];
    assert_ne!(expected[0], expected[1]);

    let model = Arc::new(RiskModel::from_artifact(RiskModelConfig::default(), &first_path).unwrap());
    let swapper = {
        let model = Arc::clone(&model);
        std::thread::spawn(move || {
            for i in 0..40 {
                let path = if i % 2 == 0 { &second_path } else { &first_path };
                model.load(path).unwrap();
            }
        })
    };

    for _ in 0..200 {
        let explanation = model.explain_prediction(&stressed_school()).unwrap();
        assert!(
            expected.contains(&explanation),
            "explanation mixes two ensembles: {:?}",
            explanation
        );
    }
    swapper.join().unwrap();
}
