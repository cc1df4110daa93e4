//! Bootstrap training data for the risk model.
//!
//! Used until real historical observations are ingested. The label formula
//! is the calibration target for the initial self-test, not ground truth.

use crate::error::{AppError, Result};
use crate::ml::features::NUM_FEATURES;
use crate::ml::models::TrainingDataset;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand::distributions::Distribution;
use statrs::distribution::Normal;

/// Standard deviation of the label noise
const LABEL_NOISE_STD: f64 = 5.0;

/// Generate `n_samples` feature rows and matching risk labels.
pub fn generate_training_data(n_samples: usize, seed: u64) -> Result<TrainingDataset> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, LABEL_NOISE_STD)
        .map_err(|e| AppError::Internal(format!("invalid noise distribution: {}", e)))?;

    let mut features = Array2::zeros((n_samples, NUM_FEATURES));
    let mut labels = Array1::zeros(n_samples);

    for i in 0..n_samples {
        let row = [
            rng.gen_range(150..800) as f64,  // enrollment
            rng.gen_range(100..700) as f64,  // current_attendance
            rng.gen_range(120..750) as f64,  // capacity
            rng.gen_range(90..680) as f64,   // avg_meal_uptake
            rng.gen_range(0.6..0.95),        // attendance_rate
            rng.gen_range(0.5..1.0),         // capacity_utilization
            rng.gen_range(0..180) as f64,    // days_since_inspection
            rng.gen_range(0..10) as f64,     // previous_shortage_count
            rng.gen_range(0.7..1.0),         // budget_utilization_rate
            rng.gen_range(0..15) as f64,     // supply_chain_delay_days
            rng.gen_range(0.0..100.0),       // weather_risk_score
            rng.gen_range(0.8..1.2),         // seasonal_factor
            rng.gen_range(0..2) as f64,      // hostel_attached
            rng.gen_range(-0.1..0.1),        // enrollment_trend_7d
            rng.gen_range(-0.15..0.15),      // attendance_trend_7d
        ];

        labels[i] = (risk_formula(&row) + noise.sample(&mut rng)).clamp(0.0, 100.0);
        for (j, value) in row.into_iter().enumerate() {
            features[[i, j]] = value;
        }
    }

    TrainingDataset::new(features, labels)
}

/// Assumed feature → risk relationship, before noise and clipping.
pub fn risk_formula(row: &[f64; NUM_FEATURES]) -> f64 {
    row[5] * 30.0
        + (1.0 - row[4]) * 25.0
        + row[7] * 5.0
        + row[9] * 2.0
        + row[10] * 0.2
        + (row[6] / 180.0) * 15.0
        + (1.0 - row[8]) * 20.0
}
