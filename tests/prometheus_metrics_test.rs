//! Exposition tests for engine metrics
//!
//! Runs both engines and checks that their counters reach the Prometheus
//! text output with the expected names and labels.

mod common;

use common::{demand_config, extract_metric_value, parse_prometheus_output, stressed_school};
use meal_shortage_engine::{
    forecast::DemandModel,
    metrics::{gather_metrics, init_metrics},
    ml::{RiskModel, RiskModelConfig},
};

#[test]
fn test_engine_activity_is_exported() {
    init_metrics().unwrap();

    let risk = RiskModel::new(RiskModelConfig {
        synthetic_samples: 300,
        ..RiskModelConfig::default()
    });
    risk.train_default().unwrap();
    risk.predict(&stressed_school()).unwrap();
    risk.predict_batch(&[stressed_school(), stressed_school()]).unwrap();

    let demand = DemandModel::new(demand_config());
    demand.train("S1", None).unwrap();
    demand.forecast_with_capacity(7, 1).unwrap();

    let metrics = parse_prometheus_output(&gather_metrics());

    let predictions = metrics
        .get("meal_shortage_engine_risk_predictions_total")
        .expect("risk prediction counter exported");
    let batch_line = predictions
        .iter()
        .find(|l| l.contains("mode=\"batch\""))
        .expect("batch sample present");
    assert!(extract_metric_value(batch_line).unwrap() >= 2.0);

    let training = metrics
        .get("meal_shortage_engine_model_training_total")
        .expect("training counter exported");
    assert!(training
        .iter()
        .any(|l| l.contains("model=\"demand\"") && l.contains("outcome=\"success\"")));

    let shortage = metrics
        .get("meal_shortage_engine_shortage_days_total")
        .expect("shortage counter exported");
    let value = shortage
        .iter()
        .find_map(|l| if l.starts_with('#') { None } else { extract_metric_value(l) })
        .unwrap();
    assert!(value >= 7.0);
}

#[test]
fn test_exposition_has_help_and_type() {
    init_metrics().unwrap();
    let output = gather_metrics();

    for line in output.lines().filter(|l| l.starts_with("# TYPE")) {
        let kind = line.split_whitespace().nth(3).unwrap();
        assert!(
            ["counter", "gauge", "histogram"].contains(&kind),
            "unexpected type in {}",
            line
        );
    }
    assert!(output.contains("# HELP meal_shortage_engine_build_info"));
}
