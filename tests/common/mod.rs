//! Shared fixtures for integration tests
#![allow(dead_code)]

use chrono::NaiveDate;
use meal_shortage_engine::{config::Config, forecast::DemandModelConfig, ml::FeatureVector};
use std::collections::HashMap;

/// Fixed "today" so forecasts do not depend on the wall clock
pub fn reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// School under pressure on every shortage driver
pub fn stressed_school() -> FeatureVector {
    FeatureVector {
        enrollment: 500,
        current_attendance: 300,
        capacity: 450,
        avg_meal_uptake: 290,
        attendance_rate: 0.6,
        capacity_utilization: 1.0,
        days_since_inspection: 90,
        previous_shortage_count: 8,
        budget_utilization_rate: 0.85,
        supply_chain_delay_days: 10,
        weather_risk_score: 50.0,
        seasonal_factor: 1.0,
        hostel_attached: 0,
        enrollment_trend_7d: 0.0,
        attendance_trend_7d: 0.0,
    }
}

/// School with spare capacity and a clean record
pub fn calm_school() -> FeatureVector {
    FeatureVector {
        enrollment: 400,
        current_attendance: 380,
        capacity: 700,
        avg_meal_uptake: 350,
        attendance_rate: 0.95,
        capacity_utilization: 0.5,
        days_since_inspection: 5,
        previous_shortage_count: 0,
        budget_utilization_rate: 1.0,
        supply_chain_delay_days: 0,
        weather_risk_score: 5.0,
        seasonal_factor: 1.0,
        hostel_attached: 1,
        enrollment_trend_7d: 0.0,
        attendance_trend_7d: 0.0,
    }
}

pub fn demand_config() -> DemandModelConfig {
    DemandModelConfig {
        reference_date: Some(reference_date()),
        uncertainty_samples: 300,
        ..DemandModelConfig::default()
    }
}

/// Config with smaller workloads and no artifact locations
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.risk_model.synthetic_samples = 400;
    config.demand_model = demand_config();
    config
}

/// Metric name → exposition lines (HELP, TYPE and samples)
pub fn parse_prometheus_output(output: &str) -> HashMap<String, Vec<String>> {
    let mut metrics = HashMap::new();
    let mut current_metric = String::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("# HELP") || line.starts_with("# TYPE") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 {
                current_metric = parts[2].to_string();
                metrics
                    .entry(current_metric.clone())
                    .or_insert_with(Vec::new)
                    .push(line.to_string());
            }
        } else if !line.starts_with('#') && !current_metric.is_empty() {
            metrics
                .entry(current_metric.clone())
                .or_insert_with(Vec::new)
                .push(line.to_string());
        }
    }

    metrics
}

/// Value of a sample line such as `name{a="1"} 42`
pub fn extract_metric_value(line: &str) -> Option<f64> {
    line.split_whitespace().last()?.parse::<f64>().ok()
}
