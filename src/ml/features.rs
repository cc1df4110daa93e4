use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

/// Number of features in the fixed schema
pub const NUM_FEATURES: usize = 15;

/// Feature names in training/inference column order
pub const FEATURE_NAMES: [&str; NUM_FEATURES] = [
    "enrollment",
    "current_attendance",
    "capacity",
    "avg_meal_uptake",
    "attendance_rate",
    "capacity_utilization",
    "days_since_inspection",
    "previous_shortage_count",
    "budget_utilization_rate",
    "supply_chain_delay_days",
    "weather_risk_score",
    "seasonal_factor",
    "hostel_attached",
    "enrollment_trend_7d",
    "attendance_trend_7d",
];

/// Operational state of one school, as consumed by the risk model.
///
/// Deserialization rejects missing and unknown fields; [`FeatureVector::validate_domain`]
/// enforces the per-field domains. The risk model re-checks domains on every call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct FeatureVector {
    /// Total enrollment
    #[validate(range(min = 1))]
    pub enrollment: u32,

    /// Current attendance
    pub current_attendance: u32,

    /// Meal capacity
    #[validate(range(min = 1))]
    pub capacity: u32,

    /// Average meal uptake
    pub avg_meal_uptake: u32,

    /// Attendance rate (0-1)
    #[validate(range(min = 0.0, max = 1.0))]
    pub attendance_rate: f64,

    /// Capacity utilization (0-1)
    #[validate(range(min = 0.0, max = 1.0))]
    pub capacity_utilization: f64,

    /// Days since last inspection
    pub days_since_inspection: u32,

    /// Previous shortage incidents
    pub previous_shortage_count: u32,

    /// Budget utilization (0-1)
    #[validate(range(min = 0.0, max = 1.0))]
    pub budget_utilization_rate: f64,

    /// Supply chain delay in days
    pub supply_chain_delay_days: u32,

    /// Weather risk score (0-100)
    #[validate(range(min = 0.0, max = 100.0))]
    pub weather_risk_score: f64,

    /// Seasonal adjustment factor (> 0)
    pub seasonal_factor: f64,

    /// Hostel attached (0 or 1)
    #[validate(range(max = 1))]
    pub hostel_attached: u8,

    /// 7-day enrollment trend
    pub enrollment_trend_7d: f64,

    /// 7-day attendance trend
    pub attendance_trend_7d: f64,
}

impl FeatureVector {
    /// Check every field against its declared domain.
    pub fn validate_domain(&self) -> Result<()> {
        // Range checks let NaN through, so finiteness goes first.
        for (name, value) in FEATURE_NAMES.iter().zip(self.to_array()) {
            if !value.is_finite() {
                return Err(AppError::Validation(format!(
                    "{}: value must be finite",
                    name
                )));
            }
        }
        self.validate()?;
        if self.seasonal_factor <= 0.0 {
            return Err(AppError::Validation(format!(
                "seasonal_factor: must be > 0, got {}",
                self.seasonal_factor
            )));
        }
        Ok(())
    }

    /// Values in [`FEATURE_NAMES`] order
    pub fn to_array(&self) -> [f64; NUM_FEATURES] {
        [
            self.enrollment as f64,
            self.current_attendance as f64,
            self.capacity as f64,
            self.avg_meal_uptake as f64,
            self.attendance_rate,
            self.capacity_utilization,
            self.days_since_inspection as f64,
            self.previous_shortage_count as f64,
            self.budget_utilization_rate,
            self.supply_chain_delay_days as f64,
            self.weather_risk_score,
            self.seasonal_factor,
            self.hostel_attached as f64,
            self.enrollment_trend_7d,
            self.attendance_trend_7d,
        ]
    }

    /// Build a vector from a name → value dictionary.
    ///
    /// Every schema field must be present, no other keys are accepted, and
    /// integer fields must carry integral values.
    pub fn from_map(values: &HashMap<String, f64>) -> Result<Self> {
        for key in values.keys() {
            if !FEATURE_NAMES.contains(&key.as_str()) {
                return Err(AppError::Validation(format!("unknown feature: {}", key)));
            }
        }

        let get = |name: &str| -> Result<f64> {
            values
                .get(name)
                .copied()
                .ok_or_else(|| AppError::Validation(format!("missing feature: {}", name)))
        };
        let get_int = |name: &str| -> Result<u32> {
            let value = get(name)?;
            if !value.is_finite() || value.fract() != 0.0 || value < 0.0 || value > u32::MAX as f64
            {
                return Err(AppError::Validation(format!(
                    "{}: expected a non-negative integer, got {}",
                    name, value
                )));
            }
            Ok(value as u32)
        };

        let hostel = get_int("hostel_attached")?;
        let vector = Self {
            enrollment: get_int("enrollment")?,
            current_attendance: get_int("current_attendance")?,
            capacity: get_int("capacity")?,
            avg_meal_uptake: get_int("avg_meal_uptake")?,
            attendance_rate: get("attendance_rate")?,
            capacity_utilization: get("capacity_utilization")?,
            days_since_inspection: get_int("days_since_inspection")?,
            previous_shortage_count: get_int("previous_shortage_count")?,
            budget_utilization_rate: get("budget_utilization_rate")?,
            supply_chain_delay_days: get_int("supply_chain_delay_days")?,
            weather_risk_score: get("weather_risk_score")?,
            seasonal_factor: get("seasonal_factor")?,
            hostel_attached: u8::try_from(hostel).map_err(|_| {
                AppError::Validation(format!("hostel_attached: expected 0 or 1, got {}", hostel))
            })?,
            enrollment_trend_7d: get("enrollment_trend_7d")?,
            attendance_trend_7d: get("attendance_trend_7d")?,
        };

        vector.validate_domain()?;
        Ok(vector)
    }

    /// Name → value dictionary in schema order
    pub fn to_map(&self) -> HashMap<String, f64> {
        FEATURE_NAMES
            .iter()
            .zip(self.to_array())
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_vector() -> FeatureVector {
        FeatureVector {
            enrollment: 450,
            current_attendance: 390,
            capacity: 420,
            avg_meal_uptake: 370,
            attendance_rate: 0.87,
            capacity_utilization: 0.88,
            days_since_inspection: 45,
            previous_shortage_count: 2,
            budget_utilization_rate: 0.9,
            supply_chain_delay_days: 3,
            weather_risk_score: 25.0,
            seasonal_factor: 1.05,
            hostel_attached: 0,
            enrollment_trend_7d: 0.01,
            attendance_trend_7d: -0.02,
        }
    }

    #[test]
    fn test_valid_vector_passes() {
        assert!(sample_vector().validate_domain().is_ok());
    }

    #[test]
    fn test_out_of_domain_values_rejected() {
        let mut v = sample_vector();
        v.enrollment = 0;
        assert!(matches!(v.validate_domain(), Err(AppError::Validation(_))));

        let mut v = sample_vector();
        v.attendance_rate = 1.2;
        assert!(matches!(v.validate_domain(), Err(AppError::Validation(_))));

        let mut v = sample_vector();
        v.weather_risk_score = 100.5;
        assert!(matches!(v.validate_domain(), Err(AppError::Validation(_))));

        let mut v = sample_vector();
        v.seasonal_factor = 0.0;
        assert!(matches!(v.validate_domain(), Err(AppError::Validation(_))));

        let mut v = sample_vector();
        v.hostel_attached = 2;
        assert!(matches!(v.validate_domain(), Err(AppError::Validation(_))));

        let mut v = sample_vector();
        v.attendance_trend_7d = f64::NAN;
        assert!(matches!(v.validate_domain(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_array_order_matches_names() {
        let v = sample_vector();
        let arr = v.to_array();
        assert_eq!(arr[0], 450.0);
        assert_eq!(arr[5], 0.88);
        assert_eq!(arr[12], 0.0);
        assert_eq!(arr[14], -0.02);
    }

    #[test]
    fn test_from_map_roundtrip() {
        let v = sample_vector();
        let rebuilt = FeatureVector::from_map(&v.to_map()).unwrap();
        assert_eq!(v, rebuilt);
    }

    #[test]
    fn test_from_map_missing_field() {
        let mut map = sample_vector().to_map();
        map.remove("capacity");
        let err = FeatureVector::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn test_from_map_unknown_field() {
        let mut map = sample_vector().to_map();
        map.insert("district".to_string(), 1.0);
        assert!(matches!(
            FeatureVector::from_map(&map),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_from_map_fractional_integer() {
        let mut map = sample_vector().to_map();
        map.insert("enrollment".to_string(), 450.5);
        assert!(matches!(
            FeatureVector::from_map(&map),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_deserialize_rejects_missing_and_unknown() {
        let mut json = serde_json::to_value(sample_vector()).unwrap();
        json.as_object_mut().unwrap().remove("seasonal_factor");
        assert!(serde_json::from_value::<FeatureVector>(json).is_err());

        let mut json = serde_json::to_value(sample_vector()).unwrap();
        json.as_object_mut()
            .unwrap()
            .insert("extra".to_string(), serde_json::json!(1));
        assert!(serde_json::from_value::<FeatureVector>(json).is_err());
    }
}
