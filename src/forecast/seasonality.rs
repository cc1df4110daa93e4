use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Periodic component approximated by a truncated Fourier series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seasonality {
    pub name: String,
    /// Period in days
    pub period: f64,
    pub fourier_order: usize,
}

impl Seasonality {
    pub fn new(name: &str, period: f64, fourier_order: usize) -> Self {
        Self {
            name: name.to_string(),
            period,
            fourier_order,
        }
    }

    pub fn weekly(fourier_order: usize) -> Self {
        Self::new("weekly", 7.0, fourier_order)
    }

    pub fn yearly(fourier_order: usize) -> Self {
        Self::new("yearly", 365.25, fourier_order)
    }

    pub fn monthly(period: f64, fourier_order: usize) -> Self {
        Self::new("monthly", period, fourier_order)
    }

    /// Number of regressor columns (a sine and a cosine per order)
    pub fn n_columns(&self) -> usize {
        2 * self.fourier_order
    }

    /// `[sin(2πt/P), cos(2πt/P), sin(4πt/P), ...]` with t in days since the Unix epoch
    pub fn features(&self, date: NaiveDate) -> Vec<f64> {
        let t = days_since_epoch(date);
        let mut out = Vec::with_capacity(self.n_columns());
        for i in 1..=self.fourier_order {
            let x = 2.0 * PI * i as f64 * t / self.period;
            out.push(x.sin());
            out.push(x.cos());
        }
        out
    }
}

/// `num_days_from_ce` of 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Days since 1970-01-01; anchors every seasonality to the same phase.
pub fn days_since_epoch(date: NaiveDate) -> f64 {
    (date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_offset() {
        assert_eq!(days_since_epoch(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()), 0.0);
        assert_eq!(days_since_epoch(NaiveDate::from_ymd_opt(1970, 1, 8).unwrap()), 7.0);
    }

    #[test]
    fn test_weekly_features_repeat_every_seven_days() {
        let weekly = Seasonality::weekly(3);
        let a = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let b = NaiveDate::from_ymd_opt(2025, 6, 9).unwrap();
        let fa = weekly.features(a);
        let fb = weekly.features(b);
        assert_eq!(fa.len(), 6);
        for (x, y) in fa.iter().zip(fb.iter()) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_zero_order_has_no_columns() {
        let s = Seasonality::yearly(0);
        assert_eq!(s.n_columns(), 0);
        assert!(s.features(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()).is_empty());
    }
}
