//! Piecewise-linear growth with changepoints.
//!
//! Time is scaled so the first observation is `t = 0` and the last is `t = 1`.
//! A changepoint at `s` adds `delta * (t - s)` for every `t >= s`, which keeps
//! the trend continuous while letting the slope change.

use rand::Rng;
use rand::distributions::Distribution;
use serde::{Deserialize, Serialize};
use statrs::distribution::Poisson;

/// Fitted trend in scaled units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiecewiseLinearTrend {
    /// Base growth rate
    pub k: f64,
    /// Offset
    pub m: f64,
    /// Changepoint locations in scaled time
    pub changepoints: Vec<f64>,
    /// Rate adjustment at each changepoint
    pub deltas: Vec<f64>,
}

impl PiecewiseLinearTrend {
    pub fn value_at(&self, t: f64) -> f64 {
        let shift: f64 = self
            .changepoints
            .iter()
            .zip(self.deltas.iter())
            .map(|(&s, &d)| d * hinge(t, s))
            .sum();
        self.k * t + self.m + shift
    }

    /// Mean absolute rate adjustment; the scale of sampled future changes
    pub fn mean_abs_delta(&self) -> f64 {
        if self.deltas.is_empty() {
            return 0.0;
        }
        self.deltas.iter().map(|d| d.abs()).sum::<f64>() / self.deltas.len() as f64
    }
}

/// `max(t - s, 0)`: the design column of a changepoint at `s`
pub fn hinge(t: f64, s: f64) -> f64 {
    if t >= s {
        t - s
    } else {
        0.0
    }
}

/// Place up to `n_changepoints` at observation times evenly spread over the
/// first `changepoint_range` share of the history. The first observation is
/// never a changepoint.
pub fn place_changepoints(t: &[f64], n_changepoints: usize, changepoint_range: f64) -> Vec<f64> {
    let hist_size = (t.len() as f64 * changepoint_range).floor() as usize;
    let n = n_changepoints.min(hist_size.saturating_sub(1));
    if n == 0 {
        return Vec::new();
    }

    let last = (hist_size - 1) as f64;
    (1..=n)
        .map(|i| {
            let idx = (last * i as f64 / n as f64).round_ties_even() as usize;
            t[idx.min(t.len() - 1)]
        })
        .collect()
}

/// Random slope changes beyond the end of the history
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FutureTrendShift {
    changes: Vec<(f64, f64)>,
}

impl FutureTrendShift {
    /// Draw changepoints uniformly on `(1, t_max]` at the historical rate
    /// (`n_hist_changepoints` per unit of scaled time) with Laplace magnitudes.
    pub fn sample<R: Rng>(
        rng: &mut R,
        t_max: f64,
        n_hist_changepoints: usize,
        mean_abs_delta: f64,
    ) -> Self {
        let horizon = t_max - 1.0;
        if horizon <= 0.0 || n_hist_changepoints == 0 {
            return Self::default();
        }

        let n_changes = sample_poisson(rng, n_hist_changepoints as f64 * horizon);
        let scale = mean_abs_delta + 1e-8;
        let positions: Vec<f64> = (0..n_changes)
            .map(|_| 1.0 + rng.gen::<f64>() * horizon)
            .collect();
        let changes = positions
            .into_iter()
            .map(|s| (s, sample_laplace(rng, scale)))
            .collect();

        Self { changes }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Additive trend offset at `t`
    pub fn value_at(&self, t: f64) -> f64 {
        self.changes.iter().map(|&(s, d)| d * hinge(t, s)).sum()
    }
}

/// Poisson draw; zero for a non-positive rate
pub fn sample_poisson<R: Rng>(rng: &mut R, lambda: f64) -> usize {
    if !(lambda > 0.0) {
        return 0;
    }
    match Poisson::new(lambda) {
        Ok(poisson) => poisson.sample(rng) as usize,
        Err(_) => 0,
    }
}

/// Laplace(0, scale) draw by inverse CDF
pub fn sample_laplace<R: Rng>(rng: &mut R, scale: f64) -> f64 {
    let u = rng.gen::<f64>() - 0.5;
    let tail = (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE);
    -scale * u.signum() * tail.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn scaled_times(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 / (n - 1) as f64).collect()
    }

    #[test]
    fn test_changepoints_cover_first_80_percent() {
        let t = scaled_times(90);
        let cps = place_changepoints(&t, 25, 0.8);
        assert_eq!(cps.len(), 25);
        assert!(cps[0] > 0.0);
        assert!(cps.windows(2).all(|w| w[0] < w[1]));
        // hist_size = 72, so the last changepoint is observation 71
        assert!((cps[24] - t[71]).abs() < 1e-12);
    }

    #[test]
    fn test_short_history_limits_changepoints() {
        let t = scaled_times(5);
        assert_eq!(place_changepoints(&t, 25, 0.8).len(), 3);
        assert!(place_changepoints(&scaled_times(2), 25, 0.8).is_empty());
    }

    #[test]
    fn test_trend_is_continuous_at_changepoint() {
        let trend = PiecewiseLinearTrend {
            k: 1.0,
            m: 0.5,
            changepoints: vec![0.5],
            deltas: vec![-2.0],
        };
        assert!((trend.value_at(0.5) - 1.0).abs() < 1e-12);
        assert!((trend.value_at(1.0) - 0.5).abs() < 1e-12);
        assert!((trend.mean_abs_delta() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_poisson_mean_is_close_to_rate() {
        let mut rng = StdRng::seed_from_u64(3);
        let n = 5000;
        let mean = (0..n).map(|_| sample_poisson(&mut rng, 4.0) as f64).sum::<f64>() / n as f64;
        assert!((mean - 4.0).abs() < 0.2);
        assert_eq!(sample_poisson(&mut rng, 0.0), 0);
        assert_eq!(sample_poisson(&mut rng, f64::NAN), 0);
    }

    #[test]
    fn test_poisson_large_rate() {
        let mut rng = StdRng::seed_from_u64(5);
        let n = 2000;
        let mean = (0..n).map(|_| sample_poisson(&mut rng, 60.0) as f64).sum::<f64>() / n as f64;
        assert!((mean - 60.0).abs() < 1.5);
    }

    #[test]
    fn test_laplace_is_symmetric_with_scale() {
        let mut rng = StdRng::seed_from_u64(9);
        let draws: Vec<f64> = (0..10000).map(|_| sample_laplace(&mut rng, 2.0)).collect();
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        let mean_abs = draws.iter().map(|d| d.abs()).sum::<f64>() / draws.len() as f64;
        assert!(mean.abs() < 0.15);
        assert!((mean_abs - 2.0).abs() < 0.15);
    }

    #[test]
    fn test_future_shift_only_affects_future() {
        let mut rng = StdRng::seed_from_u64(1);
        let shift = FutureTrendShift::sample(&mut rng, 3.0, 25, 0.05);
        assert!(!shift.is_empty());
        assert_eq!(shift.value_at(0.5), 0.0);
        assert_eq!(shift.value_at(1.0), 0.0);
        assert!(FutureTrendShift::sample(&mut rng, 1.0, 25, 0.05).is_empty());
    }
}
