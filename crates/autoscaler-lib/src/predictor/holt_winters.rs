//! In-process Holt-Winters triple exponential smoothing
//!
//! Additive seasonality. With season length `L`, history window `W` and
//! horizon `H`, the model keeps a level, a trend and `L` seasonal
//! components and updates them over the `W` observed points:
//!
//! ```text
//! level_t  = α(x_t - s[t mod L]) + (1-α)(level + trend)
//! trend_t  = β(level_t - level) + (1-β)trend
//! s[t mod L] = γ(x_t - level_t) + (1-γ)s[t mod L]
//! ```
//!
//! and extrapolates `H` further points as `level + m·trend + s[t mod L]`.

use crate::collector::CollectorWorker;
use crate::error::PredictError;
use crate::models::{Forecast, HoltWintersParams};
use std::sync::Arc;

/// Holt-Winters predictor reading the trailing window of its collector
#[derive(Debug)]
pub struct HoltWintersPredictor {
    key: String,
    params: HoltWintersParams,
    worker: Arc<CollectorWorker>,
}

impl HoltWintersPredictor {
    pub fn new(
        key: String,
        params: HoltWintersParams,
        worker: Arc<CollectorWorker>,
    ) -> Result<Self, PredictError> {
        validate(&params)?;
        Ok(Self { key, params, worker })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn params(&self) -> &HoltWintersParams {
        &self.params
    }

    /// Forecast `look_forward` points from the last `look_back` samples
    pub fn predict(&self) -> Result<Forecast, PredictError> {
        let need = self.params.look_back;
        let window = self
            .worker
            .window(need)
            .ok_or_else(|| PredictError::InsufficientData {
                have: self.worker.data_cap(),
                need,
            })?;

        let series: Vec<f64> = window.iter().map(|s| s.value).collect();
        let values = triple_exponential_smoothing(&series, &self.params);
        let baseline = series.last().copied().unwrap_or_default();

        Ok(Forecast {
            values,
            baseline,
            loss: None,
        })
    }
}

fn validate(p: &HoltWintersParams) -> Result<(), PredictError> {
    let invalid = |msg: String| Err(PredictError::InvalidModel(msg));

    if p.season_length == 0 {
        return invalid("season length must be positive".to_string());
    }
    if p.look_forward == 0 {
        return invalid("look_forward must be positive".to_string());
    }
    if p.look_back < 2 * p.season_length {
        return invalid(format!(
            "look_back {} must cover at least two seasons of {}",
            p.look_back, p.season_length
        ));
    }
    if p.look_back % p.season_length != 0 {
        return invalid(format!(
            "look_back {} is not a multiple of season length {}",
            p.look_back, p.season_length
        ));
    }
    for (name, v) in [("alpha", p.alpha), ("beta", p.beta), ("gamma", p.gamma)] {
        if !(0.0..=1.0).contains(&v) {
            return invalid(format!("{} must lie in [0, 1], got {}", name, v));
        }
    }
    Ok(())
}

/// Average per-step change between the first two seasons
fn initial_trend(series: &[f64], slen: usize) -> f64 {
    let sum: f64 = (0..slen)
        .map(|i| (series[i + slen] - series[i]) / slen as f64)
        .sum();
    sum / slen as f64
}

/// Mean deviation of each season position from its season's average
fn initial_seasonal_components(series: &[f64], slen: usize) -> Vec<f64> {
    let n_seasons = series.len() / slen;
    let season_averages: Vec<f64> = series
        .chunks_exact(slen)
        .map(|season| season.iter().sum::<f64>() / slen as f64)
        .collect();

    (0..slen)
        .map(|i| {
            let total: f64 = (0..n_seasons)
                .map(|j| series[slen * j + i] - season_averages[j])
                .sum();
            total / n_seasons as f64
        })
        .collect()
}

/// Forecast `look_forward` points for `series`
///
/// `series` must hold at least two full seasons and a whole number of them.
pub fn triple_exponential_smoothing(series: &[f64], p: &HoltWintersParams) -> Vec<f64> {
    let slen = p.season_length;
    let (alpha, beta, gamma) = (p.alpha, p.beta, p.gamma);

    let mut seasonals = initial_seasonal_components(series, slen);
    let mut trend = initial_trend(series, slen);
    let mut level = series[0] - seasonals[0];

    for (t, &x) in series.iter().enumerate().skip(1) {
        let idx = t % slen;
        let last_level = level;
        level = alpha * (x - seasonals[idx]) + (1.0 - alpha) * (level + trend);
        trend = beta * (level - last_level) + (1.0 - beta) * trend;
        seasonals[idx] = gamma * (x - level) + (1.0 - gamma) * seasonals[idx];
    }

    let w = series.len();
    (w..w + p.look_forward)
        .map(|t| {
            let m = (t - w + 1) as f64;
            level + m * trend + seasonals[t % slen]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::{samples, test_metric, StaticSource};

    fn params(slen: usize, look_back: usize, look_forward: usize) -> HoltWintersParams {
        HoltWintersParams {
            season_length: slen,
            look_back,
            look_forward,
            alpha: 0.5,
            beta: 0.5,
            gamma: 0.5,
        }
    }

    fn worker_with(values: &[f64]) -> Arc<CollectorWorker> {
        let worker = Arc::new(CollectorWorker::new(
            test_metric("cpu"),
            Arc::new(StaticSource::new(vec![])),
            0,
        ));
        worker.append(samples(values));
        worker
    }

    #[test]
    fn test_periodic_series_repeats_season() {
        let series = [1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0];
        let forecast = triple_exponential_smoothing(&series, &params(4, 8, 8));

        let expected = [1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0];
        for (got, want) in forecast.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-9, "got {:?}", forecast);
        }
    }

    #[test]
    fn test_forecast_prefix_does_not_depend_on_horizon() {
        let series = [3.0, 5.0, 4.0, 6.0, 5.0, 7.0, 6.0, 8.0, 7.0, 9.0, 8.0, 10.0];
        let short = triple_exponential_smoothing(&series, &params(2, 12, 3));
        let long = triple_exponential_smoothing(&series, &params(2, 12, 9));

        assert_eq!(short.len(), 3);
        assert_eq!(long.len(), 9);
        assert_eq!(&long[..3], &short[..]);
    }

    #[test]
    fn test_linear_trend_is_extrapolated() {
        let series: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let p = HoltWintersParams {
            alpha: 1.0,
            beta: 1.0,
            gamma: 0.0,
            ..params(1, 8, 3)
        };
        let forecast = triple_exponential_smoothing(&series, &p);
        assert_eq!(forecast, vec![8.0, 9.0, 10.0]);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let worker = worker_with(&[]);
        let cases = [
            params(0, 8, 4),
            params(4, 6, 4),
            params(4, 4, 4),
            params(4, 8, 0),
            HoltWintersParams { alpha: 1.5, ..params(4, 8, 4) },
            HoltWintersParams { gamma: -0.1, ..params(4, 8, 4) },
        ];
        for p in cases {
            assert!(
                matches!(
                    HoltWintersPredictor::new("k".into(), p, worker.clone()),
                    Err(PredictError::InvalidModel(_))
                ),
                "accepted {:?}",
                p
            );
        }
    }

    #[test]
    fn test_predict_requires_full_window() {
        let worker = worker_with(&[1.0, 2.0, 3.0]);
        let predictor = HoltWintersPredictor::new("k".into(), params(2, 4, 2), worker).unwrap();

        match predictor.predict() {
            Err(PredictError::InsufficientData { have, need }) => {
                assert_eq!(have, 3);
                assert_eq!(need, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_predict_uses_trailing_window() {
        let worker = worker_with(&[100.0, 100.0, 1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0]);
        let predictor = HoltWintersPredictor::new("k".into(), params(4, 8, 4), worker.clone()).unwrap();

        let forecast = predictor.predict().unwrap();
        assert_eq!(forecast.values.len(), 4);
        assert_eq!(forecast.baseline, 4.0);
        assert!((forecast.values[3] - 4.0).abs() < 1e-9);

        // History is shared, predicting never consumes it
        assert_eq!(worker.data_cap(), 10);
    }
}
