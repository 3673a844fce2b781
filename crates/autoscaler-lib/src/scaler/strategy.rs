//! Replica aggregation strategies
//!
//! A forecast becomes a replica sequence through a [`BaseStrategy`]. The
//! sequences of sibling models on one metric are folded by a
//! [`ModelStrategy`], and the weighted sum over all metrics is reduced to a
//! single number by an [`ObjStrategy`].

use serde::{Deserialize, Serialize};

/// Converts a forecast into a replica count per future step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseStrategy {
    /// Keep per-replica load where it is now
    #[default]
    Steady,
    /// Keep per-replica load under the metric target
    UnderThreshold,
}

impl BaseStrategy {
    pub fn apply(&self, forecast: &[f64], baseline: f64, current: i32, target: f64) -> Vec<i32> {
        match self {
            BaseStrategy::Steady => steady(forecast, baseline, current),
            BaseStrategy::UnderThreshold => under_threshold(forecast, target),
        }
    }
}

/// Float to replica count, rounding up and clamping negatives to zero
fn to_replicas(v: f64) -> i32 {
    if v.is_nan() || v <= 0.0 {
        0
    } else {
        v.ceil() as i32
    }
}

/// `ceil(current * f / baseline)` for each forecast value
///
/// A zero baseline carries no load information, so the current count is kept.
pub fn steady(forecast: &[f64], baseline: f64, current: i32) -> Vec<i32> {
    if baseline == 0.0 {
        return vec![current.max(0); forecast.len()];
    }
    forecast
        .iter()
        .map(|f| to_replicas(current as f64 * f / baseline))
        .collect()
}

/// `ceil(f / target)` for each forecast value, zero target yields zeros
pub fn under_threshold(forecast: &[f64], target: f64) -> Vec<i32> {
    if target == 0.0 {
        return vec![0; forecast.len()];
    }
    forecast.iter().map(|f| to_replicas(f / target)).collect()
}

/// Folds the sequences of several models on one metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStrategy {
    #[default]
    Max,
    Min,
    Mean,
}

impl ModelStrategy {
    /// Element-wise fold, truncated to the shortest sequence
    pub fn apply(&self, sequences: &[Vec<i32>]) -> Vec<i32> {
        let len = match sequences.iter().map(Vec::len).min() {
            Some(len) => len,
            None => return Vec::new(),
        };

        (0..len)
            .map(|i| {
                let column = sequences.iter().map(|s| s[i]);
                match self {
                    ModelStrategy::Max => column.max().unwrap_or_default(),
                    ModelStrategy::Min => column.min().unwrap_or_default(),
                    ModelStrategy::Mean => {
                        let sum: i64 = column.map(i64::from).sum();
                        sum.div_euclid(sequences.len() as i64) as i32
                    }
                }
            })
            .collect()
    }
}

/// Element-wise `Σ weight · sequence`, truncated to the shortest sequence
pub fn weighted_sum(weighted: &[(i32, Vec<i32>)]) -> Vec<i64> {
    let len = match weighted.iter().map(|(_, s)| s.len()).min() {
        Some(len) => len,
        None => return Vec::new(),
    };

    (0..len)
        .map(|i| {
            weighted
                .iter()
                .map(|(w, s)| i64::from(*w) * i64::from(s[i]))
                .sum()
        })
        .collect()
}

/// Reduces the summed sequence to one number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjStrategy {
    #[default]
    SelectMax,
}

impl ObjStrategy {
    pub fn apply(&self, summed: &[i64]) -> Option<i64> {
        match self {
            ObjStrategy::SelectMax => summed.iter().copied().max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_scales_with_forecast() {
        assert_eq!(steady(&[20.0, -5.0, 15.0], 10.0, 2), vec![4, 0, 3]);
    }

    #[test]
    fn test_steady_rounds_up() {
        assert_eq!(steady(&[11.0], 10.0, 3), vec![4]);
    }

    #[test]
    fn test_steady_zero_baseline_keeps_current() {
        assert_eq!(steady(&[5.0, 8.0], 0.0, 3), vec![3, 3]);
    }

    #[test]
    fn test_under_threshold() {
        assert_eq!(under_threshold(&[0.0, 1.0, 9.5, 10.0, -3.0], 5.0), vec![0, 1, 2, 2, 0]);
        assert_eq!(under_threshold(&[4.0, 7.0], 0.0), vec![0, 0]);
    }

    #[test]
    fn test_base_strategy_dispatch() {
        assert_eq!(BaseStrategy::Steady.apply(&[20.0], 10.0, 2, 1.0), vec![4]);
        assert_eq!(BaseStrategy::UnderThreshold.apply(&[20.0], 10.0, 2, 4.0), vec![5]);
    }

    #[test]
    fn test_model_strategies() {
        let seqs = vec![vec![0, 1, 1, 1, 2], vec![0, 2, 3, 5, 6]];
        assert_eq!(ModelStrategy::Mean.apply(&seqs), vec![0, 1, 2, 3, 4]);
        assert_eq!(ModelStrategy::Max.apply(&seqs), vec![0, 2, 3, 5, 6]);
        assert_eq!(ModelStrategy::Min.apply(&seqs), vec![0, 1, 1, 1, 2]);
    }

    #[test]
    fn test_model_strategy_truncates_and_handles_empty() {
        let seqs = vec![vec![1, 5, 9], vec![3, 2]];
        assert_eq!(ModelStrategy::Max.apply(&seqs), vec![3, 5]);
        assert!(ModelStrategy::Mean.apply(&[]).is_empty());
    }

    #[test]
    fn test_weighted_sum_and_select_max() {
        let summed = weighted_sum(&[(60, vec![1, 3, 2]), (40, vec![2, 1, 4])]);
        assert_eq!(summed, vec![140, 220, 280]);
        assert_eq!(ObjStrategy::SelectMax.apply(&summed), Some(280));
        assert_eq!(ObjStrategy::SelectMax.apply(&[]), None);
    }
}
