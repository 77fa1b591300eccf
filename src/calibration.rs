use serde::{Deserialize, Serialize};

/// Home-win probability paired with the observed outcome (`true` = home won).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub home_prob: f64,
    pub home_win: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinaryMetrics {
    pub samples: usize,
    pub brier: f64,
    pub log_loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub count: usize,
    pub avg_pred: f64,
    pub actual_rate: f64,
}

impl BinaryMetrics {
    pub fn empty() -> Self {
        Self {
            samples: 0,
            brier: 0.0,
            log_loss: 0.0,
            accuracy: 0.0,
        }
    }
}

/// Share of games the home side won; 0.5 with no games.
pub fn home_win_rate(outcomes: &[bool]) -> f64 {
    if outcomes.is_empty() {
        return 0.5;
    }
    outcomes.iter().filter(|w| **w).count() as f64 / outcomes.len() as f64
}

pub fn evaluate_probs(scored: &[Scored]) -> BinaryMetrics {
    if scored.is_empty() {
        return BinaryMetrics::empty();
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0usize;

    for s in scored {
        let (b, l, hit) = score_one(*s);
        brier_sum += b;
        log_loss_sum += l;
        if hit {
            correct += 1;
        }
    }

    let n = scored.len() as f64;
    BinaryMetrics {
        samples: scored.len(),
        brier: brier_sum / n,
        log_loss: log_loss_sum / n,
        accuracy: correct as f64 / n,
    }
}

/// Like [`evaluate_probs`] but every sample counts with its weight.
pub fn evaluate_probs_weighted(scored: &[Scored], weights: &[f64]) -> BinaryMetrics {
    if scored.is_empty() || scored.len() != weights.len() {
        return BinaryMetrics::empty();
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0.0_f64;
    let mut weight_sum = 0.0_f64;

    for (s, w_raw) in scored.iter().zip(weights) {
        let w = (*w_raw).max(1e-9);
        weight_sum += w;
        let (b, l, hit) = score_one(*s);
        brier_sum += w * b;
        log_loss_sum += w * l;
        if hit {
            correct += w;
        }
    }

    let n = weight_sum.max(1e-9);
    BinaryMetrics {
        samples: scored.len(),
        brier: brier_sum / n,
        log_loss: log_loss_sum / n,
        accuracy: correct / n,
    }
}

/// Reliability buckets over the home-win probability.
pub fn calibration_bins(scored: &[Scored], bins: usize) -> Vec<CalibrationBin> {
    let bins = bins.max(2);
    let mut counts = vec![0usize; bins];
    let mut pred_sum = vec![0.0_f64; bins];
    let mut actual_sum = vec![0.0_f64; bins];

    for s in scored {
        let p = s.home_prob.clamp(0.0, 1.0);
        let idx = ((p * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
        pred_sum[idx] += p;
        if s.home_win {
            actual_sum[idx] += 1.0;
        }
    }

    (0..bins)
        .map(|i| {
            let count = counts[i];
            let (avg_pred, actual_rate) = if count > 0 {
                (pred_sum[i] / count as f64, actual_sum[i] / count as f64)
            } else {
                (0.0, 0.0)
            };
            CalibrationBin {
                bucket_start: i as f64 / bins as f64,
                bucket_end: (i + 1) as f64 / bins as f64,
                count,
                avg_pred,
                actual_rate,
            }
        })
        .collect()
}

// (brier, log loss, correct at the 0.5 threshold)
fn score_one(s: Scored) -> (f64, f64, bool) {
    let p = s.home_prob.clamp(0.0, 1.0);
    let y = if s.home_win { 1.0 } else { 0.0 };
    let brier = (p - y).powi(2);
    let actual_prob = if s.home_win { p } else { 1.0 - p }.clamp(1e-12, 1.0);
    let predicted_home = p > 0.5;
    (brier, -actual_prob.ln(), predicted_home == s.home_win)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(p: f64, w: bool) -> Scored {
        Scored {
            home_prob: p,
            home_win: w,
        }
    }

    #[test]
    fn perfect_predictions_have_zero_brier() {
        let m = evaluate_probs(&[s(1.0, true), s(0.0, false)]);
        assert_eq!(m.samples, 2);
        assert!(m.brier < 1e-12);
        assert_eq!(m.accuracy, 1.0);
    }

    #[test]
    fn coin_flip_log_loss_is_ln2() {
        let m = evaluate_probs(&[s(0.5, true), s(0.5, false)]);
        assert!((m.log_loss - std::f64::consts::LN_2).abs() < 1e-12);
        assert!((m.brier - 0.25).abs() < 1e-12);
    }

    #[test]
    fn weights_shift_accuracy() {
        let scored = [s(0.9, true), s(0.9, false)];
        let m = evaluate_probs_weighted(&scored, &[3.0, 1.0]);
        assert!((m.accuracy - 0.75).abs() < 1e-12);
        assert_eq!(evaluate_probs_weighted(&scored, &[1.0]).samples, 0);
    }

    #[test]
    fn bins_cover_unit_interval() {
        let bins = calibration_bins(&[s(0.05, false), s(0.95, true), s(1.0, true)], 10);
        assert_eq!(bins.len(), 10);
        assert_eq!(bins[0].count, 1);
        assert_eq!(bins[9].count, 2);
        assert_eq!(bins[9].actual_rate, 1.0);
    }

    #[test]
    fn home_rate_defaults_to_even() {
        assert_eq!(home_win_rate(&[]), 0.5);
        assert_eq!(home_win_rate(&[true, true, false, true]), 0.75);
    }
}
