use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::ElementConversion;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::calibration::{BinaryMetrics, Scored, evaluate_probs, evaluate_probs_weighted};
use crate::dataset::{Dataset, DatasetEntry};
use crate::error::{ForecastError, Result};
use crate::mlp::{
    ClassifierNet, InferenceBackend, MlpClassifier, TrainBackend, column_tensor, rows_tensor,
    weighted_bce_with_logits, with_seeded_backend,
};
use crate::scaler::StandardScaler;
use crate::stats::FEATURE_DIM;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    pub train_fraction: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub hidden: Vec<usize>,
    pub dropout: Vec<f64>,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            train_fraction: 0.8,
            epochs: 30,
            batch_size: 64,
            learning_rate: 1e-3,
            hidden: vec![64, 32, 16],
            dropout: vec![0.3, 0.3, 0.0],
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub train_samples: usize,
    pub val_samples: usize,
    pub epochs: Vec<EpochStats>,
    pub validation: BinaryMetrics,
    pub validation_weighted: BinaryMetrics,
}

impl TrainingReport {
    /// Accuracy on the held-out rows with their recency weights applied.
    pub fn validation_accuracy(&self) -> f64 {
        self.validation_weighted.accuracy
    }
}

/// Fitted scaler and classifier. Not yet committed anywhere.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub scaler: StandardScaler,
    pub classifier: MlpClassifier,
    pub report: TrainingReport,
}

pub fn train(dataset: &Dataset, cfg: &TrainerConfig) -> Result<TrainedModel> {
    let (train_rows, val_rows) = dataset.chronological_split(cfg.train_fraction);
    if train_rows.is_empty() || val_rows.is_empty() {
        return Err(ForecastError::TrainingFailure(format!(
            "need rows on both sides of the split (train={}, validation={})",
            train_rows.len(),
            val_rows.len()
        )));
    }

    let raw: Vec<[f64; FEATURE_DIM]> = train_rows.iter().map(|e| e.features).collect();
    let scaler = StandardScaler::fit(&raw)
        .map_err(|e| ForecastError::TrainingFailure(format!("fit scaler: {e}")))?;
    let x_train = scale_rows(&scaler, train_rows)?;
    let x_val = scale_rows(&scaler, val_rows)?;
    let y_train: Vec<f32> = train_rows.iter().map(|e| f32::from(e.label)).collect();
    let w_train: Vec<f32> = train_rows.iter().map(|e| e.weight as f32).collect();

    let (classifier, epochs) = with_seeded_backend(cfg.seed, || {
        fit(cfg, &x_train, &y_train, &w_train, &x_val, val_rows)
    })?;

    let scored = score_scaled(&classifier, &x_val, val_rows)?;
    let weights: Vec<f64> = val_rows.iter().map(|e| e.weight).collect();
    let report = TrainingReport {
        train_samples: train_rows.len(),
        val_samples: val_rows.len(),
        epochs,
        validation: evaluate_probs(&scored),
        validation_weighted: evaluate_probs_weighted(&scored, &weights),
    };
    info!(
        accuracy = report.validation_accuracy(),
        log_loss = report.validation_weighted.log_loss,
        brier = report.validation_weighted.brier,
        "validation"
    );

    Ok(TrainedModel {
        scaler,
        classifier,
        report,
    })
}

/// Mini-batch Adam over the scaled training rows. Expects the backend RNG
/// to be seeded by the caller.
fn fit(
    cfg: &TrainerConfig,
    x_train: &[Vec<f64>],
    y_train: &[f32],
    w_train: &[f32],
    x_val: &[Vec<f64>],
    val_rows: &[DatasetEntry],
) -> Result<(MlpClassifier, Vec<EpochStats>)> {
    let device = Default::default();
    let mut model = ClassifierNet::<TrainBackend>::new(&device, FEATURE_DIM, &cfg.hidden, &cfg.dropout);
    let mut optimizer = AdamConfig::new()
        .with_epsilon(1e-7)
        .init::<TrainBackend, ClassifierNet<TrainBackend>>();
    let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(1));
    let mut order: Vec<usize> = (0..x_train.len()).collect();
    let batch_size = cfg.batch_size.max(1);

    info!(
        train = x_train.len(),
        validation = x_val.len(),
        epochs = cfg.epochs,
        batch_size,
        params = model.num_params(),
        "training classifier"
    );

    let mut epochs = Vec::with_capacity(cfg.epochs);
    for epoch in 1..=cfg.epochs {
        order.shuffle(&mut rng);
        let mut loss_sum = 0.0;

        for batch in order.chunks(batch_size) {
            let x = rows_tensor::<TrainBackend>(
                batch.iter().map(|&i| x_train[i].as_slice()),
                FEATURE_DIM,
                &device,
            );
            let y = column_tensor(batch.iter().map(|&i| y_train[i]).collect(), &device);
            let w = column_tensor(batch.iter().map(|&i| w_train[i]).collect(), &device);

            let loss = weighted_bce_with_logits(model.forward(x), y, w);
            let batch_loss: f32 = loss.clone().into_scalar().elem();
            loss_sum += f64::from(batch_loss) * batch.len() as f64;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(cfg.learning_rate, model, grads);
        }

        let loss = loss_sum / x_train.len() as f64;
        if !loss.is_finite() {
            return Err(ForecastError::TrainingFailure(format!(
                "loss diverged at epoch {epoch}"
            )));
        }
        let snapshot = export(&model.valid())?;
        let val = evaluate_probs(&score_scaled(&snapshot, x_val, val_rows)?);
        debug!(epoch, loss, val_loss = val.log_loss, val_accuracy = val.accuracy, "epoch done");
        epochs.push(EpochStats {
            epoch,
            loss,
            val_loss: val.log_loss,
            val_accuracy: val.accuracy,
        });
    }

    Ok((export(&model.valid())?, epochs))
}

fn export(net: &ClassifierNet<InferenceBackend>) -> Result<MlpClassifier> {
    MlpClassifier::from_net(net)
        .map_err(|e| ForecastError::TrainingFailure(format!("export weights: {e}")))
}

/// Scores raw dataset rows with a fitted scaler and classifier.
pub fn score_entries(
    scaler: &StandardScaler,
    classifier: &MlpClassifier,
    entries: &[DatasetEntry],
) -> Result<Vec<Scored>> {
    let x = scale_rows(scaler, entries)?;
    score_scaled(classifier, &x, entries)
}

fn scale_rows(scaler: &StandardScaler, entries: &[DatasetEntry]) -> Result<Vec<Vec<f64>>> {
    entries
        .iter()
        .map(|e| {
            scaler
                .transform(&e.features)
                .map_err(|err| ForecastError::InferenceFailure(err.to_string()))
        })
        .collect()
}

fn score_scaled(
    classifier: &MlpClassifier,
    x: &[Vec<f64>],
    entries: &[DatasetEntry],
) -> Result<Vec<Scored>> {
    let probs = classifier
        .predict_batch(x)
        .map_err(|err| ForecastError::InferenceFailure(err.to_string()))?;
    Ok(probs
        .into_iter()
        .zip(entries)
        .map(|(p, e)| Scored {
            home_prob: p,
            home_win: e.label == 1,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn synthetic(n: usize) -> Dataset {
        let base = NaiveDate::from_ymd_opt(2023, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid date");
        let entries = (0..n)
            .map(|i| {
                let edge = ((i * 37) % 21) as f64 - 10.0;
                let mut features = [0.0; FEATURE_DIM];
                features[0] = 105.0 + edge;
                features[10] = 105.0 - edge;
                features[7] = 0.46 + edge / 200.0;
                features[17] = 0.46 - edge / 200.0;
                DatasetEntry {
                    features,
                    label: u8::from(edge > 0.0),
                    weight: 1.0,
                    game_date: base + chrono::Duration::days(i as i64),
                }
            })
            .collect();
        Dataset {
            entries,
            final_state: Default::default(),
            latest_date: None,
        }
    }

    fn quick() -> TrainerConfig {
        TrainerConfig {
            epochs: 15,
            batch_size: 16,
            learning_rate: 0.01,
            ..TrainerConfig::default()
        }
    }

    #[test]
    fn learns_a_separable_signal() {
        let model = train(&synthetic(200), &quick()).expect("train");
        assert_eq!(model.report.train_samples, 160);
        assert_eq!(model.report.val_samples, 40);
        assert_eq!(model.report.epochs.len(), 15);
        assert!(model.report.validation_accuracy() > 0.8);
    }

    #[test]
    fn training_is_reproducible_for_a_seed() {
        let ds = synthetic(80);
        let cfg = TrainerConfig {
            epochs: 3,
            ..quick()
        };
        let a = train(&ds, &cfg).expect("train");
        let b = train(&ds, &cfg).expect("train");
        assert_eq!(a.classifier, b.classifier);
        assert_eq!(a.report, b.report);
    }

    #[test]
    fn tiny_dataset_is_rejected() {
        let err = train(&synthetic(1), &quick()).expect_err("should fail");
        assert!(matches!(err, ForecastError::TrainingFailure(_)));
    }
}
