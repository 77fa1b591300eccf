//! Feed-forward binary classifier on burn.
//!
//! Architecture used for match outcomes: `20 -> 64 -> 32 -> 16 -> 1`,
//! ReLU hidden layers, dropout 0.3 after the first two, sigmoid output.
//! Training runs on `Autodiff<NdArray>`; the fitted weights are exported
//! into [`MlpClassifier`], which is what bundles persist and serve from.

use std::sync::{Mutex, PoisonError};

use burn::backend::Autodiff;
use burn::module::{Module, Param};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use burn_ndarray::NdArray;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend used for inference and validation scoring.
pub type InferenceBackend = NdArray<f32>;
/// Backend used while fitting.
pub type TrainBackend = Autodiff<InferenceBackend>;

/// The ndarray backend keeps one process-wide RNG for parameter init and
/// dropout masks, so seeded work is serialised.
static BACKEND_RNG: Mutex<()> = Mutex::new(());

/// Runs `f` with the backend RNG seeded and held exclusively.
pub fn with_seeded_backend<R>(seed: u64, f: impl FnOnce() -> R) -> R {
    let _guard = BACKEND_RNG.lock().unwrap_or_else(PoisonError::into_inner);
    InferenceBackend::seed(&Default::default(), seed);
    f()
}

#[derive(Debug, Error, PartialEq)]
pub enum InferenceError {
    #[error("classifier expects {expected} inputs, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("classifier has no layers")]
    Empty,
    #[error("classifier produced a non-finite output")]
    NonFinite,
    #[error("tensor data: {0}")]
    Tensor(String),
}

/// Linear -> ReLU -> Dropout.
#[derive(Module, Debug)]
pub struct HiddenBlock<B: Backend> {
    linear: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> HiddenBlock<B> {
    pub fn new(device: &B::Device, in_dim: usize, out_dim: usize, dropout: f64) -> Self {
        HiddenBlock {
            linear: LinearConfig::new(in_dim, out_dim).init(device),
            dropout: DropoutConfig::new(dropout.clamp(0.0, 0.95)).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.dropout.forward(relu(self.linear.forward(x)))
    }
}

/// Hidden blocks followed by a single-logit head.
#[derive(Module, Debug)]
pub struct ClassifierNet<B: Backend> {
    hidden: Vec<HiddenBlock<B>>,
    head: Linear<B>,
}

impl<B: Backend> ClassifierNet<B> {
    /// `dropout[i]` applies after hidden layer `i`; missing entries mean 0.
    pub fn new(device: &B::Device, input_dim: usize, hidden: &[usize], dropout: &[f64]) -> Self {
        let mut fan_in = input_dim;
        let mut blocks = Vec::with_capacity(hidden.len());
        for (idx, &width) in hidden.iter().enumerate() {
            let p = dropout.get(idx).copied().unwrap_or(0.0);
            blocks.push(HiddenBlock::new(device, fan_in, width, p));
            fan_in = width;
        }
        ClassifierNet {
            hidden: blocks,
            head: LinearConfig::new(fan_in, 1).init(device),
        }
    }

    /// Raw logits, `[batch, 1]`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.hidden.iter().fold(x, |x, block| block.forward(x));
        self.head.forward(x)
    }
}

/// Sample-weighted binary cross-entropy on logits, averaged over the batch.
///
/// Uses `max(z, 0) - z*y + ln(1 + e^-|z|)` so large logits stay finite.
pub fn weighted_bce_with_logits<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    weights: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let softplus = (logits.clone().abs().neg().exp() + 1.0).log();
    let loss = relu(logits.clone()) - logits * targets + softplus;
    (loss * weights).mean()
}

/// Packs rows into a `[rows, width]` f32 tensor.
pub fn rows_tensor<'a, B: Backend>(
    rows: impl IntoIterator<Item = &'a [f64]>,
    width: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let values: Vec<f32> = rows
        .into_iter()
        .flat_map(|row| row.iter().map(|v| *v as f32))
        .collect();
    let count = values.len() / width.max(1);
    Tensor::from_data(TensorData::new(values, [count, width]), device)
}

/// A `[n, 1]` column tensor.
pub fn column_tensor<B: Backend>(values: Vec<f32>, device: &B::Device) -> Tensor<B, 2> {
    let n = values.len();
    Tensor::from_data(TensorData::new(values, [n, 1]), device)
}

/// One exported linear layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub inputs: usize,
    pub outputs: usize,
    /// Row-major `[inputs][outputs]`.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    /// Drop probability after this layer while training. The head has none.
    #[serde(default)]
    pub dropout: f64,
}

impl DenseLayer {
    fn export<B: Backend>(linear: &Linear<B>, dropout: f64) -> Result<Self, InferenceError> {
        let [inputs, outputs] = linear.weight.dims();
        let weights = tensor_values(linear.weight.val())?;
        let bias = match &linear.bias {
            Some(bias) => tensor_values(bias.val())?,
            None => vec![0.0; outputs],
        };
        Ok(Self {
            inputs,
            outputs,
            weights,
            bias,
            dropout,
        })
    }

    fn to_linear<B: Backend>(&self, device: &B::Device) -> Linear<B> {
        let weight = Tensor::<B, 2>::from_data(
            TensorData::new(self.weights.clone(), [self.inputs, self.outputs]),
            device,
        );
        let bias = Tensor::<B, 1>::from_data(TensorData::new(self.bias.clone(), [self.outputs]), device);
        Linear {
            weight: Param::from_tensor(weight),
            bias: Some(Param::from_tensor(bias)),
        }
    }

    fn is_consistent(&self) -> bool {
        self.weights.len() == self.inputs * self.outputs && self.bias.len() == self.outputs
    }
}

fn tensor_values<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f32>, InferenceError> {
    t.into_data()
        .to_vec::<f32>()
        .map_err(|e| InferenceError::Tensor(format!("{e:?}")))
}

/// Serialisable weights of a [`ClassifierNet`]. The last layer is the head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpClassifier {
    pub layers: Vec<DenseLayer>,
}

impl MlpClassifier {
    /// Freshly initialised classifier for `seed`.
    pub fn new(
        input_dim: usize,
        hidden: &[usize],
        dropout: &[f64],
        seed: u64,
    ) -> Result<Self, InferenceError> {
        with_seeded_backend(seed, || {
            let device = Default::default();
            let net = ClassifierNet::<InferenceBackend>::new(&device, input_dim, hidden, dropout);
            Self::from_net(&net)
        })
    }

    /// Copies the parameters out of a network.
    pub fn from_net<B: Backend>(net: &ClassifierNet<B>) -> Result<Self, InferenceError> {
        let mut layers = Vec::with_capacity(net.hidden.len() + 1);
        for block in &net.hidden {
            layers.push(DenseLayer::export(&block.linear, block.dropout.prob)?);
        }
        layers.push(DenseLayer::export(&net.head, 0.0)?);
        Ok(Self { layers })
    }

    /// Rebuilds the network on `B`.
    pub fn to_net<B: Backend>(&self, device: &B::Device) -> Result<ClassifierNet<B>, InferenceError> {
        let Some((head, hidden)) = self.layers.split_last() else {
            return Err(InferenceError::Empty);
        };
        let mut fan_in = self.input_dim();
        for layer in &self.layers {
            if !layer.is_consistent() || layer.inputs != fan_in {
                return Err(InferenceError::Dimension {
                    expected: fan_in,
                    actual: layer.inputs,
                });
            }
            fan_in = layer.outputs;
        }
        if head.outputs != 1 {
            return Err(InferenceError::Dimension {
                expected: 1,
                actual: head.outputs,
            });
        }
        Ok(ClassifierNet {
            hidden: hidden
                .iter()
                .map(|layer| HiddenBlock {
                    linear: layer.to_linear(device),
                    dropout: DropoutConfig::new(layer.dropout.clamp(0.0, 0.95)).init(),
                })
                .collect(),
            head: head.to_linear(device),
        })
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map(|l| l.inputs).unwrap_or(0)
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.bias.len())
            .sum()
    }

    /// Probability of the positive class for one scaled feature row.
    pub fn predict_proba(&self, x: &[f64]) -> Result<f64, InferenceError> {
        self.predict_batch(&[x.to_vec()])?
            .first()
            .copied()
            .ok_or(InferenceError::NonFinite)
    }

    /// Probabilities for scaled rows in one forward pass. Dropout is inactive
    /// on the inference backend.
    pub fn predict_batch(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, InferenceError> {
        if self.layers.is_empty() {
            return Err(InferenceError::Empty);
        }
        let expected = self.input_dim();
        if let Some(bad) = rows.iter().find(|r| r.len() != expected) {
            return Err(InferenceError::Dimension {
                expected,
                actual: bad.len(),
            });
        }
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let device = Default::default();
        let net = self.to_net::<InferenceBackend>(&device)?;
        let x = rows_tensor::<InferenceBackend>(rows.iter().map(Vec::as_slice), expected, &device);
        tensor_values(sigmoid(net.forward(x)))?
            .into_iter()
            .map(|p| {
                let p = f64::from(p);
                if p.is_finite() {
                    Ok(p.clamp(0.0, 1.0))
                } else {
                    Err(InferenceError::NonFinite)
                }
            })
            .collect()
    }
}
