use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScalerError {
    #[error("expected {expected} features, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("cannot fit a scaler on zero rows")]
    Empty,
}

/// Per-feature standardization: `(x - mean) / std`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl StandardScaler {
    /// Population mean and standard deviation per column. Constant columns get
    /// a scale of 1 so they map to 0 instead of dividing by zero.
    pub fn fit<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self, ScalerError> {
        let Some(first) = rows.first() else {
            return Err(ScalerError::Empty);
        };
        let dim = first.as_ref().len();
        let n = rows.len() as f64;

        let mut means = vec![0.0; dim];
        for row in rows {
            let row = check_dim(row.as_ref(), dim)?;
            for (m, x) in means.iter_mut().zip(row) {
                *m += x;
            }
        }
        for m in &mut means {
            *m /= n;
        }

        let mut vars = vec![0.0; dim];
        for row in rows {
            for ((v, x), m) in vars.iter_mut().zip(row.as_ref()).zip(&means) {
                *v += (x - m).powi(2);
            }
        }
        let scales = vars
            .into_iter()
            .map(|v| {
                let std = (v / n).sqrt();
                if std > 1e-12 && std.is_finite() { std } else { 1.0 }
            })
            .collect();

        Ok(Self { means, scales })
    }

    pub fn dim(&self) -> usize {
        self.means.len()
    }

    pub fn transform(&self, row: &[f64]) -> Result<Vec<f64>, ScalerError> {
        let row = check_dim(row, self.dim())?;
        Ok(row
            .iter()
            .zip(&self.means)
            .zip(&self.scales)
            .map(|((x, m), s)| (x - m) / s)
            .collect())
    }
}

fn check_dim(row: &[f64], expected: usize) -> Result<&[f64], ScalerError> {
    if row.len() != expected {
        return Err(ScalerError::Dimension {
            expected,
            actual: row.len(),
        });
    }
    Ok(row)
}
