pub mod artifacts;
pub mod calibration;
pub mod config;
pub mod dataset;
pub mod ema;
pub mod error;
pub mod espn_fetch;
pub mod game_log;
pub mod heuristic;
pub mod http_client;
pub mod logging;
pub mod mlp;
pub mod predict;
pub mod prediction_log;
pub mod retrain;
pub mod scaler;
pub mod stats;
pub mod trainer;

pub use error::{ForecastError, Result};
