use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::dataset::DatasetConfig;
use crate::heuristic::HeuristicConfig;
use crate::retrain::RetrainConfig;
use crate::trainer::TrainerConfig;

const APP_DIR: &str = "courtcast";

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub model_dir: PathBuf,
    pub ema_alpha: f64,
    pub weight_decay_days: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
    pub fetch_window_days: u32,
    pub history_games: usize,
    pub h2h_games: usize,
    pub keep_bundles: usize,
    pub retrain_interval: Option<Duration>,
}

impl Config {
    /// Reads `.env` (if present) and then the process environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let base = app_cache_dir().unwrap_or_else(|| PathBuf::from(".").join(APP_DIR));
        let db_path = env_path("COURTCAST_DB").unwrap_or_else(|| base.join("nba.sqlite"));
        let model_dir = env_path("COURTCAST_MODEL_DIR").unwrap_or_else(|| base.join("models"));

        let retrain_secs = env_parse::<u64>("COURTCAST_RETRAIN_INTERVAL_SECS").unwrap_or(0);

        Self {
            db_path,
            model_dir,
            ema_alpha: env_parse::<f64>("COURTCAST_EMA_ALPHA")
                .unwrap_or(0.18)
                .clamp(0.01, 0.99),
            weight_decay_days: env_parse::<f64>("COURTCAST_WEIGHT_DECAY_DAYS")
                .unwrap_or(500.0)
                .max(1.0),
            epochs: env_parse::<usize>("COURTCAST_EPOCHS")
                .unwrap_or(30)
                .clamp(1, 1000),
            batch_size: env_parse::<usize>("COURTCAST_BATCH_SIZE")
                .unwrap_or(64)
                .clamp(1, 4096),
            learning_rate: env_parse::<f64>("COURTCAST_LEARNING_RATE")
                .unwrap_or(0.001)
                .clamp(1e-6, 1.0),
            seed: env_parse::<u64>("COURTCAST_SEED").unwrap_or(42),
            fetch_window_days: env_parse::<u32>("COURTCAST_FETCH_WINDOW_DAYS")
                .unwrap_or(7)
                .clamp(1, 60),
            history_games: env_parse::<usize>("COURTCAST_HISTORY_GAMES")
                .unwrap_or(50)
                .clamp(1, 500),
            h2h_games: env_parse::<usize>("COURTCAST_H2H_GAMES")
                .unwrap_or(20)
                .clamp(1, 200),
            keep_bundles: env_parse::<usize>("COURTCAST_KEEP_BUNDLES")
                .unwrap_or(3)
                .clamp(1, 50),
            retrain_interval: (retrain_secs > 0).then(|| Duration::from_secs(retrain_secs.max(60))),
        }
    }

    pub fn dataset(&self) -> DatasetConfig {
        DatasetConfig {
            alpha: self.ema_alpha,
            weight_decay_days: self.weight_decay_days,
        }
    }

    pub fn trainer(&self) -> TrainerConfig {
        TrainerConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            seed: self.seed,
            ..TrainerConfig::default()
        }
    }

    pub fn heuristic(&self) -> HeuristicConfig {
        HeuristicConfig {
            history_games: self.history_games,
            h2h_games: self.h2h_games,
            ..HeuristicConfig::default()
        }
    }

    pub fn retrain(&self) -> RetrainConfig {
        RetrainConfig {
            fetch_window_days: self.fetch_window_days,
            dataset: self.dataset(),
            trainer: self.trainer(),
            keep_bundles: self.keep_bundles,
        }
    }
}

/// `$XDG_CACHE_HOME/courtcast`, falling back to `~/.cache/courtcast`.
pub fn app_cache_dir() -> Option<PathBuf> {
    if let Ok(base) = env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(APP_DIR));
    }
    let home = env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(APP_DIR))
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}
