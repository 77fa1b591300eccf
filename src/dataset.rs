use chrono::NaiveDateTime;

use crate::ema::{DEFAULT_ALPHA, EmaEngine, TeamEmaState};
use crate::stats::{FEATURE_DIM, GameRecord, feature_vector};

pub const DEFAULT_WEIGHT_DECAY_DAYS: f64 = 500.0;

#[derive(Debug, Clone, Copy)]
pub struct DatasetConfig {
    pub alpha: f64,
    pub weight_decay_days: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            weight_decay_days: DEFAULT_WEIGHT_DECAY_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetEntry {
    pub features: [f64; FEATURE_DIM],
    pub label: u8,
    pub weight: f64,
    pub game_date: NaiveDateTime,
}

/// Training rows in chronological order plus the EMA state after the last game.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub entries: Vec<DatasetEntry>,
    pub final_state: TeamEmaState,
    pub latest_date: Option<NaiveDateTime>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest `train_fraction` of rows for training, the rest for validation.
    pub fn chronological_split(&self, train_fraction: f64) -> (&[DatasetEntry], &[DatasetEntry]) {
        let idx = split_index(self.entries.len(), train_fraction);
        self.entries.split_at(idx)
    }
}

pub fn split_index(len: usize, train_fraction: f64) -> usize {
    let frac = train_fraction.clamp(0.0, 1.0);
    ((len as f64) * frac).floor() as usize
}

/// `exp(-days_old / decay_days)`; 1.0 for the newest game.
pub fn recency_weight(days_old: i64, decay_days: f64) -> f64 {
    let days = days_old.max(0) as f64;
    (-days / decay_days.max(f64::MIN_POSITIVE)).exp()
}

/// Walks `games` once in date order, emitting pre-game features, home-win label
/// and recency weight per game. No game is dropped for lack of history.
pub fn build_dataset(games: &[GameRecord], cfg: DatasetConfig) -> Dataset {
    let mut ordered: Vec<&GameRecord> = games.iter().collect();
    ordered.sort_by(|a, b| {
        a.game_date
            .cmp(&b.game_date)
            .then_with(|| a.game_id.cmp(&b.game_id))
    });

    let mut engine = EmaEngine::seeded_from(games, cfg.alpha);
    let latest_date = ordered.last().map(|g| g.game_date);

    let mut entries = Vec::with_capacity(ordered.len());
    for game in ordered {
        let snapshot = engine.observe(game);
        let days_old = latest_date
            .map(|last| (last - game.game_date).num_days())
            .unwrap_or(0);
        entries.push(DatasetEntry {
            features: feature_vector(&snapshot.home, &snapshot.away),
            label: u8::from(game.home_win),
            weight: recency_weight(days_old, cfg.weight_decay_days),
            game_date: game.game_date,
        });
    }

    Dataset {
        entries,
        final_state: engine.into_state(),
        latest_date,
    }
}
