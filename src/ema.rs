//! Chronological per-team exponential moving averages of box-score stats.
//!
//! Each team starts from the league-wide mean of every stat (computed over the
//! whole history, home and away sides together) and is updated once per game
//! it plays, after the pre-game snapshot for that game has been emitted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::stats::{GameRecord, STAT_COUNT, StatVector, TeamId};

pub const DEFAULT_ALPHA: f64 = 0.18;

/// Smoothed stat vector per team.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamEmaState {
    teams: BTreeMap<TeamId, StatVector>,
}

impl TeamEmaState {
    pub fn get(&self, team: TeamId) -> Option<&StatVector> {
        self.teams.get(&team)
    }

    pub fn contains(&self, team: TeamId) -> bool {
        self.teams.contains_key(&team)
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    pub fn team_ids(&self) -> impl Iterator<Item = TeamId> + '_ {
        self.teams.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TeamId, &StatVector)> + '_ {
        self.teams.iter().map(|(id, v)| (*id, v))
    }
}

/// Both teams' state as it stood before the observed game was played.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreGameSnapshot {
    pub home: StatVector,
    pub away: StatVector,
}

pub struct EmaEngine {
    alpha: f64,
    seed: StatVector,
    state: TeamEmaState,
}

impl EmaEngine {
    pub fn new(alpha: f64, seed: StatVector) -> Self {
        Self {
            alpha,
            seed,
            state: TeamEmaState::default(),
        }
    }

    /// Seeds new teams with the mean of every stat across `games`.
    pub fn seeded_from(games: &[GameRecord], alpha: f64) -> Self {
        Self::new(alpha, global_means(games))
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn seed(&self) -> &StatVector {
        &self.seed
    }

    pub fn state(&self) -> &TeamEmaState {
        &self.state
    }

    pub fn into_state(self) -> TeamEmaState {
        self.state
    }

    /// Returns the pre-game snapshot for `game`, then folds the game's actual
    /// stats into both teams' averages. Games must arrive in date order.
    pub fn observe(&mut self, game: &GameRecord) -> PreGameSnapshot {
        let home = self.current(game.home_team_id);
        let away = self.current(game.away_team_id);
        let snapshot = PreGameSnapshot { home, away };

        let new_home = ema_update(&home, &game.home_stats, self.alpha);
        let new_away = ema_update(&away, &game.away_stats, self.alpha);
        self.state.teams.insert(game.home_team_id, new_home);
        self.state.teams.insert(game.away_team_id, new_away);

        snapshot
    }

    fn current(&self, team: TeamId) -> StatVector {
        self.state.teams.get(&team).copied().unwrap_or(self.seed)
    }
}

/// `alpha * actual + (1 - alpha) * old`, per stat. Non-finite actuals count as 0.
pub fn ema_update(old: &StatVector, actual: &StatVector, alpha: f64) -> StatVector {
    let mut out = [0.0; STAT_COUNT];
    for (idx, slot) in out.iter_mut().enumerate() {
        let value = actual.0[idx];
        let value = if value.is_finite() { value } else { 0.0 };
        *slot = alpha * value + (1.0 - alpha) * old.0[idx];
    }
    StatVector(out)
}

/// Mean of each stat over every home and away occurrence in `games`.
pub fn global_means(games: &[GameRecord]) -> StatVector {
    if games.is_empty() {
        return StatVector::zeros();
    }
    let mut sums = [0.0; STAT_COUNT];
    for game in games {
        for idx in 0..STAT_COUNT {
            sums[idx] += game.home_stats.0[idx] + game.away_stats.0[idx];
        }
    }
    let n = (games.len() * 2) as f64;
    for s in &mut sums {
        *s /= n;
    }
    StatVector(sums)
}

/// Replays `games` (already in date order) and returns the final state.
pub fn replay(games: &[GameRecord], alpha: f64) -> TeamEmaState {
    let mut engine = EmaEngine::seeded_from(games, alpha);
    for game in games {
        engine.observe(game);
    }
    engine.into_state()
}
