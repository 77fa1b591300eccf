//! Rule-based home-win estimate used when no trained bundle can serve a pair.

use anyhow::Result;
use serde::Serialize;

use crate::game_log::GameLog;
use crate::stats::{GameRecord, TeamId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeuristicConfig {
    pub history_games: usize,
    pub h2h_games: usize,
    pub home_advantage: f64,
    pub win_rate_weight: f64,
    pub home_weight: f64,
    pub h2h_weight: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            history_games: 50,
            h2h_games: 20,
            home_advantage: 0.55,
            win_rate_weight: 0.4,
            home_weight: 0.3,
            h2h_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeuristicEstimate {
    pub win_rate_team1: f64,
    pub win_rate_team2: f64,
    pub head_to_head: f64,
    /// Percent scale, 0..=100.
    pub probability_team1: f64,
}

/// Fraction of `games` won by `team`; 0.5 without history.
pub fn win_rate(games: &[GameRecord], team: TeamId) -> f64 {
    fraction_won(games, team)
}

/// Fraction of the direct meetings in `meetings` won by `team`; 0.5 if none.
pub fn head_to_head_factor(meetings: &[GameRecord], team: TeamId) -> f64 {
    fraction_won(meetings, team)
}

pub fn winrate_ratio(rate1: f64, rate2: f64) -> f64 {
    let total = rate1 + rate2;
    if total <= 0.0 { 0.5 } else { rate1 / total }
}

/// Weighted blend of win-rate ratio, home advantage and head-to-head, in percent.
pub fn heuristic_probability(rate1: f64, rate2: f64, h2h: f64, cfg: &HeuristicConfig) -> f64 {
    let p = cfg.win_rate_weight * winrate_ratio(rate1, rate2)
        + cfg.home_weight * cfg.home_advantage
        + cfg.h2h_weight * h2h;
    (100.0 * p).clamp(0.0, 100.0)
}

/// Reads recent form and meetings from the game log and blends them.
pub fn estimate(
    log: &GameLog,
    team1: TeamId,
    team2: TeamId,
    cfg: &HeuristicConfig,
) -> Result<HeuristicEstimate> {
    let recent1 = log.recent_games(team1, cfg.history_games)?;
    let recent2 = log.recent_games(team2, cfg.history_games)?;
    let meetings = log.head_to_head(team1, team2, cfg.h2h_games)?;

    let win_rate_team1 = win_rate(&recent1, team1);
    let win_rate_team2 = win_rate(&recent2, team2);
    let head_to_head = head_to_head_factor(&meetings, team1);

    Ok(HeuristicEstimate {
        win_rate_team1,
        win_rate_team2,
        head_to_head,
        probability_team1: heuristic_probability(win_rate_team1, win_rate_team2, head_to_head, cfg),
    })
}

fn fraction_won(games: &[GameRecord], team: TeamId) -> f64 {
    let results: Vec<bool> = games.iter().filter_map(|g| g.won_by(team)).collect();
    if results.is_empty() {
        return 0.5;
    }
    results.iter().filter(|w| **w).count() as f64 / results.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_sided_history_blend() {
        let p = heuristic_probability(1.0, 0.5, 0.5, &HeuristicConfig::default());
        let expected = 100.0 * (0.4 * (1.0 / 1.5) + 0.3 * 0.55 + 0.3 * 0.5);
        assert!((p - expected).abs() < 1e-9);
        assert!((p - 58.2).abs() < 0.05);
    }

    #[test]
    fn ratio_defaults_when_both_rates_zero() {
        assert_eq!(winrate_ratio(0.0, 0.0), 0.5);
        assert_eq!(winrate_ratio(0.3, 0.0), 1.0);
    }

    #[test]
    fn empty_history_is_even() {
        assert_eq!(win_rate(&[], TeamId(1)), 0.5);
        assert_eq!(head_to_head_factor(&[], TeamId(1)), 0.5);
    }

    #[test]
    fn even_matchup_lands_on_home_edge() {
        let p = heuristic_probability(0.5, 0.5, 0.5, &HeuristicConfig::default());
        assert!((p - 51.5).abs() < 1e-9);
    }
}
