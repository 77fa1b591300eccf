use std::fmt;
use std::ops::{Index, IndexMut};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const STAT_COUNT: usize = 10;
pub const FEATURE_DIM: usize = STAT_COUNT * 2;

/// Box-score stats tracked per team, in feature order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    Pts,
    Reb,
    Ast,
    Stl,
    Blk,
    Tov,
    Pf,
    FgPct,
    Fg3Pct,
    FtPct,
}

impl Stat {
    pub const ALL: [Stat; STAT_COUNT] = [
        Stat::Pts,
        Stat::Reb,
        Stat::Ast,
        Stat::Stl,
        Stat::Blk,
        Stat::Tov,
        Stat::Pf,
        Stat::FgPct,
        Stat::Fg3Pct,
        Stat::FtPct,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Column stem in the `game` table (`pts` -> `pts_home` / `pts_away`).
    pub fn column(self) -> &'static str {
        match self {
            Stat::Pts => "pts",
            Stat::Reb => "reb",
            Stat::Ast => "ast",
            Stat::Stl => "stl",
            Stat::Blk => "blk",
            Stat::Tov => "tov",
            Stat::Pf => "pf",
            Stat::FgPct => "fg_pct",
            Stat::Fg3Pct => "fg3_pct",
            Stat::FtPct => "ft_pct",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamId(pub i64);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One value per [`Stat`], indexed by stat position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatVector(pub [f64; STAT_COUNT]);

impl StatVector {
    pub fn zeros() -> Self {
        Self([0.0; STAT_COUNT])
    }

    /// Non-finite inputs are stored as zero.
    pub fn from_values(values: [f64; STAT_COUNT]) -> Self {
        let mut out = values;
        for v in &mut out {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        Self(out)
    }

    pub fn get(&self, stat: Stat) -> f64 {
        self.0[stat.index()]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl Default for StatVector {
    fn default() -> Self {
        Self::zeros()
    }
}

impl Index<Stat> for StatVector {
    type Output = f64;

    fn index(&self, stat: Stat) -> &f64 {
        &self.0[stat.index()]
    }
}

impl IndexMut<Stat> for StatVector {
    fn index_mut(&mut self, stat: Stat) -> &mut f64 {
        &mut self.0[stat.index()]
    }
}

/// A completed game as stored in the game log. Read-only to the forecasting core.
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub game_id: String,
    pub game_date: NaiveDateTime,
    pub home_team_id: TeamId,
    pub away_team_id: TeamId,
    pub home_abbrev: String,
    pub away_abbrev: String,
    pub home_name: String,
    pub away_name: String,
    pub home_stats: StatVector,
    pub away_stats: StatVector,
    pub home_win: bool,
    /// False when the source row records no result for either side. Such a
    /// game still counts as played but credits neither team.
    pub decided: bool,
}

impl GameRecord {
    pub fn involves(&self, team: TeamId) -> bool {
        self.home_team_id == team || self.away_team_id == team
    }

    /// Whether `team` won this game; `None` if it did not play.
    pub fn won_by(&self, team: TeamId) -> Option<bool> {
        if self.home_team_id == team {
            Some(self.decided && self.home_win)
        } else if self.away_team_id == team {
            Some(self.decided && !self.home_win)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamInfo {
    pub team_id: TeamId,
    pub abbrev: String,
    pub display_name: String,
}

/// Home stats followed by away stats, in [`Stat::ALL`] order.
pub fn feature_vector(home: &StatVector, away: &StatVector) -> [f64; FEATURE_DIM] {
    let mut out = [0.0; FEATURE_DIM];
    out[..STAT_COUNT].copy_from_slice(&home.0);
    out[STAT_COUNT..].copy_from_slice(&away.0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_order_matches_index() {
        for (idx, stat) in Stat::ALL.iter().enumerate() {
            assert_eq!(stat.index(), idx);
        }
        assert_eq!(Stat::FtPct.column(), "ft_pct");
    }

    #[test]
    fn non_finite_values_become_zero() {
        let mut raw = [1.0; STAT_COUNT];
        raw[2] = f64::NAN;
        raw[5] = f64::INFINITY;
        let v = StatVector::from_values(raw);
        assert_eq!(v[Stat::Ast], 0.0);
        assert_eq!(v[Stat::Tov], 0.0);
        assert_eq!(v[Stat::Pts], 1.0);
    }

    #[test]
    fn feature_vector_puts_home_first() {
        let mut home = StatVector::zeros();
        home[Stat::Pts] = 110.0;
        let mut away = StatVector::zeros();
        away[Stat::Pts] = 99.0;
        let f = feature_vector(&home, &away);
        assert_eq!(f.len(), FEATURE_DIM);
        assert_eq!(f[0], 110.0);
        assert_eq!(f[STAT_COUNT], 99.0);
    }
}
