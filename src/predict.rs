//! Prediction service: bundled model when it covers both teams, heuristic
//! otherwise. Every served prediction is handed to a [`PredictionSink`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::artifacts::{ArtifactBundle, BundleSlot};
use crate::error::{ForecastError, Result};
use crate::game_log::GameLog;
use crate::heuristic::{self, HeuristicConfig};
use crate::prediction_log::{PredictionLogEntry, PredictionSink};
use crate::retrain::{RetrainOrchestrator, RetrainStatus};
use crate::stats::{TeamId, TeamInfo};

pub const MODEL_CONFIDENCE: f64 = 85.0;
pub const HEURISTIC_CONFIDENCE: f64 = 70.0;
pub const HEURISTIC_VERSION: &str = "heuristic-v1";
pub const BASELINE_TOTAL_SCORE: f64 = 110.0;

/// Team as named by a caller: numeric id or abbreviation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeamRef {
    Id(TeamId),
    Abbrev(String),
}

impl FromStr for TeamRef {
    type Err = ForecastError;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ForecastError::InvalidInput("empty team reference".into()));
        }
        Ok(match raw.parse::<i64>() {
            Ok(id) => TeamRef::Id(TeamId(id)),
            Err(_) => TeamRef::Abbrev(raw.to_ascii_uppercase()),
        })
    }
}

impl fmt::Display for TeamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeamRef::Id(id) => write!(f, "{id}"),
            TeamRef::Abbrev(a) => f.write_str(a),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionRequest {
    pub home: TeamRef,
    pub away: TeamRef,
    pub requested_by: Option<i64>,
}

impl PredictionRequest {
    pub fn new(home: TeamRef, away: TeamRef) -> Self {
        Self {
            home,
            away,
            requested_by: None,
        }
    }

    /// Resolves both sides to known team ids. Identical teams are rejected.
    pub fn resolve(&self, service: &PredictionService) -> Result<(TeamId, TeamId)> {
        let home = service.resolve_team(&self.home)?;
        let away = service.resolve_team(&self.away)?;
        if home == away {
            return Err(ForecastError::InvalidInput(format!(
                "home and away are the same team ({home})"
            )));
        }
        Ok((home, away))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub team1_id: TeamId,
    pub team2_id: TeamId,
    /// Percent, 0..=100. `probability_team2 = 100 - probability_team1`.
    pub probability_team1: f64,
    pub probability_team2: f64,
    pub predicted_score1: u32,
    pub predicted_score2: u32,
    pub confidence: f64,
    pub model_version: String,
}

impl PredictionResult {
    /// Team 1 (home) win probability on the unit scale.
    pub fn home_win_probability(&self) -> f64 {
        (self.probability_team1 / 100.0).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub bundle_loaded: bool,
    pub model_version: Option<String>,
    pub bundle_teams: usize,
    pub retrain: Option<RetrainStatus>,
}

pub struct PredictionService {
    game_log: Arc<GameLog>,
    slot: Arc<BundleSlot>,
    sink: Arc<dyn PredictionSink>,
    heuristic: HeuristicConfig,
    orchestrator: Option<Arc<RetrainOrchestrator>>,
}

impl PredictionService {
    pub fn new(game_log: Arc<GameLog>, slot: Arc<BundleSlot>, sink: Arc<dyn PredictionSink>) -> Self {
        Self {
            game_log,
            slot,
            sink,
            heuristic: HeuristicConfig::default(),
            orchestrator: None,
        }
    }

    pub fn with_heuristic(mut self, cfg: HeuristicConfig) -> Self {
        self.heuristic = cfg;
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<RetrainOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn slot(&self) -> &Arc<BundleSlot> {
        &self.slot
    }

    /// `team1` plays at home.
    pub fn predict(&self, team1: TeamId, team2: TeamId) -> Result<PredictionResult> {
        self.predict_for(team1, team2, None)
    }

    pub fn handle(&self, request: &PredictionRequest) -> Result<PredictionResult> {
        let (home, away) = request.resolve(self)?;
        self.predict_for(home, away, request.requested_by)
    }

    pub fn predict_for(
        &self,
        team1: TeamId,
        team2: TeamId,
        requested_by: Option<i64>,
    ) -> Result<PredictionResult> {
        // One snapshot for the whole call.
        let bundle = self.slot.current();
        self.ensure_known(team1, bundle.as_deref())?;
        self.ensure_known(team2, bundle.as_deref())?;

        let (probability_team1, confidence, model_version) =
            match model_probability(bundle.as_deref(), team1, team2) {
                Ok((p, version)) => (100.0 * p, MODEL_CONFIDENCE, version),
                Err(reason) => {
                    match &reason {
                        ForecastError::InferenceFailure(_) => {
                            warn!(%team1, %team2, error = %reason, "inference failed, using heuristic")
                        }
                        _ => debug!(%team1, %team2, reason = %reason, "using heuristic"),
                    }
                    let est = heuristic::estimate(&self.game_log, team1, team2, &self.heuristic)?;
                    (
                        est.probability_team1,
                        HEURISTIC_CONFIDENCE,
                        HEURISTIC_VERSION.to_string(),
                    )
                }
            };

        let probability_team1 = probability_team1.clamp(0.0, 100.0);
        let probability_team2 = 100.0 - probability_team1;
        let result = PredictionResult {
            team1_id: team1,
            team2_id: team2,
            probability_team1,
            probability_team2,
            predicted_score1: expected_score(probability_team1),
            predicted_score2: expected_score(probability_team2),
            confidence,
            model_version,
        };

        let entry = PredictionLogEntry {
            requested_by,
            team1_id: team1,
            team2_id: team2,
            probability_team1: result.probability_team1,
            probability_team2: result.probability_team2,
            expected_score_team1: result.predicted_score1,
            expected_score_team2: result.predicted_score2,
            confidence: result.confidence,
            model_version: result.model_version.clone(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        if let Err(err) = self.sink.record(&entry) {
            warn!(error = %err, "failed to record prediction");
        }

        Ok(result)
    }

    /// Team directory from the game log, falling back to the bundle snapshot.
    pub fn teams(&self) -> Result<Vec<TeamInfo>> {
        let teams = self.game_log.teams()?;
        if !teams.is_empty() {
            return Ok(teams);
        }
        Ok(self
            .slot
            .current()
            .map(|b| b.teams.clone())
            .unwrap_or_default())
    }

    pub fn health(&self) -> HealthReport {
        let bundle = self.slot.current();
        HealthReport {
            bundle_loaded: bundle.is_some(),
            model_version: bundle.as_ref().map(|b| b.model_version()),
            bundle_teams: bundle.as_ref().map(|b| b.ema_state.len()).unwrap_or(0),
            retrain: self.orchestrator.as_ref().map(|o| o.status()),
        }
    }

    pub(crate) fn resolve_team(&self, team: &TeamRef) -> Result<TeamId> {
        let bundle = self.slot.current();
        match team {
            TeamRef::Id(id) => {
                self.ensure_known(*id, bundle.as_deref())?;
                Ok(*id)
            }
            TeamRef::Abbrev(abbrev) => {
                if let Some(info) = self.game_log.team_by_abbrev(abbrev)? {
                    return Ok(info.team_id);
                }
                bundle
                    .as_deref()
                    .and_then(|b| b.team_by_abbrev(abbrev))
                    .map(|t| t.team_id)
                    .ok_or_else(|| ForecastError::NotFound(format!("team {abbrev}")))
            }
        }
    }

    fn ensure_known(&self, team: TeamId, bundle: Option<&ArtifactBundle>) -> Result<()> {
        if self.game_log.team_by_id(team)?.is_some() {
            return Ok(());
        }
        if let Some(b) = bundle
            && (b.ema_state.contains(team) || b.team(team).is_some())
        {
            return Ok(());
        }
        Err(ForecastError::NotFound(format!("team id {team}")))
    }
}

fn model_probability(
    bundle: Option<&ArtifactBundle>,
    home: TeamId,
    away: TeamId,
) -> Result<(f64, String)> {
    let Some(bundle) = bundle else {
        return Err(ForecastError::ArtifactUnavailable("no bundle loaded".into()));
    };
    if !bundle.covers(home, away) {
        return Err(ForecastError::ArtifactUnavailable(format!(
            "bundle v{} lacks EMA state for {home} or {away}",
            bundle.version
        )));
    }
    let p = bundle.home_win_probability(home, away)?;
    Ok((p, bundle.model_version()))
}

/// Share of the baseline total, truncated.
pub fn expected_score(probability_pct: f64) -> u32 {
    (BASELINE_TOTAL_SCORE * probability_pct.clamp(0.0, 100.0) / 100.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_refs_parse() {
        assert_eq!("1610612738".parse::<TeamRef>().ok(), Some(TeamRef::Id(TeamId(1610612738))));
        assert_eq!("bos".parse::<TeamRef>().ok(), Some(TeamRef::Abbrev("BOS".into())));
        assert!(matches!(
            " ".parse::<TeamRef>(),
            Err(ForecastError::InvalidInput(_))
        ));
    }

    #[test]
    fn expected_scores_truncate() {
        assert_eq!(expected_score(58.2), 64);
        assert_eq!(expected_score(41.8), 45);
        assert_eq!(expected_score(100.0), 110);
    }

    #[test]
    fn unit_scale_probability() {
        let r = PredictionResult {
            team1_id: TeamId(1),
            team2_id: TeamId(2),
            probability_team1: 62.5,
            probability_team2: 37.5,
            predicted_score1: 68,
            predicted_score2: 41,
            confidence: MODEL_CONFIDENCE,
            model_version: "model-v1".into(),
        };
        assert!((r.home_win_probability() - 0.625).abs() < 1e-12);
    }
}
