use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::game_log::GameLog;
use crate::stats::TeamId;

/// Immutable record of one served prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLogEntry {
    pub requested_by: Option<i64>,
    pub team1_id: TeamId,
    pub team2_id: TeamId,
    pub probability_team1: f64,
    pub probability_team2: f64,
    pub expected_score_team1: u32,
    pub expected_score_team2: u32,
    pub confidence: f64,
    pub model_version: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPrediction {
    pub id: i64,
    #[serde(flatten)]
    pub entry: PredictionLogEntry,
}

/// Where served predictions are recorded. Returns the id assigned to the entry.
pub trait PredictionSink: Send + Sync {
    fn record(&self, entry: &PredictionLogEntry) -> Result<i64>;
}

impl PredictionSink for GameLog {
    fn record(&self, entry: &PredictionLogEntry) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO prediction_log (
                requested_by, team1_id, team2_id, probability_team1, probability_team2,
                expected_score_team1, expected_score_team2, confidence, model_version, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.requested_by,
                entry.team1_id.0,
                entry.team2_id.0,
                entry.probability_team1,
                entry.probability_team2,
                entry.expected_score_team1 as i64,
                entry.expected_score_team2 as i64,
                entry.confidence,
                entry.model_version,
                entry.created_at,
            ],
        )
        .context("insert prediction log entry")?;
        Ok(conn.last_insert_rowid())
    }
}

impl GameLog {
    /// A user's predictions, newest first.
    pub fn predictions_for_user(
        &self,
        user: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredPrediction>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PREDICTION_COLUMNS} FROM prediction_log
                 WHERE requested_by = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2 OFFSET ?3"
            ))
            .context("prepare predictions query")?;
        let rows = stmt
            .query_map(params![user, limit as i64, offset as i64], decode_prediction)
            .context("query predictions")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode prediction row")?);
        }
        Ok(out)
    }

    pub fn prediction_by_id(&self, id: i64) -> Result<Option<StoredPrediction>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {PREDICTION_COLUMNS} FROM prediction_log WHERE id = ?1"),
            params![id],
            decode_prediction,
        )
        .optional()
        .context("query prediction by id")
    }

    pub fn prediction_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn
            .query_row("SELECT COUNT(*) FROM prediction_log", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("count predictions")?;
        Ok(n.max(0) as usize)
    }
}

/// In-process sink, mainly for tests and embedding without sqlite.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<PredictionLogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<PredictionLogEntry> {
        self.entries
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl PredictionSink for MemorySink {
    fn record(&self, entry: &PredictionLogEntry) -> Result<i64> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))?;
        guard.push(entry.clone());
        Ok(guard.len() as i64)
    }
}

const PREDICTION_COLUMNS: &str = "id, requested_by, team1_id, team2_id, probability_team1, \
     probability_team2, expected_score_team1, expected_score_team2, confidence, model_version, \
     created_at";

fn decode_prediction(row: &Row<'_>) -> rusqlite::Result<StoredPrediction> {
    Ok(StoredPrediction {
        id: row.get(0)?,
        entry: PredictionLogEntry {
            requested_by: row.get(1)?,
            team1_id: TeamId(row.get(2)?),
            team2_id: TeamId(row.get(3)?),
            probability_team1: row.get(4)?,
            probability_team2: row.get(5)?,
            expected_score_team1: row.get::<_, i64>(6)?.max(0) as u32,
            expected_score_team2: row.get::<_, i64>(7)?.max(0) as u32,
            confidence: row.get(8)?,
            model_version: row.get(9)?,
            created_at: row.get(10)?,
        },
    })
}
