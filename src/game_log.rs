use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::stats::{GameRecord, STAT_COUNT, Stat, StatVector, TeamId, TeamInfo};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Append-only store of completed games plus the team directory.
///
/// The `game` table keeps the column naming of the public NBA game dumps
/// (`team_id_home`, `pts_home`, `wl_home`, ...) so an existing dump can be
/// opened in place.
pub struct GameLog {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone)]
pub struct IngestRun {
    pub started_at: String,
    pub window_days: u32,
    pub fetched: usize,
    pub inserted: usize,
    pub errors: Vec<String>,
}

impl GameLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn =
            Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("game log connection lock poisoned"))
    }

    /// Inserts games that are not yet present (by `game_id`) and upserts both
    /// teams into the directory. Returns the number of newly stored games.
    pub fn insert_games(&self, games: &[GameRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("begin insert transaction")?;
        let sql = insert_game_sql();
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(&sql).context("prepare insert game")?;
            for game in games {
                let mut values: Vec<rusqlite::types::Value> = vec![
                    game.game_id.clone().into(),
                    game.game_date.format(DATE_FORMAT).to_string().into(),
                    game.home_team_id.0.into(),
                    game.home_abbrev.clone().into(),
                    game.home_name.clone().into(),
                    game.away_team_id.0.into(),
                    game.away_abbrev.clone().into(),
                    game.away_name.clone().into(),
                    wl_value(game, game.home_win),
                    wl_value(game, !game.home_win),
                ];
                values.extend(game.home_stats.0.iter().map(|v| (*v).into()));
                values.extend(game.away_stats.0.iter().map(|v| (*v).into()));
                inserted += stmt
                    .execute(rusqlite::params_from_iter(values))
                    .with_context(|| format!("insert game {}", game.game_id))?;
            }
        }
        for game in games {
            upsert_team(&tx, game.home_team_id, &game.home_abbrev, &game.home_name)?;
            upsert_team(&tx, game.away_team_id, &game.away_abbrev, &game.away_name)?;
        }
        tx.commit().context("commit insert transaction")?;
        Ok(inserted)
    }

    /// Adds a team to the directory even if it has not played yet.
    pub fn register_team(&self, team: &TeamInfo) -> Result<()> {
        let conn = self.lock()?;
        upsert_team(&conn, team.team_id, &team.abbrev, &team.display_name)
    }

    /// Every game, ascending by date then id.
    pub fn load_games(&self) -> Result<Vec<GameRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM game ORDER BY game_date ASC, game_id ASC",
            game_columns()
        );
        query_games(&conn, &sql, [])
    }

    /// The last `limit` games `team` played, newest first.
    pub fn recent_games(&self, team: TeamId, limit: usize) -> Result<Vec<GameRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM game
             WHERE team_id_home = ?1 OR team_id_away = ?1
             ORDER BY game_date DESC, game_id DESC
             LIMIT ?2",
            game_columns()
        );
        query_games(&conn, &sql, params![team.0, limit as i64])
    }

    /// The last `limit` meetings between `a` and `b` in either venue, newest first.
    pub fn head_to_head(&self, a: TeamId, b: TeamId, limit: usize) -> Result<Vec<GameRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM game
             WHERE (team_id_home = ?1 AND team_id_away = ?2)
                OR (team_id_home = ?2 AND team_id_away = ?1)
             ORDER BY game_date DESC, game_id DESC
             LIMIT ?3",
            game_columns()
        );
        query_games(&conn, &sql, params![a.0, b.0, limit as i64])
    }

    pub fn team_by_id(&self, team: TeamId) -> Result<Option<TeamInfo>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT team_id, abbrev, display_name FROM team_directory WHERE team_id = ?1",
            params![team.0],
            decode_team,
        )
        .optional()
        .context("query team by id")
    }

    pub fn team_by_abbrev(&self, abbrev: &str) -> Result<Option<TeamInfo>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT team_id, abbrev, display_name FROM team_directory
             WHERE UPPER(abbrev) = UPPER(?1)
             ORDER BY team_id ASC LIMIT 1",
            params![abbrev.trim()],
            decode_team,
        )
        .optional()
        .context("query team by abbrev")
    }

    pub fn teams(&self) -> Result<Vec<TeamInfo>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT team_id, abbrev, display_name FROM team_directory ORDER BY abbrev ASC")
            .context("prepare teams query")?;
        let rows = stmt.query_map([], decode_team).context("query teams")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode team row")?);
        }
        Ok(out)
    }

    pub fn game_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn
            .query_row("SELECT COUNT(*) FROM game", [], |row| row.get::<_, i64>(0))
            .context("count games")?;
        Ok(n.max(0) as usize)
    }

    pub fn latest_game_date(&self) -> Result<Option<NaiveDateTime>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row("SELECT MAX(game_date) FROM game", [], |row| {
                row.get::<_, Option<String>>(0)
            })
            .context("query latest game date")?;
        Ok(raw.as_deref().and_then(parse_game_date))
    }

    pub fn record_ingest_run(&self, run: &IngestRun) -> Result<i64> {
        let conn = self.lock()?;
        let errors_json = serde_json::to_string(&run.errors).unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            "INSERT INTO ingest_run(started_at, finished_at, window_days, fetched, inserted, errors_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.started_at,
                Utc::now().to_rfc3339(),
                run.window_days as i64,
                run.fetched as i64,
                run.inserted as i64,
                errors_json
            ],
        )
        .context("insert ingest run")?;
        Ok(conn.last_insert_rowid())
    }
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    let mut stat_columns = String::new();
    for side in ["home", "away"] {
        for stat in Stat::ALL {
            stat_columns.push_str(&format!("    {}_{side} REAL NULL,\n", stat.column()));
        }
    }
    let sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS game (
            game_id TEXT PRIMARY KEY,
            game_date TEXT NOT NULL,
            team_id_home INTEGER NOT NULL,
            team_abbreviation_home TEXT NOT NULL,
            team_name_home TEXT NOT NULL,
            team_id_away INTEGER NOT NULL,
            team_abbreviation_away TEXT NOT NULL,
            team_name_away TEXT NOT NULL,
            wl_home TEXT NULL,
            wl_away TEXT NULL,
{stat_columns}            source TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_game_date ON game(game_date);
        CREATE INDEX IF NOT EXISTS idx_game_home ON game(team_id_home);
        CREATE INDEX IF NOT EXISTS idx_game_away ON game(team_id_away);

        CREATE TABLE IF NOT EXISTS team_directory (
            team_id INTEGER PRIMARY KEY,
            abbrev TEXT NOT NULL,
            display_name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS prediction_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            requested_by INTEGER NULL,
            team1_id INTEGER NOT NULL,
            team2_id INTEGER NOT NULL,
            probability_team1 REAL NOT NULL,
            probability_team2 REAL NOT NULL,
            expected_score_team1 INTEGER NOT NULL,
            expected_score_team2 INTEGER NOT NULL,
            confidence REAL NOT NULL,
            model_version TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_prediction_user ON prediction_log(requested_by);

        CREATE TABLE IF NOT EXISTS ingest_run (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            finished_at TEXT NULL,
            window_days INTEGER NOT NULL,
            fetched INTEGER NOT NULL,
            inserted INTEGER NOT NULL,
            errors_json TEXT NOT NULL
        );
        "#
    );
    conn.execute_batch(&sql).context("create sqlite schema")?;
    Ok(())
}

/// Accepts `YYYY-MM-DD HH:MM:SS`, ISO `T`-separated timestamps and bare dates.
pub fn parse_game_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, DATE_FORMAT) {
        return Some(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    for fmt in ["%Y-%m-%dT%H:%MZ", "%Y-%m-%dT%H:%M:%SZ"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    let date = NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()?;
    date.and_hms_opt(0, 0, 0)
}

fn game_columns() -> String {
    let mut cols = vec![
        "game_id".to_string(),
        "game_date".to_string(),
        "team_id_home".to_string(),
        "team_abbreviation_home".to_string(),
        "team_name_home".to_string(),
        "team_id_away".to_string(),
        "team_abbreviation_away".to_string(),
        "team_name_away".to_string(),
        "wl_home".to_string(),
        "wl_away".to_string(),
    ];
    for side in ["home", "away"] {
        for stat in Stat::ALL {
            cols.push(format!("{}_{side}", stat.column()));
        }
    }
    cols.join(", ")
}

fn insert_game_sql() -> String {
    let mut cols = vec![
        "game_id".to_string(),
        "game_date".to_string(),
        "team_id_home".to_string(),
        "team_abbreviation_home".to_string(),
        "team_name_home".to_string(),
        "team_id_away".to_string(),
        "team_abbreviation_away".to_string(),
        "team_name_away".to_string(),
        "wl_home".to_string(),
        "wl_away".to_string(),
    ];
    for side in ["home", "away"] {
        for stat in Stat::ALL {
            cols.push(format!("{}_{side}", stat.column()));
        }
    }
    let placeholders = (1..=cols.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT OR IGNORE INTO game ({}) VALUES ({placeholders})",
        cols.join(", ")
    )
}

fn query_games<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<GameRecord>> {
    let mut stmt = conn.prepare(sql).context("prepare games query")?;
    let rows = stmt.query_map(params, decode_game).context("query games")?;
    let mut out = Vec::new();
    for row in rows {
        if let Some(game) = row.context("decode game row")? {
            out.push(game);
        }
    }
    Ok(out)
}

/// Rows with an unparseable date are skipped rather than failing the whole read.
fn decode_game(row: &Row<'_>) -> rusqlite::Result<Option<GameRecord>> {
    let raw_date: String = row.get(1)?;
    let Some(game_date) = parse_game_date(&raw_date) else {
        return Ok(None);
    };
    let wl_home = wl_cell(row.get::<_, Option<String>>(8)?);
    let wl_away = wl_cell(row.get::<_, Option<String>>(9)?);

    let base = 10;
    let mut home = [0.0; STAT_COUNT];
    let mut away = [0.0; STAT_COUNT];
    for idx in 0..STAT_COUNT {
        home[idx] = stat_cell(row, base + idx)?;
        away[idx] = stat_cell(row, base + STAT_COUNT + idx)?;
    }

    Ok(Some(GameRecord {
        game_id: row.get(0)?,
        game_date,
        home_team_id: TeamId(row.get(2)?),
        home_abbrev: row.get(3)?,
        home_name: row.get(4)?,
        away_team_id: TeamId(row.get(5)?),
        away_abbrev: row.get(6)?,
        away_name: row.get(7)?,
        home_stats: StatVector::from_values(home),
        away_stats: StatVector::from_values(away),
        home_win: match (wl_home, wl_away) {
            (Some(home), _) => home == 'W',
            (None, Some(away)) => away == 'L',
            (None, None) => false,
        },
        decided: wl_home.is_some() || wl_away.is_some(),
    }))
}

/// `W`/`L` marker of a result cell; blanks and anything else read as unknown.
fn wl_cell(raw: Option<String>) -> Option<char> {
    match raw?.trim().to_ascii_uppercase().as_str() {
        "W" => Some('W'),
        "L" => Some('L'),
        _ => None,
    }
}

fn wl_value(game: &GameRecord, won: bool) -> rusqlite::types::Value {
    if !game.decided {
        return rusqlite::types::Value::Null;
    }
    if won { "W" } else { "L" }.to_string().into()
}

/// Missing or non-numeric cells read as 0.
fn stat_cell(row: &Row<'_>, idx: usize) -> rusqlite::Result<f64> {
    use rusqlite::types::ValueRef;
    let v = match row.get_ref(idx)? {
        ValueRef::Integer(n) => n as f64,
        ValueRef::Real(x) => x,
        ValueRef::Text(t) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .unwrap_or(0.0),
        ValueRef::Null | ValueRef::Blob(_) => 0.0,
    };
    Ok(if v.is_finite() { v } else { 0.0 })
}

fn decode_team(row: &Row<'_>) -> rusqlite::Result<TeamInfo> {
    Ok(TeamInfo {
        team_id: TeamId(row.get(0)?),
        abbrev: row.get(1)?,
        display_name: row.get(2)?,
    })
}

fn upsert_team(conn: &Connection, team: TeamId, abbrev: &str, name: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO team_directory (team_id, abbrev, display_name) VALUES (?1, ?2, ?3)
         ON CONFLICT(team_id) DO UPDATE SET
            abbrev = excluded.abbrev,
            display_name = excluded.display_name",
        params![team.0, abbrev.trim(), name.trim()],
    )
    .context("upsert team")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(id: &str, date: &str, home: i64, away: i64, home_win: bool) -> GameRecord {
        let mut hs = StatVector::zeros();
        hs[Stat::Pts] = 101.0;
        let mut aw = StatVector::zeros();
        aw[Stat::Pts] = 99.0;
        GameRecord {
            game_id: id.to_string(),
            game_date: parse_game_date(date).expect("valid date"),
            home_team_id: TeamId(home),
            away_team_id: TeamId(away),
            home_abbrev: format!("H{home}"),
            away_abbrev: format!("A{away}"),
            home_name: format!("Home {home}"),
            away_name: format!("Away {away}"),
            home_stats: hs,
            away_stats: aw,
            home_win,
            decided: true,
        }
    }

    #[test]
    fn parse_game_date_accepts_common_shapes() {
        assert!(parse_game_date("2024-01-05 00:00:00").is_some());
        assert!(parse_game_date("2024-01-05T19:30:00").is_some());
        assert!(parse_game_date("2024-01-05T19:30Z").is_some());
        assert!(parse_game_date("2024-01-05").is_some());
        assert!(parse_game_date("yesterday").is_none());
    }

    #[test]
    fn duplicate_game_ids_are_ignored() {
        let log = GameLog::open_in_memory().expect("db");
        let g = game("g1", "2024-01-01", 1, 2, true);
        assert_eq!(log.insert_games(&[g.clone()]).expect("insert"), 1);
        assert_eq!(log.insert_games(&[g]).expect("insert"), 0);
        assert_eq!(log.game_count().expect("count"), 1);
    }

    #[test]
    fn load_games_is_chronological_and_round_trips_stats() {
        let log = GameLog::open_in_memory().expect("db");
        log.insert_games(&[
            game("g2", "2024-01-03", 1, 2, false),
            game("g1", "2024-01-01", 2, 1, true),
        ])
        .expect("insert");
        let games = log.load_games().expect("load");
        assert_eq!(games[0].game_id, "g1");
        assert_eq!(games[1].game_id, "g2");
        assert_eq!(games[1].home_stats[Stat::Pts], 101.0);
        assert!(!games[1].home_win);
    }

    #[test]
    fn null_stat_cells_read_as_zero() {
        let log = GameLog::open_in_memory().expect("db");
        log.insert_games(&[game("g1", "2024-01-01", 1, 2, true)])
            .expect("insert");
        {
            let conn = log.lock().expect("lock");
            conn.execute("UPDATE game SET reb_home = NULL, ast_home = 'n/a'", [])
                .expect("update");
        }
        let games = log.load_games().expect("load");
        assert_eq!(games[0].home_stats[Stat::Reb], 0.0);
        assert_eq!(games[0].home_stats[Stat::Ast], 0.0);
    }

    #[test]
    fn game_without_any_result_credits_neither_side() {
        use crate::heuristic::win_rate;

        let log = GameLog::open_in_memory().expect("db");
        log.insert_games(&[
            game("g1", "2024-01-01", 1, 2, true),
            game("g2", "2024-01-02", 3, 1, true),
        ])
        .expect("insert");
        {
            let conn = log.lock().expect("lock");
            conn.execute(
                "UPDATE game SET wl_home = NULL, wl_away = NULL WHERE game_id = 'g2'",
                [],
            )
            .expect("update");
        }

        let games = log.load_games().expect("load");
        assert!(games[0].decided);
        assert!(!games[1].decided);
        assert_eq!(games[1].won_by(TeamId(3)), Some(false));
        assert_eq!(games[1].won_by(TeamId(1)), Some(false));

        // Still counted as played, so team 1 is 1 of 2 and team 3 is 0 of 1.
        let recent1 = log.recent_games(TeamId(1), 10).expect("recent");
        assert_eq!(win_rate(&recent1, TeamId(1)), 0.5);
        let recent3 = log.recent_games(TeamId(3), 10).expect("recent");
        assert_eq!(win_rate(&recent3, TeamId(3)), 0.0);

        // Re-inserting an undecided game keeps both cells empty.
        let copy = GameRecord {
            game_id: "g3".to_string(),
            ..games[1].clone()
        };
        log.insert_games(&[copy]).expect("insert undecided");
        let conn = log.lock().expect("lock");
        let cells: (Option<String>, Option<String>) = conn
            .query_row("SELECT wl_home, wl_away FROM game WHERE game_id = 'g3'", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .expect("row");
        assert_eq!(cells, (None, None));
    }

    #[test]
    fn away_result_alone_decides_the_game() {
        let log = GameLog::open_in_memory().expect("db");
        log.insert_games(&[game("g1", "2024-01-01", 1, 2, true)])
            .expect("insert");
        {
            let conn = log.lock().expect("lock");
            conn.execute("UPDATE game SET wl_home = NULL, wl_away = 'W'", [])
                .expect("update");
        }
        let games = log.load_games().expect("load");
        assert!(games[0].decided);
        assert_eq!(games[0].won_by(TeamId(2)), Some(true));
        assert_eq!(games[0].won_by(TeamId(1)), Some(false));
    }

    #[test]
    fn directory_lookup_by_abbrev_is_case_insensitive() {
        let log = GameLog::open_in_memory().expect("db");
        log.register_team(&TeamInfo {
            team_id: TeamId(7),
            abbrev: "BOS".to_string(),
            display_name: "Boston Celtics".to_string(),
        })
        .expect("register");
        let found = log.team_by_abbrev("bos").expect("query").expect("team");
        assert_eq!(found.team_id, TeamId(7));
        assert!(log.team_by_id(TeamId(8)).expect("query").is_none());
    }

    #[test]
    fn recent_games_and_head_to_head_are_newest_first() {
        let log = GameLog::open_in_memory().expect("db");
        log.insert_games(&[
            game("g1", "2024-01-01", 1, 2, true),
            game("g2", "2024-01-02", 3, 1, true),
            game("g3", "2024-01-03", 2, 1, false),
        ])
        .expect("insert");
        let recent = log.recent_games(TeamId(1), 2).expect("recent");
        assert_eq!(
            recent.iter().map(|g| g.game_id.as_str()).collect::<Vec<_>>(),
            vec!["g3", "g2"]
        );
        let h2h = log.head_to_head(TeamId(1), TeamId(2), 10).expect("h2h");
        assert_eq!(h2h.len(), 2);
        assert_eq!(h2h[0].game_id, "g3");
    }
}
