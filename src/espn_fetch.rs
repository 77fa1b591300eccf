use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::game_log::parse_game_date;
use crate::http_client::{get_text, http_client};
use crate::stats::{GameRecord, Stat, StatVector, TeamInfo};

const ESPN_BASE_URL: &str = "http://site.api.espn.com/apis/site/v2/sports/basketball/nba";

const SPECIAL_GAME_KEYWORDS: [&str; 7] = [
    "team",
    "world",
    "usa",
    "all-star",
    "all star",
    "rising stars",
    "celebrity",
];

/// Source of recently completed games.
pub trait GameFetcher: Send + Sync {
    /// Completed games from the trailing `window_days` days (today included),
    /// mapped onto `teams`. Games with unmapped teams are dropped.
    fn fetch_recent(&self, window_days: u32, teams: &[TeamInfo]) -> Result<Vec<GameRecord>>;
}

/// ESPN public scoreboard + box-score summary endpoints.
pub struct EspnFetcher {
    base_url: String,
    request_delay: Duration,
    today: Option<NaiveDate>,
}

impl Default for EspnFetcher {
    fn default() -> Self {
        Self {
            base_url: ESPN_BASE_URL.to_string(),
            request_delay: Duration::from_millis(500),
            today: None,
        }
    }
}

impl EspnFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Pins the last day of the window instead of using the local date.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn scoreboard(&self, date: NaiveDate) -> Result<Vec<ScoreboardGame>> {
        let client = http_client()?;
        let url = format!(
            "{}/scoreboard?dates={}&limit=100",
            self.base_url,
            date.format("%Y%m%d")
        );
        let body = get_text(client, &url).with_context(|| format!("scoreboard {date}"))?;
        parse_scoreboard_json(&body)
    }

    fn box_score(&self, event_id: &str) -> Result<BoxScore> {
        let client = http_client()?;
        let url = format!("{}/summary?event={event_id}", self.base_url);
        let body = get_text(client, &url)?;
        parse_summary_json(&body)
    }
}

impl GameFetcher for EspnFetcher {
    fn fetch_recent(&self, window_days: u32, teams: &[TeamInfo]) -> Result<Vec<GameRecord>> {
        let today = self.today.unwrap_or_else(|| Local::now().date_naive());
        let mut out = Vec::new();
        let mut skipped = 0usize;

        for offset in 0..window_days.max(1) {
            let date = today - chrono::Duration::days(i64::from(offset));
            let games = self.scoreboard(date)?;
            debug!(%date, events = games.len(), "scoreboard fetched");

            for game in games {
                if !game.completed || is_special_game(&game.away_name, &game.home_name) {
                    skipped += 1;
                    continue;
                }
                thread::sleep(self.request_delay);
                let box_score = match self.box_score(&game.event_id) {
                    Ok(b) => Some(b),
                    Err(err) => {
                        warn!(event = %game.event_id, error = %err, "box score unavailable, using score only");
                        None
                    }
                };
                match build_record(&game, box_score.as_ref(), teams) {
                    Some(record) => out.push(record),
                    None => {
                        skipped += 1;
                        warn!(
                            event = %game.event_id,
                            home = %game.home_name,
                            away = %game.away_name,
                            "could not map teams"
                        );
                    }
                }
            }
        }

        info!(window_days, games = out.len(), skipped, "espn fetch finished");
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreboardGame {
    pub event_id: String,
    pub game_date: NaiveDateTime,
    pub home_name: String,
    pub away_name: String,
    pub home_abbrev: String,
    pub away_abbrev: String,
    pub home_score: f64,
    pub away_score: f64,
    pub completed: bool,
}

/// Numeric team stats from a game summary, keyed by ESPN stat name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoxScore {
    pub home: HashMap<String, f64>,
    pub away: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct ScoreboardResponse {
    #[serde(default)]
    events: Vec<EspnEvent>,
}

#[derive(Debug, Deserialize)]
struct EspnEvent {
    id: String,
    date: String,
    #[serde(default)]
    competitions: Vec<EspnCompetition>,
    status: Option<EspnStatus>,
}

#[derive(Debug, Deserialize)]
struct EspnCompetition {
    #[serde(default)]
    competitors: Vec<EspnCompetitor>,
    status: Option<EspnStatus>,
}

#[derive(Debug, Deserialize)]
struct EspnCompetitor {
    #[serde(rename = "homeAway")]
    home_away: Option<String>,
    #[serde(default)]
    score: Value,
    #[serde(default)]
    team: EspnTeam,
}

#[derive(Debug, Default, Deserialize)]
struct EspnTeam {
    #[serde(rename = "displayName", default)]
    display_name: String,
    #[serde(default)]
    abbreviation: String,
}

#[derive(Debug, Deserialize)]
struct EspnStatus {
    #[serde(rename = "type")]
    kind: Option<EspnStatusType>,
}

#[derive(Debug, Deserialize)]
struct EspnStatusType {
    completed: Option<bool>,
}

pub fn parse_scoreboard_json(raw: &str) -> Result<Vec<ScoreboardGame>> {
    let resp: ScoreboardResponse =
        serde_json::from_str(raw.trim()).context("invalid scoreboard json")?;
    let mut out = Vec::with_capacity(resp.events.len());

    for event in resp.events {
        let Some(comp) = event.competitions.first() else {
            continue;
        };
        if comp.competitors.len() < 2 {
            continue;
        }
        let Some(game_date) = parse_game_date(&event.date) else {
            continue;
        };
        // Listed away first unless the feed says otherwise.
        let (away, home) = match comp.competitors[0].home_away.as_deref() {
            Some("home") => (&comp.competitors[1], &comp.competitors[0]),
            _ => (&comp.competitors[0], &comp.competitors[1]),
        };
        let completed = comp
            .status
            .as_ref()
            .or(event.status.as_ref())
            .and_then(|s| s.kind.as_ref())
            .and_then(|k| k.completed)
            .unwrap_or(true);

        out.push(ScoreboardGame {
            event_id: event.id.clone(),
            game_date,
            home_name: home.team.display_name.clone(),
            away_name: away.team.display_name.clone(),
            home_abbrev: home.team.abbreviation.clone(),
            away_abbrev: away.team.abbreviation.clone(),
            home_score: value_as_f64(&home.score).unwrap_or(0.0),
            away_score: value_as_f64(&away.score).unwrap_or(0.0),
            completed,
        });
    }
    Ok(out)
}

/// Reads `boxscore.teams[].statistics`. Entries are either `{name,
/// displayValue}` pairs (combined names like `fieldGoalsMade-fieldGoalsAttempted`
/// are split on `-`) or objects carrying numeric fields directly.
pub fn parse_summary_json(raw: &str) -> Result<BoxScore> {
    let root: Value = serde_json::from_str(raw.trim()).context("invalid summary json")?;
    let mut out = BoxScore::default();
    let teams = root
        .get("boxscore")
        .and_then(|b| b.get("teams"))
        .and_then(Value::as_array);

    for team in teams.into_iter().flatten() {
        let target = if team.get("homeAway").and_then(Value::as_str) == Some("home") {
            &mut out.home
        } else {
            &mut out.away
        };
        let stats = team.get("statistics").and_then(Value::as_array);
        for stat in stats.into_iter().flatten() {
            collect_stat(stat, target);
        }
    }
    Ok(out)
}

fn collect_stat(stat: &Value, target: &mut HashMap<String, f64>) {
    let Some(obj) = stat.as_object() else {
        return;
    };
    if let (Some(name), Some(display)) = (
        obj.get("name").and_then(Value::as_str),
        obj.get("displayValue").and_then(Value::as_str),
    ) {
        let names: Vec<&str> = name.split('-').collect();
        let values: Vec<&str> = display.split('-').collect();
        if names.len() == values.len() {
            for (n, v) in names.iter().zip(values) {
                if let Ok(x) = v.trim().parse::<f64>() {
                    target.insert((*n).to_string(), x);
                }
            }
        }
    }
    for (key, value) in obj {
        if key == "label" {
            continue;
        }
        if let Some(x) = value.as_f64() {
            target.insert(key.clone(), x);
        }
    }
}

/// Exhibition matchups (All-Star, Rising Stars, celebrity games).
pub fn is_special_game(away_name: &str, home_name: &str) -> bool {
    let combined = format!("{away_name} {home_name}").to_lowercase();
    SPECIAL_GAME_KEYWORDS.iter().any(|k| combined.contains(k))
}

/// Maps an ESPN display name or abbreviation to the game log's abbreviation.
pub fn canonical_abbrev(display_name: &str, espn_abbrev: &str) -> Option<&'static str> {
    let by_name = match display_name.trim() {
        "Atlanta Hawks" => Some("ATL"),
        "Boston Celtics" => Some("BOS"),
        "Brooklyn Nets" | "Brooklyn" => Some("BKN"),
        "Charlotte Hornets" | "Charlotte" => Some("CHA"),
        "Chicago Bulls" => Some("CHI"),
        "Cleveland Cavaliers" => Some("CLE"),
        "Dallas Mavericks" => Some("DAL"),
        "Denver Nuggets" => Some("DEN"),
        "Detroit Pistons" => Some("DET"),
        "Golden State Warriors" | "Golden State" => Some("GSW"),
        "Houston Rockets" => Some("HOU"),
        "Indiana Pacers" => Some("IND"),
        "LA Clippers" | "Los Angeles Clippers" => Some("LAC"),
        "Los Angeles Lakers" | "LA Lakers" => Some("LAL"),
        "Memphis Grizzlies" => Some("MEM"),
        "Miami Heat" => Some("MIA"),
        "Milwaukee Bucks" => Some("MIL"),
        "Minnesota Timberwolves" => Some("MIN"),
        "New Orleans Pelicans" | "New Orleans" => Some("NOP"),
        "New York Knicks" => Some("NYK"),
        "Oklahoma City Thunder" | "Oklahoma City" => Some("OKC"),
        "Orlando Magic" => Some("ORL"),
        "Philadelphia 76ers" => Some("PHI"),
        "Phoenix Suns" | "Phoenix" => Some("PHX"),
        "Portland Trail Blazers" => Some("POR"),
        "Sacramento Kings" => Some("SAC"),
        "San Antonio Spurs" | "San Antonio" => Some("SAS"),
        "Toronto Raptors" => Some("TOR"),
        "Utah Jazz" => Some("UTA"),
        "Washington Wizards" => Some("WAS"),
        _ => None,
    };
    by_name.or(match espn_abbrev.trim().to_ascii_uppercase().as_str() {
        "GS" => Some("GSW"),
        "NY" => Some("NYK"),
        "NO" => Some("NOP"),
        "SA" => Some("SAS"),
        "UTAH" => Some("UTA"),
        "WSH" => Some("WAS"),
        "BKN" => Some("BKN"),
        "PHX" => Some("PHX"),
        _ => None,
    })
}

/// Builds a game log row from a scoreboard entry plus its (optional) box score.
/// Returns `None` when either team is not in `teams`.
pub fn build_record(
    game: &ScoreboardGame,
    box_score: Option<&BoxScore>,
    teams: &[TeamInfo],
) -> Option<GameRecord> {
    let home = lookup_team(teams, &game.home_name, &game.home_abbrev)?;
    let away = lookup_team(teams, &game.away_name, &game.away_abbrev)?;
    let empty = HashMap::new();
    let (home_box, away_box) = match box_score {
        Some(b) => (&b.home, &b.away),
        None => (&empty, &empty),
    };

    Some(GameRecord {
        game_id: format!("ESPN_{}", game.event_id),
        game_date: game.game_date,
        home_team_id: home.team_id,
        away_team_id: away.team_id,
        home_abbrev: home.abbrev.clone(),
        away_abbrev: away.abbrev.clone(),
        home_name: game.home_name.clone(),
        away_name: game.away_name.clone(),
        home_stats: stat_vector(home_box, game.home_score),
        away_stats: stat_vector(away_box, game.away_score),
        home_win: game.home_score > game.away_score,
        decided: true,
    })
}

fn lookup_team<'a>(teams: &'a [TeamInfo], name: &str, espn_abbrev: &str) -> Option<&'a TeamInfo> {
    let wanted = canonical_abbrev(name, espn_abbrev).map(str::to_string).or_else(|| {
        let raw = espn_abbrev.trim();
        (!raw.is_empty()).then(|| raw.to_ascii_uppercase())
    })?;
    teams.iter().find(|t| t.abbrev.eq_ignore_ascii_case(&wanted))
}

fn stat_vector(b: &HashMap<String, f64>, points: f64) -> StatVector {
    let get = |key: &str| b.get(key).copied().unwrap_or(0.0);
    let mut v = StatVector::zeros();
    v[Stat::Pts] = points;
    v[Stat::Reb] = get("rebounds").max(get("totalRebounds"));
    v[Stat::Ast] = get("assists");
    v[Stat::Stl] = get("steals");
    v[Stat::Blk] = get("blocks");
    v[Stat::Tov] = get("turnovers").max(get("totalTurnovers"));
    v[Stat::Pf] = get("fouls");
    v[Stat::FgPct] = safe_pct(get("fieldGoalsMade"), get("fieldGoalsAttempted"));
    v[Stat::Fg3Pct] = safe_pct(
        get("threePointFieldGoalsMade"),
        get("threePointFieldGoalsAttempted"),
    );
    v[Stat::FtPct] = safe_pct(get("freeThrowsMade"), get("freeThrowsAttempted"));
    v
}

/// `made / attempted` rounded to 3 decimals; 0 with no attempts.
pub fn safe_pct(made: f64, attempted: f64) -> f64 {
    if attempted > 0.0 {
        (made / attempted * 1000.0).round() / 1000.0
    } else {
        0.0
    }
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
