use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{SecondsFormat, Utc};

use courtcast::config::Config;
use courtcast::espn_fetch::{EspnFetcher, GameFetcher};
use courtcast::game_log::{GameLog, IngestRun};
use courtcast::logging;

fn main() -> Result<()> {
    logging::init_logging();
    let cfg = Config::from_env();
    let db_path = parse_db_path_arg().unwrap_or_else(|| cfg.db_path.clone());
    let window_days = parse_days_arg().unwrap_or(cfg.fetch_window_days);
    let delay_ms = std::env::var("COURTCAST_FETCH_DELAY_MS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(500)
        .min(10_000);

    let log = GameLog::open(&db_path)?;
    let teams = log.teams()?;
    if teams.is_empty() {
        return Err(anyhow!(
            "team directory in {} is empty; load a game dump first",
            db_path.display()
        ));
    }

    let started_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let fetcher = EspnFetcher::new().with_request_delay(Duration::from_millis(delay_ms));
    let (games, errors) = match fetcher.fetch_recent(window_days, &teams) {
        Ok(games) => (games, Vec::new()),
        Err(err) => (Vec::new(), vec![format!("{err:#}")]),
    };
    let inserted = log.insert_games(&games)?;
    log.record_ingest_run(&IngestRun {
        started_at,
        window_days,
        fetched: games.len(),
        inserted,
        errors: errors.clone(),
    })?;

    println!("ESPN ingest complete");
    println!("DB: {}", db_path.display());
    println!("Window: {window_days} days");
    println!("Games fetched: {}", games.len());
    println!("Games inserted: {inserted}");
    println!("Games in log: {}", log.game_count()?);
    if let Some(latest) = log.latest_game_date()? {
        println!("Latest game: {latest}");
    }
    if !errors.is_empty() {
        println!("errors: {}", errors.len());
        for err in &errors {
            println!("   - {err}");
        }
    }
    Ok(())
}

fn parse_db_path_arg() -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix("--db=") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if arg == "--db" {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(PathBuf::from(next));
            }
        }
    }
    None
}

fn parse_days_arg() -> Option<u32> {
    std::env::args()
        .skip(1)
        .find_map(|arg| arg.strip_prefix("--days=").map(str::to_string))
        .and_then(|v| v.trim().parse::<u32>().ok())
        .map(|d| d.clamp(1, 60))
}
