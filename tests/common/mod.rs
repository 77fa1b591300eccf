#![allow(dead_code)]

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use courtcast::artifacts::{ArtifactBundle, ArtifactStore, BundleDraft};
use courtcast::dataset::{DatasetConfig, build_dataset};
use courtcast::game_log::GameLog;
use courtcast::stats::{GameRecord, Stat, StatVector, TeamId, TeamInfo};
use courtcast::trainer::{TrainerConfig, train};

pub fn base_date() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2023, 10, 24)
        .and_then(|d| d.and_hms_opt(19, 0, 0))
        .expect("valid date")
}

pub fn team(id: i64) -> TeamInfo {
    TeamInfo {
        team_id: TeamId(id),
        abbrev: format!("T{id:02}"),
        display_name: format!("City {id}"),
    }
}

pub fn stats(points: f64, strength: f64) -> StatVector {
    let mut v = StatVector::zeros();
    v[Stat::Pts] = points;
    v[Stat::Reb] = 44.0 + strength / 2.0;
    v[Stat::Ast] = 24.0 + strength / 3.0;
    v[Stat::Stl] = 7.5;
    v[Stat::Blk] = 5.0;
    v[Stat::Tov] = 13.0 - strength / 4.0;
    v[Stat::Pf] = 19.0;
    v[Stat::FgPct] = 0.46 + strength / 200.0;
    v[Stat::Fg3Pct] = 0.36 + strength / 300.0;
    v[Stat::FtPct] = 0.78;
    v
}

pub fn game(
    id: &str,
    date: NaiveDateTime,
    home: &TeamInfo,
    away: &TeamInfo,
    home_pts: f64,
    away_pts: f64,
) -> GameRecord {
    GameRecord {
        game_id: id.to_string(),
        game_date: date,
        home_team_id: home.team_id,
        away_team_id: away.team_id,
        home_abbrev: home.abbrev.clone(),
        away_abbrev: away.abbrev.clone(),
        home_name: home.display_name.clone(),
        away_name: away.display_name.clone(),
        home_stats: stats(home_pts, 0.0),
        away_stats: stats(away_pts, 0.0),
        home_win: home_pts > away_pts,
        decided: true,
    }
}

/// League where team `i` is `4 * (i - mid)` points better than average, plus a
/// small home edge and noise.
pub fn synthetic_history(team_count: i64, games: usize, seed: u64) -> Vec<GameRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    let teams: Vec<TeamInfo> = (1..=team_count).map(team).collect();
    let mid = (team_count as f64 + 1.0) / 2.0;
    let strength = |t: &TeamInfo| 4.0 * (t.team_id.0 as f64 - mid);

    (0..games)
        .map(|i| {
            let h = rng.gen_range(0..teams.len());
            let mut a = rng.gen_range(0..teams.len() - 1);
            if a >= h {
                a += 1;
            }
            let (home, away) = (&teams[h], &teams[a]);
            let (sh, sa) = (strength(home), strength(away));
            let mut hp = (105.0 + sh + 2.5 + rng.gen_range(-10.0..10.0_f64)).round();
            let ap = (105.0 + sa + rng.gen_range(-10.0..10.0_f64)).round();
            if hp == ap {
                hp += 1.0;
            }
            let date = base_date() + Duration::days((i / 4) as i64) + Duration::minutes((i % 4) as i64 * 30);
            GameRecord {
                game_id: format!("G{i:05}"),
                game_date: date,
                home_team_id: home.team_id,
                away_team_id: away.team_id,
                home_abbrev: home.abbrev.clone(),
                away_abbrev: away.abbrev.clone(),
                home_name: home.display_name.clone(),
                away_name: away.display_name.clone(),
                home_stats: stats(hp, sh),
                away_stats: stats(ap, sa),
                home_win: hp > ap,
                decided: true,
            }
        })
        .collect()
}

pub fn quick_trainer() -> TrainerConfig {
    TrainerConfig {
        epochs: 4,
        batch_size: 32,
        learning_rate: 0.005,
        ..TrainerConfig::default()
    }
}

pub fn seeded_log(games: &[GameRecord]) -> GameLog {
    let log = GameLog::open_in_memory().expect("in-memory db");
    log.insert_games(games).expect("insert games");
    log
}

/// Trains on everything in `log` and commits the result to `store`.
pub fn commit_trained(log: &GameLog, store: &ArtifactStore, seed: u64) -> ArtifactBundle {
    let games = log.load_games().expect("load games");
    let dataset = build_dataset(&games, DatasetConfig::default());
    let model = train(
        &dataset,
        &TrainerConfig {
            seed,
            ..quick_trainer()
        },
    )
    .expect("train");
    store
        .commit(BundleDraft {
            model,
            ema_state: dataset.final_state,
            teams: log.teams().expect("teams"),
            ema_alpha: DatasetConfig::default().alpha,
        })
        .expect("commit")
}
