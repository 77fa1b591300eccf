use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use anyhow::{Result, bail};

use courtcast::artifacts::ArtifactStore;
use courtcast::calibration::{
    BinaryMetrics, CalibrationBin, Scored, calibration_bins, evaluate_probs,
    evaluate_probs_weighted,
};
use courtcast::config::Config;
use courtcast::dataset::{build_dataset, split_index};
use courtcast::game_log::GameLog;
use courtcast::heuristic::{
    HeuristicConfig, head_to_head_factor, heuristic_probability, win_rate,
};
use courtcast::logging;
use courtcast::stats::{GameRecord, TeamId};
use courtcast::trainer::{score_entries, train};

fn main() -> Result<()> {
    logging::init_logging_quiet();
    let cfg = Config::from_env();
    let db_path = parse_path_arg("db").unwrap_or_else(|| cfg.db_path.clone());
    let model_dir = parse_path_arg("models").unwrap_or_else(|| cfg.model_dir.clone());

    let log = GameLog::open(&db_path)?;
    let games = log.load_games()?;
    let dataset = build_dataset(&games, cfg.dataset());
    let trainer_cfg = cfg.trainer();
    let cut = split_index(dataset.len(), trainer_cfg.train_fraction);
    if cut == 0 || cut >= dataset.len() {
        bail!("not enough games to backtest ({} in log)", games.len());
    }
    let test_rows = &dataset.entries[cut..];
    let weights = test_rows.iter().map(|e| e.weight).collect::<Vec<_>>();

    let store = ArtifactStore::new(&model_dir, cfg.keep_bundles);
    let (label, model_scores) = match store.load_current()? {
        Some(bundle) => (
            bundle.model_version(),
            score_entries(&bundle.scaler, &bundle.classifier, test_rows)?,
        ),
        None => {
            println!("no committed bundle in {}, training one", model_dir.display());
            let model = train(&dataset, &trainer_cfg)?;
            (
                "fresh model".to_string(),
                score_entries(&model.scaler, &model.classifier, test_rows)?,
            )
        }
    };

    let heuristic_scores = replay_heuristic(&games, cut, &cfg.heuristic());

    println!("Backtest over newest {} of {} games", test_rows.len(), dataset.len());
    print_block(
        &label,
        &evaluate_probs(&model_scores),
        &evaluate_probs_weighted(&model_scores, &weights),
        &calibration_bins(&model_scores, 10),
    );
    print_block(
        "heuristic-v1",
        &evaluate_probs(&heuristic_scores),
        &evaluate_probs_weighted(&heuristic_scores, &weights),
        &calibration_bins(&heuristic_scores, 10),
    );
    Ok(())
}

/// Heuristic scored for every game from index `start`, using only games played
/// before it.
fn replay_heuristic(games: &[GameRecord], start: usize, cfg: &HeuristicConfig) -> Vec<Scored> {
    let mut ordered = games.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| {
        a.game_date
            .cmp(&b.game_date)
            .then_with(|| a.game_id.cmp(&b.game_id))
    });

    let mut form: HashMap<TeamId, VecDeque<GameRecord>> = HashMap::new();
    let mut meetings: HashMap<(TeamId, TeamId), VecDeque<GameRecord>> = HashMap::new();
    let mut out = Vec::with_capacity(ordered.len().saturating_sub(start));

    for (idx, game) in ordered.into_iter().enumerate() {
        let home = game.home_team_id;
        let away = game.away_team_id;
        let key = if home < away { (home, away) } else { (away, home) };

        if idx >= start {
            let mut rate = |team: TeamId| {
                form.get_mut(&team)
                    .map(|w| win_rate(w.make_contiguous(), team))
                    .unwrap_or_else(|| win_rate(&[], team))
            };
            let (rate_home, rate_away) = (rate(home), rate(away));
            let h2h = meetings
                .get_mut(&key)
                .map(|w| head_to_head_factor(w.make_contiguous(), home))
                .unwrap_or_else(|| head_to_head_factor(&[], home));
            out.push(Scored {
                home_prob: heuristic_probability(rate_home, rate_away, h2h, cfg) / 100.0,
                home_win: game.home_win,
            });
        }

        push_capped(form.entry(home).or_default(), game.clone(), cfg.history_games);
        push_capped(form.entry(away).or_default(), game.clone(), cfg.history_games);
        push_capped(meetings.entry(key).or_default(), game.clone(), cfg.h2h_games);
    }
    out
}

fn push_capped<T>(q: &mut VecDeque<T>, value: T, cap: usize) {
    q.push_back(value);
    while q.len() > cap.max(1) {
        q.pop_front();
    }
}

fn print_block(
    label: &str,
    plain: &BinaryMetrics,
    weighted: &BinaryMetrics,
    bins: &[CalibrationBin],
) {
    println!();
    println!("== {label} ==");
    println!(
        "accuracy={:.3} log_loss={:.4} brier={:.4}",
        plain.accuracy, plain.log_loss, plain.brier
    );
    println!(
        "weighted: accuracy={:.3} log_loss={:.4} brier={:.4}",
        weighted.accuracy, weighted.log_loss, weighted.brier
    );
    for bin in bins.iter().filter(|b| b.count > 0) {
        println!(
            "  {:.1}-{:.1}  n={:<5} pred={:.3} actual={:.3}",
            bin.bucket_start, bin.bucket_end, bin.count, bin.avg_pred, bin.actual_rate
        );
    }
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    let eq = format!("--{name}=");
    let bare = format!("--{name}");
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix(&eq) {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if *arg == bare {
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use courtcast::heuristic::estimate;
    use courtcast::stats::StatVector;

    fn history() -> Vec<GameRecord> {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(19, 0, 0))
            .expect("valid date");
        let pairs = [(1, 2), (2, 3), (3, 1), (1, 2), (2, 1), (3, 2), (1, 3), (2, 1), (1, 2), (3, 1)];
        pairs
            .iter()
            .enumerate()
            .map(|(i, &(home, away))| GameRecord {
                game_id: format!("g{i:02}"),
                game_date: base + Duration::days(i as i64),
                home_team_id: TeamId(home),
                away_team_id: TeamId(away),
                home_abbrev: format!("T{home}"),
                away_abbrev: format!("T{away}"),
                home_name: format!("Team {home}"),
                away_name: format!("Team {away}"),
                home_stats: StatVector::zeros(),
                away_stats: StatVector::zeros(),
                home_win: i % 3 != 0,
                decided: i != 4,
            })
            .collect()
    }

    #[test]
    fn replay_matches_the_served_estimate() {
        let games = history();
        let cfg = HeuristicConfig {
            history_games: 3,
            h2h_games: 2,
            ..HeuristicConfig::default()
        };
        let replayed = replay_heuristic(&games, 1, &cfg);
        assert_eq!(replayed.len(), games.len() - 1);

        for (idx, scored) in replayed.iter().enumerate() {
            let game = &games[idx + 1];
            let log = GameLog::open_in_memory().expect("db");
            log.insert_games(&games[..=idx]).expect("insert");
            let served = estimate(&log, game.home_team_id, game.away_team_id, &cfg).expect("estimate");
            assert!(
                (scored.home_prob - served.probability_team1 / 100.0).abs() < 1e-12,
                "game {}",
                game.game_id
            );
        }
    }
}
