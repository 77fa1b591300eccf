use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use criterion::{Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;

use courtcast::artifacts::{ArtifactBundle, BundleSlot};
use courtcast::calibration::BinaryMetrics;
use courtcast::dataset::{DatasetConfig, build_dataset};
use courtcast::espn_fetch::{parse_scoreboard_json, parse_summary_json};
use courtcast::game_log::GameLog;
use courtcast::predict::PredictionService;
use courtcast::prediction_log::MemorySink;
use courtcast::stats::{GameRecord, Stat, StatVector, TeamId};
use courtcast::trainer::{TrainerConfig, train};

fn sample_games(teams: i64, count: usize) -> Vec<GameRecord> {
    let mut rng = StdRng::seed_from_u64(7);
    let base = NaiveDate::from_ymd_opt(2023, 10, 24)
        .and_then(|d| d.and_hms_opt(19, 0, 0))
        .expect("valid date");
    (0..count)
        .map(|i| {
            let home = rng.gen_range(1..=teams);
            let away = (home % teams) + 1;
            let mut hs = StatVector::zeros();
            let mut aw = StatVector::zeros();
            for stat in [Stat::Pts, Stat::Reb, Stat::Ast, Stat::Tov] {
                hs[stat] = rng.gen_range(10.0..120.0);
                aw[stat] = rng.gen_range(10.0..120.0);
            }
            hs[Stat::FgPct] = rng.gen_range(0.38..0.55);
            aw[Stat::FgPct] = rng.gen_range(0.38..0.55);
            GameRecord {
                game_id: format!("B{i:06}"),
                game_date: base + Duration::hours(i as i64 * 6),
                home_team_id: TeamId(home),
                away_team_id: TeamId(away),
                home_abbrev: format!("T{home:02}"),
                away_abbrev: format!("T{away:02}"),
                home_name: format!("City {home}"),
                away_name: format!("City {away}"),
                home_win: hs[Stat::Pts] > aw[Stat::Pts],
                decided: true,
                home_stats: hs,
                away_stats: aw,
            }
        })
        .collect()
}

fn bench_dataset_build(c: &mut Criterion) {
    let games = sample_games(30, 5_000);
    c.bench_function("dataset_build_5k", |b| {
        b.iter(|| {
            let dataset = build_dataset(black_box(&games), DatasetConfig::default());
            black_box(dataset.len());
        })
    });
}

fn bench_train_epoch(c: &mut Criterion) {
    let dataset = build_dataset(&sample_games(30, 2_000), DatasetConfig::default());
    let cfg = TrainerConfig {
        epochs: 1,
        ..TrainerConfig::default()
    };
    let mut group = c.benchmark_group("train");
    group.sample_size(10);
    group.bench_function("one_epoch_2k", |b| {
        b.iter(|| {
            let model = train(black_box(&dataset), &cfg).expect("train");
            black_box(model.report.validation_accuracy());
        })
    });
    group.finish();
}

fn bench_predict(c: &mut Criterion) {
    let games = sample_games(30, 2_000);
    let dataset = build_dataset(&games, DatasetConfig::default());
    let model = train(
        &dataset,
        &TrainerConfig {
            epochs: 1,
            ..TrainerConfig::default()
        },
    )
    .expect("train");

    let log = GameLog::open_in_memory().expect("db");
    log.insert_games(&games).expect("insert");
    let bundle = ArtifactBundle {
        version: 1,
        created_at: String::new(),
        manifest: courtcast::artifacts::BundleManifest {
            version: 1,
            created_at: String::new(),
            ema_alpha: DatasetConfig::default().alpha,
            train_samples: model.report.train_samples,
            val_samples: model.report.val_samples,
            validation: BinaryMetrics::empty(),
            validation_weighted: BinaryMetrics::empty(),
            digests: Default::default(),
        },
        classifier: model.classifier,
        scaler: model.scaler,
        ema_state: dataset.final_state,
        teams: log.teams().expect("teams"),
    };

    let service = PredictionService::new(
        Arc::new(log),
        Arc::new(BundleSlot::new(Some(bundle))),
        Arc::new(MemorySink::new()),
    );
    c.bench_function("predict_model_path", |b| {
        b.iter(|| {
            let r = service
                .predict(black_box(TeamId(3)), black_box(TeamId(17)))
                .expect("predict");
            black_box(r.probability_team1);
        })
    });

    let empty = PredictionService::new(
        Arc::new({
            let log = GameLog::open_in_memory().expect("db");
            log.insert_games(&games).expect("insert");
            log
        }),
        Arc::new(BundleSlot::default()),
        Arc::new(MemorySink::new()),
    );
    c.bench_function("predict_heuristic_path", |b| {
        b.iter(|| {
            let r = empty
                .predict(black_box(TeamId(3)), black_box(TeamId(17)))
                .expect("predict");
            black_box(r.probability_team1);
        })
    });
}

fn bench_espn_parse(c: &mut Criterion) {
    c.bench_function("espn_scoreboard_parse", |b| {
        b.iter(|| {
            let games = parse_scoreboard_json(black_box(SCOREBOARD_JSON)).expect("parse");
            black_box(games.len());
        })
    });
    c.bench_function("espn_summary_parse", |b| {
        b.iter(|| {
            let box_score = parse_summary_json(black_box(SUMMARY_JSON)).expect("parse");
            black_box(box_score.home.len());
        })
    });
}

criterion_group!(
    perf,
    bench_dataset_build,
    bench_train_epoch,
    bench_predict,
    bench_espn_parse
);
criterion_main!(perf);

static SCOREBOARD_JSON: &str = include_str!("../tests/fixtures/espn_scoreboard.json");
static SUMMARY_JSON: &str = include_str!("../tests/fixtures/espn_summary.json");
