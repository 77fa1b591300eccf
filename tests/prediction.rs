mod common;

use std::sync::Arc;
use std::thread;

use courtcast::artifacts::{ArtifactStore, BundleSlot};
use courtcast::game_log::GameLog;
use courtcast::predict::{
    HEURISTIC_CONFIDENCE, HEURISTIC_VERSION, MODEL_CONFIDENCE, PredictionRequest,
    PredictionService, TeamRef,
};
use courtcast::prediction_log::{MemorySink, PredictionSink};
use courtcast::stats::TeamId;
use courtcast::ForecastError;

use common::{base_date, commit_trained, game, seeded_log, synthetic_history, team};

fn service(log: Arc<GameLog>, slot: Arc<BundleSlot>, sink: Arc<MemorySink>) -> PredictionService {
    PredictionService::new(log, slot, sink as Arc<dyn PredictionSink>)
}

#[test]
fn heuristic_for_team_with_one_home_win_against_team_without_history() {
    let (a, b, c) = (team(1), team(2), team(3));
    let log = GameLog::open_in_memory().expect("db");
    log.register_team(&b).expect("register");
    log.insert_games(&[game("g1", base_date(), &a, &c, 120.0, 101.0)])
        .expect("insert");

    let sink = Arc::new(MemorySink::new());
    let svc = service(Arc::new(log), Arc::new(BundleSlot::default()), Arc::clone(&sink));
    let result = svc.predict(a.team_id, b.team_id).expect("predict");

    let expected = 100.0 * (0.4 * (1.0 / 1.5) + 0.3 * 0.55 + 0.3 * 0.5);
    assert!((result.probability_team1 - expected).abs() < 1e-9);
    assert!((result.probability_team1 - 58.2).abs() < 0.05);
    assert!((result.probability_team1 + result.probability_team2 - 100.0).abs() < 1e-9);
    assert_eq!(result.confidence, HEURISTIC_CONFIDENCE);
    assert_eq!(result.model_version, HEURISTIC_VERSION);
    assert_eq!(result.predicted_score1, 63);
    assert_eq!(result.predicted_score2, 46);

    let logged = sink.entries();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].team1_id, a.team_id);
    assert_eq!(logged[0].model_version, HEURISTIC_VERSION);
}

#[test]
fn unknown_team_is_not_found() {
    let log = seeded_log(&synthetic_history(4, 20, 1));
    let sink = Arc::new(MemorySink::new());
    let svc = service(Arc::new(log), Arc::new(BundleSlot::default()), Arc::clone(&sink));

    let err = svc.predict(TeamId(1), TeamId(999)).expect_err("unknown team");
    assert!(matches!(err, ForecastError::NotFound(_)));

    let req = PredictionRequest::new(TeamRef::Abbrev("ZZZ".into()), TeamRef::Id(TeamId(1)));
    assert!(matches!(svc.handle(&req), Err(ForecastError::NotFound(_))));
    assert!(sink.entries().is_empty());
}

#[test]
fn identical_teams_rejected_at_request_layer() {
    let log = seeded_log(&synthetic_history(4, 20, 1));
    let svc = service(
        Arc::new(log),
        Arc::new(BundleSlot::default()),
        Arc::new(MemorySink::new()),
    );
    let req = PredictionRequest::new(TeamRef::Abbrev("T01".into()), TeamRef::Id(TeamId(1)));
    assert!(matches!(svc.handle(&req), Err(ForecastError::InvalidInput(_))));
}

#[test]
fn abbreviations_resolve_through_the_directory() {
    let log = seeded_log(&synthetic_history(4, 20, 1));
    let svc = service(
        Arc::new(log),
        Arc::new(BundleSlot::default()),
        Arc::new(MemorySink::new()),
    );
    let mut req = PredictionRequest::new("t02".parse().expect("ref"), "3".parse().expect("ref"));
    req.requested_by = Some(7);
    let result = svc.handle(&req).expect("predict");
    assert_eq!(result.team1_id, TeamId(2));
    assert_eq!(result.team2_id, TeamId(3));
}

#[test]
fn probabilities_sum_to_one_hundred_on_both_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = Arc::new(seeded_log(&synthetic_history(6, 240, 3)));
    let slot = Arc::new(BundleSlot::default());
    let svc = service(Arc::clone(&log), Arc::clone(&slot), Arc::new(MemorySink::new()));

    let pairs: Vec<(TeamId, TeamId)> = (1..=6)
        .flat_map(|h| (1..=6).filter(move |a| *a != h).map(move |a| (TeamId(h), TeamId(a))))
        .collect();

    for (h, a) in &pairs {
        let r = svc.predict(*h, *a).expect("heuristic");
        assert!((r.probability_team1 + r.probability_team2 - 100.0).abs() < 1e-9);
        assert!((0.0..=100.0).contains(&r.probability_team1));
    }

    let store = ArtifactStore::new(dir.path(), 2);
    slot.replace(commit_trained(&log, &store, 11));
    for (h, a) in &pairs {
        let r = svc.predict(*h, *a).expect("model");
        assert_eq!(r.model_version, "model-v1");
        assert_eq!(r.confidence, MODEL_CONFIDENCE);
        assert!((r.probability_team1 + r.probability_team2 - 100.0).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&r.home_win_probability()));
    }
}

#[test]
fn team_without_ema_state_falls_back_to_heuristic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = Arc::new(seeded_log(&synthetic_history(4, 120, 5)));
    let store = ArtifactStore::new(dir.path(), 2);
    let slot = Arc::new(BundleSlot::new(Some(commit_trained(&log, &store, 1))));
    let newcomer = team(9);
    log.register_team(&newcomer).expect("register");

    let svc = service(Arc::clone(&log), slot, Arc::new(MemorySink::new()));
    let r = svc.predict(TeamId(1), newcomer.team_id).expect("predict");
    assert_eq!(r.model_version, HEURISTIC_VERSION);
    let r = svc.predict(TeamId(1), TeamId(2)).expect("predict");
    assert_eq!(r.model_version, "model-v1");
}

#[test]
fn inference_failure_falls_back_to_heuristic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = Arc::new(seeded_log(&synthetic_history(4, 120, 6)));
    let store = ArtifactStore::new(dir.path(), 2);
    let mut bundle = commit_trained(&log, &store, 1);
    // A scaler one column short no longer fits the feature vector.
    bundle.scaler.means.pop();
    bundle.scaler.scales.pop();
    assert!(matches!(
        bundle.home_win_probability(TeamId(1), TeamId(2)),
        Err(ForecastError::InferenceFailure(_))
    ));

    let sink = Arc::new(MemorySink::new());
    let svc = service(
        Arc::clone(&log),
        Arc::new(BundleSlot::new(Some(bundle))),
        Arc::clone(&sink),
    );
    let r = svc.predict(TeamId(1), TeamId(2)).expect("heuristic answer");
    assert_eq!(r.model_version, HEURISTIC_VERSION);
    assert_eq!(r.confidence, HEURISTIC_CONFIDENCE);
    assert!((r.probability_team1 + r.probability_team2 - 100.0).abs() < 1e-9);
    assert_eq!(sink.entries()[0].model_version, HEURISTIC_VERSION);
}

#[test]
fn bundle_team_snapshot_covers_an_empty_game_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let history = seeded_log(&synthetic_history(4, 120, 5));
    let store = ArtifactStore::new(dir.path(), 2);
    let bundle = commit_trained(&history, &store, 1);

    let empty = Arc::new(GameLog::open_in_memory().expect("db"));
    let svc = service(
        empty,
        Arc::new(BundleSlot::new(Some(bundle))),
        Arc::new(MemorySink::new()),
    );
    assert_eq!(svc.teams().expect("teams").len(), 4);
    let req = PredictionRequest::new(TeamRef::Abbrev("T01".into()), TeamRef::Abbrev("T04".into()));
    let r = svc.handle(&req).expect("predict");
    assert_eq!(r.model_version, "model-v1");

    let health = svc.health();
    assert!(health.bundle_loaded);
    assert_eq!(health.model_version.as_deref(), Some("model-v1"));
    assert_eq!(health.bundle_teams, 4);
    assert!(health.retrain.is_none());
}

#[test]
fn concurrent_predictions_see_one_bundle_each_during_swaps() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = Arc::new(seeded_log(&synthetic_history(6, 240, 8)));
    let store = ArtifactStore::new(dir.path(), 3);
    let v1 = commit_trained(&log, &store, 1);
    let v2 = commit_trained(&log, &store, 2);
    let (home, away) = (TeamId(2), TeamId(5));
    let p1 = 100.0 * v1.home_win_probability(home, away).expect("v1");
    let p2 = 100.0 * v2.home_win_probability(home, away).expect("v2");

    let slot = Arc::new(BundleSlot::new(Some(v1.clone())));
    let svc = Arc::new(service(Arc::clone(&log), Arc::clone(&slot), Arc::new(MemorySink::new())));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let svc = Arc::clone(&svc);
            thread::spawn(move || {
                (0..200)
                    .map(|_| svc.predict(home, away).expect("predict"))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    for i in 0..100 {
        let next = if i % 2 == 0 { v2.clone() } else { v1.clone() };
        slot.replace(next);
    }

    for reader in readers {
        for r in reader.join().expect("reader thread") {
            match r.model_version.as_str() {
                "model-v1" => assert_eq!(r.probability_team1, p1),
                "model-v2" => assert_eq!(r.probability_team1, p2),
                other => panic!("unexpected version {other}"),
            }
        }
    }
}
