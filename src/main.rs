use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;

use courtcast::artifacts::{ArtifactStore, BundleDraft, BundleSlot};
use courtcast::config::Config;
use courtcast::dataset::build_dataset;
use courtcast::espn_fetch::EspnFetcher;
use courtcast::game_log::GameLog;
use courtcast::logging;
use courtcast::predict::{PredictionRequest, PredictionService, TeamRef};
use courtcast::retrain::{RetrainOrchestrator, RunOutcome};
use courtcast::trainer::train;

const USAGE: &str = "usage: courtcast [--db=PATH] [--models=DIR] [--user=ID] <command>

commands:
  train                 build the dataset from the game log and commit a new bundle
  predict <home> <away> predict a matchup (team ids or abbreviations)
  teams                 list the team directory
  status                show bundle and retrain status
  retrain               fetch recent games, retrain and swap the bundle
  serve                 answer `predict <home> <away>`, `status`, `retrain`, `teams` on stdin";

fn main() -> Result<()> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let positional = args
        .iter()
        .filter(|a| !a.starts_with("--"))
        .filter(|a| !is_flag_value(&args, a))
        .cloned()
        .collect::<Vec<_>>();
    let Some(command) = positional.first().map(String::as_str) else {
        println!("{USAGE}");
        return Ok(());
    };

    let mut cfg = Config::from_env();
    if let Some(db) = parse_path_arg(&args, "db") {
        cfg.db_path = db;
    }
    if let Some(models) = parse_path_arg(&args, "models") {
        cfg.model_dir = models;
    }
    let user = parse_arg(&args, "user").and_then(|v| v.parse::<i64>().ok());

    match command {
        "serve" | "retrain" | "train" => logging::init_logging(),
        _ => logging::init_logging_quiet(),
    }

    let app = App::open(&cfg)?;
    match command {
        "train" => cmd_train(&app),
        "predict" => {
            let (Some(home), Some(away)) = (positional.get(1), positional.get(2)) else {
                bail!("predict needs <home> <away>");
            };
            cmd_predict(&app, home, away, user)
        }
        "teams" => cmd_teams(&app),
        "status" => print_json(&app.service.health()),
        "retrain" => cmd_retrain(&app),
        "serve" => cmd_serve(&app, user),
        other => Err(anyhow!("unknown command {other:?}\n\n{USAGE}")),
    }
}

struct App {
    cfg: Config,
    game_log: Arc<GameLog>,
    slot: Arc<BundleSlot>,
    orchestrator: Arc<RetrainOrchestrator>,
    service: PredictionService,
}

impl App {
    fn open(cfg: &Config) -> Result<Self> {
        let game_log = Arc::new(GameLog::open(&cfg.db_path)?);
        let store = ArtifactStore::new(&cfg.model_dir, cfg.keep_bundles);
        let bundle = match store.load_current() {
            Ok(bundle) => bundle,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "current bundle unusable, serving heuristic");
                None
            }
        };
        let slot = Arc::new(BundleSlot::new(bundle));
        let orchestrator = Arc::new(RetrainOrchestrator::new(
            Arc::clone(&game_log),
            cfg.model_dir.clone(),
            Arc::clone(&slot),
            Arc::new(EspnFetcher::new()),
            cfg.retrain(),
        ));
        let service = PredictionService::new(
            Arc::clone(&game_log),
            Arc::clone(&slot),
            Arc::clone(&game_log) as Arc<dyn courtcast::prediction_log::PredictionSink>,
        )
        .with_heuristic(cfg.heuristic())
        .with_orchestrator(Arc::clone(&orchestrator));

        Ok(Self {
            cfg: cfg.clone(),
            game_log,
            slot,
            orchestrator,
            service,
        })
    }
}

fn cmd_train(app: &App) -> Result<()> {
    let games = app.game_log.load_games()?;
    if games.is_empty() {
        bail!("game log at {} is empty", app.cfg.db_path.display());
    }
    let dataset = build_dataset(&games, app.cfg.dataset());
    info!(games = games.len(), rows = dataset.len(), "dataset built");
    let model = train(&dataset, &app.cfg.trainer())?;
    let report = model.report.clone();

    let draft = BundleDraft {
        model,
        ema_state: dataset.final_state,
        teams: app.game_log.teams()?,
        ema_alpha: app.cfg.ema_alpha,
    };
    let bundle = app.orchestrator.store().commit(draft)?;
    app.slot.replace(bundle);

    println!(
        "trained on {} rows, validated on {}",
        report.train_samples, report.val_samples
    );
    println!(
        "validation: accuracy={:.3} (unweighted {:.3}) log_loss={:.4} brier={:.4}",
        report.validation_accuracy(),
        report.validation.accuracy,
        report.validation_weighted.log_loss,
        report.validation_weighted.brier
    );
    if let Some(version) = app.slot.current().map(|b| b.model_version()) {
        println!("committed {version} to {}", app.cfg.model_dir.display());
    }
    Ok(())
}

fn cmd_predict(app: &App, home: &str, away: &str, user: Option<i64>) -> Result<()> {
    let mut request = PredictionRequest::new(home.parse::<TeamRef>()?, away.parse::<TeamRef>()?);
    request.requested_by = user;
    let result = app.service.handle(&request)?;
    print_json(&serde_json::json!({
        "home_team_id": result.team1_id,
        "away_team_id": result.team2_id,
        "home_win_probability": result.home_win_probability(),
        "probability_team1": result.probability_team1,
        "probability_team2": result.probability_team2,
        "predicted_score1": result.predicted_score1,
        "predicted_score2": result.predicted_score2,
        "confidence": result.confidence,
        "model_version": result.model_version,
    }))
}

fn cmd_teams(app: &App) -> Result<()> {
    for team in app.service.teams()? {
        println!("{:>12}  {:<4}  {}", team.team_id, team.abbrev, team.display_name);
    }
    Ok(())
}

fn cmd_retrain(app: &App) -> Result<()> {
    match app.orchestrator.run_blocking() {
        RunOutcome::Succeeded(summary) => print_json(&summary),
        RunOutcome::Failed(failure) => {
            print_json(&failure)?;
            bail!("retrain failed during {:?}", failure.stage)
        }
        RunOutcome::AlreadyRunning => bail!("a retrain is already running"),
    }
}

fn cmd_serve(app: &App, user: Option<i64>) -> Result<()> {
    let _schedule = app
        .cfg
        .retrain_interval
        .map(|every| app.orchestrator.spawn_schedule(every));
    let bundle = app.slot.current().map(|b| b.model_version());
    info!(bundle = bundle.as_deref().unwrap_or("none"), "serving on stdin");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("read stdin")?;
        let words = line.split_whitespace().collect::<Vec<_>>();
        let outcome = match words.as_slice() {
            [] => continue,
            ["quit"] | ["exit"] => break,
            ["predict", home, away] => cmd_predict(app, home, away, user),
            ["status"] => print_json(&app.service.health()),
            ["teams"] => cmd_teams(app),
            ["retrain"] => print_json(&serde_json::json!({
                "ack": format!("{:?}", app.orchestrator.trigger()),
            })),
            _ => Err(anyhow!("unrecognized: {line}")),
        };
        if let Err(err) = outcome {
            println!("{}", serde_json::json!({ "error": format!("{err:#}") }));
        }
        io::stdout().flush().ok();
    }

    app.orchestrator.join();
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn parse_arg(args: &[String], name: &str) -> Option<String> {
    let eq = format!("--{name}=");
    let bare = format!("--{name}");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&eq) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if *arg == bare {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(next.trim().to_string());
            }
        }
    }
    None
}

fn parse_path_arg(args: &[String], name: &str) -> Option<PathBuf> {
    parse_arg(args, name).map(PathBuf::from)
}

// `--db path` style: the value after a bare flag is not a positional argument.
fn is_flag_value(args: &[String], candidate: &String) -> bool {
    args.windows(2).any(|w| {
        std::ptr::eq(&w[1], candidate)
            && matches!(w[0].as_str(), "--db" | "--models" | "--user")
    })
}
