//! Single-flight background pipeline: fetch new games, rebuild the dataset,
//! train, then persist and swap the serving bundle.
//!
//! ```text
//! Idle -> Fetching -> Rebuilding -> Training -> Swapping -> Idle
//!            \            \            \           \
//!             `------------`------------`-----------`--> Failed -> Idle
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::artifacts::{ArtifactStore, BundleDraft, BundleSlot};
use crate::dataset::{DatasetConfig, build_dataset};
use crate::error::{ForecastError, Result};
use crate::espn_fetch::GameFetcher;
use crate::game_log::{GameLog, IngestRun};
use crate::trainer::{TrainerConfig, train};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainState {
    Idle,
    Fetching,
    Rebuilding,
    Training,
    Swapping,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RetrainConfig {
    pub fetch_window_days: u32,
    pub dataset: DatasetConfig,
    pub trainer: TrainerConfig,
    pub keep_bundles: usize,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            fetch_window_days: 7,
            dataset: DatasetConfig::default(),
            trainer: TrainerConfig::default(),
            keep_bundles: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAck {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailure {
    pub stage: RetrainState,
    pub error: String,
    pub at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub version: u64,
    pub new_games: usize,
    pub dataset_rows: usize,
    pub validation_accuracy: f64,
    pub at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded(RunSummary),
    Failed(StageFailure),
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrainStatus {
    pub state: RetrainState,
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    /// States visited by the most recent run, in order.
    pub last_run_states: Vec<RetrainState>,
    pub last_success: Option<RunSummary>,
    pub last_failure: Option<StageFailure>,
}

impl Default for RetrainStatus {
    fn default() -> Self {
        Self {
            state: RetrainState::Idle,
            runs_started: 0,
            runs_succeeded: 0,
            runs_failed: 0,
            last_run_states: Vec::new(),
            last_success: None,
            last_failure: None,
        }
    }
}

struct Pipeline {
    game_log: Arc<GameLog>,
    store: ArtifactStore,
    slot: Arc<BundleSlot>,
    fetcher: Arc<dyn GameFetcher>,
    cfg: RetrainConfig,
    running: AtomicBool,
    status: Mutex<RetrainStatus>,
}

pub struct RetrainOrchestrator {
    pipeline: Arc<Pipeline>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RetrainOrchestrator {
    pub fn new(
        game_log: Arc<GameLog>,
        model_dir: impl Into<PathBuf>,
        slot: Arc<BundleSlot>,
        fetcher: Arc<dyn GameFetcher>,
        cfg: RetrainConfig,
    ) -> Self {
        let store = ArtifactStore::new(model_dir, cfg.keep_bundles);
        Self {
            pipeline: Arc::new(Pipeline {
                game_log,
                store,
                slot,
                fetcher,
                cfg,
                running: AtomicBool::new(false),
                status: Mutex::new(RetrainStatus::default()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.pipeline.store
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> RetrainStatus {
        self.pipeline.status_guard().clone()
    }

    /// Starts a run on a worker thread unless one is already in progress.
    /// Returns immediately.
    pub fn trigger(&self) -> TriggerAck {
        let Some(guard) = RunGuard::acquire(&self.pipeline) else {
            info!("retrain trigger ignored, run in progress");
            return TriggerAck::AlreadyRunning;
        };
        let pipeline = Arc::clone(&self.pipeline);
        let handle = thread::spawn(move || {
            let _guard = guard;
            pipeline.run();
        });
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = worker.replace(handle) {
            let _ = previous.join();
        }
        TriggerAck::Started
    }

    /// Runs the pipeline on the calling thread under the same single-flight rule.
    pub fn run_blocking(&self) -> RunOutcome {
        let Some(_guard) = RunGuard::acquire(&self.pipeline) else {
            return RunOutcome::AlreadyRunning;
        };
        self.pipeline.run()
    }

    /// Waits for the most recently triggered run, if any.
    pub fn join(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("retrain worker panicked");
        }
    }

    /// Triggers a run every `interval` from a background thread until the
    /// returned handle is stopped.
    pub fn spawn_schedule(self: &Arc<Self>, interval: Duration) -> ScheduleHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let orchestrator = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let tick = Duration::from_millis(200).min(interval);
            let mut next = Instant::now() + interval;
            while !stop_flag.load(Ordering::Acquire) {
                if Instant::now() >= next {
                    let ack = orchestrator.trigger();
                    info!(?ack, "scheduled retrain");
                    next = Instant::now() + interval;
                }
                thread::sleep(tick);
            }
        });
        ScheduleHandle {
            stop,
            handle: Some(handle),
        }
    }
}

pub struct ScheduleHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ScheduleHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ScheduleHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Holds the single-flight flag; released on drop, including on panic.
struct RunGuard {
    pipeline: Arc<Pipeline>,
}

impl RunGuard {
    fn acquire(pipeline: &Arc<Pipeline>) -> Option<Self> {
        pipeline
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                pipeline: Arc::clone(pipeline),
            })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.pipeline.running.store(false, Ordering::Release);
    }
}

impl Pipeline {
    fn status_guard(&self) -> MutexGuard<'_, RetrainStatus> {
        self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(&self, state: RetrainState) {
        let mut status = self.status_guard();
        status.state = state;
        status.last_run_states.push(state);
        drop(status);
        info!(?state, "retrain stage");
    }

    fn run(&self) -> RunOutcome {
        {
            let mut status = self.status_guard();
            status.runs_started += 1;
            status.last_run_states.clear();
        }

        match self.stages() {
            Ok(summary) => {
                let mut status = self.status_guard();
                status.runs_succeeded += 1;
                status.last_success = Some(summary.clone());
                drop(status);
                self.enter(RetrainState::Idle);
                info!(
                    version = summary.version,
                    new_games = summary.new_games,
                    accuracy = summary.validation_accuracy,
                    "retrain finished"
                );
                RunOutcome::Succeeded(summary)
            }
            Err((stage, err)) => {
                error!(?stage, error = %err, "retrain failed");
                let failure = StageFailure {
                    stage,
                    error: err.to_string(),
                    at: now(),
                };
                self.enter(RetrainState::Failed);
                {
                    let mut status = self.status_guard();
                    status.runs_failed += 1;
                    status.last_failure = Some(failure.clone());
                }
                self.enter(RetrainState::Idle);
                RunOutcome::Failed(failure)
            }
        }
    }

    fn stages(&self) -> std::result::Result<RunSummary, (RetrainState, ForecastError)> {
        self.enter(RetrainState::Fetching);
        let new_games = self.fetch().map_err(|e| (RetrainState::Fetching, e))?;

        self.enter(RetrainState::Rebuilding);
        let games = self
            .game_log
            .load_games()
            .map_err(|e| (RetrainState::Rebuilding, ForecastError::from(e)))?;
        let dataset = build_dataset(&games, self.cfg.dataset);
        info!(games = games.len(), rows = dataset.len(), "dataset rebuilt");

        self.enter(RetrainState::Training);
        let model = train(&dataset, &self.cfg.trainer).map_err(|e| (RetrainState::Training, e))?;
        let validation_accuracy = model.report.validation_accuracy();

        self.enter(RetrainState::Swapping);
        let teams = self
            .game_log
            .teams()
            .map_err(|e| (RetrainState::Swapping, ForecastError::from(e)))?;
        let draft = BundleDraft {
            model,
            ema_state: dataset.final_state.clone(),
            teams,
            ema_alpha: self.cfg.dataset.alpha,
        };
        // Persist first; the slot only changes once the bundle is on disk.
        let bundle = self
            .store
            .commit(draft)
            .map_err(|e| (RetrainState::Swapping, ForecastError::from(e)))?;
        let version = bundle.version;
        self.slot.replace(bundle);

        Ok(RunSummary {
            version,
            new_games,
            dataset_rows: dataset.len(),
            validation_accuracy,
            at: now(),
        })
    }

    fn fetch(&self) -> Result<usize> {
        let started_at = now();
        let window_days = self.cfg.fetch_window_days;
        let teams = self.game_log.teams()?;

        let fetched = match self.fetcher.fetch_recent(window_days, &teams) {
            Ok(games) => games,
            Err(err) => {
                self.log_ingest(IngestRun {
                    started_at,
                    window_days,
                    fetched: 0,
                    inserted: 0,
                    errors: vec![format!("{err:#}")],
                });
                return Err(ForecastError::IngestionFailure(format!("{err:#}")));
            }
        };
        let inserted = match self.game_log.insert_games(&fetched) {
            Ok(inserted) => inserted,
            Err(err) => {
                self.log_ingest(IngestRun {
                    started_at,
                    window_days,
                    fetched: fetched.len(),
                    inserted: 0,
                    errors: vec![format!("{err:#}")],
                });
                return Err(ForecastError::IngestionFailure(format!("{err:#}")));
            }
        };
        self.log_ingest(IngestRun {
            started_at,
            window_days,
            fetched: fetched.len(),
            inserted,
            errors: Vec::new(),
        });
        info!(fetched = fetched.len(), inserted, "games ingested");
        Ok(inserted)
    }

    fn log_ingest(&self, run: IngestRun) {
        if let Err(err) = self.game_log.record_ingest_run(&run) {
            warn!(error = %err, "failed to record ingest run");
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
