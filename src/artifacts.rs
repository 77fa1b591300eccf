//! Versioned on-disk bundles of everything needed to serve model predictions.
//!
//! Layout under the store root:
//!
//! ```text
//! CURRENT                      -> "v000007"
//! bundles/v000007/classifier.json
//! bundles/v000007/scaler.json
//! bundles/v000007/team_emas.json
//! bundles/v000007/teams.json
//! bundles/v000007/manifest.json
//! ```
//!
//! A bundle directory only appears under its final name once every file has
//! been written and re-read, and `CURRENT` is replaced by rename afterwards.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::calibration::BinaryMetrics;
use crate::ema::TeamEmaState;
use crate::error::ForecastError;
use crate::mlp::MlpClassifier;
use crate::scaler::StandardScaler;
use crate::stats::{TeamId, TeamInfo, feature_vector};
use crate::trainer::TrainedModel;

const BUNDLES_DIR: &str = "bundles";
const CURRENT_FILE: &str = "CURRENT";
const MANIFEST_FILE: &str = "manifest.json";
const CLASSIFIER_FILE: &str = "classifier.json";
const SCALER_FILE: &str = "scaler.json";
const EMA_FILE: &str = "team_emas.json";
const TEAMS_FILE: &str = "teams.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub version: u64,
    pub created_at: String,
    pub ema_alpha: f64,
    pub train_samples: usize,
    pub val_samples: usize,
    pub validation: BinaryMetrics,
    pub validation_weighted: BinaryMetrics,
    /// File name -> lowercase hex SHA-256.
    pub digests: BTreeMap<String, String>,
}

/// Immutable serving snapshot. Shared behind an `Arc` and never mutated.
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    pub version: u64,
    pub created_at: String,
    pub classifier: MlpClassifier,
    pub scaler: StandardScaler,
    pub ema_state: TeamEmaState,
    pub teams: Vec<TeamInfo>,
    pub manifest: BundleManifest,
}

impl ArtifactBundle {
    pub fn model_version(&self) -> String {
        format!("model-v{}", self.version)
    }

    /// Both teams have EMA state in this bundle.
    pub fn covers(&self, home: TeamId, away: TeamId) -> bool {
        self.ema_state.contains(home) && self.ema_state.contains(away)
    }

    pub fn team(&self, id: TeamId) -> Option<&TeamInfo> {
        self.teams.iter().find(|t| t.team_id == id)
    }

    pub fn team_by_abbrev(&self, abbrev: &str) -> Option<&TeamInfo> {
        self.teams
            .iter()
            .find(|t| t.abbrev.eq_ignore_ascii_case(abbrev.trim()))
    }

    /// Home-win probability in [0, 1] from the bundled classifier.
    pub fn home_win_probability(&self, home: TeamId, away: TeamId) -> crate::Result<f64> {
        let (Some(h), Some(a)) = (self.ema_state.get(home), self.ema_state.get(away)) else {
            return Err(ForecastError::ArtifactUnavailable(format!(
                "bundle v{} has no EMA state for {home} or {away}",
                self.version
            )));
        };
        let features = feature_vector(h, a);
        let scaled = self
            .scaler
            .transform(&features)
            .map_err(|e| ForecastError::InferenceFailure(e.to_string()))?;
        self.classifier
            .predict_proba(&scaled)
            .map_err(|e| ForecastError::InferenceFailure(e.to_string()))
    }
}

/// Outcome of a training run, ready to be committed as the next version.
#[derive(Debug, Clone)]
pub struct BundleDraft {
    pub model: TrainedModel,
    pub ema_state: TeamEmaState,
    pub teams: Vec<TeamInfo>,
    pub ema_alpha: f64,
}

pub struct ArtifactStore {
    root: PathBuf,
    keep: usize,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            root: root.into(),
            keep: keep.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundles_dir(&self) -> PathBuf {
        self.root.join(BUNDLES_DIR)
    }

    fn bundle_dir(&self, version: u64) -> PathBuf {
        self.bundles_dir().join(dir_name(version))
    }

    /// Committed versions on disk, ascending. Temp directories are ignored.
    pub fn versions(&self) -> Result<Vec<u64>> {
        let dir = self.bundles_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
            let entry = entry.context("read bundle dir entry")?;
            if let Some(v) = entry.file_name().to_str().and_then(parse_dir_name) {
                out.push(v);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    pub fn current_version(&self) -> Result<Option<u64>> {
        let path = self.root.join(CURRENT_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        parse_dir_name(raw.trim())
            .map(Some)
            .ok_or_else(|| anyhow!("malformed CURRENT pointer: {:?}", raw.trim()))
    }

    /// The bundle `CURRENT` points to, fully verified. `None` if nothing has been
    /// committed yet.
    pub fn load_current(&self) -> Result<Option<ArtifactBundle>> {
        match self.current_version()? {
            Some(v) => self.load_version(v).map(Some),
            None => Ok(None),
        }
    }

    pub fn load_version(&self, version: u64) -> Result<ArtifactBundle> {
        load_dir(&self.bundle_dir(version), version)
    }

    /// Writes `draft` as the next version, verifies it, publishes it and moves
    /// `CURRENT`. Returns the bundle as read back from disk.
    pub fn commit(&self, draft: BundleDraft) -> Result<ArtifactBundle> {
        let bundles = self.bundles_dir();
        fs::create_dir_all(&bundles).with_context(|| format!("create {}", bundles.display()))?;

        let version = self.versions()?.last().copied().unwrap_or(0) + 1;
        let final_dir = self.bundle_dir(version);
        let tmp_dir = bundles.join(format!("{}.tmp", dir_name(version)));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir).context("clear stale bundle temp dir")?;
        }
        fs::create_dir_all(&tmp_dir).context("create bundle temp dir")?;

        let written = write_bundle_files(&tmp_dir, version, &draft);
        let bundle = written.and_then(|_| load_dir(&tmp_dir, version));
        let bundle = match bundle {
            Ok(bundle) => bundle,
            Err(err) => {
                let _ = fs::remove_dir_all(&tmp_dir);
                return Err(err.context(format!("stage bundle v{version}")));
            }
        };

        fs::rename(&tmp_dir, &final_dir).context("publish bundle dir")?;
        let pointer_tmp = self.root.join(format!("{CURRENT_FILE}.tmp"));
        fs::write(&pointer_tmp, dir_name(version)).context("write CURRENT pointer")?;
        fs::rename(&pointer_tmp, self.root.join(CURRENT_FILE)).context("swap CURRENT pointer")?;
        info!(version, dir = %final_dir.display(), "bundle committed");

        if let Err(err) = self.prune() {
            warn!(error = %err, "bundle prune failed");
        }
        Ok(bundle)
    }

    /// Removes the oldest committed bundles beyond `keep`, never the current one.
    pub fn prune(&self) -> Result<usize> {
        let current = self.current_version()?;
        let versions = self.versions()?;
        if versions.len() <= self.keep {
            return Ok(0);
        }
        let mut removed = 0;
        for v in &versions[..versions.len() - self.keep] {
            if Some(*v) == current {
                continue;
            }
            fs::remove_dir_all(self.bundle_dir(*v))
                .with_context(|| format!("remove bundle v{v}"))?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn write_bundle_files(dir: &Path, version: u64, draft: &BundleDraft) -> Result<()> {
    let report = &draft.model.report;
    let mut digests = BTreeMap::new();
    for (name, bytes) in [
        (CLASSIFIER_FILE, to_json(&draft.model.classifier)?),
        (SCALER_FILE, to_json(&draft.model.scaler)?),
        (EMA_FILE, to_json(&draft.ema_state)?),
        (TEAMS_FILE, to_json(&draft.teams)?),
    ] {
        digests.insert(name.to_string(), sha256_hex(&bytes));
        let path = dir.join(name);
        fs::write(&path, &bytes).with_context(|| format!("write {}", path.display()))?;
    }

    let manifest = BundleManifest {
        version,
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        ema_alpha: draft.ema_alpha,
        train_samples: report.train_samples,
        val_samples: report.val_samples,
        validation: report.validation,
        validation_weighted: report.validation_weighted,
        digests,
    };
    let path = dir.join(MANIFEST_FILE);
    fs::write(&path, to_json(&manifest)?).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn load_dir(dir: &Path, version: u64) -> Result<ArtifactBundle> {
    let manifest: BundleManifest = read_json(&dir.join(MANIFEST_FILE), None)?;
    if manifest.version != version {
        bail!(
            "manifest in {} claims v{}, expected v{version}",
            dir.display(),
            manifest.version
        );
    }
    let digest = |name: &str| -> Result<&str> {
        manifest
            .digests
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("manifest has no digest for {name}"))
    };

    let classifier: MlpClassifier =
        read_json(&dir.join(CLASSIFIER_FILE), Some(digest(CLASSIFIER_FILE)?))?;
    let scaler: StandardScaler = read_json(&dir.join(SCALER_FILE), Some(digest(SCALER_FILE)?))?;
    let ema_state: TeamEmaState = read_json(&dir.join(EMA_FILE), Some(digest(EMA_FILE)?))?;
    let teams: Vec<TeamInfo> = read_json(&dir.join(TEAMS_FILE), Some(digest(TEAMS_FILE)?))?;

    if scaler.dim() != classifier.input_dim() {
        bail!(
            "scaler width {} does not match classifier input {}",
            scaler.dim(),
            classifier.input_dim()
        );
    }

    Ok(ArtifactBundle {
        version,
        created_at: manifest.created_at.clone(),
        classifier,
        scaler,
        ema_state,
        teams,
        manifest,
    })
}

fn read_json<T: DeserializeOwned>(path: &Path, expected_digest: Option<&str>) -> Result<T> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    if let Some(expected) = expected_digest {
        let actual = sha256_hex(&bytes);
        if actual != expected {
            bail!("digest mismatch for {}", path.display());
        }
    }
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).context("serialize bundle file")
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn dir_name(version: u64) -> String {
    format!("v{version:06}")
}

fn parse_dir_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix('v')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Shared pointer to the bundle currently used for serving.
///
/// Readers clone the `Arc` under a short read lock and keep using that snapshot
/// for the whole prediction, so a concurrent `replace` never mixes versions.
#[derive(Debug, Default)]
pub struct BundleSlot {
    inner: RwLock<Option<Arc<ArtifactBundle>>>,
}

impl BundleSlot {
    pub fn new(initial: Option<ArtifactBundle>) -> Self {
        Self {
            inner: RwLock::new(initial.map(Arc::new)),
        }
    }

    pub fn current(&self) -> Option<Arc<ArtifactBundle>> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Installs `bundle` and returns the one it replaced.
    pub fn replace(&self, bundle: ArtifactBundle) -> Option<Arc<ArtifactBundle>> {
        let next = Some(Arc::new(bundle));
        match self.inner.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }
}
