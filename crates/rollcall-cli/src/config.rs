use anyhow::{Context, Result};
use rollcall_engine::{DedupConfig, LedgerOptions, PipelineConfig};
use rollcall_vision::Metric;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration: defaults, then the TOML file named by
/// `ROLLCALL_CONFIG` (if any), then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite attendance ledger.
    pub db_path: PathBuf,
    pub metric: Metric,
    /// Largest embedding distance still accepted as a match.
    pub max_distance: f32,
    /// Minimum candidate confidence that counts towards attendance.
    pub confirm_threshold: f32,
    /// Two sightings must fall within this many milliseconds to confirm.
    pub stability_window_ms: u64,
    /// Absence after which a student counts as re-entering; unset disables
    /// re-entry tracking.
    pub reentry_gap_secs: Option<u64>,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Frames not processed within this many milliseconds are dropped.
    pub frame_deadline_ms: u64,
    /// Sessions left open longer than this are closed automatically.
    pub session_timeout_mins: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            model_dir: rollcall_vision::default_model_dir(),
            db_path: data_dir.join("attendance.db"),
            metric: Metric::Euclidean,
            max_distance: 1.10,
            confirm_threshold: 0.45,
            stability_window_ms: 5000,
            reentry_gap_secs: None,
            workers: 2,
            queue_capacity: 32,
            frame_deadline_ms: 2000,
            session_timeout_mins: Some(180),
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Override fields from `ROLLCALL_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        env_parse(&lookup, "ROLLCALL_METRIC", &mut self.metric);
        env_parse(&lookup, "ROLLCALL_MAX_DISTANCE", &mut self.max_distance);
        env_parse(&lookup, "ROLLCALL_CONFIRM_THRESHOLD", &mut self.confirm_threshold);
        env_parse(&lookup, "ROLLCALL_STABILITY_WINDOW_MS", &mut self.stability_window_ms);
        env_optional(&lookup, "ROLLCALL_REENTRY_GAP_SECS", &mut self.reentry_gap_secs);
        env_parse(&lookup, "ROLLCALL_WORKERS", &mut self.workers);
        env_parse(&lookup, "ROLLCALL_QUEUE_CAPACITY", &mut self.queue_capacity);
        env_parse(&lookup, "ROLLCALL_FRAME_DEADLINE_MS", &mut self.frame_deadline_ms);
        env_optional(&lookup, "ROLLCALL_SESSION_TIMEOUT_MINS", &mut self.session_timeout_mins);
    }

    pub fn dedup(&self) -> DedupConfig {
        DedupConfig {
            confirm_threshold: self.confirm_threshold,
            stability_window: chrono::Duration::milliseconds(self.stability_window_ms as i64),
            reentry_gap: self.reentry_gap_secs.map(|s| chrono::Duration::seconds(s as i64)),
        }
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            allow_reentry: self.reentry_gap_secs.is_some(),
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            frame_deadline: Duration::from_millis(self.frame_deadline_ms),
        }
    }

    pub fn session_timeout(&self) -> Option<chrono::Duration> {
        self.session_timeout_mins.map(|m| chrono::Duration::minutes(m as i64))
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_vision::DETECTOR_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_vision::RECOGNIZER_MODEL_FILE)
    }
}

fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
        }
    }
}

/// `0`, `off` and the empty string disable an optional setting.
fn env_optional(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Option<u64>) {
    if let Some(raw) = lookup(key) {
        match raw.trim() {
            "" | "0" | "off" => *slot = None,
            value => match value.parse() {
                Ok(v) => *slot = Some(v),
                Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
            },
        }
    }
}
