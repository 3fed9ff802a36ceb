use facegate_core::{EncoderConfig, Metric, PolicyConfig, QualityConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] facegate_core::ConfigError),
    #[error("enroll.variations must not be empty")]
    NoVariations,
    #[error("{0} must be positive")]
    NonPositive(&'static str),
    #[error("invalid value {value:?} for {key}")]
    InvalidOverride { key: &'static str, value: String },
}

/// Enrollment session shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollConfig {
    /// One capture stage per entry, in order (e.g. "default", "glasses").
    pub variations: Vec<String>,
    /// Accepted frames required per stage.
    pub images_per_variation: usize,
    /// Upper bound on a whole camera enrollment.
    pub timeout_secs: u64,
}

impl Default for EnrollConfig {
    fn default() -> Self {
        Self {
            variations: vec!["default".to_string()],
            images_per_variation: 5,
            timeout_secs: 120,
        }
    }
}

/// Daemon configuration: optional TOML file, then `FACEGATE_*` overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing the SCRFD model.
    pub model_dir: PathBuf,
    /// Path to the SQLite user database.
    pub db_path: PathBuf,
    /// Frames discarded after the camera opens.
    pub warmup_frames: usize,
    /// Pause between authentication attempts.
    pub tick_interval_ms: u64,
    /// Give up on an authentication cycle after this long.
    pub auth_timeout_secs: u64,
    pub quality: QualityConfig,
    pub encoder: EncoderConfig,
    pub policy: PolicyConfig,
    pub enroll: EnrollConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("users.db"),
            warmup_frames: facegate_hw::DEFAULT_WARMUP_FRAMES,
            tick_interval_ms: 1000,
            auth_timeout_secs: 30,
            quality: QualityConfig::default(),
            encoder: EncoderConfig::default(),
            policy: PolicyConfig::default(),
            enroll: EnrollConfig::default(),
        }
    }
}

impl Config {
    /// Load from the config file (if any) and the process environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os("FACEGATE_CONFIG").map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(default_config_path);

        let mut config = if explicit.is_some() || path.exists() {
            tracing::info!(path = %path.display(), "loading config file");
            Self::from_file(&path)?
        } else {
            tracing::info!(path = %path.display(), "no config file; using defaults");
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `FACEGATE_*` overrides read through `lookup`. Values that fail
    /// to parse are errors.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("FACEGATE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(&lookup, "FACEGATE_WARMUP_FRAMES", &mut self.warmup_frames)?;
        override_parsed(&lookup, "FACEGATE_TICK_INTERVAL_MS", &mut self.tick_interval_ms)?;
        override_parsed(&lookup, "FACEGATE_AUTH_TIMEOUT_SECS", &mut self.auth_timeout_secs)?;
        override_parsed(&lookup, "FACEGATE_TOP_K", &mut self.policy.top_k)?;
        override_parsed(&lookup, "FACEGATE_BEST_THRESHOLD", &mut self.policy.best_threshold)?;
        override_parsed(&lookup, "FACEGATE_MEAN_THRESHOLD", &mut self.policy.mean_threshold)?;
        override_parsed(&lookup, "FACEGATE_MARGIN", &mut self.policy.margin)?;
        override_parsed(&lookup, "FACEGATE_MIN_SAMPLES", &mut self.policy.min_samples)?;
        override_parsed::<Metric>(&lookup, "FACEGATE_METRIC", &mut self.policy.metric)?;
        override_parsed(
            &lookup,
            "FACEGATE_IMAGES_PER_VARIATION",
            &mut self.enroll.images_per_variation,
        )?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quality.validate()?;
        self.encoder.validate()?;
        self.policy.validate()?;
        if self.enroll.variations.is_empty() {
            return Err(ConfigError::NoVariations);
        }
        if self.enroll.images_per_variation == 0 {
            return Err(ConfigError::NonPositive("enroll.images_per_variation"));
        }
        if self.enroll.timeout_secs == 0 {
            return Err(ConfigError::NonPositive("enroll.timeout_secs"));
        }
        if self.auth_timeout_secs == 0 {
            return Err(ConfigError::NonPositive("auth_timeout_secs"));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn enroll_timeout(&self) -> Duration {
        Duration::from_secs(self.enroll.timeout_secs)
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride { key, value: raw.clone() })?;
    Ok(())
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("facegate")
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("facegate/config.toml")
}
