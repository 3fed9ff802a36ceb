//! Tunable parameters for the quality gate, encoder and decision policy.
//!
//! All three deserialize from TOML sections with every field optional.
//! `validate()` is meant to run once at startup; an invalid value is fatal.

use crate::similarity::Metric;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("top_k must be positive")]
    NonPositiveTopK,
    #[error("min_samples must be positive")]
    NonPositiveMinSamples,
    #[error("{name} must be within [-1, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f32 },
    #[error("margin must be a non-negative number, got {0}")]
    InvalidMargin(f32),
    #[error("brightness window [{min}, {max}] is empty or outside [0, 255]")]
    InvalidBrightnessWindow { min: f64, max: f64 },
    #[error("min_sharpness must be a non-negative number, got {0}")]
    InvalidSharpness(f64),
    #[error("canonical_size must be between 8 and 512, got {0}")]
    InvalidCanonicalSize(u32),
    #[error("clahe_grid must be positive and no larger than canonical_size")]
    InvalidClaheGrid,
    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("face_padding must be within [0, 1], got {0}")]
    InvalidPadding(f32),
}

/// Quality gate thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Minimum face width and height in pixels.
    pub min_face_size: u32,
    pub min_brightness: f64,
    pub max_brightness: f64,
    /// Minimum Laplacian variance over the face region.
    pub min_sharpness: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_face_size: 100,
            min_brightness: 50.0,
            max_brightness: 200.0,
            min_sharpness: 100.0,
        }
    }
}

impl QualityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_face_size == 0 {
            return Err(ConfigError::NonPositive {
                name: "min_face_size",
                value: 0.0,
            });
        }
        let (min, max) = (self.min_brightness, self.max_brightness);
        if !(0.0..=255.0).contains(&min) || !(0.0..=255.0).contains(&max) || min > max {
            return Err(ConfigError::InvalidBrightnessWindow { min, max });
        }
        if !(self.min_sharpness >= 0.0) {
            return Err(ConfigError::InvalidSharpness(self.min_sharpness));
        }
        Ok(())
    }
}

/// Face encoder parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Side of the square the face is resized to; vectors have `canonical_size²` values.
    pub canonical_size: u32,
    /// Fraction of the face box added on each side before cropping.
    pub face_padding: f32,
    /// Smallest face the encoder's own detection pass accepts.
    pub min_face_size: u32,
    pub clahe_clip_limit: f32,
    pub clahe_grid: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            canonical_size: 64,
            face_padding: 0.2,
            min_face_size: 80,
            clahe_clip_limit: 2.0,
            clahe_grid: 8,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(8..=512).contains(&self.canonical_size) {
            return Err(ConfigError::InvalidCanonicalSize(self.canonical_size));
        }
        if !(0.0..=1.0).contains(&self.face_padding) {
            return Err(ConfigError::InvalidPadding(self.face_padding));
        }
        if self.clahe_grid == 0 || self.clahe_grid > self.canonical_size {
            return Err(ConfigError::InvalidClaheGrid);
        }
        if !(self.clahe_clip_limit > 0.0) {
            return Err(ConfigError::NonPositive {
                name: "clahe_clip_limit",
                value: self.clahe_clip_limit as f64,
            });
        }
        Ok(())
    }

    /// Length of every vector this encoder produces.
    pub fn dimension(&self) -> usize {
        (self.canonical_size * self.canonical_size) as usize
    }
}

/// Acceptance policy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub top_k: usize,
    pub best_threshold: f32,
    pub mean_threshold: f32,
    /// Required gap between the best and second-best candidates.
    pub margin: f32,
    pub min_samples: usize,
    pub metric: Metric,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            best_threshold: 0.91,
            mean_threshold: 0.88,
            margin: 0.04,
            min_samples: 3,
            metric: Metric::Cosine,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.top_k == 0 {
            return Err(ConfigError::NonPositiveTopK);
        }
        if self.min_samples == 0 {
            return Err(ConfigError::NonPositiveMinSamples);
        }
        for (name, value) in [
            ("best_threshold", self.best_threshold),
            ("mean_threshold", self.mean_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }
        if !(self.margin >= 0.0) || !self.margin.is_finite() {
            return Err(ConfigError::InvalidMargin(self.margin));
        }
        Ok(())
    }
}
