use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::similarity::Metric;

/// A captured 8-bit, 3-channel color frame.
///
/// Owned by the capture side and only borrowed by the core for a single call.
pub type RawFrame = RgbImage;

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }

    /// Clip the rectangle to an image of the given size.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        let x = self.x.min(width);
        let y = self.y.min(height);
        let x2 = self.x.saturating_add(self.width).min(width);
        let y2 = self.y.saturating_add(self.height).min(height);
        Rect::new(x, y, x2 - x, y2 - y)
    }

    /// Grow the rectangle by `ratio` of its size on every side, clipped to the image.
    pub fn padded(&self, ratio: f32, width: u32, height: u32) -> Rect {
        let pad_w = (self.width as f32 * ratio) as u32;
        let pad_h = (self.height as f32 * ratio) as u32;
        let x1 = self.x.saturating_sub(pad_w);
        let y1 = self.y.saturating_sub(pad_h);
        let x2 = (self.x + self.width + pad_w).min(width);
        let y2 = (self.y + self.height + pad_h).min(height);
        Rect::new(x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
    }
}

/// A detected face, with the eye pair when the detector reports one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub bounds: Rect,
    /// Detection confidence in [0, 1].
    pub confidence: f32,
    /// Left and right eye centers in frame coordinates.
    pub eyes: Option<[(f32, f32); 2]>,
}

impl FaceRegion {
    pub fn new(bounds: Rect) -> Self {
        Self {
            bounds,
            confidence: 1.0,
            eyes: None,
        }
    }
}

/// Fixed-length face signature produced by the encoder.
///
/// Vectors produced by [`FaceEncoder`](crate::FaceEncoder) always have unit L2 norm.
/// Vectors loaded from storage are taken as-is; scoring tolerates empty or
/// mismatched ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// L2-normalize `values`. Returns `None` when the norm is zero.
    pub fn normalized(mut values: Vec<f32>) -> Option<Self> {
        let norm = l2_norm(&values);
        if norm <= 0.0 || !norm.is_finite() {
            return None;
        }
        for v in values.iter_mut() {
            *v /= norm;
        }
        Some(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Similarity to another vector under `metric`. See [`crate::similarity`].
    pub fn similarity(&self, other: &FeatureVector, metric: Metric) -> f32 {
        crate::similarity::similarity(&self.values, &other.values, metric)
    }
}

pub(crate) fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Access level granted to an enrolled user. Lower numbers are more privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AccessLevel {
    /// Sees every user and may delete other users.
    Admin = 1,
    /// Sees every user.
    Operator = 2,
    /// Sees only its own record.
    Standard = 3,
}

impl AccessLevel {
    pub fn can_list_all(self) -> bool {
        matches!(self, AccessLevel::Admin | AccessLevel::Operator)
    }

    pub fn can_delete_users(self) -> bool {
        self == AccessLevel::Admin
    }
}

impl TryFrom<u8> for AccessLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AccessLevel::Admin),
            2 => Ok(AccessLevel::Operator),
            3 => Ok(AccessLevel::Standard),
            other => Err(format!("invalid access level {other} (expected 1, 2 or 3)")),
        }
    }
}

impl From<AccessLevel> for u8 {
    fn from(level: AccessLevel) -> u8 {
        level as u8
    }
}

/// An enrolled user and their templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub name: String,
    pub access_level: AccessLevel,
    /// May be empty for a placeholder account, which can never be matched.
    pub templates: Vec<FeatureVector>,
}

/// Per-user aggregate for one query vector.
#[derive(Debug, Clone, Copy)]
pub struct ScoreEntry<'a> {
    pub user: &'a UserProfile,
    pub best_score: f32,
    pub mean_top_k: f32,
}

/// Why the decision policy refused access.
#[derive(Debug, Clone, PartialEq)]
pub enum DenialReason {
    NoCandidate,
    InsufficientSamples { found: usize, required: usize },
    BestBelowThreshold { best: f32, threshold: f32 },
    MeanBelowThreshold { mean: f32, threshold: f32, top_k: usize },
    InsufficientMargin { margin: f32, required: f32 },
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::NoCandidate => write!(f, "no candidate found"),
            DenialReason::InsufficientSamples { found, required } => write!(
                f,
                "candidate has only {found} template(s); minimum required is {required}"
            ),
            DenialReason::BestBelowThreshold { best, threshold } => write!(
                f,
                "best similarity {best:.3} below threshold {threshold}"
            ),
            DenialReason::MeanBelowThreshold {
                mean,
                threshold,
                top_k,
            } => write!(
                f,
                "mean of top-{top_k} similarities {mean:.3} below threshold {threshold}"
            ),
            DenialReason::InsufficientMargin { margin, required } => write!(
                f,
                "margin between top two candidates insufficient ({margin:.4} < {required})"
            ),
        }
    }
}

/// Outcome of one access decision.
#[derive(Debug, Clone)]
pub struct DecisionResult {
    pub granted: bool,
    pub candidate: Option<UserProfile>,
    pub best_score: f32,
    pub mean_top_k: f32,
    /// Set on every denial, `None` when granted.
    pub reason: Option<DenialReason>,
}

impl DecisionResult {
    pub fn reason_text(&self) -> Option<String> {
        self.reason.as_ref().map(|r| r.to_string())
    }
}
