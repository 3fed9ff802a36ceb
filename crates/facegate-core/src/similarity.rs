//! Bounded similarity between two feature vectors.
//!
//! Degenerate inputs (empty, zero-norm, or length-mismatched vectors) score
//! 0.0 instead of failing, so one corrupt template cannot abort a batch.

use serde::{Deserialize, Serialize};

/// Similarity metric, chosen once in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `dot(a, b) / (|a| * |b|)`, in [-1, 1].
    #[default]
    Cosine,
    /// `1 - euclidean(a, b) / (2 * sqrt(D))`.
    Euclidean,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Cosine => f.write_str("cosine"),
            Metric::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" => Ok(Metric::Euclidean),
            other => Err(format!("unknown metric: {other}")),
        }
    }
}

pub fn similarity(a: &[f32], b: &[f32], metric: Metric) -> f32 {
    match metric {
        Metric::Cosine => cosine_similarity(a, b),
        Metric::Euclidean => euclidean_similarity(a, b),
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 && denom.is_finite() {
        dot / denom
    } else {
        0.0
    }
}

pub fn euclidean_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let distance = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt();

    1.0 - distance / ((a.len() as f32).sqrt() * 2.0)
}
