//! Per-user score aggregation and the multi-criteria access decision.

use crate::config::{ConfigError, PolicyConfig};
use crate::similarity::Metric;
use crate::types::{DecisionResult, DenialReason, FeatureVector, ScoreEntry, UserProfile};

/// Score `query` against every user's templates.
///
/// For each user, `best_score` is the highest template similarity and
/// `mean_top_k` the mean of the `min(top_k, templates)` highest. Users without
/// templates score `(0.0, 0.0)`. The result is sorted by descending
/// `best_score`; equal scores keep input order.
pub fn score_all<'a>(
    query: &FeatureVector,
    users: &'a [UserProfile],
    top_k: usize,
    metric: Metric,
) -> Vec<ScoreEntry<'a>> {
    let mut entries: Vec<ScoreEntry<'a>> = users
        .iter()
        .map(|user| {
            let mut scores: Vec<f32> = user.templates.iter().map(|t| query.similarity(t, metric)).collect();
            scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

            let (best_score, mean_top_k) = match scores.first() {
                None => (0.0, 0.0),
                Some(&best) => {
                    let k = top_k.min(scores.len()).max(1);
                    (best, scores[..k].iter().sum::<f32>() / k as f32)
                }
            };
            ScoreEntry {
                user,
                best_score,
                mean_top_k,
            }
        })
        .collect();

    // Stable sort: ties keep input order.
    entries.sort_by(|a, b| {
        b.best_score
            .partial_cmp(&a.best_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    entries
}

/// Applies the ordered acceptance criteria to aggregated scores.
#[derive(Debug, Clone)]
pub struct DecisionPolicy {
    config: PolicyConfig,
}

impl DecisionPolicy {
    /// Build a policy; fails on invalid configuration.
    pub fn new(config: PolicyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn score_all<'a>(&self, query: &FeatureVector, users: &'a [UserProfile]) -> Vec<ScoreEntry<'a>> {
        score_all(query, users, self.config.top_k, self.config.metric)
    }

    /// Decide whether `query` grants access to one of `users`.
    ///
    /// Criteria, in order, against the top-ranked candidate: a candidate
    /// exists; it has at least `min_samples` templates; its best score clears
    /// `best_threshold`; its mean-top-k clears `mean_threshold`; it leads the
    /// runner-up (0.0 if none) by at least `margin`.
    pub fn decide(&self, query: &FeatureVector, users: &[UserProfile]) -> DecisionResult {
        let scored = self.score_all(query, users);
        for entry in &scored {
            tracing::trace!(
                user_id = entry.user.id,
                best = entry.best_score,
                mean_top_k = entry.mean_top_k,
                "candidate score"
            );
        }
        self.evaluate(&scored)
    }

    /// Apply the criteria to already-ranked scores.
    pub fn evaluate(&self, scored: &[ScoreEntry<'_>]) -> DecisionResult {
        let cfg = &self.config;

        let Some(top) = scored.first() else {
            return deny(None, 0.0, 0.0, DenialReason::NoCandidate);
        };
        let second_best = scored.get(1).map(|e| e.best_score).unwrap_or(0.0);
        let samples = top.user.templates.len();

        let reason = if samples < cfg.min_samples {
            Some(DenialReason::InsufficientSamples {
                found: samples,
                required: cfg.min_samples,
            })
        } else if top.best_score < cfg.best_threshold {
            Some(DenialReason::BestBelowThreshold {
                best: top.best_score,
                threshold: cfg.best_threshold,
            })
        } else if top.mean_top_k < cfg.mean_threshold {
            Some(DenialReason::MeanBelowThreshold {
                mean: top.mean_top_k,
                threshold: cfg.mean_threshold,
                top_k: cfg.top_k,
            })
        } else if top.best_score - second_best < cfg.margin {
            Some(DenialReason::InsufficientMargin {
                margin: top.best_score - second_best,
                required: cfg.margin,
            })
        } else {
            None
        };

        match reason {
            Some(reason) => deny(Some(top.user), top.best_score, top.mean_top_k, reason),
            None => {
                tracing::info!(
                    user_id = top.user.id,
                    user = %top.user.name,
                    best = top.best_score,
                    mean_top_k = top.mean_top_k,
                    "access granted"
                );
                DecisionResult {
                    granted: true,
                    candidate: Some(top.user.clone()),
                    best_score: top.best_score,
                    mean_top_k: top.mean_top_k,
                    reason: None,
                }
            }
        }
    }
}

fn deny(candidate: Option<&UserProfile>, best_score: f32, mean_top_k: f32, reason: DenialReason) -> DecisionResult {
    tracing::info!(
        candidate = candidate.map(|u| u.id),
        best = best_score,
        mean_top_k,
        %reason,
        "access denied"
    );
    DecisionResult {
        granted: false,
        candidate: candidate.cloned(),
        best_score,
        mean_top_k,
        reason: Some(reason),
    }
}
