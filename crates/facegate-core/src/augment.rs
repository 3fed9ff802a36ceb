//! Enrollment-time augmentation: one source image becomes several templates.

use crate::encoder::FaceEncoder;
use crate::imgproc;
use crate::types::{FeatureVector, RawFrame};

/// Small in-plane rotations applied to each source image, in degrees.
const ROTATIONS_DEG: [f32; 2] = [-6.0, 6.0];
/// Brightness multipliers applied to each source image.
const BRIGHTNESS_SCALES: [f32; 2] = [0.9, 1.1];

/// Upper bound on templates produced per source image.
pub const MAX_VARIANTS: usize = 2 + ROTATIONS_DEG.len() + BRIGHTNESS_SCALES.len();

/// Derives extra template vectors from a captured image so a single pose or
/// lighting condition does not dominate later scoring.
#[derive(Clone)]
pub struct AugmentationGenerator {
    encoder: FaceEncoder,
}

impl AugmentationGenerator {
    pub fn new(encoder: FaceEncoder) -> Self {
        Self { encoder }
    }

    /// Encode the original, its mirror, two small rotations and two
    /// brightness shifts. Variants that fail to encode are dropped.
    pub fn expand(&self, frame: &RawFrame) -> Vec<FeatureVector> {
        let mut variants: Vec<RawFrame> = Vec::with_capacity(MAX_VARIANTS);
        variants.push(frame.clone());
        variants.push(imgproc::flip_horizontal(frame));
        variants.extend(ROTATIONS_DEG.iter().map(|&a| imgproc::rotate_about_center(frame, a)));
        variants.extend(BRIGHTNESS_SCALES.iter().map(|&s| imgproc::scale_brightness(frame, s)));

        let vectors: Vec<FeatureVector> = variants.iter().filter_map(|v| self.encoder.encode(v)).collect();
        tracing::debug!(
            produced = vectors.len(),
            attempted = variants.len(),
            "augmented enrollment image"
        );
        vectors
    }
}
