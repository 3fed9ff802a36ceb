//! Classical face signature: crop, eye-level alignment, canonical resize,
//! CLAHE, and L2 normalization of the raw intensities.
//!
//! The encoder is best-effort. When no face is found it encodes a centered
//! square crop of the whole frame instead of failing, and relies on the
//! quality gate to have rejected faceless frames beforehand. On enrollment
//! paths that bypass the gate (directory import) this can admit non-face
//! content into a user's templates.

use crate::config::EncoderConfig;
use crate::detector::{largest_face, FaceDetector};
use crate::imgproc;
use crate::types::{FeatureVector, RawFrame, Rect};
use std::sync::Arc;

/// Smallest side an aligned crop may have before it counts as degenerate.
const MIN_CROP_SIDE: u32 = 2;

/// Turns a frame into a fixed-length unit-norm [`FeatureVector`].
#[derive(Clone)]
pub struct FaceEncoder {
    detector: Arc<dyn FaceDetector>,
    config: EncoderConfig,
}

impl FaceEncoder {
    pub fn new(detector: Arc<dyn FaceDetector>, config: EncoderConfig) -> Self {
        Self { detector, config }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Length of every vector this encoder produces.
    pub fn dimension(&self) -> usize {
        self.config.dimension()
    }

    /// Encode a frame. Returns `None` when no usable vector can be produced.
    pub fn encode(&self, frame: &RawFrame) -> Option<FeatureVector> {
        if frame.width() == 0 || frame.height() == 0 {
            return None;
        }

        let region = self.face_crop(frame);
        let size = self.config.canonical_size;
        let resized = imgproc::resize(&region, size, size);

        let mut gray = imgproc::to_gray(&resized);
        imgproc::clahe(&mut gray, self.config.clahe_grid, self.config.clahe_clip_limit);

        let values: Vec<f32> = gray.as_raw().iter().map(|&p| p as f32 / 255.0).collect();
        let vector = FeatureVector::normalized(values);
        if vector.is_none() {
            tracing::debug!("encoding failed: zero-norm signature");
        }
        vector
    }

    /// Locate, pad and align the face, or fall back to a centered square.
    fn face_crop(&self, frame: &RawFrame) -> RawFrame {
        let gray = imgproc::to_gray(frame);
        let faces = self
            .detector
            .detect_faces(&gray, self.config.min_face_size)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "face detection failed; using center crop");
                Vec::new()
            });

        let Some(face) = largest_face(&faces) else {
            tracing::debug!("no face detected; encoding center crop");
            return center_crop(frame);
        };

        let padded = face
            .bounds
            .padded(self.config.face_padding, frame.width(), frame.height());
        let mut crop = imgproc::crop(frame, padded);

        if let Some(angle) = self.eye_angle(&imgproc::crop(&gray, padded)) {
            tracing::trace!(angle, "aligning face by eye line");
            crop = imgproc::rotate_about_center(&crop, angle);
        }

        if crop.width() < MIN_CROP_SIDE || crop.height() < MIN_CROP_SIDE {
            tracing::debug!(
                width = crop.width(),
                height = crop.height(),
                "degenerate face crop; encoding center crop"
            );
            return center_crop(frame);
        }
        crop
    }

    /// Angle in degrees of the line through the two widest eyes, if found.
    fn eye_angle(&self, face_gray: &image::GrayImage) -> Option<f32> {
        let eyes = match self.detector.detect_eyes(face_gray) {
            Ok(eyes) => eyes,
            Err(e) => {
                tracing::warn!(error = %e, "eye detection failed; skipping alignment");
                return None;
            }
        };
        eye_line_angle(&eyes)
    }
}

fn center_crop(frame: &RawFrame) -> RawFrame {
    imgproc::crop(frame, imgproc::center_square(frame.width(), frame.height()))
}

/// Pick the two widest eye boxes, order them left to right, and return the
/// angle of the line between their centers in degrees.
pub fn eye_line_angle(eyes: &[Rect]) -> Option<f32> {
    if eyes.len() < 2 {
        return None;
    }
    let mut by_width: Vec<&Rect> = eyes.iter().collect();
    by_width.sort_by(|a, b| b.width.cmp(&a.width));

    let mut centers = [by_width[0].center(), by_width[1].center()];
    centers.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let [(xl, yl), (xr, yr)] = centers;
    Some((yr - yl).atan2(xr - xl).to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::tests::{textured_frame, FailingDetector, FixedDetector};
    use image::Rgb;

    fn encoder(faces: Vec<Rect>, eyes: Vec<Rect>) -> FaceEncoder {
        FaceEncoder::new(Arc::new(FixedDetector { faces, eyes }), EncoderConfig::default())
    }

    fn gradient_frame(width: u32, height: u32) -> RawFrame {
        RawFrame::from_fn(width, height, |x, y| {
            let v = ((x * 3 + y * 5) % 256) as u8;
            Rgb([v, v.wrapping_add(40), v / 2])
        })
    }

    #[test]
    fn test_encoded_vector_is_unit_norm() {
        let enc = encoder(vec![Rect::new(60, 40, 160, 160)], vec![]);
        let v = enc.encode(&gradient_frame(320, 240)).unwrap();
        assert_eq!(v.len(), 64 * 64);
        assert!((v.norm() - 1.0).abs() < 1e-4, "norm = {}", v.norm());
    }

    #[test]
    fn test_no_face_falls_back_to_center_crop() {
        // A faceless frame still encodes.
        let frame = gradient_frame(320, 240);
        let v = encoder(vec![], vec![]).encode(&frame).unwrap();
        assert!((v.norm() - 1.0).abs() < 1e-4);

        // Identical to encoding the explicit center square.
        let square = imgproc::crop(&frame, Rect::new(40, 0, 240, 240));
        let w = encoder(vec![], vec![]).encode(&square).unwrap();
        assert!((v.similarity(&w, crate::Metric::Cosine) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_frame_fails() {
        assert!(encoder(vec![], vec![]).encode(&RawFrame::new(0, 0)).is_none());
    }

    #[test]
    fn test_black_frame_encodes_uniform_signature() {
        // CLAHE lifts a flat black crop to one non-zero level.
        let frame = RawFrame::new(200, 200);
        let v = encoder(vec![Rect::new(20, 20, 150, 150)], vec![]).encode(&frame).unwrap();
        let expected = 1.0 / 64.0;
        assert!(v.values.iter().all(|&x| (x - expected).abs() < 1e-6));
    }

    #[test]
    fn test_degenerate_crop_falls_back_to_center_crop() {
        // A 1-pixel-wide box at the right edge pads to a 1x240 crop.
        let frame = gradient_frame(320, 240);
        let v = encoder(vec![Rect::new(319, 0, 1, 240)], vec![]).encode(&frame).unwrap();

        let square = imgproc::crop(&frame, Rect::new(40, 0, 240, 240));
        let w = encoder(vec![], vec![]).encode(&square).unwrap();
        assert!((v.similarity(&w, crate::Metric::Cosine) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_detector_failure_falls_back_to_center_crop() {
        let frame = gradient_frame(320, 240);
        let failing = FaceEncoder::new(Arc::new(FailingDetector), EncoderConfig::default());
        let v = failing.encode(&frame).unwrap();
        let w = encoder(vec![], vec![]).encode(&frame).unwrap();
        assert_eq!(v, w);
    }

    #[test]
    fn test_deterministic() {
        let enc = encoder(
            vec![Rect::new(60, 40, 160, 160)],
            vec![Rect::new(30, 50, 30, 20), Rect::new(110, 60, 30, 20)],
        );
        let frame = textured_frame(320, 240);
        assert_eq!(enc.encode(&frame), enc.encode(&frame));
    }

    #[test]
    fn test_eye_alignment_changes_signature() {
        let frame = gradient_frame(320, 240);
        let plain = encoder(vec![Rect::new(60, 40, 160, 160)], vec![]).encode(&frame).unwrap();
        let aligned = encoder(
            vec![Rect::new(60, 40, 160, 160)],
            vec![Rect::new(30, 40, 30, 20), Rect::new(120, 70, 30, 20)],
        )
        .encode(&frame)
        .unwrap();
        assert_ne!(plain, aligned);
        assert!((aligned.norm() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_eye_line_angle_uses_two_widest() {
        let eyes = [
            Rect::new(100, 60, 30, 20), // right, lower
            Rect::new(0, 0, 5, 5),      // spurious, narrow
            Rect::new(20, 40, 30, 20),  // left
        ];
        // Centers (35, 50) and (115, 70): atan2(20, 80).
        let angle = eye_line_angle(&eyes).unwrap();
        assert!((angle - 20f32.atan2(80.0).to_degrees()).abs() < 1e-4);
    }

    #[test]
    fn test_eye_line_angle_needs_two() {
        assert!(eye_line_angle(&[Rect::new(0, 0, 10, 10)]).is_none());
        assert!(eye_line_angle(&[]).is_none());
    }

    #[test]
    fn test_level_eyes_give_zero_angle() {
        let eyes = [Rect::new(80, 40, 20, 10), Rect::new(20, 40, 20, 10)];
        assert_eq!(eye_line_angle(&eyes), Some(0.0));
    }
}
