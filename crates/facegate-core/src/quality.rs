//! Per-frame quality gate: face present, large enough, well lit and sharp.

use crate::config::QualityConfig;
use crate::detector::{largest_face, FaceDetector};
use crate::imgproc;
use crate::types::{FaceRegion, RawFrame};
use std::sync::Arc;
use thiserror::Error;

/// Why a frame was judged unusable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QualityRejection {
    #[error("empty or invalid image")]
    EmptyFrame,
    #[error("no face detected")]
    NoFace,
    #[error("face too small ({width}x{height} pixels, minimum {min}x{min})")]
    FaceTooSmall { width: u32, height: u32, min: u32 },
    #[error("inadequate lighting (mean brightness {brightness:.2}, expected {min} to {max})")]
    InadequateLighting { brightness: f64, min: f64, max: f64 },
    #[error("blurred image (face region too small for sharpness analysis)")]
    RegionTooSmall,
    #[error("blurred image (Laplacian variance {variance:.2}, minimum {min})")]
    Blurred { variance: f64, min: f64 },
}

/// Measurements of a frame that passed the gate.
#[derive(Debug, Clone)]
pub struct QualityReport {
    pub face: FaceRegion,
    pub brightness: f64,
    pub sharpness: f64,
}

/// Judges whether a frame is usable for encoding.
#[derive(Clone)]
pub struct QualityGate {
    detector: Arc<dyn FaceDetector>,
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(detector: Arc<dyn FaceDetector>, config: QualityConfig) -> Self {
        Self { detector, config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Run the checks in order, stopping at the first failure.
    pub fn check(&self, frame: &RawFrame) -> Result<QualityReport, QualityRejection> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(QualityRejection::EmptyFrame);
        }

        let gray = imgproc::to_gray(frame);
        let min = self.config.min_face_size;

        let faces = self.detector.detect_faces(&gray, min).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "face detection failed; treating as no face");
            Vec::new()
        });
        let face = largest_face(&faces).cloned().ok_or(QualityRejection::NoFace)?;

        let (width, height) = (face.bounds.width, face.bounds.height);
        if width < min || height < min {
            return Err(QualityRejection::FaceTooSmall { width, height, min });
        }

        let roi = imgproc::crop(&gray, face.bounds);

        let brightness = imgproc::mean_intensity(&roi);
        let (lo, hi) = (self.config.min_brightness, self.config.max_brightness);
        if brightness < lo || brightness > hi {
            return Err(QualityRejection::InadequateLighting {
                brightness,
                min: lo,
                max: hi,
            });
        }

        let sharpness = imgproc::laplacian_variance(&roi).ok_or(QualityRejection::RegionTooSmall)?;
        if sharpness < self.config.min_sharpness {
            return Err(QualityRejection::Blurred {
                variance: sharpness,
                min: self.config.min_sharpness,
            });
        }

        tracing::debug!(
            x = face.bounds.x,
            y = face.bounds.y,
            width,
            height,
            brightness,
            sharpness,
            "frame passed quality gate"
        );

        Ok(QualityReport {
            face,
            brightness,
            sharpness,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::types::Rect;
    use image::{GrayImage, Rgb};

    /// Reports a fixed set of faces and eyes regardless of input or minimum size.
    pub(crate) struct FixedDetector {
        pub faces: Vec<Rect>,
        pub eyes: Vec<Rect>,
    }

    impl FaceDetector for FixedDetector {
        fn detect_faces(&self, _gray: &GrayImage, _min_size: u32) -> Result<Vec<FaceRegion>, DetectorError> {
            Ok(self.faces.iter().map(|&r| FaceRegion::new(r)).collect())
        }

        fn detect_eyes(&self, _gray: &GrayImage) -> Result<Vec<Rect>, DetectorError> {
            Ok(self.eyes.clone())
        }
    }

    pub(crate) struct FailingDetector;

    impl FaceDetector for FailingDetector {
        fn detect_faces(&self, _gray: &GrayImage, _min_size: u32) -> Result<Vec<FaceRegion>, DetectorError> {
            Err(DetectorError::InferenceFailed("boom".into()))
        }

        fn detect_eyes(&self, _gray: &GrayImage) -> Result<Vec<Rect>, DetectorError> {
            Err(DetectorError::InferenceFailed("boom".into()))
        }
    }

    /// Mid-gray checkerboard: brightness ~127, very sharp.
    pub(crate) fn textured_frame(width: u32, height: u32) -> RawFrame {
        RawFrame::from_fn(width, height, |x, y| {
            let v = if (x / 2 + y / 2) % 2 == 0 { 77 } else { 177 };
            Rgb([v, v, v])
        })
    }

    fn gate(faces: Vec<Rect>) -> QualityGate {
        QualityGate::new(Arc::new(FixedDetector { faces, eyes: vec![] }), QualityConfig::default())
    }

    #[test]
    fn test_empty_frame_rejected() {
        let result = gate(vec![]).check(&RawFrame::new(0, 0));
        assert_eq!(result.unwrap_err(), QualityRejection::EmptyFrame);
        assert_eq!(QualityRejection::EmptyFrame.to_string(), "empty or invalid image");
    }

    #[test]
    fn test_no_face_rejected() {
        let result = gate(vec![]).check(&textured_frame(320, 240));
        assert_eq!(result.unwrap_err(), QualityRejection::NoFace);
    }

    #[test]
    fn test_detector_failure_is_no_face() {
        let gate = QualityGate::new(Arc::new(FailingDetector), QualityConfig::default());
        assert_eq!(gate.check(&textured_frame(320, 240)).unwrap_err(), QualityRejection::NoFace);
    }

    #[test]
    fn test_face_too_small_rejected() {
        let err = gate(vec![Rect::new(10, 10, 120, 90)])
            .check(&textured_frame(320, 240))
            .unwrap_err();
        assert_eq!(
            err,
            QualityRejection::FaceTooSmall {
                width: 120,
                height: 90,
                min: 100
            }
        );
    }

    #[test]
    fn test_largest_face_is_judged() {
        // Small dark face plus a large well-lit one: the large one decides.
        let mut frame = textured_frame(400, 300);
        for y in 0..110 {
            for x in 280..390 {
                frame.put_pixel(x, y, Rgb([5, 5, 5]));
            }
        }
        let gate = gate(vec![Rect::new(280, 0, 110, 110), Rect::new(20, 20, 200, 200)]);
        let report = gate.check(&frame).unwrap();
        assert_eq!(report.face.bounds, Rect::new(20, 20, 200, 200));
    }

    #[test]
    fn test_dark_face_rejected() {
        let frame = RawFrame::from_fn(320, 240, |x, y| {
            let v = if (x + y) % 2 == 0 { 10 } else { 40 };
            Rgb([v, v, v])
        });
        let err = gate(vec![Rect::new(50, 50, 150, 150)]).check(&frame).unwrap_err();
        assert!(matches!(err, QualityRejection::InadequateLighting { .. }), "{err}");
        assert!(err.to_string().starts_with("inadequate lighting"));
    }

    #[test]
    fn test_overexposed_face_rejected() {
        let frame = RawFrame::from_pixel(320, 240, Rgb([240, 240, 240]));
        let err = gate(vec![Rect::new(50, 50, 150, 150)]).check(&frame).unwrap_err();
        assert!(matches!(err, QualityRejection::InadequateLighting { .. }));
    }

    #[test]
    fn test_flat_face_is_blurred() {
        let frame = RawFrame::from_pixel(320, 240, Rgb([128, 128, 128]));
        let err = gate(vec![Rect::new(50, 50, 150, 150)]).check(&frame).unwrap_err();
        assert!(matches!(err, QualityRejection::Blurred { .. }));
        assert!(err.to_string().starts_with("blurred image"));
    }

    #[test]
    fn test_good_frame_accepted() {
        let report = gate(vec![Rect::new(50, 50, 150, 150)])
            .check(&textured_frame(320, 240))
            .unwrap();
        assert!((report.brightness - 127.0).abs() < 2.0, "{}", report.brightness);
        assert!(report.sharpness >= 100.0);
    }
}
