//! Face and eye detection.
//!
//! [`FaceDetector`] is the seam through which the quality gate and the encoder
//! find faces. It is constructed once and shared immutably. [`ScrfdDetector`]
//! is the production implementation: SCRFD via ONNX Runtime with 3-stride
//! anchor decoding and NMS. Eye boxes are derived from its landmarks.

use crate::types::{FaceRegion, Rect};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Eye box side as a fraction of the face width.
const EYE_BOX_RATIO: f32 = 0.25;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector session poisoned")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces and eyes in grayscale images.
pub trait FaceDetector: Send + Sync {
    /// Faces at least `min_size` pixels on both sides, in image coordinates.
    fn detect_faces(&self, gray: &GrayImage, min_size: u32) -> Result<Vec<FaceRegion>, DetectorError>;

    /// Eye bounding boxes, in image coordinates.
    fn detect_eyes(&self, gray: &GrayImage) -> Result<Vec<Rect>, DetectorError>;
}

/// The face with the largest bounding-box area; the earliest wins ties.
pub fn largest_face(faces: &[FaceRegion]) -> Option<&FaceRegion> {
    faces.iter().fold(None, |best: Option<&FaceRegion>, f| match best {
        Some(b) if b.bounds.area() >= f.bounds.area() => Some(b),
        _ => Some(f),
    })
}

/// Raw detection in floating-point frame coordinates.
#[derive(Debug, Clone)]
struct Detection {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
    /// [left_eye, right_eye, nose, left_mouth, right_mouth]
    landmarks: Option<[(f32, f32); 5]>,
}

impl Detection {
    fn to_region(&self, img_w: u32, img_h: u32) -> FaceRegion {
        let x1 = self.x.max(0.0).round() as u32;
        let y1 = self.y.max(0.0).round() as u32;
        let x2 = (self.x + self.width).max(0.0).round() as u32;
        let y2 = (self.y + self.height).max(0.0).round() as u32;
        let bounds = Rect::new(x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1)).clamp_to(img_w, img_h);
        FaceRegion {
            bounds,
            confidence: self.confidence,
            eyes: self.landmarks.map(|l| [l[0], l[1]]),
        }
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD face detector.
pub struct ScrfdDetector {
    session: Mutex<Session>,
    /// Per-stride output indices for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            stride_indices,
        })
    }

    /// Run the network and return detections sorted by confidence.
    fn run(&self, gray: &GrayImage) -> Result<Vec<Detection>, DetectorError> {
        let (width, height) = (gray.width() as usize, gray.height() as usize);
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(gray.as_raw(), width, height);

        let mut session = self.session.lock().map_err(|_| DetectorError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            all.extend(decode_stride(scores, bboxes, kps, stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        Ok(nms(all, SCRFD_NMS_THRESHOLD))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect_faces(&self, gray: &GrayImage, min_size: u32) -> Result<Vec<FaceRegion>, DetectorError> {
        let faces: Vec<FaceRegion> = self
            .run(gray)?
            .iter()
            .map(|d| d.to_region(gray.width(), gray.height()))
            .filter(|f| f.bounds.width >= min_size && f.bounds.height >= min_size)
            .collect();
        tracing::trace!(count = faces.len(), min_size, "faces detected");
        Ok(faces)
    }

    fn detect_eyes(&self, gray: &GrayImage) -> Result<Vec<Rect>, DetectorError> {
        let detections = self.run(gray)?;
        let Some(face) = detections.first() else {
            return Ok(Vec::new());
        };
        let Some(landmarks) = face.landmarks else {
            return Ok(Vec::new());
        };
        Ok(eye_boxes(&landmarks, face.width, gray.width(), gray.height()))
    }
}

/// Square boxes centered on the two eye landmarks.
fn eye_boxes(landmarks: &[(f32, f32); 5], face_width: f32, img_w: u32, img_h: u32) -> Vec<Rect> {
    let side = (face_width * EYE_BOX_RATIO).max(1.0);
    landmarks[..2]
        .iter()
        .map(|&(ex, ey)| {
            let x = (ex - side / 2.0).max(0.0).round() as u32;
            let y = (ey - side / 2.0).max(0.0).round() as u32;
            Rect::new(x, y, side.round() as u32, side.round() as u32).clamp_to(img_w, img_h)
        })
        .filter(|r| r.area() > 0)
        .collect()
}

/// Letterbox a grayscale frame into a NCHW float tensor.
fn preprocess(frame: &[u8], width: usize, height: usize) -> (Array4<f32>, LetterboxInfo) {
    let size = SCRFD_INPUT_SIZE;
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let inv_scale = 1.0 / scale;
    let mut resized = vec![0u8; new_w * new_h];
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy) + tr * fx * (1.0 - fy) + bl * (1.0 - fx) * fy + br * fx * fy;
            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let inside = y >= pad_y_start && y < pad_y_start + new_h && x >= pad_x_start && x < pad_x_start + new_w;
            let pixel = if inside {
                resized[(y - pad_y_start) * new_w + (x - pad_x_start)] as f32
            } else {
                SCRFD_MEAN
            };
            let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Map output tensors to stride slots by name ("score_8", "bbox_16", ...),
/// falling back to positional order [scores, bboxes, kps] × [8, 16, 32].
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize, 0usize); 3];
    for (i, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => named[i] = (s, b, k),
            _ => {
                tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    named
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unmap = |v: f32, pad: f32| (v - pad) / letterbox.scale;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * s;
        let anchor_cy = (anchor_idx / grid) as f32 * s;

        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = unmap(anchor_cx - bboxes[off] * s, letterbox.pad_x);
        let y1 = unmap(anchor_cy - bboxes[off + 1] * s, letterbox.pad_y);
        let x2 = unmap(anchor_cx + bboxes[off + 2] * s, letterbox.pad_x);
        let y2 = unmap(anchor_cy + bboxes[off + 3] * s, letterbox.pad_y);

        let kps_off = idx * 10;
        let landmarks = (kps_off + 9 < kps.len()).then(|| {
            std::array::from_fn(|i| {
                (
                    unmap(anchor_cx + kps[kps_off + i * 2] * s, letterbox.pad_x),
                    unmap(anchor_cy + kps[kps_off + i * 2 + 1] * s, letterbox.pad_y),
                )
            })
        });

        detections.push(Detection {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    detections
}

/// Non-maximum suppression; output is sorted by descending confidence.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection {
            x,
            y,
            width: w,
            height: h,
            confidence: conf,
            landmarks: None,
        }
    }

    #[test]
    fn test_largest_face_picks_area() {
        let faces = vec![
            FaceRegion::new(Rect::new(0, 0, 100, 100)),
            FaceRegion::new(Rect::new(10, 10, 150, 120)),
            FaceRegion::new(Rect::new(20, 20, 110, 110)),
        ];
        assert_eq!(largest_face(&faces).unwrap().bounds, Rect::new(10, 10, 150, 120));
        assert!(largest_face(&[]).is_none());
    }

    #[test]
    fn test_largest_face_tie_keeps_first() {
        let faces = vec![
            FaceRegion::new(Rect::new(0, 0, 100, 100)),
            FaceRegion::new(Rect::new(50, 50, 100, 100)),
        ];
        assert_eq!(largest_face(&faces).unwrap().bounds.x, 0);
    }

    #[test]
    fn test_iou_partial() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                det(5.0, 5.0, 100.0, 100.0, 0.8),
                det(0.0, 0.0, 100.0, 100.0, 0.9),
                det(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_detection_to_region_clamps() {
        let d = Detection {
            landmarks: Some([(30.0, 40.0), (70.0, 42.0), (50.0, 60.0), (35.0, 80.0), (65.0, 80.0)]),
            ..det(-10.0, 5.0, 120.0, 100.0, 0.95)
        };
        let region = d.to_region(100, 90);
        assert_eq!(region.bounds, Rect::new(0, 5, 100, 85));
        assert_eq!(region.eyes, Some([(30.0, 40.0), (70.0, 42.0)]));
    }

    #[test]
    fn test_eye_boxes_centered_on_landmarks() {
        let lm = [(40.0, 50.0), (80.0, 50.0), (60.0, 70.0), (45.0, 90.0), (75.0, 90.0)];
        let boxes = eye_boxes(&lm, 80.0, 200, 200);
        assert_eq!(boxes, vec![Rect::new(30, 40, 20, 20), Rect::new(70, 40, 20, 20)]);
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = ["bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_preprocess_letterbox_padding() {
        let frame = vec![200u8; 320 * 160];
        let (tensor, lb) = preprocess(&frame, 320, 160);
        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert!((lb.pad_y - 160.0).abs() < 1e-6);
        // Padding rows normalize to zero, content rows do not.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert!(tensor[[0, 0, 320, 320]] > 0.0);
    }
}
