//! facegate-core: Face authentication core.
//!
//! Quality gating, a classical intensity-based face signature, enrollment
//! augmentation, template scoring and the multi-criteria access decision.
//! Face detection is injected through [`FaceDetector`]; the bundled
//! implementation runs SCRFD via ONNX Runtime.

pub mod augment;
pub mod config;
pub mod detector;
pub mod encoder;
pub mod imgproc;
pub mod matcher;
pub mod quality;
pub mod similarity;
pub mod types;

pub use augment::AugmentationGenerator;
pub use config::{ConfigError, EncoderConfig, PolicyConfig, QualityConfig};
pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use encoder::FaceEncoder;
pub use matcher::{score_all, DecisionPolicy};
pub use quality::{QualityGate, QualityRejection, QualityReport};
pub use similarity::Metric;
pub use types::{
    AccessLevel, DecisionResult, DenialReason, FaceRegion, FeatureVector, RawFrame, Rect, ScoreEntry, UserProfile,
};
