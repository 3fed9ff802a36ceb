//! Authentication and enrollment sessions built on the core pipeline.
//!
//! A session pulls frames from a [`FrameSource`], reports progress to a
//! [`StatusSink`] and stops on success, cancellation or timeout.

use crate::config::{Config, EnrollConfig};
use crate::store::UserStore;
use facegate_core::{
    AugmentationGenerator, DecisionPolicy, DecisionResult, FaceDetector, FaceEncoder, FeatureVector, QualityGate,
    QualityRejection, RawFrame, UserProfile,
};
use facegate_hw::FrameSource;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use walkdir::WalkDir;

/// Granularity at which sleeping sessions notice cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("cancelled")]
    Cancelled,
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// The configured quality gate, encoder, augmenter and policy, sharing one detector.
#[derive(Clone)]
pub struct Pipeline {
    pub gate: QualityGate,
    pub encoder: FaceEncoder,
    pub augmenter: AugmentationGenerator,
    pub policy: DecisionPolicy,
}

impl Pipeline {
    pub fn new(detector: Arc<dyn FaceDetector>, config: &Config) -> Result<Self, facegate_core::ConfigError> {
        let encoder = FaceEncoder::new(Arc::clone(&detector), config.encoder.clone());
        Ok(Self {
            gate: QualityGate::new(detector, config.quality.clone()),
            augmenter: AugmentationGenerator::new(encoder.clone()),
            encoder,
            policy: DecisionPolicy::new(config.policy.clone())?,
        })
    }
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same token.
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Receives human-readable progress lines.
pub trait StatusSink: Send + Sync {
    fn status(&self, message: &str);
}

impl StatusSink for tokio::sync::mpsc::UnboundedSender<String> {
    fn status(&self, message: &str) {
        // Receiver gone means nobody is listening; not an error.
        let _ = self.send(message.to_string());
    }
}

/// Where a cycle gets its current user list from.
pub trait UserSource {
    fn users(&self) -> Vec<UserProfile>;
}

impl UserSource for Mutex<UserStore> {
    fn users(&self) -> Vec<UserProfile> {
        let store = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        store.list_users().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load users");
            Vec::new()
        })
    }
}

impl UserSource for Vec<UserProfile> {
    fn users(&self) -> Vec<UserProfile> {
        self.clone()
    }
}

/// Outcome of one authentication step.
#[derive(Debug, Clone)]
pub enum AuthTick {
    NoFrame,
    Rejected(QualityRejection),
    ExtractionFailed,
    Denied(DecisionResult),
    Granted(DecisionResult),
}

impl AuthTick {
    pub fn is_granted(&self) -> bool {
        matches!(self, AuthTick::Granted(_))
    }

    pub fn status_line(&self) -> String {
        match self {
            AuthTick::NoFrame => "Waiting for camera".to_string(),
            AuthTick::Rejected(reason) => format!("Frame rejected: {reason}"),
            AuthTick::ExtractionFailed => "Could not extract face features".to_string(),
            AuthTick::Denied(result) => format!(
                "Access denied: {}",
                result.reason_text().unwrap_or_else(|| "unknown".to_string())
            ),
            AuthTick::Granted(result) => format!(
                "Access granted: {}",
                result.candidate.as_ref().map(|u| u.name.as_str()).unwrap_or("?")
            ),
        }
    }
}

/// One independent authentication attempt on a single frame.
pub fn auth_tick(pipeline: &Pipeline, frame: Option<&RawFrame>, users: &[UserProfile]) -> AuthTick {
    let Some(frame) = frame else {
        return AuthTick::NoFrame;
    };
    if let Err(rejection) = pipeline.gate.check(frame) {
        tracing::debug!(%rejection, "frame rejected");
        return AuthTick::Rejected(rejection);
    }
    let Some(query) = pipeline.encoder.encode(frame) else {
        return AuthTick::ExtractionFailed;
    };
    let result = pipeline.policy.decide(&query, users);
    if result.granted {
        AuthTick::Granted(result)
    } else {
        AuthTick::Denied(result)
    }
}

/// Timing for a repeating session.
#[derive(Debug, Clone, Copy)]
pub struct CycleTiming {
    pub tick_interval: Duration,
    pub timeout: Duration,
}

/// How an authentication cycle ended.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Granted(DecisionResult),
    Cancelled,
    TimedOut { last: Option<AuthTick> },
}

/// Repeat [`auth_tick`] until access is granted, the token is cancelled or
/// the timeout elapses. Users are reloaded on every tick.
pub fn run_auth_cycle(
    pipeline: &Pipeline,
    frames: &mut dyn FrameSource,
    users: &dyn UserSource,
    sink: &dyn StatusSink,
    timing: CycleTiming,
    cancel: &CancelToken,
) -> AuthOutcome {
    let started = Instant::now();
    let mut last = None;
    let mut ticks = 0u32;

    loop {
        if cancel.is_cancelled() {
            tracing::info!(ticks, "authentication cancelled");
            sink.status("Authentication cancelled");
            return AuthOutcome::Cancelled;
        }
        if started.elapsed() >= timing.timeout {
            tracing::info!(ticks, "authentication timed out");
            sink.status("Authentication timed out");
            return AuthOutcome::TimedOut { last };
        }

        let frame = frames.next_frame();
        let tick = auth_tick(pipeline, frame.as_ref(), &users.users());
        ticks += 1;
        tracing::debug!(ticks, granted = tick.is_granted(), "authentication tick");
        sink.status(&tick.status_line());

        if let AuthTick::Granted(result) = tick {
            return AuthOutcome::Granted(result);
        }
        last = Some(tick);

        pause(timing.tick_interval, cancel);
    }
}

/// Sleep for `duration`, waking early on cancellation.
fn pause(duration: Duration, cancel: &CancelToken) {
    let until = Instant::now() + duration;
    while !cancel.is_cancelled() {
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        std::thread::sleep(remaining.min(CANCEL_POLL));
    }
}

/// Result of offering one frame to an enrollment session.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollStep {
    Rejected(QualityRejection),
    /// The frame passed the gate but no variant could be encoded.
    NoVectors,
    Accepted {
        stage: usize,
        collected: usize,
        added: usize,
    },
}

/// Staged enrollment: one stage per variation, each needing a fixed number
/// of accepted frames. Frames are encoded immediately and never kept.
pub struct EnrollmentSession {
    variations: Vec<String>,
    per_variation: usize,
    stage: usize,
    collected: usize,
    templates: Vec<FeatureVector>,
}

impl EnrollmentSession {
    pub fn new(config: &EnrollConfig) -> Self {
        Self {
            variations: config.variations.clone(),
            per_variation: config.images_per_variation,
            stage: 0,
            collected: 0,
            templates: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage >= self.variations.len()
    }

    pub fn templates(&self) -> &[FeatureVector] {
        &self.templates
    }

    pub fn into_templates(self) -> Vec<FeatureVector> {
        self.templates
    }

    /// Current stage's variation name, if any remain.
    pub fn current_variation(&self) -> Option<&str> {
        self.variations.get(self.stage).map(String::as_str)
    }

    pub fn progress_line(&self) -> String {
        match self.current_variation() {
            Some(variation) => format!(
                "Stage {}/{} ({variation}): {}/{} images",
                self.stage + 1,
                self.variations.len(),
                self.collected,
                self.per_variation
            ),
            None => format!("Enrollment complete: {} templates", self.templates().len()),
        }
    }

    /// Gate, expand and record a frame. Rejected frames do not use up a slot.
    pub fn offer(&mut self, pipeline: &Pipeline, frame: &RawFrame) -> EnrollStep {
        if let Err(rejection) = pipeline.gate.check(frame) {
            return EnrollStep::Rejected(rejection);
        }
        let vectors = pipeline.augmenter.expand(frame);
        if vectors.is_empty() {
            return EnrollStep::NoVectors;
        }

        let added = vectors.len();
        let stage = self.stage;
        self.templates.extend(vectors);
        self.collected += 1;
        let collected = self.collected;

        if self.collected >= self.per_variation {
            tracing::info!(
                stage = stage + 1,
                variation = self.current_variation().unwrap_or(""),
                "enrollment stage complete"
            );
            self.stage += 1;
            self.collected = 0;
        }
        EnrollStep::Accepted { stage, collected, added }
    }
}

/// Drive an [`EnrollmentSession`] from live frames.
pub fn run_enrollment(
    pipeline: &Pipeline,
    frames: &mut dyn FrameSource,
    sink: &dyn StatusSink,
    config: &EnrollConfig,
    timing: CycleTiming,
    cancel: &CancelToken,
) -> Result<Vec<FeatureVector>, SessionError> {
    let started = Instant::now();
    let mut session = EnrollmentSession::new(config);
    sink.status(&session.progress_line());

    while !session.is_complete() {
        if cancel.is_cancelled() {
            sink.status("Enrollment cancelled");
            return Err(SessionError::Cancelled);
        }
        if started.elapsed() >= timing.timeout {
            sink.status("Enrollment timed out");
            return Err(SessionError::TimedOut(timing.timeout));
        }

        if let Some(frame) = frames.next_frame() {
            match session.offer(pipeline, &frame) {
                EnrollStep::Rejected(reason) => sink.status(&format!("Frame rejected: {reason}")),
                EnrollStep::NoVectors => sink.status("Could not extract face features"),
                EnrollStep::Accepted { .. } => sink.status(&session.progress_line()),
            }
        }
        if !session.is_complete() {
            pause(timing.tick_interval, cancel);
        }
    }

    sink.status(&session.progress_line());
    Ok(session.into_templates())
}

/// Enroll from every PNG/JPEG file under `dir`, subdirectories included,
/// in path order.
///
/// Images are not quality-gated; undecodable files are skipped.
pub fn enroll_from_directory(pipeline: &Pipeline, dir: &Path) -> Result<Vec<FeatureVector>, SessionError> {
    if let Err(source) = std::fs::read_dir(dir) {
        return Err(SessionError::Io {
            path: dir.display().to_string(),
            source,
        });
    }
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && has_image_extension(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();

    let mut templates = Vec::new();
    for path in &paths {
        let frame = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image");
                continue;
            }
        };
        let vectors = pipeline.augmenter.expand(&frame);
        tracing::debug!(path = %path.display(), vectors = vectors.len(), "enrolled image");
        templates.extend(vectors);
    }
    tracing::info!(images = paths.len(), templates = templates.len(), dir = %dir.display(), "directory enrollment");
    Ok(templates)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use facegate_core::{AccessLevel, DetectorError, FaceRegion, Rect};
    use image::{GrayImage, Rgb};
    use std::collections::VecDeque;

    /// Sink that only logs.
    pub(crate) struct LogSink;

    impl StatusSink for LogSink {
        fn status(&self, message: &str) {
            tracing::debug!(message, "status");
        }
    }

    /// Reports one fixed face on every frame.
    pub(crate) struct StubDetector(pub Option<Rect>);

    impl FaceDetector for StubDetector {
        fn detect_faces(&self, _gray: &GrayImage, _min_size: u32) -> Result<Vec<FaceRegion>, DetectorError> {
            Ok(self.0.iter().map(|&r| FaceRegion::new(r)).collect())
        }

        fn detect_eyes(&self, _gray: &GrayImage) -> Result<Vec<Rect>, DetectorError> {
            Ok(Vec::new())
        }
    }

    /// Plays back a fixed list of frames (`None` = no frame available).
    pub(crate) struct Scripted(pub VecDeque<Option<RawFrame>>);

    impl FrameSource for Scripted {
        fn next_frame(&mut self) -> Option<RawFrame> {
            self.0.pop_front().flatten()
        }
    }

    /// Returns the same frame forever.
    pub(crate) struct Repeating(pub RawFrame);

    impl FrameSource for Repeating {
        fn next_frame(&mut self) -> Option<RawFrame> {
            Some(self.0.clone())
        }
    }

    #[derive(Default)]
    pub(crate) struct Collect(pub Mutex<Vec<String>>);

    impl StatusSink for Collect {
        fn status(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    impl Collect {
        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Sharp, mid-gray checkerboard that passes the default gate.
    pub(crate) fn good_frame() -> RawFrame {
        RawFrame::from_fn(320, 240, |x, y| {
            let v = if (x / 2 + y / 2) % 2 == 0 { 77 } else { 177 };
            Rgb([v, v, v])
        })
    }

    pub(crate) fn face() -> Rect {
        Rect::new(50, 50, 150, 150)
    }

    pub(crate) fn pipeline(face: Option<Rect>) -> Pipeline {
        Pipeline::new(Arc::new(StubDetector(face)), &Config::default()).unwrap()
    }

    fn fast() -> CycleTiming {
        CycleTiming {
            tick_interval: Duration::ZERO,
            timeout: Duration::from_secs(5),
        }
    }

    fn enrolled_user(pipeline: &Pipeline, id: i64) -> UserProfile {
        let v = pipeline.encoder.encode(&good_frame()).unwrap();
        UserProfile {
            id,
            name: "alice".into(),
            access_level: AccessLevel::Standard,
            templates: vec![v.clone(), v.clone(), v],
        }
    }

    #[test]
    fn test_tick_without_frame() {
        assert!(matches!(auth_tick(&pipeline(Some(face())), None, &[]), AuthTick::NoFrame));
    }

    #[test]
    fn test_tick_rejects_faceless_frame() {
        let tick = auth_tick(&pipeline(None), Some(&good_frame()), &[]);
        assert!(matches!(tick, AuthTick::Rejected(QualityRejection::NoFace)));
        assert_eq!(tick.status_line(), "Frame rejected: no face detected");
    }

    #[test]
    fn test_tick_denies_without_users() {
        let tick = auth_tick(&pipeline(Some(face())), Some(&good_frame()), &[]);
        match tick {
            AuthTick::Denied(result) => assert_eq!(result.reason_text().unwrap(), "no candidate found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tick_grants_enrolled_user() {
        let p = pipeline(Some(face()));
        let users = vec![enrolled_user(&p, 7)];
        let tick = auth_tick(&p, Some(&good_frame()), &users);
        assert!(tick.is_granted(), "{}", tick.status_line());
        assert_eq!(tick.status_line(), "Access granted: alice");
    }

    #[test]
    fn test_tick_is_idempotent() {
        let p = pipeline(Some(face()));
        let users = vec![enrolled_user(&p, 1)];
        let a = auth_tick(&p, Some(&good_frame()), &users);
        let b = auth_tick(&p, Some(&good_frame()), &users);
        assert_eq!(a.status_line(), b.status_line());
    }

    #[test]
    fn test_cycle_grants_after_bad_frames() {
        let p = pipeline(Some(face()));
        let users = vec![enrolled_user(&p, 3)];
        let dark = RawFrame::from_pixel(320, 240, Rgb([5, 5, 5]));
        let mut frames = Scripted(VecDeque::from(vec![None, Some(dark), Some(good_frame())]));
        let sink = Collect::default();

        let outcome = run_auth_cycle(&p, &mut frames, &users, &sink, fast(), &CancelToken::new());
        match outcome {
            AuthOutcome::Granted(result) => assert_eq!(result.candidate.unwrap().id, 3),
            other => panic!("unexpected {other:?}"),
        }
        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("Frame rejected: inadequate lighting"));
    }

    #[test]
    fn test_cycle_times_out() {
        let p = pipeline(Some(face()));
        let mut frames = Scripted(VecDeque::new());
        let timing = CycleTiming {
            tick_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(60),
        };
        let outcome = run_auth_cycle(&p, &mut frames, &Vec::<UserProfile>::new(), &LogSink, timing, &CancelToken::new());
        assert!(matches!(outcome, AuthOutcome::TimedOut { last: Some(AuthTick::NoFrame) }));
    }

    #[test]
    fn test_cycle_cancelled() {
        let p = pipeline(Some(face()));
        let cancel = CancelToken::new();
        cancel.cancel();
        let sink = Collect::default();
        let outcome = run_auth_cycle(&p, &mut Repeating(good_frame()), &Vec::<UserProfile>::new(), &sink, fast(), &cancel);
        assert!(matches!(outcome, AuthOutcome::Cancelled));
        assert_eq!(sink.lines(), vec!["Authentication cancelled"]);
    }

    #[test]
    fn test_cycle_cancelled_from_another_thread() {
        let p = pipeline(None);
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let timing = CycleTiming {
            tick_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        };
        let started = Instant::now();
        let outcome = run_auth_cycle(&p, &mut Repeating(good_frame()), &Vec::<UserProfile>::new(), &LogSink, timing, &cancel);
        handle.join().unwrap();
        assert!(matches!(outcome, AuthOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_cycle_reloads_users_each_tick() {
        use std::cell::Cell;

        struct Counting<'a>(Cell<u32>, &'a UserProfile);
        impl UserSource for Counting<'_> {
            fn users(&self) -> Vec<UserProfile> {
                self.0.set(self.0.get() + 1);
                // Enrolled user only appears from the third load on.
                if self.0.get() >= 3 {
                    vec![self.1.clone()]
                } else {
                    Vec::new()
                }
            }
        }

        let p = pipeline(Some(face()));
        let user = enrolled_user(&p, 9);
        let source = Counting(Cell::new(0), &user);
        let outcome = run_auth_cycle(&p, &mut Repeating(good_frame()), &source, &LogSink, fast(), &CancelToken::new());
        assert!(matches!(outcome, AuthOutcome::Granted(_)));
        assert_eq!(source.0.get(), 3);
    }

    #[test]
    fn test_enrollment_stages() {
        let p = pipeline(Some(face()));
        let config = EnrollConfig {
            variations: vec!["default".into(), "glasses".into()],
            images_per_variation: 2,
            ..Default::default()
        };
        let mut session = EnrollmentSession::new(&config);
        assert_eq!(session.current_variation(), Some("default"));

        let blank = RawFrame::from_pixel(320, 240, Rgb([128, 128, 128]));
        assert!(matches!(session.offer(&p, &blank), EnrollStep::Rejected(_)));

        assert_eq!(
            session.offer(&p, &good_frame()),
            EnrollStep::Accepted { stage: 0, collected: 1, added: 6 }
        );
        session.offer(&p, &good_frame());
        assert_eq!(session.current_variation(), Some("glasses"));
        session.offer(&p, &good_frame());
        assert!(!session.is_complete());
        session.offer(&p, &good_frame());
        assert!(session.is_complete());
        assert_eq!(session.templates().len(), 4 * 6);
    }

    #[test]
    fn test_run_enrollment_collects_templates() {
        let p = pipeline(Some(face()));
        let config = EnrollConfig {
            images_per_variation: 3,
            ..Default::default()
        };
        let sink = Collect::default();
        let templates = run_enrollment(
            &p,
            &mut Repeating(good_frame()),
            &sink,
            &config,
            fast(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(templates.len(), 3 * 6);
        assert_eq!(sink.lines().last().unwrap(), "Enrollment complete: 18 templates");
    }

    #[test]
    fn test_run_enrollment_times_out() {
        let p = pipeline(None);
        let timing = CycleTiming {
            tick_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(30),
        };
        let result = run_enrollment(
            &p,
            &mut Repeating(good_frame()),
            &LogSink,
            &EnrollConfig::default(),
            timing,
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(SessionError::TimedOut(_))));
    }

    #[test]
    fn test_enroll_from_directory() {
        let dir = std::env::temp_dir().join(format!("facegate-enroll-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        good_frame().save(dir.join("a.png")).unwrap();
        good_frame()
            .save_with_format(dir.join("b.jpeg"), image::ImageFormat::Jpeg)
            .unwrap();
        std::fs::write(dir.join("notes.txt"), "ignore me").unwrap();
        std::fs::write(dir.join("broken.jpg"), "not an image").unwrap();
        let nested = dir.join("glasses");
        std::fs::create_dir_all(&nested).unwrap();
        good_frame().save(nested.join("c.png")).unwrap();

        let templates = enroll_from_directory(&pipeline(Some(face())), &dir).unwrap();
        assert_eq!(templates.len(), 3 * 6);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_enroll_from_missing_directory() {
        let result = enroll_from_directory(&pipeline(None), Path::new("/nonexistent/facegate"));
        assert!(matches!(result, Err(SessionError::Io { .. })));
    }
}
