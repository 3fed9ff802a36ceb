use crate::config::Config;
use crate::session::{
    self, AuthOutcome, CancelToken, CycleTiming, Pipeline, SessionError, StatusSink,
};
use crate::store::{StoreError, UserStore};
use facegate_core::AccessLevel;
use facegate_hw::FrameSource;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("enrollment failed: {0}")]
    Session(#[from] SessionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Timing and enrollment settings the engine needs per request.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub auth: CycleTiming,
    pub enroll: CycleTiming,
    pub enroll_config: crate::config::EnrollConfig,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            auth: CycleTiming {
                tick_interval: config.tick_interval(),
                timeout: config.auth_timeout(),
            },
            enroll: CycleTiming {
                tick_interval: config.tick_interval(),
                timeout: config.enroll_timeout(),
            },
            enroll_config: config.enroll.clone(),
        }
    }
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Authenticate {
        reply: oneshot::Sender<AuthOutcome>,
    },
    Enroll {
        name: String,
        access_level: AccessLevel,
        reply: oneshot::Sender<Result<i64, EngineError>>,
    },
    EnrollFromDirectory {
        name: String,
        access_level: AccessLevel,
        dir: PathBuf,
        reply: oneshot::Sender<Result<i64, EngineError>>,
    },
}

/// Cancel tokens of the queued and running requests.
#[derive(Clone, Default)]
struct Pending(Arc<Mutex<Vec<CancelToken>>>);

impl Pending {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CancelToken>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self) -> CancelToken {
        let token = CancelToken::new();
        self.lock().push(token.clone());
        token
    }

    fn remove(&self, token: &CancelToken) {
        self.lock().retain(|t| !t.same_as(token));
    }

    fn cancel_all(&self) -> usize {
        let tokens = self.lock();
        for token in tokens.iter() {
            token.cancel();
        }
        tokens.len()
    }
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<(CancelToken, EngineRequest)>,
    pending: Pending,
}

impl EngineHandle {
    /// Queue `request` with its own cancel token.
    async fn submit(&self, request: EngineRequest) -> Result<(), EngineError> {
        let token = self.pending.add();
        if self.tx.send((token.clone(), request)).await.is_err() {
            self.pending.remove(&token);
            return Err(EngineError::ChannelClosed);
        }
        Ok(())
    }

    /// Run an authentication cycle until granted, cancelled or timed out.
    pub async fn authenticate(&self) -> Result<AuthOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(EngineRequest::Authenticate { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Capture an enrollment session from the camera and register the user.
    pub async fn enroll(&self, name: String, access_level: AccessLevel) -> Result<i64, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(EngineRequest::Enroll {
            name,
            access_level,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Register a user from a directory of images.
    pub async fn enroll_from_directory(
        &self,
        name: String,
        access_level: AccessLevel,
        dir: PathBuf,
    ) -> Result<i64, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(EngineRequest::EnrollFromDirectory {
            name,
            access_level,
            dir,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stop the running session at its next tick boundary, and every
    /// request still queued behind it.
    pub fn cancel(&self) {
        let cancelled = self.pending.cancel_all();
        tracing::info!(cancelled, "cancel requested");
    }
}

/// Everything the engine thread owns.
struct Engine {
    pipeline: Pipeline,
    frames: Box<dyn FrameSource>,
    store: Arc<Mutex<UserStore>>,
    sink: Box<dyn StatusSink>,
    settings: EngineSettings,
    pending: Pending,
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the frame source and processes one request at a time.
pub fn spawn_engine(
    pipeline: Pipeline,
    frames: Box<dyn FrameSource>,
    store: Arc<Mutex<UserStore>>,
    sink: Box<dyn StatusSink>,
    settings: EngineSettings,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<(CancelToken, EngineRequest)>(4);
    let pending = Pending::default();

    let mut engine = Engine {
        pipeline,
        frames,
        store,
        sink,
        settings,
        pending: pending.clone(),
    };

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some((cancel, req)) = rx.blocking_recv() {
                engine.handle(req, &cancel);
                engine.pending.remove(&cancel);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, pending })
}

impl Engine {
    fn handle(&mut self, req: EngineRequest, cancel: &CancelToken) {
        match req {
            EngineRequest::Authenticate { reply } => {
                let outcome = session::run_auth_cycle(
                    &self.pipeline,
                    self.frames.as_mut(),
                    self.store.as_ref(),
                    self.sink.as_ref(),
                    self.settings.auth,
                    cancel,
                );
                let _ = reply.send(outcome);
            }
            EngineRequest::Enroll {
                name,
                access_level,
                reply,
            } => {
                let result = session::run_enrollment(
                    &self.pipeline,
                    self.frames.as_mut(),
                    self.sink.as_ref(),
                    &self.settings.enroll_config,
                    self.settings.enroll,
                    cancel,
                )
                .map_err(EngineError::from)
                .and_then(|templates| self.register(&name, access_level, &templates));
                let _ = reply.send(result);
            }
            EngineRequest::EnrollFromDirectory {
                name,
                access_level,
                dir,
                reply,
            } => {
                let result = session::enroll_from_directory(&self.pipeline, &dir)
                    .map_err(EngineError::from)
                    .and_then(|templates| self.register(&name, access_level, &templates));
                let _ = reply.send(result);
            }
        }
    }

    fn register(
        &self,
        name: &str,
        access_level: AccessLevel,
        templates: &[facegate_core::FeatureVector],
    ) -> Result<i64, EngineError> {
        let store = self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = store.register(name, access_level, templates)?;
        self.sink
            .status(&format!("Registered {name} with {} templates", templates.len()));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnrollConfig;
    use crate::session::tests::{face, good_frame, pipeline, LogSink, Repeating};
    use std::time::Duration;

    fn settings() -> EngineSettings {
        let timing = CycleTiming {
            tick_interval: Duration::ZERO,
            timeout: Duration::from_secs(5),
        };
        EngineSettings {
            auth: timing,
            enroll: timing,
            enroll_config: EnrollConfig {
                images_per_variation: 3,
                ..Default::default()
            },
        }
    }

    fn engine() -> (EngineHandle, Arc<Mutex<UserStore>>) {
        let store = Arc::new(Mutex::new(UserStore::open_in_memory().unwrap()));
        let handle = spawn_engine(
            pipeline(Some(face())),
            Box::new(Repeating(good_frame())),
            Arc::clone(&store),
            Box::new(LogSink),
            settings(),
        )
        .unwrap();
        (handle, store)
    }

    #[tokio::test]
    async fn test_enroll_then_authenticate() {
        let (handle, store) = engine();
        let id = handle.enroll("alice".into(), AccessLevel::Admin).await.unwrap();
        assert_eq!(store.lock().unwrap().get_user(id).unwrap().unwrap().templates.len(), 18);

        match handle.authenticate().await.unwrap() {
            AuthOutcome::Granted(result) => {
                let user = result.candidate.unwrap();
                assert_eq!(user.id, id);
                assert_eq!(user.access_level, AccessLevel::Admin);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_enroll_rejects_empty_name() {
        let (handle, _store) = engine();
        let err = handle.enroll(" ".into(), AccessLevel::Standard).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::EmptyName)));
    }

    #[tokio::test]
    async fn test_enroll_from_missing_directory() {
        let (handle, store) = engine();
        let err = handle
            .enroll_from_directory("bob".into(), AccessLevel::Standard, PathBuf::from("/nonexistent/facegate"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Session(SessionError::Io { .. })));
        assert_eq!(store.lock().unwrap().count().unwrap(), 0);
    }

    fn slow_engine() -> EngineHandle {
        let store = Arc::new(Mutex::new(UserStore::open_in_memory().unwrap()));
        let mut slow = settings();
        slow.auth = CycleTiming {
            tick_interval: Duration::from_millis(20),
            timeout: Duration::from_secs(30),
        };
        spawn_engine(
            pipeline(Some(face())),
            Box::new(Repeating(good_frame())),
            store,
            Box::new(LogSink),
            slow,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_cancel_stops_authentication() {
        let handle = slow_engine();

        let canceller = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        assert!(matches!(handle.authenticate().await.unwrap(), AuthOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_reaches_queued_request() {
        let handle = slow_engine();

        let running = tokio::spawn({
            let h = handle.clone();
            async move { h.authenticate().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued = tokio::spawn({
            let h = handle.clone();
            async move { h.authenticate().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.cancel();
        assert!(matches!(running.await.unwrap().unwrap(), AuthOutcome::Cancelled));
        assert!(matches!(queued.await.unwrap().unwrap(), AuthOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_while_idle_does_not_stop_next_request() {
        let (handle, _store) = engine();
        handle.cancel();
        let id = handle.enroll("carol".into(), AccessLevel::Operator).await.unwrap();
        assert!(id > 0);
    }

    #[test]
    fn test_pending_tracks_only_live_tokens() {
        let pending = Pending::default();
        let a = pending.add();
        let b = pending.add();
        pending.remove(&a);
        assert_eq!(pending.cancel_all(), 1);
        assert!(!a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
