use crate::access::{self, AccessError};
use crate::engine::{EngineError, EngineHandle};
use crate::session::AuthOutcome;
use crate::store::UserStore;
use facegate_core::{AccessLevel, UserProfile};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.facegate.Daemon1";
pub const OBJECT_PATH: &str = "/org/facegate/Daemon1";

/// D-Bus interface for the facegate daemon.
///
/// Bus name: org.facegate.Daemon1
/// Object path: /org/facegate/Daemon1
pub struct FacegateService {
    engine: EngineHandle,
    store: Arc<Mutex<UserStore>>,
    camera_device: String,
    model_path: String,
}

impl FacegateService {
    pub fn new(engine: EngineHandle, store: Arc<Mutex<UserStore>>, camera_device: String, model_path: String) -> Self {
        Self {
            engine,
            store,
            camera_device,
            model_path,
        }
    }

    fn store(&self) -> MutexGuard<'_, UserStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Identify the caller by face before a user-management operation.
    async fn authenticated_actor(&self) -> zbus::fdo::Result<UserProfile> {
        let outcome = self.engine.authenticate().await.map_err(failed)?;
        granted_actor(outcome).map_err(access_denied)
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn access_denied(e: AccessError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "user management refused");
    zbus::fdo::Error::AccessDenied(e.to_string())
}

/// The user a granted authentication identified.
fn granted_actor(outcome: AuthOutcome) -> Result<UserProfile, AccessError> {
    match outcome {
        AuthOutcome::Granted(result) => result
            .candidate
            .ok_or_else(|| AccessError::NotAuthenticated("no candidate".into())),
        AuthOutcome::Cancelled => Err(AccessError::NotAuthenticated("cancelled".into())),
        AuthOutcome::TimedOut { .. } => Err(AccessError::NotAuthenticated("timeout".into())),
    }
}

fn parse_level(level: u8) -> zbus::fdo::Result<AccessLevel> {
    AccessLevel::try_from(level).map_err(zbus::fdo::Error::InvalidArgs)
}

/// JSON document returned by `Authenticate`.
pub fn outcome_json(outcome: &AuthOutcome) -> serde_json::Value {
    match outcome {
        AuthOutcome::Granted(result) => {
            let user = result.candidate.as_ref();
            serde_json::json!({
                "granted": true,
                "outcome": "granted",
                "user_id": user.map(|u| u.id),
                "user": user.map(|u| u.name.clone()),
                "access_level": user.map(|u| u8::from(u.access_level)),
                "best_score": result.best_score,
                "mean_top_k": result.mean_top_k,
            })
        }
        AuthOutcome::Cancelled => serde_json::json!({
            "granted": false,
            "outcome": "cancelled",
        }),
        AuthOutcome::TimedOut { last } => serde_json::json!({
            "granted": false,
            "outcome": "timeout",
            "last_status": last.as_ref().map(|t| t.status_line()),
        }),
    }
}

#[interface(name = "org.facegate.Daemon1")]
impl FacegateService {
    /// Run an authentication cycle; returns the outcome as JSON.
    async fn authenticate(&self) -> zbus::fdo::Result<String> {
        tracing::info!("authenticate requested");
        let outcome = self.engine.authenticate().await.map_err(failed)?;
        Ok(outcome_json(&outcome).to_string())
    }

    /// Enroll a new user from the camera; returns the new user id.
    async fn enroll(&self, name: &str, level: u8) -> zbus::fdo::Result<i64> {
        tracing::info!(user = name, level, "enroll requested");
        let access_level = parse_level(level)?;
        self.engine
            .enroll(name.to_string(), access_level)
            .await
            .map_err(enroll_error)
    }

    /// Enroll a new user from a directory of images; returns the new user id.
    async fn enroll_from_directory(&self, name: &str, level: u8, dir: &str) -> zbus::fdo::Result<i64> {
        tracing::info!(user = name, level, dir, "directory enroll requested");
        let access_level = parse_level(level)?;
        self.engine
            .enroll_from_directory(name.to_string(), access_level, PathBuf::from(dir))
            .await
            .map_err(enroll_error)
    }

    /// Cancel the running authentication or enrollment.
    async fn cancel(&self) -> zbus::fdo::Result<()> {
        self.engine.cancel();
        Ok(())
    }

    /// List the enrolled users the authenticated caller may see, as JSON.
    async fn list_users(&self) -> zbus::fdo::Result<String> {
        let actor = self.authenticated_actor().await?;
        let users = self.store().summaries().map_err(failed)?;
        let visible = access::visible_users(&actor, users);
        tracing::info!(actor = %actor.name, shown = visible.len(), "listing users");
        serde_json::to_string(&visible).map_err(failed)
    }

    /// Delete a user by id. The authenticated caller must be level 1 and
    /// may not delete itself.
    async fn delete_user(&self, id: i64) -> zbus::fdo::Result<bool> {
        let actor = self.authenticated_actor().await?;
        access::check_delete(&actor, id).map_err(access_denied)?;

        let store = self.store();
        match store.get_user(id).map_err(failed)? {
            Some(user) => tracing::info!(id, name = %user.name, actor = %actor.name, "deleting user"),
            None => tracing::info!(id, actor = %actor.name, "delete requested for unknown user"),
        }
        store.delete(id).map_err(failed)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let users = self.store().count().map_err(failed)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera_device,
            "model": self.model_path,
            "users": users,
        })
        .to_string())
    }

    /// Progress line from the running session.
    #[zbus(signal)]
    async fn status_changed(emitter: &SignalEmitter<'_>, message: &str) -> zbus::Result<()>;
}

/// Emit a `StatusChanged` signal for every line received on `rx`.
pub async fn forward_status(
    connection: zbus::Connection,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<String>,
) -> zbus::Result<()> {
    let iface = connection
        .object_server()
        .interface::<_, FacegateService>(OBJECT_PATH)
        .await?;
    while let Some(message) = rx.recv().await {
        tracing::debug!(message = %message, "status");
        if let Err(e) = FacegateService::status_changed(iface.signal_emitter(), &message).await {
            tracing::warn!(error = %e, "failed to emit StatusChanged");
        }
    }
    Ok(())
}

fn enroll_error(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Store(crate::store::StoreError::EmptyName) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => failed(other),
    }
}
