use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::BrowserSession;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session backend unavailable: {0}")]
    Unavailable(String),
}

/// Result of a successful backend launch. The backend owns whatever
/// observer flips `alive` to false when the underlying connection dies.
pub struct LaunchedSession {
    pub connection: Arc<dyn BrowserSession>,
    pub alive: Arc<AtomicBool>,
}

/// A live (or once-live) browser session handed to vendor flows.
pub struct SessionHandle {
    id: String,
    created_at: DateTime<Utc>,
    alive: Arc<AtomicBool>,
    connection: Arc<dyn BrowserSession>,
}

impl SessionHandle {
    fn new(launched: LaunchedSession) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            alive: launched.alive,
            connection: launched.connection,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn connection(&self) -> &dyn BrowserSession {
        self.connection.as_ref()
    }
}

/// Launches new sessions. Implemented by the chromium backend in
/// production and by instant fakes in tests.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn launch(&self) -> Result<LaunchedSession, SessionError>;
}

pub type SharedSessionBackend = Arc<dyn SessionBackend>;

/// Owns at most one current session per integration and replaces it when
/// it is absent or has disconnected.
///
/// Creation is single-flight: the async mutex is held across the launch
/// await, so two callers racing on an empty cache cannot leak two
/// browser processes. A failed launch leaves the cache empty and the
/// next caller tries again; there is no internal retry or backoff.
pub struct SessionManager {
    label: &'static str,
    backend: SharedSessionBackend,
    current: tokio::sync::Mutex<Option<Arc<SessionHandle>>>,
}

impl SessionManager {
    pub fn new(label: &'static str, backend: SharedSessionBackend) -> Self {
        Self {
            label,
            backend,
            current: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the cached session while it is still connected, otherwise
    /// discards it and launches a fresh one.
    pub async fn acquire(&self) -> Result<Arc<SessionHandle>, SessionError> {
        let mut slot = self.current.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_connected() {
                return Ok(Arc::clone(session));
            }
            warn!(
                integration = self.label,
                session_id = session.id(),
                "cached session disconnected; launching replacement"
            );
            *slot = None;
        }
        let session = self.launch_locked().await?;
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Drops whatever is cached and launches a new session. Used after a
    /// session-class step failure where the cached handle may still
    /// report itself connected.
    pub async fn refresh(&self) -> Result<Arc<SessionHandle>, SessionError> {
        let mut slot = self.current.lock().await;
        *slot = None;
        let session = self.launch_locked().await?;
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn launch_locked(&self) -> Result<Arc<SessionHandle>, SessionError> {
        let launched = self.backend.launch().await.map_err(|err| {
            warn!(integration = self.label, error = %err, "session launch failed");
            err
        })?;
        let session = Arc::new(SessionHandle::new(launched));
        info!(
            integration = self.label,
            session_id = session.id(),
            "session launched"
        );
        Ok(session)
    }
}
