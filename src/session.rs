use crate::errors::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    pub access_token: String,
    pub issued_at: DateTime<Utc>,
}

/// Supplies the authenticated context every query and channel subscription
/// runs under. Returning `SessionExpired` is fatal to the engine instance.
pub trait SessionProvider: Send + Sync {
    fn context(&self) -> EngineResult<SessionContext>;
}

#[derive(Clone, Default)]
pub struct StaticSession {
    current: Arc<RwLock<Option<SessionContext>>>,
}

impl StaticSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(access_token: &str) -> Self {
        let session = Self::new();
        session.sign_in(access_token);
        session
    }

    pub fn sign_in(&self, access_token: &str) -> SessionContext {
        let context = SessionContext {
            session_id: Uuid::new_v4().to_string(),
            access_token: access_token.to_string(),
            issued_at: Utc::now(),
        };
        if let Ok(mut writer) = self.current.write() {
            *writer = Some(context.clone());
        }
        context
    }

    pub fn expire(&self) {
        if let Ok(mut writer) = self.current.write() {
            *writer = None;
        }
    }
}

impl SessionProvider for StaticSession {
    fn context(&self) -> EngineResult<SessionContext> {
        let reader = self
            .current
            .read()
            .map_err(|_| EngineError::Internal("session lock poisoned".to_string()))?;
        reader
            .clone()
            .ok_or_else(|| EngineError::SessionExpired("no active session".to_string()))
    }
}
