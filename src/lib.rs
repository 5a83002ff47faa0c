pub mod aggregate;
pub mod backoff;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod debounce;
pub mod engine;
pub mod errors;
pub mod feed;
pub mod fetch;
pub mod lifecycle;
pub mod models;
pub mod session;
pub mod validation;
pub mod view;

pub use crate::aggregate::{AggregateCallback, Reducer};
pub use crate::config::{EngineConfig, LoggingConfig};
pub use crate::dashboard::Dashboard;
pub use crate::db::SqliteStore;
pub use crate::engine::{Collaborators, LiveViewEngine};
pub use crate::errors::{EngineError, EngineResult};
pub use crate::feed::{ChangeChannel, ChannelHandle, FeedSink};
pub use crate::fetch::{QueryFuture, RemoteQuery};
pub use crate::models::{
    EngineStats, EventKind, EventMask, QuerySpec, RelationName, Row, ViewId, ViewSnapshot, ViewSpec, ViewState,
    WatchedRelation,
};
pub use crate::session::{SessionContext, SessionProvider, StaticSession};
pub use crate::view::ViewRegistration;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` overrides the configured filter.
pub fn init_tracing(config: &LoggingConfig) -> EngineResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "engine.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(non_blocking)
                .try_init()
                .map_err(|error| EngineError::Internal(error.to_string()))
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|error| EngineError::Internal(error.to_string())),
    }
}
