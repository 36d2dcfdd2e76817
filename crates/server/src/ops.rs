//! Health, readiness and version endpoints, and the storage backend choice
//! they report on.

use axum::{extract::State, Json};
use quillhub_storage::{connect, migrate, StoragePool};
use serde::Serialize;
use tracing::{error, info};

use crate::AppState;

/// Where sessions and accounts live for this process.
#[derive(Clone)]
pub enum Backend {
    /// No `database_url` configured.
    Memory,
    Postgres(StoragePool),
    /// A database was configured but connecting or migrating failed. The
    /// process keeps serving from memory.
    Unavailable(String),
}

impl Backend {
    /// Connects and migrates when a URL is given. Failures degrade to memory
    /// rather than aborting startup.
    pub async fn open(database_url: Option<&str>) -> Self {
        let Some(url) = database_url else {
            return Self::Memory;
        };
        let pool = match connect(url).await {
            Ok(pool) => pool,
            Err(err) => {
                error!(?err, "failed to establish database connection");
                return Self::Unavailable(err.to_string());
            }
        };
        match migrate(&pool).await {
            Ok(()) => {
                info!("database connection established and migrations applied");
                Self::Postgres(pool)
            }
            Err(err) => {
                error!(?err, "failed to apply database migrations");
                Self::Unavailable(err.to_string())
            }
        }
    }

    pub fn pool(&self) -> Option<StoragePool> {
        match self {
            Self::Postgres(pool) => Some(pool.clone()),
            Self::Memory | Self::Unavailable(_) => None,
        }
    }

    fn database(&self) -> Component {
        match self {
            Self::Memory => Component::new("database", "disabled")
                .with_details("database_url not configured"),
            Self::Postgres(_) => Component::new("database", "up"),
            Self::Unavailable(reason) => Component::new("database", "down").with_details(reason),
        }
    }

    fn session_store(&self) -> Component {
        match self {
            Self::Postgres(_) => Component::new("session_store", "postgres"),
            Self::Memory | Self::Unavailable(_) => Component::new("session_store", "memory")
                .with_details("sessions are lost on restart"),
        }
    }
}

#[derive(Serialize)]
pub struct Readiness {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<Component>,
}

#[derive(Serialize)]
struct Component {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl Component {
    fn new(name: &'static str, status: &'static str) -> Self {
        Self {
            name,
            status,
            details: None,
        }
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

pub async fn health() -> &'static str {
    "ok"
}

/// Ready only when sessions are persisted; an in-memory process still
/// answers requests but reports `degraded`.
pub async fn readiness(State(state): State<AppState>) -> Json<Readiness> {
    let backend = state.backend();
    let cleanup = if state.config().cleanup.enabled {
        Component::new("session_cleanup", "scheduled")
            .with_details(format!("daily at {} UTC", state.config().cleanup.run_at))
    } else {
        Component::new("session_cleanup", "disabled")
    };

    Json(Readiness {
        status: if backend.pool().is_some() {
            "ready"
        } else {
            "degraded"
        },
        uptime_seconds: state.uptime_seconds(),
        components: vec![backend.database(), backend.session_store(), cleanup],
    })
}

#[derive(Serialize)]
pub struct Version {
    version: &'static str,
}

pub async fn version() -> Json<Version> {
    Json(Version {
        version: env!("CARGO_PKG_VERSION"),
    })
}
