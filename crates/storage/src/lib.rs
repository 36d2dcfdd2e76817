//! Storage helpers for Postgres access.

use std::sync::Arc;

use anyhow::Result;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

pub mod account;
pub mod session;
pub mod user;

pub use sqlx::PgPool;

pub use account::{AccountRepository, ConfirmationStatus};
pub use session::DeviceSessionRepository;
pub use user::{
    CreateUserError, CredentialError, NewUser, PendingConfirmation, UserProfile, UserRepository,
};

/// Embedded schema migrations for users and device sessions.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Thin wrapper around a shared `PgPool`.
#[derive(Clone)]
pub struct StoragePool {
    pool: Arc<PgPool>,
}

impl StoragePool {
    /// Wrap an existing pool in an `Arc` so it can be cloned safely.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Borrow the underlying `PgPool`.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::ops::Deref for StoragePool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        self.pool()
    }
}

pub async fn connect(database_url: &str) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    Ok(StoragePool::new(pool))
}

/// Apply pending migrations.
pub async fn migrate(pool: &StoragePool) -> Result<()> {
    MIGRATOR.run(pool.pool()).await?;
    Ok(())
}
