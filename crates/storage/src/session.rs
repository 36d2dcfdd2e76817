use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use quillhub_core::{retention_cutoff, DbId, NewSession, Session};
use sqlx::FromRow;
use uuid::Uuid;

use crate::StoragePool;

const SESSION_COLUMNS: &str =
    "id, user_id, device_id, device_name, ip, issued_at, expires_at, deleted_at";

/// Persistence for `device_sessions`. Holds no business rules.
#[derive(Clone)]
pub struct DeviceSessionRepository {
    pool: StoragePool,
}

#[derive(Debug, Clone, FromRow)]
struct SessionRow {
    id: DbId,
    user_id: DbId,
    device_id: Uuid,
    device_name: String,
    ip: Option<String>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            user_id: row.user_id,
            device_id: row.device_id,
            device_name: row.device_name,
            ip: row.ip,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            deleted_at: row.deleted_at,
        }
    }
}

impl DeviceSessionRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, session: &NewSession) -> Result<Session> {
        let query = format!(
            "INSERT INTO device_sessions (user_id, device_id, device_name, ip, issued_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {SESSION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(session.user_id)
            .bind(session.device_id)
            .bind(&session.device_name)
            .bind(session.ip.as_deref())
            .bind(session.issued_at)
            .bind(session.expires_at)
            .fetch_one(self.pool.pool())
            .await
            .with_context(|| format!("inserting session for device {}", session.device_id))?;
        Ok(row.into())
    }

    /// Active (not soft-deleted) session for a device.
    pub async fn find_active_by_device_id(&self, device_id: Uuid) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM device_sessions
             WHERE device_id = $1 AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(device_id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_active_for_user(&self, user_id: DbId) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM device_sessions
             WHERE user_id = $1 AND deleted_at IS NULL
             ORDER BY issued_at DESC"
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(user_id)
            .fetch_all(self.pool.pool())
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Rotate timestamps only if the row still carries `previous_iat`.
    ///
    /// Returns `false` when another rotation or a logout got there first.
    pub async fn update_timestamps(
        &self,
        session_id: DbId,
        previous_iat: DateTime<Utc>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE device_sessions
            SET issued_at = $3,
                expires_at = $4
            WHERE id = $1
              AND issued_at = $2
              AND deleted_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(previous_iat)
        .bind(issued_at)
        .bind(expires_at)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn soft_delete(&self, session_id: DbId, deleted_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE device_sessions
            SET deleted_at = $2
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(deleted_at)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn soft_delete_all_except(
        &self,
        user_id: DbId,
        current_device_id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE device_sessions
            SET deleted_at = $3
            WHERE user_id = $1
              AND device_id <> $2
              AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(current_device_id)
        .bind(deleted_at)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Permanently remove rows soft-deleted more than `retention` ago.
    pub async fn hard_delete_older_than(&self, retention: Duration) -> Result<u64> {
        let cutoff = retention_cutoff(Utc::now(), retention).with_context(|| {
            format!("retention of {} days is out of range", retention.num_days())
        })?;
        let mut tx = self.pool.pool().begin().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM device_sessions
            WHERE deleted_at IS NOT NULL
              AND deleted_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("deleting sessions soft-deleted before {cutoff}"))?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
