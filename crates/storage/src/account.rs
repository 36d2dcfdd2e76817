//! E-mail confirmation and password recovery columns on `users`.
//!
//! Codes are single use: a successful confirmation or recovery clears both the
//! code and its expiry.

use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    NotConfirmed,
    Confirmed,
}

impl ConfirmationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationStatus::NotConfirmed => "not_confirmed",
            ConfirmationStatus::Confirmed => "confirmed",
        }
    }
}

impl FromStr for ConfirmationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_confirmed" => Ok(ConfirmationStatus::NotConfirmed),
            "confirmed" => Ok(ConfirmationStatus::Confirmed),
            other => Err(anyhow!("unknown confirmation status '{other}'")),
        }
    }
}

pub struct AccountRepository;

impl AccountRepository {
    /// Mark the owner of a live, unexpired code as confirmed.
    pub async fn confirm_email(pool: &PgPool, code: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET confirmation_status = 'confirmed',
                confirmation_code = NULL,
                confirmation_expires_at = NULL
            WHERE confirmation_code = $1
              AND confirmation_expires_at > $2
              AND confirmation_status = 'not_confirmed'
              AND deleted_at IS NULL
            "#,
        )
        .bind(code)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace the confirmation code of an unconfirmed user.
    pub async fn regenerate_confirmation(
        pool: &PgPool,
        email: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET confirmation_code = $2,
                confirmation_expires_at = $3
            WHERE email = $1
              AND confirmation_status = 'not_confirmed'
              AND deleted_at IS NULL
            "#,
        )
        .bind(email)
        .bind(code)
        .bind(expires_at)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn confirmation_status(
        pool: &PgPool,
        email: &str,
    ) -> Result<Option<ConfirmationStatus>> {
        let status = sqlx::query_scalar::<_, String>(
            r#"
            SELECT confirmation_status
            FROM users
            WHERE email = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(email)
        .fetch_optional(pool)
        .await?;
        status.as_deref().map(ConfirmationStatus::from_str).transpose()
    }

    pub async fn set_recovery_code(
        pool: &PgPool,
        email: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET recovery_code = $2,
                recovery_expires_at = $3
            WHERE email = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(email)
        .bind(code)
        .bind(expires_at)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Swap the password hash for the holder of a live recovery code.
    pub async fn reset_password(
        pool: &PgPool,
        recovery_code: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $2,
                recovery_code = NULL,
                recovery_expires_at = NULL
            WHERE recovery_code = $1
              AND recovery_expires_at > $3
              AND deleted_at IS NULL
            "#,
        )
        .bind(recovery_code)
        .bind(password_hash)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
