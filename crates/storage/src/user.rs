use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use quillhub_core::DbId;
use quillhub_crypto::verify_password;
use sqlx::{FromRow, PgPool};
use thiserror::Error;

/// Repository utilities for user persistence.
pub struct UserRepository;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("user not found")]
    UserNotFound,
    #[error("invalid credentials")]
    InvalidCredentials,
}

#[derive(Debug, Error)]
pub enum CreateUserError {
    #[error("login already exists")]
    LoginTaken,
    #[error("email already exists")]
    EmailTaken,
    #[error("failed to create user: {0}")]
    Other(#[from] anyhow::Error),
}

/// Pending confirmation attached to a freshly registered user.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub login: String,
    pub email: String,
    pub password_hash: String,
    /// `None` creates an already confirmed account.
    pub confirmation: Option<PendingConfirmation>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct UserProfile {
    pub id: DbId,
    pub login: String,
    pub email: String,
}

impl UserRepository {
    pub async fn create_user(pool: &PgPool, user: &NewUser) -> Result<DbId, CreateUserError> {
        let (status, code, expires_at) = match &user.confirmation {
            Some(pending) => ("not_confirmed", Some(pending.code.as_str()), Some(pending.expires_at)),
            None => ("confirmed", None, None),
        };

        let id = sqlx::query_scalar::<_, DbId>(
            r#"
            INSERT INTO users (login, email, password_hash, confirmation_status, confirmation_code, confirmation_expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&user.login)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(status)
        .bind(code)
        .bind(expires_at)
        .fetch_one(pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if matches!(db_err.code(), Some(code) if code.as_ref() == "23505") => {
                match db_err.constraint() {
                    Some("users_email_active_idx") => CreateUserError::EmailTaken,
                    _ => CreateUserError::LoginTaken,
                }
            }
            other => CreateUserError::Other(
                anyhow!(other).context(format!("creating user '{}'", user.login)),
            ),
        })?;

        Ok(id)
    }

    /// Verify credentials and return the user id when successful.
    ///
    /// `login_or_email` is matched exactly against either column of a
    /// non-deleted user. Hash verification runs on the blocking pool.
    pub async fn verify_credentials(
        pool: &PgPool,
        login_or_email: &str,
        password: &str,
    ) -> Result<DbId> {
        let record = sqlx::query_as::<_, (DbId, String)>(
            r#"
            SELECT id, password_hash
            FROM users
            WHERE (login = $1 OR email = $1)
              AND deleted_at IS NULL
            ORDER BY (login = $1) DESC
            LIMIT 1
            "#,
        )
        .bind(login_or_email)
        .fetch_optional(pool)
        .await
        .with_context(|| "querying user credentials")?;

        let Some((user_id, password_hash)) = record else {
            return Err(CredentialError::UserNotFound.into());
        };

        let password = password.to_owned();
        let matches =
            tokio::task::spawn_blocking(move || verify_password(&password, &password_hash))
                .await
                .context("password verification task failed")?
                .map_err(|err| anyhow!("invalid password hash for user {user_id}: {err}"))?;

        if !matches {
            return Err(CredentialError::InvalidCredentials.into());
        }
        Ok(user_id)
    }

    pub async fn find_profile(pool: &PgPool, user_id: DbId) -> Result<Option<UserProfile>> {
        let profile = sqlx::query_as::<_, UserProfile>(
            r#"
            SELECT id, login, email
            FROM users
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
        Ok(profile)
    }

    /// Which of `login` / `email` already belongs to a non-deleted user.
    pub async fn find_conflicts(pool: &PgPool, login: &str, email: &str) -> Result<(bool, bool)> {
        let (login_taken, email_taken) = sqlx::query_as::<_, (bool, bool)>(
            r#"
            SELECT
                EXISTS (SELECT 1 FROM users WHERE login = $1 AND deleted_at IS NULL),
                EXISTS (SELECT 1 FROM users WHERE email = $2 AND deleted_at IS NULL)
            "#,
        )
        .bind(login)
        .bind(email)
        .fetch_one(pool)
        .await?;
        Ok((login_taken, email_taken))
    }
}
