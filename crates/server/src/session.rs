//! Device session lifecycle: login, refresh rotation, logout and retention.
//!
//! A session moves `Active -> Active (rotated) -> SoftDeleted -> gone`. There
//! is no way back from `SoftDeleted`. Every refresh stamps the session row
//! with the new token's `iat`, so a refresh token that has already been
//! rotated no longer matches and is rejected.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use quillhub_core::{
    describe_user_agent, retention_cutoff, timestamp_from_unix, ClientInfo, DbId, DeviceView,
    NewSession, Session, SessionContext, UserContext,
};
use quillhub_crypto::{hash_password, verify_password, TokenError, TokenIssuer};
use quillhub_storage::{CredentialError, DeviceSessionRepository, StoragePool, UserRepository};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("session not found")]
    NotFound,
    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<TokenError> for SessionError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired | TokenError::Invalid => SessionError::Unauthorized,
            other => SessionError::Storage(anyhow!(other)),
        }
    }
}

/// Checks a login-or-email and password pair.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn authenticate(&self, login_or_email: &str, password: &str)
        -> Result<Option<UserContext>>;
}

/// Persistence of session rows. Lookups only ever return active rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &NewSession) -> Result<Session>;
    async fn find_by_device_id(&self, device_id: Uuid) -> Result<Option<Session>>;
    async fn list_for_user(&self, user_id: DbId) -> Result<Vec<Session>>;
    /// Compare-and-swap on the stored `iat`.
    async fn update_timestamps(
        &self,
        session_id: DbId,
        previous_iat: DateTime<Utc>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn soft_delete(&self, session_id: DbId) -> Result<bool>;
    async fn soft_delete_all_except(&self, user_id: DbId, device_id: Uuid) -> Result<u64>;
    async fn hard_delete_older_than(&self, retention: Duration) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Identity carried by a verified access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessContext {
    pub user_id: DbId,
}

#[derive(Clone)]
pub struct SessionService {
    issuer: TokenIssuer,
    credentials: Arc<dyn CredentialVerifier>,
    store: Arc<dyn SessionStore>,
}

impl SessionService {
    pub fn new(
        issuer: TokenIssuer,
        credentials: Arc<dyn CredentialVerifier>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            issuer,
            credentials,
            store,
        }
    }

    pub async fn authenticate(
        &self,
        login_or_email: &str,
        password: &str,
    ) -> Result<UserContext, SessionError> {
        match self
            .credentials
            .authenticate(login_or_email, password)
            .await?
        {
            Some(user) => Ok(user),
            None => {
                info!("login rejected: invalid credentials");
                Err(SessionError::Unauthorized)
            }
        }
    }

    /// Open a new device session for an authenticated user.
    pub async fn login(
        &self,
        user: UserContext,
        client: &ClientInfo,
    ) -> Result<TokenPair, SessionError> {
        let device_id = Uuid::new_v4();
        let access = self.issuer.issue_access_token(user.user_id)?;
        let refresh = self.issuer.issue_refresh_token(user.user_id, device_id)?;

        let new_session = NewSession {
            user_id: user.user_id,
            device_id,
            device_name: describe_user_agent(client.user_agent.as_deref()),
            ip: client.ip.clone(),
            issued_at: unix_to_timestamp(refresh.claims.iat)?,
            expires_at: unix_to_timestamp(refresh.claims.exp)?,
        };
        let session = self.store.insert(&new_session).await?;

        info!(
            user_id = user.user_id,
            session_id = session.id,
            device_id = %device_id,
            device_name = %session.device_name,
            "session created"
        );

        Ok(TokenPair {
            access_token: access.token,
            refresh_token: refresh.token,
        })
    }

    /// Validate a refresh token against its session row.
    ///
    /// Every failure collapses into `Unauthorized`.
    pub async fn validate_refresh_token(&self, token: &str) -> Result<SessionContext, SessionError> {
        let claims = match self.issuer.verify_refresh(token) {
            Ok(claims) => claims,
            Err(err @ (TokenError::Expired | TokenError::Invalid)) => {
                debug!(reason = %err, "refresh token rejected");
                return Err(SessionError::Unauthorized);
            }
            Err(other) => return Err(other.into()),
        };

        let Some(session) = self.store.find_by_device_id(claims.device_id).await? else {
            debug!(device_id = %claims.device_id, "refresh token without active session");
            return Err(SessionError::Unauthorized);
        };

        if !session.belongs_to(claims.user_id) {
            warn!(device_id = %claims.device_id, "refresh token user does not own session");
            return Err(SessionError::Unauthorized);
        }

        if !session.matches_issued_at(claims.iat) {
            warn!(
                user_id = claims.user_id,
                device_id = %claims.device_id,
                "superseded refresh token presented"
            );
            return Err(SessionError::Unauthorized);
        }

        Ok(SessionContext {
            user_id: claims.user_id,
            device_id: claims.device_id,
            token_iat: claims.iat,
        })
    }

    pub fn verify_access_token(&self, token: &str) -> Result<AccessContext, SessionError> {
        let claims = self.issuer.verify_access(token)?;
        Ok(AccessContext { user_id: claims.id })
    }

    /// Rotate the token pair of the caller's session.
    pub async fn refresh(&self, context: SessionContext) -> Result<TokenPair, SessionError> {
        let Some(session) = self.store.find_by_device_id(context.device_id).await? else {
            return Err(SessionError::Unauthorized);
        };
        if !session.belongs_to(context.user_id) {
            return Err(SessionError::Unauthorized);
        }

        // The new iat must differ from the presented one even within the same second.
        let iat = Utc::now().timestamp().max(context.token_iat + 1);
        let access = self.issuer.issue_access_token(context.user_id)?;
        let refresh =
            self.issuer
                .issue_refresh_token_at(context.user_id, context.device_id, iat)?;

        let rotated = self
            .store
            .update_timestamps(
                session.id,
                unix_to_timestamp(context.token_iat)?,
                unix_to_timestamp(refresh.claims.iat)?,
                unix_to_timestamp(refresh.claims.exp)?,
            )
            .await?;
        if !rotated {
            warn!(
                user_id = context.user_id,
                device_id = %context.device_id,
                "refresh lost race against a concurrent rotation or logout"
            );
            return Err(SessionError::Unauthorized);
        }

        debug!(
            user_id = context.user_id,
            device_id = %context.device_id,
            "refresh token rotated"
        );

        Ok(TokenPair {
            access_token: access.token,
            refresh_token: refresh.token,
        })
    }

    pub async fn logout(&self, context: SessionContext) -> Result<(), SessionError> {
        let Some(session) = self.store.find_by_device_id(context.device_id).await? else {
            return Err(SessionError::Unauthorized);
        };
        if !self.store.soft_delete(session.id).await? {
            return Err(SessionError::Unauthorized);
        }
        info!(
            user_id = context.user_id,
            device_id = %context.device_id,
            "session logged out"
        );
        Ok(())
    }

    /// Soft-delete every session of the caller except the current one.
    pub async fn logout_all_others(&self, context: SessionContext) -> Result<u64, SessionError> {
        let removed = self
            .store
            .soft_delete_all_except(context.user_id, context.device_id)
            .await?;
        info!(
            user_id = context.user_id,
            device_id = %context.device_id,
            removed,
            "other sessions logged out"
        );
        Ok(removed)
    }

    pub async fn delete_specific_session(
        &self,
        context: SessionContext,
        target_device_id: Uuid,
    ) -> Result<(), SessionError> {
        let Some(session) = self.store.find_by_device_id(target_device_id).await? else {
            return Err(SessionError::NotFound);
        };
        if !session.belongs_to(context.user_id) {
            warn!(
                user_id = context.user_id,
                target_device_id = %target_device_id,
                "attempt to delete another user's session"
            );
            return Err(SessionError::Forbidden);
        }
        if !self.store.soft_delete(session.id).await? {
            return Err(SessionError::NotFound);
        }
        info!(
            user_id = context.user_id,
            target_device_id = %target_device_id,
            "session deleted"
        );
        Ok(())
    }

    pub async fn list_devices(
        &self,
        context: SessionContext,
    ) -> Result<Vec<DeviceView>, SessionError> {
        let sessions = self.store.list_for_user(context.user_id).await?;
        Ok(sessions.iter().map(DeviceView::from).collect())
    }

    /// Hard-delete sessions soft-deleted longer ago than `retention`.
    pub async fn run_cleanup(&self, retention: Duration) -> Result<u64> {
        self.store
            .hard_delete_older_than(retention)
            .await
            .context("hard-deleting expired sessions")
    }
}

fn unix_to_timestamp(secs: i64) -> Result<DateTime<Utc>, SessionError> {
    timestamp_from_unix(secs)
        .ok_or_else(|| SessionError::Storage(anyhow!("timestamp {secs} out of range")))
}

/// Credential checks against the `users` table.
#[derive(Clone)]
pub struct DatabaseCredentialVerifier {
    pool: StoragePool,
}

impl DatabaseCredentialVerifier {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialVerifier for DatabaseCredentialVerifier {
    async fn authenticate(
        &self,
        login_or_email: &str,
        password: &str,
    ) -> Result<Option<UserContext>> {
        match UserRepository::verify_credentials(self.pool.pool(), login_or_email, password).await
        {
            Ok(user_id) => Ok(Some(UserContext { user_id })),
            Err(err) => match err.downcast_ref::<CredentialError>() {
                Some(CredentialError::InvalidCredentials | CredentialError::UserNotFound) => {
                    Ok(None)
                }
                None => Err(err),
            },
        }
    }
}

pub struct PostgresSessionStore {
    repository: DeviceSessionRepository,
}

impl PostgresSessionStore {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            repository: DeviceSessionRepository::new(pool),
        }
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn insert(&self, session: &NewSession) -> Result<Session> {
        self.repository.insert(session).await
    }

    async fn find_by_device_id(&self, device_id: Uuid) -> Result<Option<Session>> {
        self.repository.find_active_by_device_id(device_id).await
    }

    async fn list_for_user(&self, user_id: DbId) -> Result<Vec<Session>> {
        self.repository.list_active_for_user(user_id).await
    }

    async fn update_timestamps(
        &self,
        session_id: DbId,
        previous_iat: DateTime<Utc>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.repository
            .update_timestamps(session_id, previous_iat, issued_at, expires_at)
            .await
    }

    async fn soft_delete(&self, session_id: DbId) -> Result<bool> {
        self.repository.soft_delete(session_id, Utc::now()).await
    }

    async fn soft_delete_all_except(&self, user_id: DbId, device_id: Uuid) -> Result<u64> {
        self.repository
            .soft_delete_all_except(user_id, device_id, Utc::now())
            .await
    }

    async fn hard_delete_older_than(&self, retention: Duration) -> Result<u64> {
        self.repository.hard_delete_older_than(retention).await
    }
}

/// Process-local store used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemorySessionStore {
    pub(crate) users: RwLock<Vec<UserRecord>>,
    sessions: RwLock<Vec<Session>>,
}

pub(crate) struct UserRecord {
    pub(crate) id: DbId,
    pub(crate) login: String,
    pub(crate) email: String,
    pub(crate) password_hash: String,
    pub(crate) confirmed: bool,
    pub(crate) confirmation: Option<(String, DateTime<Utc>)>,
    pub(crate) recovery: Option<(String, DateTime<Utc>)>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a confirmed user reachable by `login` and by `email`.
    pub async fn register_user(
        &self,
        login: &str,
        email: &str,
        password: &str,
        user_id: DbId,
    ) -> Result<()> {
        let password_hash =
            hash_password(password).map_err(|err| anyhow!("hashing password failed: {err}"))?;
        self.users.write().await.push(UserRecord {
            id: user_id,
            login: login.to_string(),
            email: email.to_string(),
            password_hash,
            confirmed: true,
            confirmation: None,
            recovery: None,
        });
        Ok(())
    }

    #[cfg(test)]
    pub async fn all_sessions(&self) -> Vec<Session> {
        self.sessions.read().await.clone()
    }

    #[cfg(test)]
    pub async fn backdate_deletion(&self, device_id: Uuid, deleted_at: DateTime<Utc>) {
        let mut sessions = self.sessions.write().await;
        for session in sessions.iter_mut().filter(|s| s.device_id == device_id) {
            session.deleted_at = Some(deleted_at);
        }
    }
}

#[async_trait]
impl CredentialVerifier for InMemorySessionStore {
    async fn authenticate(
        &self,
        login_or_email: &str,
        password: &str,
    ) -> Result<Option<UserContext>> {
        let (user_id, password_hash) = {
            let users = self.users.read().await;
            let found = users
                .iter()
                .find(|u| u.login == login_or_email)
                .or_else(|| users.iter().find(|u| u.email == login_or_email));
            match found {
                Some(record) => (record.id, record.password_hash.clone()),
                None => return Ok(None),
            }
        };
        let password = password.to_owned();
        let matches =
            tokio::task::spawn_blocking(move || verify_password(&password, &password_hash))
                .await
                .context("password verification task failed")?
                .map_err(|err| anyhow!("stored password hash unusable: {err}"))?;
        Ok(matches.then_some(UserContext { user_id }))
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: &NewSession) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        if sessions
            .iter()
            .any(|s| s.device_id == session.device_id && s.is_active())
        {
            return Err(anyhow!(
                "active session already exists for device {}",
                session.device_id
            ));
        }
        let id = sessions.iter().map(|s| s.id).max().unwrap_or(0) + 1;
        let stored = session.clone().into_session(id);
        sessions.push(stored.clone());
        Ok(stored)
    }

    async fn find_by_device_id(&self, device_id: Uuid) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .iter()
            .find(|s| s.device_id == device_id && s.is_active())
            .cloned())
    }

    async fn list_for_user(&self, user_id: DbId) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut active: Vec<Session> = sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(active)
    }

    async fn update_timestamps(
        &self,
        session_id: DbId,
        previous_iat: DateTime<Utc>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.is_active() && s.issued_at == previous_iat)
        {
            Some(session) => {
                session.issued_at = issued_at;
                session.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn soft_delete(&self, session_id: DbId) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.is_active())
        {
            Some(session) => {
                session.deleted_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn soft_delete_all_except(&self, user_id: DbId, device_id: Uuid) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        let mut removed = 0;
        for session in sessions
            .iter_mut()
            .filter(|s| s.user_id == user_id && s.device_id != device_id && s.is_active())
        {
            session.deleted_at = Some(now);
            removed += 1;
        }
        Ok(removed)
    }

    async fn hard_delete_older_than(&self, retention: Duration) -> Result<u64> {
        let cutoff = retention_cutoff(Utc::now(), retention).with_context(|| {
            format!("retention of {} days is out of range", retention.num_days())
        })?;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|s| !matches!(s.deleted_at, Some(deleted_at) if deleted_at < cutoff));
        Ok((before - sessions.len()) as u64)
    }
}
