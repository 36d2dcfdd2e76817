//! Registration, e-mail confirmation and password recovery.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use quillhub_core::DbId;
use quillhub_crypto::{generate_code, hash_password};
use quillhub_storage::{
    AccountRepository, ConfirmationStatus, CreateUserError, NewUser, PendingConfirmation,
    StoragePool, UserProfile, UserRepository,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    config::{AccountConfig, ConfigError},
    error::{validation_response, ErrorBody, FieldError},
    session::{InMemorySessionStore, UserRecord},
    AppState,
};

const LOGIN_TAKEN: FieldError = FieldError::new("login", "login already taken");
const EMAIL_TAKEN: FieldError = FieldError::new("email", "email already registered");

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),
    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl AccountError {
    fn field(field: &'static str, message: &'static str) -> Self {
        AccountError::Validation(vec![FieldError::new(field, message)])
    }
}

impl IntoResponse for AccountError {
    fn into_response(self) -> Response {
        match self {
            AccountError::Validation(details) => validation_response(details),
            AccountError::Storage(err) => {
                error!(?err, "account operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody::server_error()),
                )
                    .into_response()
            }
        }
    }
}

/// Persistence of user accounts and their one-time codes.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_conflicts(&self, login: &str, email: &str) -> Result<(bool, bool)>;
    async fn create_user(&self, user: &NewUser) -> Result<DbId, CreateUserError>;
    async fn find_profile(&self, user_id: DbId) -> Result<Option<UserProfile>>;
    async fn confirmation_status(&self, email: &str) -> Result<Option<ConfirmationStatus>>;
    async fn confirm_email(&self, code: &str, now: DateTime<Utc>) -> Result<bool>;
    async fn regenerate_confirmation(
        &self,
        email: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn set_recovery_code(
        &self,
        email: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn reset_password(
        &self,
        recovery_code: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Outbound mail. Delivery transport is pluggable.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_confirmation(&self, email: &str, code: &str) -> Result<()>;
    async fn send_recovery(&self, email: &str, code: &str) -> Result<()>;
}

/// Mailer that only records dispatches in the log.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_confirmation(&self, email: &str, _code: &str) -> Result<()> {
        info!(%email, "confirmation email dispatched");
        Ok(())
    }

    async fn send_recovery(&self, email: &str, _code: &str) -> Result<()> {
        info!(%email, "password recovery email dispatched");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationRequest {
    pub login: String,
    pub password: String,
    pub email: String,
}

#[derive(Debug)]
struct ValidatedRegistration {
    login: String,
    password: String,
    email: String,
}

impl RegistrationRequest {
    fn validate(self) -> Result<ValidatedRegistration, Vec<FieldError>> {
        let mut errors = Vec::new();

        let login = self.login.trim().to_string();
        if let Err(err) = validate_login(&login) {
            errors.push(err);
        }
        let password = self.password.trim().to_string();
        if let Err(err) = validate_password("password", &password) {
            errors.push(err);
        }
        let email = self.email.trim().to_string();
        if !is_valid_email(&email) {
            errors.push(FieldError::new("email", "must be a valid email"));
        }

        if errors.is_empty() {
            Ok(ValidatedRegistration {
                login,
                password,
                email,
            })
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfirmationRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPasswordRequest {
    pub new_password: String,
    pub recovery_code: String,
}

fn validate_login(login: &str) -> Result<(), FieldError> {
    let length = login.chars().count();
    if !(3..=10).contains(&length) {
        return Err(FieldError::new("login", "must be 3 to 10 characters"));
    }
    if !login
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(FieldError::new(
            "login",
            "may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

/// Expects an already trimmed password; the trimmed value is what gets hashed.
fn validate_password(field: &'static str, password: &str) -> Result<(), FieldError> {
    let length = password.chars().count();
    if (6..=20).contains(&length) {
        Ok(())
    } else {
        Err(FieldError::new(field, "must be 6 to 20 characters"))
    }
}

/// `local@domain.tld` with word characters, dots and dashes.
fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
    if local.is_empty() || !local.chars().all(|c| word(c) || c == '.') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty() || !label.chars().all(word))
    {
        return false;
    }
    labels.last().is_some_and(|tld| tld.len() >= 2)
}

async fn hash_off_thread(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .context("password hashing task failed")?
        .map_err(|err| anyhow!("failed to hash password: {err}"))
}

#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn AccountStore>,
    mailer: Arc<dyn Mailer>,
    confirmation_ttl: Duration,
    recovery_ttl: Duration,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn AccountStore>,
        mailer: Arc<dyn Mailer>,
        config: &AccountConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            store,
            mailer,
            confirmation_ttl: config.confirmation_ttl()?,
            recovery_ttl: config.recovery_ttl()?,
        })
    }

    pub async fn register(&self, request: RegistrationRequest) -> Result<DbId, AccountError> {
        let request = request.validate().map_err(AccountError::Validation)?;

        let (login_taken, email_taken) = self
            .store
            .find_conflicts(&request.login, &request.email)
            .await?;
        if login_taken || email_taken {
            let mut details = Vec::new();
            if login_taken {
                details.push(LOGIN_TAKEN);
            }
            if email_taken {
                details.push(EMAIL_TAKEN);
            }
            return Err(AccountError::Validation(details));
        }

        let code = generate_code();
        let new_user = NewUser {
            login: request.login,
            email: request.email,
            password_hash: hash_off_thread(request.password).await?,
            confirmation: Some(PendingConfirmation {
                code: code.clone(),
                expires_at: Utc::now() + self.confirmation_ttl,
            }),
        };

        let user_id = match self.store.create_user(&new_user).await {
            Ok(user_id) => user_id,
            Err(CreateUserError::LoginTaken) => {
                return Err(AccountError::Validation(vec![LOGIN_TAKEN]))
            }
            Err(CreateUserError::EmailTaken) => {
                return Err(AccountError::Validation(vec![EMAIL_TAKEN]))
            }
            Err(CreateUserError::Other(err)) => return Err(err.into()),
        };
        info!(user_id, login = %new_user.login, "user registered");

        if let Err(err) = self.mailer.send_confirmation(&new_user.email, &code).await {
            error!(?err, user_id, "failed to send confirmation email");
        }
        Ok(user_id)
    }

    pub async fn confirm(&self, code: &str) -> Result<(), AccountError> {
        let code = code.trim();
        if code.is_empty() || !self.store.confirm_email(code, Utc::now()).await? {
            return Err(AccountError::field(
                "code",
                "confirmation code is invalid, expired or already applied",
            ));
        }
        info!("email confirmed");
        Ok(())
    }

    pub async fn resend_confirmation(&self, email: &str) -> Result<(), AccountError> {
        let email = email.trim();
        if !is_valid_email(email) {
            return Err(AccountError::field("email", "must be a valid email"));
        }

        let code = generate_code();
        let expires_at = Utc::now() + self.confirmation_ttl;
        if !self
            .store
            .regenerate_confirmation(email, &code, expires_at)
            .await?
        {
            let message = match self.store.confirmation_status(email).await? {
                Some(ConfirmationStatus::Confirmed) => "email already confirmed",
                Some(ConfirmationStatus::NotConfirmed) | None => "no account with this email",
            };
            return Err(AccountError::field("email", message));
        }

        self.mailer
            .send_confirmation(email, &code)
            .await
            .context("sending confirmation email")?;
        Ok(())
    }

    /// Start password recovery. Unknown addresses succeed silently.
    pub async fn recover_password(&self, email: &str) -> Result<(), AccountError> {
        let email = email.trim();
        if !is_valid_email(email) {
            return Err(AccountError::field("email", "must be a valid email"));
        }

        let code = generate_code();
        let expires_at = Utc::now() + self.recovery_ttl;
        if !self.store.set_recovery_code(email, &code, expires_at).await? {
            debug!("password recovery requested for unknown email");
            return Ok(());
        }
        if let Err(err) = self.mailer.send_recovery(email, &code).await {
            error!(?err, "failed to send password recovery email");
        }
        Ok(())
    }

    pub async fn set_new_password(&self, request: NewPasswordRequest) -> Result<(), AccountError> {
        let new_password = request.new_password.trim().to_string();
        validate_password("newPassword", &new_password)
            .map_err(|err| AccountError::Validation(vec![err]))?;
        let code = request.recovery_code.trim();
        if code.is_empty() {
            return Err(AccountError::field("recoveryCode", "must be provided"));
        }

        let password_hash = hash_off_thread(new_password).await?;
        if !self
            .store
            .reset_password(code, &password_hash, Utc::now())
            .await?
        {
            return Err(AccountError::field(
                "recoveryCode",
                "recovery code is invalid or expired",
            ));
        }
        info!("password reset via recovery code");
        Ok(())
    }

    pub async fn profile(&self, user_id: DbId) -> Result<Option<UserProfile>> {
        self.store.find_profile(user_id).await
    }
}

pub async fn registration(
    State(state): State<AppState>,
    Json(payload): Json<RegistrationRequest>,
) -> Result<StatusCode, AccountError> {
    state.accounts().register(payload).await?;
    state.record_auth_event("registration");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn registration_confirmation(
    State(state): State<AppState>,
    Json(payload): Json<ConfirmationRequest>,
) -> Result<StatusCode, AccountError> {
    state.accounts().confirm(&payload.code).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn registration_email_resending(
    State(state): State<AppState>,
    Json(payload): Json<EmailRequest>,
) -> Result<StatusCode, AccountError> {
    state.accounts().resend_confirmation(&payload.email).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn password_recovery(
    State(state): State<AppState>,
    Json(payload): Json<EmailRequest>,
) -> Result<StatusCode, AccountError> {
    state.accounts().recover_password(&payload.email).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn new_password(
    State(state): State<AppState>,
    Json(payload): Json<NewPasswordRequest>,
) -> Result<StatusCode, AccountError> {
    state.accounts().set_new_password(payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Clone)]
pub struct PostgresAccountStore {
    pool: StoragePool,
}

impl PostgresAccountStore {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    async fn find_conflicts(&self, login: &str, email: &str) -> Result<(bool, bool)> {
        UserRepository::find_conflicts(self.pool.pool(), login, email).await
    }

    async fn create_user(&self, user: &NewUser) -> Result<DbId, CreateUserError> {
        UserRepository::create_user(self.pool.pool(), user).await
    }

    async fn find_profile(&self, user_id: DbId) -> Result<Option<UserProfile>> {
        UserRepository::find_profile(self.pool.pool(), user_id).await
    }

    async fn confirmation_status(&self, email: &str) -> Result<Option<ConfirmationStatus>> {
        AccountRepository::confirmation_status(self.pool.pool(), email).await
    }

    async fn confirm_email(&self, code: &str, now: DateTime<Utc>) -> Result<bool> {
        AccountRepository::confirm_email(self.pool.pool(), code, now).await
    }

    async fn regenerate_confirmation(
        &self,
        email: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        AccountRepository::regenerate_confirmation(self.pool.pool(), email, code, expires_at).await
    }

    async fn set_recovery_code(
        &self,
        email: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        AccountRepository::set_recovery_code(self.pool.pool(), email, code, expires_at).await
    }

    async fn reset_password(
        &self,
        recovery_code: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        AccountRepository::reset_password(self.pool.pool(), recovery_code, password_hash, now).await
    }
}

#[async_trait]
impl AccountStore for InMemorySessionStore {
    async fn find_conflicts(&self, login: &str, email: &str) -> Result<(bool, bool)> {
        let users = self.users.read().await;
        Ok((
            users.iter().any(|u| u.login == login),
            users.iter().any(|u| u.email == email),
        ))
    }

    async fn create_user(&self, user: &NewUser) -> Result<DbId, CreateUserError> {
        let mut users = self.users.write().await;
        if users.iter().any(|u| u.login == user.login) {
            return Err(CreateUserError::LoginTaken);
        }
        if users.iter().any(|u| u.email == user.email) {
            return Err(CreateUserError::EmailTaken);
        }
        let id = users.iter().map(|u| u.id).max().unwrap_or(0) + 1;
        users.push(UserRecord {
            id,
            login: user.login.clone(),
            email: user.email.clone(),
            password_hash: user.password_hash.clone(),
            confirmed: user.confirmation.is_none(),
            confirmation: user
                .confirmation
                .as_ref()
                .map(|pending| (pending.code.clone(), pending.expires_at)),
            recovery: None,
        });
        Ok(id)
    }

    async fn find_profile(&self, user_id: DbId) -> Result<Option<UserProfile>> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.id == user_id).map(|u| UserProfile {
            id: u.id,
            login: u.login.clone(),
            email: u.email.clone(),
        }))
    }

    async fn confirmation_status(&self, email: &str) -> Result<Option<ConfirmationStatus>> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.email == email).map(|u| {
            if u.confirmed {
                ConfirmationStatus::Confirmed
            } else {
                ConfirmationStatus::NotConfirmed
            }
        }))
    }

    async fn confirm_email(&self, code: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut users = self.users.write().await;
        let found = users.iter_mut().find(|u| {
            !u.confirmed
                && matches!(&u.confirmation, Some((stored, expires_at)) if stored == code && *expires_at > now)
        });
        match found {
            Some(user) => {
                user.confirmed = true;
                user.confirmation = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn regenerate_confirmation(
        &self,
        email: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut users = self.users.write().await;
        match users.iter_mut().find(|u| u.email == email && !u.confirmed) {
            Some(user) => {
                user.confirmation = Some((code.to_string(), expires_at));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_recovery_code(
        &self,
        email: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut users = self.users.write().await;
        match users.iter_mut().find(|u| u.email == email) {
            Some(user) => {
                user.recovery = Some((code.to_string(), expires_at));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reset_password(
        &self,
        recovery_code: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut users = self.users.write().await;
        let found = users.iter_mut().find(|u| {
            matches!(&u.recovery, Some((stored, expires_at)) if stored == recovery_code && *expires_at > now)
        });
        match found {
            Some(user) => {
                user.password_hash = password_hash.to_string();
                user.recovery = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
