use anyhow::Context;
use axum::{
    extract::State,
    http::{header::SET_COOKIE, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use quillhub_core::DbId;
use serde::{Deserialize, Serialize};

use crate::{
    error::{validation_response, FieldError},
    guard::{cleared_cookie, refresh_cookie, AccessUser, RefreshSession, RequestClient},
    session::{SessionError, TokenPair},
    AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub login_or_email: String,
    pub password: String,
}

impl LoginRequest {
    fn validate(self) -> Result<(String, String), Vec<FieldError>> {
        let mut errors = Vec::new();
        let login_or_email = self.login_or_email.trim().to_string();
        if login_or_email.is_empty() {
            errors.push(FieldError::new("loginOrEmail", "must be provided"));
        }
        // Registration and password reset store the trimmed password.
        let password = self.password.trim().to_string();
        if password.is_empty() {
            errors.push(FieldError::new("password", "must be provided"));
        }

        if errors.is_empty() {
            Ok((login_or_email, password))
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenResponse {
    pub access_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub user_id: DbId,
    pub login: String,
    pub email: String,
}

/// Body carries the access token, the refresh token travels as a cookie.
fn token_response(state: &AppState, pair: TokenPair) -> Result<Response, SessionError> {
    let config = state.config();
    let cookie = refresh_cookie(&config.cookie, config.cookie_max_age_secs(), &pair.refresh_token)
        .context("refresh token is not a valid cookie value")?;
    Ok((
        [(SET_COOKIE, cookie)],
        Json(AccessTokenResponse {
            access_token: pair.access_token,
        }),
    )
        .into_response())
}

pub async fn login(
    State(state): State<AppState>,
    RequestClient(client): RequestClient,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, SessionError> {
    let (login_or_email, password) = match payload.validate() {
        Ok(valid) => valid,
        Err(errors) => return Ok(validation_response(errors)),
    };

    let user = match state.session().authenticate(&login_or_email, &password).await {
        Ok(user) => user,
        Err(err) => {
            state.record_auth_event("login_rejected");
            return Err(err);
        }
    };
    let pair = state.session().login(user, &client).await?;
    state.record_auth_event("login");
    token_response(&state, pair)
}

pub async fn refresh_token(
    State(state): State<AppState>,
    RefreshSession(context): RefreshSession,
) -> Result<Response, SessionError> {
    let pair = state.session().refresh(context).await?;
    state.record_auth_event("refresh");
    token_response(&state, pair)
}

pub async fn logout(
    State(state): State<AppState>,
    RefreshSession(context): RefreshSession,
) -> Result<Response, SessionError> {
    state.session().logout(context).await?;
    state.record_auth_event("logout");
    let cookie = cleared_cookie(&state.config().cookie).context("building logout cookie")?;
    Ok((StatusCode::NO_CONTENT, [(SET_COOKIE, cookie)]).into_response())
}

pub async fn me(
    State(state): State<AppState>,
    AccessUser(access): AccessUser,
) -> Result<Json<MeResponse>, SessionError> {
    let profile = state
        .accounts()
        .profile(access.user_id)
        .await?
        .ok_or(SessionError::Unauthorized)?;
    Ok(Json(MeResponse {
        user_id: profile.id,
        login: profile.login,
        email: profile.email,
    }))
}
