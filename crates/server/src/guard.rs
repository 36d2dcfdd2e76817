//! Request extractors that turn cookies and headers into typed identities.

use std::{convert::Infallible, net::SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{
        header::{InvalidHeaderValue, AUTHORIZATION, COOKIE, USER_AGENT},
        request::Parts,
        HeaderMap, HeaderValue,
    },
};
use quillhub_core::{ClientInfo, SessionContext};

use crate::{
    config::CookieConfig,
    session::{AccessContext, SessionError},
    AppState,
};

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Caller identified by a valid, current refresh-token cookie.
#[derive(Debug, Clone, Copy)]
pub struct RefreshSession(pub SessionContext);

/// Caller identified by a valid `Authorization: Bearer` access token.
#[derive(Debug, Clone, Copy)]
pub struct AccessUser(pub AccessContext);

/// Client address and user agent of the current request.
#[derive(Debug, Clone)]
pub struct RequestClient(pub ClientInfo);

impl FromRequestParts<AppState> for RefreshSession {
    type Rejection = SessionError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = cookie_value(&parts.headers, &state.config().cookie.name)
            .ok_or(SessionError::Unauthorized)?;
        let context = state.session().validate_refresh_token(&token).await?;
        Ok(Self(context))
    }
}

impl FromRequestParts<AppState> for AccessUser {
    type Rejection = SessionError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(SessionError::Unauthorized)?;
        let context = state.session().verify_access_token(token)?;
        Ok(Self(context))
    }
}

impl FromRequestParts<AppState> for RequestClient {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let forwarded = if state.config().trust_forwarded_for {
            forwarded_for(&parts.headers)
        } else {
            None
        };
        let ip = forwarded.or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(Self(ClientInfo { ip, user_agent }))
    }
}

/// Left-most `x-forwarded-for` entry, the client as seen by the first proxy.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Find cookie `name` across every `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// `Set-Cookie` value carrying a freshly issued refresh token.
pub fn refresh_cookie(
    cookie: &CookieConfig,
    max_age_secs: u64,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&render_cookie(cookie, token, max_age_secs))
}

/// `Set-Cookie` value that makes the client drop its refresh token.
pub fn cleared_cookie(cookie: &CookieConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&render_cookie(cookie, "", 0))
}

fn render_cookie(cookie: &CookieConfig, value: &str, max_age_secs: u64) -> String {
    let mut rendered = format!(
        "{}={}; Path={}; Max-Age={}",
        cookie.name, value, cookie.path, max_age_secs
    );
    if cookie.http_only {
        rendered.push_str("; HttpOnly");
    }
    if cookie.secure {
        rendered.push_str("; Secure");
    }
    rendered.push_str("; SameSite=");
    rendered.push_str(cookie.same_site.as_str());
    rendered
}
