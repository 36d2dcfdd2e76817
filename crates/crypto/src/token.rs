//! HS256 access and refresh tokens.
//!
//! Access tokens carry `{id}` and are never tracked server side. Refresh
//! tokens carry `{userId, deviceId}` and their `iat` is mirrored on the device
//! session row, which is how superseded refresh tokens get rejected. The two
//! kinds are signed with distinct secrets.

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use quillhub_core::DbId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token invalid")]
    Invalid,
    #[error("access and refresh tokens must use different secrets")]
    SharedSecret,
    #[error("{0} secret must not be empty")]
    EmptySecret(&'static str),
    #[error("{0} ttl must be positive")]
    InvalidTtl(&'static str),
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Invalid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub id: DbId,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshClaims {
    pub user_id: DbId,
    pub device_id: Uuid,
    pub iat: i64,
    pub exp: i64,
}

/// A signed token together with the claims that went into it.
#[derive(Debug, Clone)]
pub struct IssuedToken<C> {
    pub token: String,
    pub claims: C,
}

#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub access_secret: String,
    pub access_ttl: Duration,
    pub refresh_secret: String,
    pub refresh_ttl: Duration,
}

#[derive(Clone)]
pub struct TokenIssuer {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(settings: &TokenSettings) -> Result<Self, TokenError> {
        if settings.access_secret.is_empty() {
            return Err(TokenError::EmptySecret("access token"));
        }
        if settings.refresh_secret.is_empty() {
            return Err(TokenError::EmptySecret("refresh token"));
        }
        if settings.access_secret == settings.refresh_secret {
            return Err(TokenError::SharedSecret);
        }
        if settings.access_ttl <= Duration::zero() {
            return Err(TokenError::InvalidTtl("access token"));
        }
        if settings.refresh_ttl <= Duration::zero() {
            return Err(TokenError::InvalidTtl("refresh token"));
        }

        let access = settings.access_secret.as_bytes();
        let refresh = settings.refresh_secret.as_bytes();
        Ok(Self {
            access_encoding: EncodingKey::from_secret(access),
            access_decoding: DecodingKey::from_secret(access),
            refresh_encoding: EncodingKey::from_secret(refresh),
            refresh_decoding: DecodingKey::from_secret(refresh),
            access_ttl: settings.access_ttl,
            refresh_ttl: settings.refresh_ttl,
        })
    }

    pub fn issue_access_token(&self, user_id: DbId) -> Result<IssuedToken<AccessClaims>, TokenError> {
        let iat = Utc::now().timestamp();
        let claims = AccessClaims {
            id: user_id,
            iat,
            exp: iat + self.access_ttl.num_seconds(),
        };
        let token = sign(&claims, &self.access_encoding)?;
        Ok(IssuedToken { token, claims })
    }

    pub fn issue_refresh_token(
        &self,
        user_id: DbId,
        device_id: Uuid,
    ) -> Result<IssuedToken<RefreshClaims>, TokenError> {
        self.issue_refresh_token_at(user_id, device_id, Utc::now().timestamp())
    }

    /// Sign a refresh token with an explicit `iat` (seconds since the epoch).
    pub fn issue_refresh_token_at(
        &self,
        user_id: DbId,
        device_id: Uuid,
        iat: i64,
    ) -> Result<IssuedToken<RefreshClaims>, TokenError> {
        let claims = RefreshClaims {
            user_id,
            device_id,
            iat,
            exp: iat + self.refresh_ttl.num_seconds(),
        };
        let token = sign(&claims, &self.refresh_encoding)?;
        Ok(IssuedToken { token, claims })
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, TokenError> {
        verify(token, &self.access_decoding)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        verify(token, &self.refresh_decoding)
    }
}

/// Read claims without checking signature or expiry.
///
/// Only for tokens that were verified earlier or were just signed locally.
pub fn decode_claims<C: DeserializeOwned>(token: &str) -> Result<C, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    let data = decode::<C>(token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims)
}

fn sign<C: Serialize>(claims: &C, key: &EncodingKey) -> Result<String, TokenError> {
    encode(&Header::new(Algorithm::HS256), claims, key).map_err(TokenError::Signing)
}

fn verify<C: DeserializeOwned>(token: &str, key: &DecodingKey) -> Result<C, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    let data = decode::<C>(token, key, &validation)?;
    Ok(data.claims)
}
