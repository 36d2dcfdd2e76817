use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DbId;

/// Convert a JWT NumericDate (whole seconds) into a timestamp.
pub fn timestamp_from_unix(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Oldest `deleted_at` that survives a retention pass, or `None` when the
/// window reaches past the representable calendar.
pub fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(retention)
}

/// One authenticated device for one user.
///
/// `issued_at` and `expires_at` mirror the `iat`/`exp` claims of the refresh
/// token currently valid for this device. A presented refresh token whose
/// `iat` differs from `issued_at` has been superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: DbId,
    pub user_id: DbId,
    pub device_id: Uuid,
    pub device_name: String,
    pub ip: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    SoftDeleted,
}

impl Session {
    pub fn state(&self) -> SessionState {
        match self.deleted_at {
            Some(_) => SessionState::SoftDeleted,
            None => SessionState::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Whether a refresh token carrying `iat` is the one this session last issued.
    pub fn matches_issued_at(&self, iat: i64) -> bool {
        self.issued_at.timestamp() == iat
    }

    pub fn belongs_to(&self, user_id: DbId) -> bool {
        self.user_id == user_id
    }
}

/// Values required to record a fresh login.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: DbId,
    pub device_id: Uuid,
    pub device_name: String,
    pub ip: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NewSession {
    pub fn into_session(self, id: DbId) -> Session {
        Session {
            id,
            user_id: self.user_id,
            device_id: self.device_id,
            device_name: self.device_name,
            ip: self.ip,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            deleted_at: None,
        }
    }
}

/// Identity established by a successful credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: DbId,
}

/// Identity established by a validated refresh token.
///
/// `token_iat` is the `iat` of the presented token; rotation only succeeds
/// while the session row still carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: DbId,
    pub device_id: Uuid,
    pub token_iat: i64,
}

/// Request metadata captured when a session is created.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn new(ip: Option<impl Into<String>>, user_agent: Option<impl Into<String>>) -> Self {
        Self {
            ip: ip.map(Into::into),
            user_agent: user_agent.map(Into::into),
        }
    }
}

/// Public projection of a session for the device list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub ip: Option<String>,
    pub title: String,
    pub last_active_date: DateTime<Utc>,
    pub device_id: Uuid,
}

impl From<&Session> for DeviceView {
    fn from(session: &Session) -> Self {
        Self {
            ip: session.ip.clone(),
            title: session.device_name.clone(),
            last_active_date: session.issued_at,
            device_id: session.device_id,
        }
    }
}
