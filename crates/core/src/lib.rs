//! Core domain types for device sessions and the user-agent derived device titles.

pub mod device;
pub mod session;

pub use device::{describe_user_agent, DeviceName};
pub use session::{
    retention_cutoff, timestamp_from_unix, ClientInfo, DeviceView, NewSession, Session, SessionContext,
    SessionState, UserContext,
};

/// Surrogate numeric identifier used for users and session rows.
pub type DbId = i64;
