//! Cryptographic helpers shared across the quillhub backend.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

pub mod password;
pub mod token;

pub use password::{hash_password, verify_password, PasswordError};
pub use token::{
    decode_claims, AccessClaims, IssuedToken, RefreshClaims, TokenError, TokenIssuer,
    TokenSettings,
};

const SECRET_LEN: usize = 32;

/// Random URL-safe secret suitable for HMAC signing.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Opaque one-time code for e-mail confirmation and password recovery.
pub fn generate_code() -> String {
    Uuid::new_v4().to_string()
}
