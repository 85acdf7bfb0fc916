//! Error types for push-relay.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid subscription key {field}: {reason}")]
    InvalidKey { field: &'static str, reason: String },

    #[error("subscription expired at {0}")]
    Expired(i64),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("could not load VAPID signing key: {0}")]
    SigningKey(String),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: {0}")]
    Decryption(&'static str),

    #[error("malformed content-encoding header: {0}")]
    MalformedHeader(&'static str),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl Error {
    /// True for errors caused by the registration request itself rather than
    /// by the crypto stack or the network.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedScheme(_)
                | Error::InvalidEndpoint(_)
                | Error::InvalidKey { .. }
                | Error::Expired(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
