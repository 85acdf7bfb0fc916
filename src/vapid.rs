//! Voluntary Application Server Identification (RFC 8292).

use base64::Engine;
use chrono::Utc;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::BASE64_URL;

/// Lifetime of a token, and the clock skew allowed before `iat`.
pub const TOKEN_VALIDITY_SECS: i64 = 60;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct JwtHeader {
    pub typ: String,
    pub alg: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Claims {
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub sub: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VapidToken {
    pub jwt: String,
    pub expires_at: i64,
}

/// The application server's ECDSA P-256 key pair.
#[derive(Clone)]
pub struct VapidKey {
    signing_key: SigningKey,
    public_key: Vec<u8>,
}

impl VapidKey {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();

        VapidKey {
            signing_key,
            public_key,
        }
    }

    /// Imports a private key given either as a PEM document (PKCS#8 or SEC1)
    /// or as the base64url-encoded 32-byte scalar.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();

        let signing_key = if value.starts_with("-----BEGIN") {
            match SigningKey::from_pkcs8_pem(value) {
                Ok(key) => key,
                Err(_) => SecretKey::from_sec1_pem(value)
                    .map(SigningKey::from)
                    .map_err(|e| Error::SigningKey(e.to_string()))?,
            }
        } else {
            let raw = BASE64_URL
                .decode(value)
                .map_err(|e| Error::SigningKey(e.to_string()))?;
            SigningKey::from_slice(&raw).map_err(|e| Error::SigningKey(e.to_string()))?
        };

        Ok(Self::from_signing_key(signing_key))
    }

    /// Uncompressed SEC1 public point, as served to the browser.
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_key
    }

    pub fn public_key_base64(&self) -> String {
        BASE64_URL.encode(&self.public_key)
    }

    pub fn private_key_base64(&self) -> String {
        BASE64_URL.encode(self.signing_key.to_bytes())
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

/// Issues origin-scoped bearer tokens for one key pair and contact address.
#[derive(Clone)]
pub struct VapidSigner {
    key: VapidKey,
    subject: String,
}

impl VapidSigner {
    pub fn new(key: VapidKey, contact: &str) -> Self {
        let subject = if contact.starts_with("mailto:") || contact.starts_with("https:") {
            contact.to_string()
        } else {
            format!("mailto:{}", contact)
        };

        VapidSigner { key, subject }
    }

    pub fn key(&self) -> &VapidKey {
        &self.key
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// `audience` must be the push endpoint's origin, not its full URL.
    pub fn issue(&self, audience: &str) -> Result<VapidToken> {
        self.issue_at(audience, Utc::now().timestamp())
    }

    pub fn issue_at(&self, audience: &str, now: i64) -> Result<VapidToken> {
        let header = JwtHeader {
            typ: "JWT".to_string(),
            alg: "ES256".to_string(),
        };
        let claims = Claims {
            aud: audience.to_string(),
            exp: now + TOKEN_VALIDITY_SECS,
            iat: now,
            nbf: now - TOKEN_VALIDITY_SECS,
            sub: self.subject.clone(),
        };

        let signing_input = format!(
            "{}.{}",
            BASE64_URL.encode(serde_json::to_vec(&header)?),
            BASE64_URL.encode(serde_json::to_vec(&claims)?),
        );
        let signature: Signature = self.key.signing_key.sign(signing_input.as_bytes());

        Ok(VapidToken {
            jwt: format!("{}.{}", signing_input, BASE64_URL.encode(signature.to_bytes())),
            expires_at: claims.exp,
        })
    }

    /// Value of the `authorization` header for a push request.
    pub fn authorization(&self, token: &VapidToken) -> String {
        format!("vapid t={}, k={}", token.jwt, self.key.public_key_base64())
    }
}
