use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::identity::{derive_id, SubscriptionId};

/// Unpadded base64url on output, padding optional on input. Browsers emit
/// subscription keys without padding.
pub const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Uncompressed SEC1 P-256 point.
pub const UA_PUBLIC_KEY_LEN: usize = 65;
pub const AUTH_SECRET_LEN: usize = 16;
pub const IKM_LEN: usize = 32;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// A `PushSubscription` as serialized by the browser.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub expiration_time: Option<f64>,
}

/// Notification body delivered to the service worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    pub title: String,
    pub body: String,
}

impl Event {
    pub fn setup() -> Self {
        Event {
            title: "initialSetup".to_string(),
            body: "SUCCESS - SUBSCRIPTION SET UP".to_string(),
        }
    }

    pub fn sequence(seq: u64) -> Self {
        Event {
            title: format!("Notification {}", seq),
            body: format!("Value: {}", seq),
        }
    }
}

/// RFC 8188 key id and input keying material for one key generation.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    key_id: Vec<u8>,
    ikm: [u8; IKM_LEN],
}

impl KeyMaterial {
    pub fn new(key_id: Vec<u8>, ikm: [u8; IKM_LEN]) -> Self {
        KeyMaterial { key_id, ikm }
    }

    pub fn key_id(&self) -> &[u8] {
        &self.key_id
    }

    pub fn ikm(&self) -> &[u8; IKM_LEN] {
        &self.ikm
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &BASE64_URL.encode(&self.key_id))
            .field("ikm", &"<redacted>")
            .finish()
    }
}

struct SlotState {
    uses: u64,
    current: Arc<OnceCell<Arc<KeyMaterial>>>,
}

/// Cached key material with a use counter.
///
/// Every call to [`KeyMaterialSlot::acquire`] counts as one encryption. The
/// first call, and the first call after `threshold` uses, opens a fresh
/// generation. All callers of one generation share a single `OnceCell`, so
/// concurrent callers wait on the same derivation instead of starting their
/// own.
pub struct KeyMaterialSlot {
    state: Mutex<SlotState>,
}

impl KeyMaterialSlot {
    pub fn new() -> Self {
        KeyMaterialSlot {
            state: Mutex::new(SlotState {
                uses: 0,
                current: Arc::new(OnceCell::new()),
            }),
        }
    }

    pub(crate) async fn acquire<F, Fut>(&self, threshold: u64, derive: F) -> Result<Arc<KeyMaterial>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<KeyMaterial>>,
    {
        let cell = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.uses == 0 || state.uses >= threshold {
                state.current = Arc::new(OnceCell::new());
                state.uses = 0;
            }
            state.uses += 1;
            state.current.clone()
        };

        // A failed derivation leaves the cell empty; the next caller retries.
        let material = cell
            .get_or_try_init(move || async move { derive().await.map(Arc::new) })
            .await?;

        Ok(material.clone())
    }
}

impl Default for KeyMaterialSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated, immutable subscription. Only the key material slot changes
/// after construction, and only through the registry.
pub struct Subscription {
    id: SubscriptionId,
    endpoint: Url,
    ua_public: [u8; UA_PUBLIC_KEY_LEN],
    auth_secret: [u8; AUTH_SECRET_LEN],
    expiration: Option<DateTime<Utc>>,
    key_slot: KeyMaterialSlot,
}

fn decode_key<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N]> {
    let bytes = BASE64_URL.decode(value).map_err(|e| Error::InvalidKey {
        field,
        reason: e.to_string(),
    })?;

    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| Error::InvalidKey {
        field,
        reason: format!("expected {} bytes, got {}", N, bytes.len()),
    })
}

impl Subscription {
    /// Validates browser subscription data and computes its identity.
    pub fn from_info(info: &SubscriptionInfo) -> Result<Self> {
        let endpoint =
            Url::parse(&info.endpoint).map_err(|e| Error::InvalidEndpoint(e.to_string()))?;
        if endpoint.scheme() != "http" && endpoint.scheme() != "https" {
            return Err(Error::UnsupportedScheme(endpoint.scheme().to_string()));
        }

        let ua_public: [u8; UA_PUBLIC_KEY_LEN] = decode_key("p256dh", &info.keys.p256dh)?;
        if ua_public[0] != 0x04 {
            return Err(Error::InvalidKey {
                field: "p256dh",
                reason: "not an uncompressed point".to_string(),
            });
        }
        let auth_secret: [u8; AUTH_SECRET_LEN] = decode_key("auth", &info.keys.auth)?;

        let expiration = info
            .expiration_time
            .filter(|ms| ms.is_finite())
            .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single());
        if let Some(expiration) = expiration {
            if expiration <= Utc::now() {
                return Err(Error::Expired(expiration.timestamp_millis()));
            }
        }

        Ok(Subscription {
            id: derive_id(info),
            endpoint,
            ua_public,
            auth_secret,
            expiration,
            key_slot: KeyMaterialSlot::new(),
        })
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Scheme, host and non-default port of the endpoint.
    pub fn origin(&self) -> String {
        self.endpoint.origin().ascii_serialization()
    }

    pub fn ua_public(&self) -> &[u8; UA_PUBLIC_KEY_LEN] {
        &self.ua_public
    }

    pub fn auth_secret(&self) -> &[u8; AUTH_SECRET_LEN] {
        &self.auth_secret
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration, Some(expiration) if expiration <= now)
    }

    pub(crate) fn key_slot(&self) -> &KeyMaterialSlot {
        &self.key_slot
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.as_str())
            .field("expiration", &self.expiration)
            .finish()
    }
}
