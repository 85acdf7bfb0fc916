//! Deterministic subscription identities.
//!
//! The identity is a SHA-384 digest over a length-prefixed canonical form of
//! the endpoint and both keys, truncated to 16 bytes and printed as a UUID.
//! Nibble 12 is forced to `8`, which no random (v4) UUID carries, so a derived
//! id is recognisable at a glance.

use std::fmt;

use sha2::{Digest, Sha384};
use uuid::Uuid;

use crate::model::SubscriptionInfo;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

/// Builds the canonical byte encoding hashed by [`derive_id`].
///
/// Layout: `u32 len || endpoint || u16 len || p256dh || u16 len || auth`, all
/// lengths big-endian. Keys are validated before this point, so their
/// encoded length always fits in a `u16`.
fn canonical_form(endpoint: &str, p256dh: &str, auth: &str) -> Vec<u8> {
    debug_assert!(p256dh.len() <= u16::MAX as usize && auth.len() <= u16::MAX as usize);

    let mut out = Vec::with_capacity(8 + endpoint.len() + p256dh.len() + auth.len());
    out.extend_from_slice(&(endpoint.len() as u32).to_be_bytes());
    out.extend_from_slice(endpoint.as_bytes());
    out.extend_from_slice(&(p256dh.len() as u16).to_be_bytes());
    out.extend_from_slice(p256dh.as_bytes());
    out.extend_from_slice(&(auth.len() as u16).to_be_bytes());
    out.extend_from_slice(auth.as_bytes());
    out
}

/// Maps subscription data to its stable identifier.
///
/// Only `endpoint`, `keys.p256dh` and `keys.auth` participate; a changed
/// `expirationTime` keeps the same identity.
pub fn derive_id(info: &SubscriptionInfo) -> SubscriptionId {
    let digest = Sha384::digest(canonical_form(
        &info.endpoint,
        &info.keys.p256dh,
        &info.keys.auth,
    ));

    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    id[6] = 0x80 | (id[6] & 0x0f);
    id[8] = 0x80 | (id[8] & 0x3f);

    SubscriptionId(Uuid::from_bytes(id))
}
