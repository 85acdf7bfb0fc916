use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;

use crate::ece::{self, RECORD_SIZE, SALT_LEN};
use crate::error::Result;
use crate::model::{Event, Subscription};
use crate::registry::{Deliver, SubscriptionRegistry};
use crate::vapid::VapidSigner;

/// Seconds the push service may hold an undelivered message.
pub const TTL_SECS: u32 = 60;

/// Upper bound on one request to a push service, connect to last byte.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(StatusCode),
    /// The push service no longer knows the subscription; it was removed.
    Removed(StatusCode),
    /// Any other failure status. The subscription stays active.
    Rejected(StatusCode),
}

/// Statuses proving the push service has discarded the subscription.
fn is_terminal(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND | StatusCode::GONE
    )
}

pub struct Dispatcher {
    client: reqwest::Client,
    vapid: VapidSigner,
}

impl Dispatcher {
    pub fn new(vapid: VapidSigner) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, vapid))
    }

    pub fn with_client(client: reqwest::Client, vapid: VapidSigner) -> Self {
        Dispatcher { client, vapid }
    }

    pub fn vapid(&self) -> &VapidSigner {
        &self.vapid
    }

    /// Encrypts `payload` as JSON and posts it to the subscription's endpoint.
    ///
    /// A 401, 404 or 410 response removes the subscription from `registry`.
    pub async fn send<T>(
        &self,
        registry: &SubscriptionRegistry,
        subscription: &Subscription,
        payload: &T,
    ) -> Result<DeliveryOutcome>
    where
        T: Serialize + ?Sized,
    {
        let id = subscription.id();

        let material = registry.key_material(subscription).await?;
        let token = self.vapid.issue(&subscription.origin())?;
        let plaintext = serde_json::to_vec(payload)?;

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let body = ece::encode(
            &plaintext,
            material.key_id(),
            material.ikm(),
            &salt,
            RECORD_SIZE,
        )?;

        let response = self
            .client
            .post(subscription.endpoint().clone())
            .header(AUTHORIZATION, self.vapid.authorization(&token))
            .header(CONTENT_ENCODING, "aes128gcm")
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("ttl", TTL_SECS.to_string())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(%id, %status, "Sent event.");
            return Ok(DeliveryOutcome::Delivered(status));
        }

        let text = response.text().await.unwrap_or_default();
        tracing::error!(%id, %status, response = %text, "Error sending event.");

        if is_terminal(status) {
            tracing::warn!(%id, "Removing subscription.");
            registry.remove(id);
            Ok(DeliveryOutcome::Removed(status))
        } else {
            Ok(DeliveryOutcome::Rejected(status))
        }
    }
}

#[async_trait]
impl Deliver for Dispatcher {
    async fn deliver(
        &self,
        registry: &SubscriptionRegistry,
        subscription: &Arc<Subscription>,
        event: Event,
    ) {
        if let Err(error) = self.send(registry, subscription, &event).await {
            tracing::error!(id = %subscription.id(), title = %event.title, ?error, "Error sending message.");
        }
    }
}
