//! The set of live subscriptions and their delivery schedules.
//!
//! Each admitted subscription gets one periodic task, scoped by a child of
//! the registry's cancellation token. [`SubscriptionRegistry::remove`] drops
//! the entry and cancels the token under the same lock, so no new tick starts
//! after removal. Deliveries run on their own tasks under the same token, so
//! removal also abandons any still in flight; none of them re-inserts the
//! subscription.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::identity::{derive_id, SubscriptionId};
use crate::ikm::KeyDeriver;
use crate::model::{Event, KeyMaterial, Subscription, SubscriptionInfo};

/// Encryptions allowed under one key generation.
pub const ROTATION_THRESHOLD: u64 = 1 << 32;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub delivery_interval: Duration,
    pub rotation_threshold: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            delivery_interval: Duration::from_secs(5),
            rotation_threshold: ROTATION_THRESHOLD,
        }
    }
}

/// Sends one event to one subscription. Implementations report their own
/// failures; the schedule keeps running regardless.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(
        &self,
        registry: &SubscriptionRegistry,
        subscription: &Arc<Subscription>,
        event: Event,
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Added(SubscriptionId),
    AlreadyRegistered(SubscriptionId),
    /// The registry was shut down; nothing was scheduled.
    Closed(SubscriptionId),
}

impl Registration {
    pub fn id(&self) -> &SubscriptionId {
        match self {
            Registration::Added(id)
            | Registration::AlreadyRegistered(id)
            | Registration::Closed(id) => id,
        }
    }
}

struct Entry {
    subscription: Arc<Subscription>,
    schedule: CancellationToken,
}

struct RegistryInner {
    entries: Mutex<HashMap<SubscriptionId, Entry>>,
    shutdown: CancellationToken,
    deriver: Arc<dyn KeyDeriver>,
    delivery: Arc<dyn Deliver>,
    config: RegistryConfig,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(
        config: RegistryConfig,
        deriver: Arc<dyn KeyDeriver>,
        delivery: Arc<dyn Deliver>,
    ) -> Self {
        SubscriptionRegistry {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                deriver,
                delivery,
                config,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a subscription and starts its schedule. Re-registering the
    /// same subscription data is a no-op. Must be called within a Tokio
    /// runtime.
    pub fn add(&self, info: &SubscriptionInfo) -> Result<Registration> {
        let id = derive_id(info);
        if self.entries().contains_key(&id) {
            return Ok(Registration::AlreadyRegistered(id));
        }

        let subscription = Arc::new(Subscription::from_info(info)?);

        let mut entries = self.entries();
        // Another caller may have won the race while we validated.
        if entries.contains_key(&id) {
            return Ok(Registration::AlreadyRegistered(id));
        }
        if self.inner.shutdown.is_cancelled() {
            tracing::warn!(%id, "Registry is shut down, ignoring subscription.");
            return Ok(Registration::Closed(id));
        }

        let schedule = self.inner.shutdown.child_token();
        tokio::spawn(run_schedule(
            self.clone(),
            subscription.clone(),
            schedule.clone(),
        ));
        entries.insert(
            id.clone(),
            Entry {
                subscription,
                schedule,
            },
        );

        tracing::info!(%id, "Subscription added.");
        Ok(Registration::Added(id))
    }

    /// Removes a subscription and cancels its schedule. Returns whether an
    /// entry was present.
    pub fn remove(&self, id: &SubscriptionId) -> bool {
        match self.entries().remove(id) {
            Some(entry) => {
                entry.schedule.cancel();
                tracing::info!(%id, "Subscription removed.");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<Arc<Subscription>> {
        self.entries().get(id).map(|e| e.subscription.clone())
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Current key material for `subscription`, deriving a new generation on
    /// first use and after every `rotation_threshold` uses.
    pub async fn key_material(&self, subscription: &Subscription) -> Result<Arc<KeyMaterial>> {
        let deriver = self.inner.deriver.clone();

        subscription
            .key_slot()
            .acquire(self.inner.config.rotation_threshold, || async move {
                tracing::debug!(id = %subscription.id(), "Deriving key material.");
                deriver
                    .derive(subscription.ua_public(), subscription.auth_secret())
                    .await
            })
            .await
    }

    /// Cancels every schedule and empties the registry.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained = self.entries().drain().count();
        tracing::info!(%drained, "Registry shut down.");
    }
}

async fn run_schedule(
    registry: SubscriptionRegistry,
    subscription: Arc<Subscription>,
    cancel: CancellationToken,
) {
    let id = subscription.id().clone();
    let mut ticker = tokio::time::interval(registry.inner.config.delivery_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if subscription.is_expired(Utc::now()) {
            tracing::info!(%id, "Subscription expired.");
            registry.remove(&id);
            break;
        }

        let event = if seq == 0 {
            Event::setup()
        } else {
            Event::sequence(seq)
        };
        seq += 1;

        // Each delivery runs on its own task so a slow push service never
        // delays the next tick. Cancelling the schedule abandons it.
        let registry = registry.clone();
        let subscription = subscription.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let delivery = registry.inner.delivery.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(id = %subscription.id(), "Delivery abandoned.");
                }
                _ = delivery.deliver(&registry, &subscription, event) => {}
            }
        });
    }

    tracing::debug!(%id, "Schedule stopped.");
}
