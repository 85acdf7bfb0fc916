//! Server side of the Web Push protocol: subscription identities, RFC 8291
//! key agreement, RFC 8188 `aes128gcm` encoding, VAPID tokens and the
//! subscription registry that drives delivery.

pub mod dispatch;
pub mod ece;
pub mod error;
pub mod identity;
pub mod ikm;
pub mod logging;
pub mod model;
pub mod registry;
pub mod server;
pub mod server_state;
pub mod vapid;

pub use dispatch::{DeliveryOutcome, Dispatcher};
pub use error::{Error, Result};
pub use identity::{derive_id, SubscriptionId};
pub use model::{Event, KeyMaterial, Subscription, SubscriptionInfo};
pub use registry::{Registration, RegistryConfig, SubscriptionRegistry};
pub use vapid::{VapidKey, VapidSigner, VapidToken};
