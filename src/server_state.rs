use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;

use crate::dispatch::Dispatcher;
use crate::ikm::EphemeralEcdh;
use crate::model::BASE64_URL;
use crate::registry::{RegistryConfig, SubscriptionRegistry};
use crate::vapid::{VapidKey, VapidSigner};

const DEFAULT_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub vapid_privkey: String,
    pub vapid_pubkey: Option<String>,
    pub vapid_email: String,
    pub delivery_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vapid_privkey =
            lookup("PUSH_VAPID_PRIVKEY").context("Expected PUSH_VAPID_PRIVKEY env var.")?;
        let vapid_email =
            lookup("PUSH_VAPID_EMAIL").context("Expected PUSH_VAPID_EMAIL env var.")?;
        let vapid_pubkey = lookup("PUSH_VAPID_PUBKEY");

        let interval_secs = match lookup("PUSH_INTERVAL_SECS") {
            Some(secs) => secs
                .parse()
                .context("PUSH_INTERVAL_SECS must be a whole number of seconds.")?,
            None => DEFAULT_INTERVAL_SECS,
        };
        if interval_secs == 0 {
            bail!("PUSH_INTERVAL_SECS must be positive.");
        }

        Ok(Config {
            vapid_privkey,
            vapid_pubkey,
            vapid_email,
            delivery_interval: Duration::from_secs(interval_secs),
        })
    }

    /// Loads the key pair, checking the configured public key against the
    /// private one when both are given.
    pub fn vapid_signer(&self) -> Result<VapidSigner> {
        let key = VapidKey::parse(&self.vapid_privkey).context("Could not load PUSH_VAPID_PRIVKEY.")?;

        if let Some(pubkey) = &self.vapid_pubkey {
            let configured = BASE64_URL
                .decode(pubkey.trim())
                .context("PUSH_VAPID_PUBKEY is not base64url.")?;
            if configured != key.public_key_bytes() {
                bail!("PUSH_VAPID_PUBKEY does not match PUSH_VAPID_PRIVKEY.");
            }
        }

        Ok(VapidSigner::new(key, &self.vapid_email))
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub registry: SubscriptionRegistry,
    pub vapid_pubkey: Arc<[u8]>,
}

impl ServerState {
    pub fn new(config: &Config) -> Result<Self> {
        let signer = config.vapid_signer()?;
        let vapid_pubkey: Arc<[u8]> = signer.key().public_key_bytes().into();

        let registry = SubscriptionRegistry::new(
            RegistryConfig {
                delivery_interval: config.delivery_interval,
                ..RegistryConfig::default()
            },
            Arc::new(EphemeralEcdh),
            Arc::new(Dispatcher::new(signer)?),
        );

        Ok(ServerState {
            registry,
            vapid_pubkey,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn loads_minimal_config() {
        let key = VapidKey::generate();
        let privkey = key.private_key_base64();
        let config = Config::from_lookup(lookup(&[
            ("PUSH_VAPID_PRIVKEY", privkey.as_str()),
            ("PUSH_VAPID_EMAIL", "ops@example.com"),
        ]))
        .unwrap();

        assert_eq!(config.delivery_interval, Duration::from_secs(5));
        let signer = config.vapid_signer().unwrap();
        assert_eq!(signer.key().public_key_bytes(), key.public_key_bytes());
        assert_eq!(signer.subject(), "mailto:ops@example.com");
    }

    #[test]
    fn missing_private_key_is_an_error() {
        let err = Config::from_lookup(lookup(&[("PUSH_VAPID_EMAIL", "ops@example.com")]))
            .unwrap_err();
        assert!(err.to_string().contains("PUSH_VAPID_PRIVKEY"));
    }

    #[test]
    fn rejects_mismatched_public_key() {
        let key = VapidKey::generate();
        let privkey = key.private_key_base64();
        let other_pubkey = VapidKey::generate().public_key_base64();
        let config = Config::from_lookup(lookup(&[
            ("PUSH_VAPID_PRIVKEY", privkey.as_str()),
            ("PUSH_VAPID_PUBKEY", other_pubkey.as_str()),
            ("PUSH_VAPID_EMAIL", "ops@example.com"),
        ]))
        .unwrap();

        assert!(config.vapid_signer().is_err());
    }

    #[test]
    fn rejects_bad_interval() {
        let key = VapidKey::generate();
        let privkey = key.private_key_base64();
        for interval in ["soon", "0"] {
            let result = Config::from_lookup(lookup(&[
                ("PUSH_VAPID_PRIVKEY", privkey.as_str()),
                ("PUSH_VAPID_EMAIL", "ops@example.com"),
                ("PUSH_INTERVAL_SECS", interval),
            ]));
            assert!(result.is_err());
        }
    }

    #[tokio::test]
    async fn builds_state() {
        let key = VapidKey::generate();
        let privkey = key.private_key_base64();
        let pubkey = key.public_key_base64();
        let config = Config::from_lookup(lookup(&[
            ("PUSH_VAPID_PRIVKEY", privkey.as_str()),
            ("PUSH_VAPID_PUBKEY", pubkey.as_str()),
            ("PUSH_VAPID_EMAIL", "ops@example.com"),
            ("PUSH_INTERVAL_SECS", "30"),
        ]))
        .unwrap();

        let state = ServerState::new(&config).unwrap();
        assert_eq!(&state.vapid_pubkey[..], key.public_key_bytes());
        assert!(state.registry.is_empty());
    }
}
