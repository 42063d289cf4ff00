use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::config::SecretBackendKind;
use crate::errors::AppResult;

const GENERATED_KEY_BYTES: usize = 64;

/// Keyring account that may hold the places provider API key.
pub const PLACES_KEY_ALIAS: &str = "places-api-key";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretLifecycle {
    Retrieved,
    Created,
    Rotated,
}

impl SecretLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrieved => "retrieved",
            Self::Created => "created",
            Self::Rotated => "rotated",
        }
    }
}

/// A secret together with how it was obtained.
#[derive(Clone)]
pub struct SecretMaterial {
    secret: SecretString,
    lifecycle: SecretLifecycle,
}

impl SecretMaterial {
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn lifecycle(&self) -> SecretLifecycle {
        self.lifecycle
    }
}

trait SecretBackend: Send + Sync {
    fn label(&self) -> &str;
    fn load(&self, account: &str) -> AppResult<Option<SecretString>>;
    fn save(&self, account: &str, secret: &SecretString) -> AppResult<()>;
    fn remove(&self, account: &str) -> AppResult<()>;
}

/// OS credential store (Keychain, Secret Service, Credential Manager).
struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    fn entry(&self, account: &str) -> AppResult<keyring::Entry> {
        Ok(keyring::Entry::new(&self.service, account)?)
    }
}

impl SecretBackend for KeyringBackend {
    fn label(&self) -> &str {
        &self.service
    }

    fn load(&self, account: &str) -> AppResult<Option<SecretString>> {
        match self.entry(account)?.get_password() {
            Ok(value) => Ok(Some(SecretString::new(value.into()))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        self.entry(account)?.set_password(secret.expose_secret())?;
        Ok(())
    }

    fn remove(&self, account: &str) -> AppResult<()> {
        match self.entry(account)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Process-local store; nothing survives a restart.
#[derive(Default)]
struct MemoryBackend {
    entries: Mutex<HashMap<String, SecretString>>,
}

impl SecretBackend for MemoryBackend {
    fn label(&self) -> &str {
        "in-memory"
    }

    fn load(&self, account: &str) -> AppResult<Option<SecretString>> {
        Ok(self.entries.lock().get(account).cloned())
    }

    fn save(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        self.entries
            .lock()
            .insert(account.to_string(), secret.clone());
        Ok(())
    }

    fn remove(&self, account: &str) -> AppResult<()> {
        self.entries.lock().remove(account);
        Ok(())
    }
}

/// Named secrets (database key, provider key) behind a pluggable backend.
#[derive(Clone)]
pub struct SecretVault {
    backend: Arc<dyn SecretBackend>,
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            backend: Arc::new(KeyringBackend {
                service: service_name.into(),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::default()),
        }
    }

    pub fn for_backend(service_name: impl Into<String>, kind: SecretBackendKind) -> Self {
        match kind {
            SecretBackendKind::Keyring => Self::new(service_name),
            SecretBackendKind::Memory => Self::in_memory(),
        }
    }

    /// Returns the stored secret for `account`, generating one on first use.
    pub fn ensure(&self, account: &str) -> AppResult<SecretMaterial> {
        if let Some(secret) = self.backend.load(account)? {
            debug!(target: "secret_vault", backend = self.backend.label(), account, "secret retrieved");
            return Ok(SecretMaterial {
                secret,
                lifecycle: SecretLifecycle::Retrieved,
            });
        }
        let secret = generate_secret();
        self.backend.save(account, &secret)?;
        info!(target: "secret_vault", backend = self.backend.label(), account, "secret created");
        Ok(SecretMaterial {
            secret,
            lifecycle: SecretLifecycle::Created,
        })
    }

    pub fn rotate(&self, account: &str) -> AppResult<SecretMaterial> {
        let secret = generate_secret();
        self.backend.save(account, &secret)?;
        warn!(target: "secret_vault", backend = self.backend.label(), account, "secret rotated");
        Ok(SecretMaterial {
            secret,
            lifecycle: SecretLifecycle::Rotated,
        })
    }

    pub fn delete(&self, account: &str) -> AppResult<()> {
        self.backend.remove(account)
    }

    pub fn has(&self, account: &str) -> AppResult<bool> {
        Ok(self.backend.load(account)?.is_some())
    }

    pub fn read_secret(&self, account: &str) -> AppResult<Option<SecretString>> {
        self.backend.load(account)
    }

    pub fn write_secret(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        self.backend.save(account, secret)
    }

    /// Provider key from configuration, falling back to the vault entry.
    pub fn resolve_places_key(
        &self,
        configured: Option<&SecretString>,
    ) -> AppResult<Option<SecretString>> {
        if let Some(key) = configured {
            return Ok(Some(key.clone()));
        }
        let stored = self.backend.load(PLACES_KEY_ALIAS)?;
        if stored.is_some() {
            debug!(
                target: "secret_vault",
                backend = self.backend.label(),
                "places api key taken from vault"
            );
        }
        Ok(stored)
    }
}

fn generate_secret() -> SecretString {
    let mut bytes = [0_u8; GENERATED_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    SecretString::new(STANDARD_NO_PAD.encode(bytes).into())
}
