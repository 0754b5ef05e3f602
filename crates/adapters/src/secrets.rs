use sqlpane_core::config::{keys, ConfigSource};

const DEFAULT_SERVICE: &str = "sqlpane";

/// Fills `password` and `sshPassword` from the OS keyring when the wrapped
/// group leaves them out. Entries are stored under `<profile>/<key>`.
#[derive(Debug, Clone)]
pub struct KeyringOverlay<S> {
    inner: S,
    service: String,
    profile: String,
}

impl<S: ConfigSource> KeyringOverlay<S> {
    pub fn new(inner: S, profile: impl Into<String>) -> Self {
        Self {
            inner,
            service: DEFAULT_SERVICE.to_string(),
            profile: profile.into(),
        }
    }

    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Saves a secret for this profile. Returns false when no keyring backend
    /// is available or the write fails.
    pub fn store(&self, key: &str, secret: &str) -> bool {
        if !is_secret_key(key) || secret.is_empty() {
            return false;
        }
        store_secret(&self.service, &account(&self.profile, key), secret)
    }
}

impl<S: ConfigSource> ConfigSource for KeyringOverlay<S> {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).or_else(|| {
            is_secret_key(key)
                .then(|| load_secret(&self.service, &account(&self.profile, key)))
                .flatten()
        })
    }
}

fn is_secret_key(key: &str) -> bool {
    key == keys::PASSWORD || key == keys::SSH_PASSWORD
}

fn account(profile: &str, key: &str) -> String {
    format!("{profile}/{key}")
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn load_secret(service: &str, account: &str) -> Option<String> {
    let entry = keyring::Entry::new(service, account).ok()?;
    match entry.get_password() {
        Ok(secret) if !secret.is_empty() => Some(secret),
        Ok(_) | Err(keyring::Error::NoEntry) => None,
        Err(error) => {
            tracing::debug!(%error, account, "keyring lookup failed");
            None
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn load_secret(_service: &str, _account: &str) -> Option<String> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn store_secret(service: &str, account: &str, secret: &str) -> bool {
    keyring::Entry::new(service, account)
        .and_then(|entry| entry.set_password(secret))
        .inspect_err(|error| tracing::warn!(%error, account, "keyring write failed"))
        .is_ok()
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn store_secret(_service: &str, _account: &str, _secret: &str) -> bool {
    false
}
