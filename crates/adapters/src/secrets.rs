use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KEYRING_SERVICE: &str = "sqlchat";
pub const KEYRING_ACCOUNT: &str = "text2sql-api-key";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeySource {
    #[default]
    EnvVar,
    Keyring,
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("no OS keyring is available on this platform")]
    Unsupported,
    #[error("keyring access failed: {0}")]
    Keyring(String),
}

/// Resolves the API key for `source`.
///
/// With `Keyring`, a stored key wins; otherwise the environment value is used
/// and saved to the keyring for next time.
#[must_use]
pub fn resolve_api_key(source: ApiKeySource, env_value: Option<String>) -> Option<String> {
    let env_value = env_value.filter(|key| !key.trim().is_empty());

    match source {
        ApiKeySource::EnvVar => env_value,
        ApiKeySource::Keyring => {
            if let Some(api_key) = load_keyring_api_key() {
                return Some(api_key);
            }

            if let Some(api_key) = env_value {
                if let Err(error) = store_api_key(&api_key) {
                    tracing::warn!(%error, "could not save API key to keyring");
                }
                return Some(api_key);
            }

            None
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn load_keyring_api_key() -> Option<String> {
    let entry = keyring_entry().ok()?;
    entry.get_password().ok().filter(|key| !key.is_empty())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn load_keyring_api_key() -> Option<String> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
pub fn store_api_key(api_key: &str) -> Result<(), SecretError> {
    if api_key.is_empty() {
        return Ok(());
    }
    keyring_entry()?
        .set_password(api_key)
        .map_err(|error| SecretError::Keyring(error.to_string()))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub fn store_api_key(_api_key: &str) -> Result<(), SecretError> {
    Err(SecretError::Unsupported)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn keyring_entry() -> Result<keyring::Entry, SecretError> {
    keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
        .map_err(|error| SecretError::Keyring(error.to_string()))
}
