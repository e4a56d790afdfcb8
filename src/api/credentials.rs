//! JWT persistence via the OS secret store with a file fallback.
//!
//! The payload is a single JSON document `{token, user}` stored under
//! service "acencia_atlas", key "jwt_token". When the secret store is
//! unavailable the token lands in `~/.bipro_gdv_token.json` with
//! owner-only permissions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

const KEYRING_SERVICE: &str = "acencia_atlas";
const KEYRING_KEY: &str = "jwt_token";
const TOKEN_FILE_NAME: &str = ".bipro_gdv_token.json";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Token speichern fehlgeschlagen: {0}")]
    SaveFailed(String),
}

/// The persisted credential payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub token: String,
    #[serde(default)]
    pub user: Value,
}

/// Persistent credential storage.
pub struct CredentialStore {
    fallback_path: PathBuf,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self { fallback_path: home.join(TOKEN_FILE_NAME) }
    }

    #[cfg(test)]
    fn with_fallback_path(path: PathBuf) -> Self {
        Self { fallback_path: path }
    }

    fn entry() -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(KEYRING_SERVICE, KEYRING_KEY)
    }

    /// Persist the token. Prefers the OS secret store; on success any
    /// stale fallback file is removed. Falls back to an owner-only
    /// file when the secret store is unavailable.
    pub fn save(&self, credentials: &StoredCredentials) -> Result<(), CredentialError> {
        let payload = serde_json::to_string(credentials)
            .map_err(|e| CredentialError::SaveFailed(e.to_string()))?;

        match Self::entry().and_then(|entry| entry.set_password(&payload)) {
            Ok(()) => {
                debug!("Token im OS-Secret-Store gespeichert");
                if self.fallback_path.exists() {
                    let _ = std::fs::remove_file(&self.fallback_path);
                }
                return Ok(());
            }
            Err(e) => {
                warn!("Secret-Store nicht verfuegbar ({}), nutze Datei-Fallback", e);
            }
        }

        self.write_fallback(&payload)
    }

    fn write_fallback(&self, payload: &str) -> Result<(), CredentialError> {
        std::fs::write(&self.fallback_path, payload)
            .map_err(|e| CredentialError::SaveFailed(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.fallback_path, perms)
                .map_err(|e| CredentialError::SaveFailed(e.to_string()))?;
        }

        debug!("Token in Datei gespeichert (chmod 0600)");
        Ok(())
    }

    /// Load the stored payload, checking the secret store first.
    pub fn load(&self) -> Option<StoredCredentials> {
        if let Ok(entry) = Self::entry() {
            if let Ok(payload) = entry.get_password() {
                match serde_json::from_str(&payload) {
                    Ok(credentials) => return Some(credentials),
                    Err(e) => warn!("Gespeicherter Token nicht lesbar: {}", e),
                }
            }
        }

        match std::fs::read_to_string(&self.fallback_path) {
            Ok(payload) => match serde_json::from_str(&payload) {
                Ok(credentials) => Some(credentials),
                Err(e) => {
                    warn!("Token-Datei nicht lesbar: {}", e);
                    None
                }
            },
            Err(_) => None,
        }
    }

    /// Remove the payload from both backends, ignoring individual
    /// failures.
    pub fn delete(&self) {
        if let Ok(entry) = Self::entry() {
            let _ = entry.delete_credential();
        }
        if self.fallback_path.exists() {
            if std::fs::remove_file(&self.fallback_path).is_ok() {
                debug!("Token-Datei geloescht");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoredCredentials {
        StoredCredentials {
            token: "jwt-abc".to_string(),
            user: serde_json::json!({"id": 1, "username": "maria"}),
        }
    }

    #[test]
    fn test_fallback_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::with_fallback_path(dir.path().join("token.json"));

        let payload = serde_json::to_string(&sample()).unwrap();
        store.write_fallback(&payload).unwrap();

        let loaded = store.load().expect("fallback file should load");
        assert_eq!(loaded.token, "jwt-abc");
        assert_eq!(loaded.user["username"], "maria");
    }

    #[cfg(unix)]
    #[test]
    fn test_fallback_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let store = CredentialStore::with_fallback_path(path.clone());
        store.write_fallback("{}").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let store = CredentialStore::with_fallback_path(path.clone());
        store.write_fallback("{\"token\":\"t\"}").unwrap();
        store.delete();
        store.delete();
        assert!(!path.exists());
    }
}
