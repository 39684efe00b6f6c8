use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::ConfigLocator;

use super::{AuthError, SessionState, TokenSet};

/// Persistence abstraction for authentication state.
pub trait CredentialStore {
    /// Load the state for `profile`; a missing record is `Unauthenticated`.
    fn load(&self, profile: &str) -> Result<SessionState, AuthError>;
    fn save(&self, profile: &str, state: &SessionState) -> Result<(), AuthError>;
    /// Remove every stored field. Clearing an absent profile is not an error.
    fn clear(&self, profile: &str) -> Result<(), AuthError>;
}

/// Filesystem-backed credential storage located in the user configuration directory.
pub struct FileCredentialStore {
    locator: ConfigLocator,
}

impl FileCredentialStore {
    pub fn new(locator: ConfigLocator) -> Self {
        Self { locator }
    }

    pub fn with_default_locator() -> Result<Self, AuthError> {
        Ok(Self::new(ConfigLocator::new()?))
    }

    fn write_file(path: &Path, payload: &str) -> Result<(), AuthError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(payload.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = file.metadata()?.permissions();
            perm.set_mode(0o600);
            fs::set_permissions(path, perm)?;
        }

        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, profile: &str) -> Result<SessionState, AuthError> {
        let path = self.locator.credentials_file(profile);
        if !path.exists() {
            return Ok(SessionState::Unauthenticated);
        }
        let raw = fs::read_to_string(path)?;
        let record: StoredRecord = serde_json::from_str(&raw)?;
        Ok(record.into_state(profile))
    }

    fn save(&self, profile: &str, state: &SessionState) -> Result<(), AuthError> {
        if matches!(state, SessionState::Unauthenticated) {
            return self.clear(profile);
        }
        let path = self.locator.credentials_file(profile);
        let payload = serde_json::to_string_pretty(&StoredRecord::from_state(state))?;
        Self::write_file(&path, &payload)
    }

    fn clear(&self, profile: &str) -> Result<(), AuthError> {
        let path = self.locator.credentials_file(profile);
        match fs::remove_file(path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-process store; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    inner: Arc<Mutex<HashMap<String, SessionState>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionState>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, profile: &str) -> Result<SessionState, AuthError> {
        Ok(self.entries().get(profile).cloned().unwrap_or_default())
    }

    fn save(&self, profile: &str, state: &SessionState) -> Result<(), AuthError> {
        self.entries().insert(profile.to_owned(), state.clone());
        Ok(())
    }

    fn clear(&self, profile: &str) -> Result<(), AuthError> {
        self.entries().remove(profile);
        Ok(())
    }
}

/// On-disk layout: one flat field per persisted key, expiry as string epoch millis.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code_verifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    return_fragment: Option<String>,
}

impl StoredRecord {
    fn from_state(state: &SessionState) -> Self {
        match state {
            SessionState::Unauthenticated => Self::default(),
            SessionState::Authorizing {
                code_verifier,
                return_fragment,
            } => Self {
                code_verifier: Some(code_verifier.clone()),
                return_fragment: return_fragment.clone(),
                ..Self::default()
            },
            SessionState::Authenticated(tokens) => Self {
                access_token: Some(tokens.access_token.clone()),
                refresh_token: tokens.refresh_token.clone(),
                expires_at: Some(tokens.expires_at.timestamp_millis().to_string()),
                ..Self::default()
            },
        }
    }

    fn into_state(self, profile: &str) -> SessionState {
        match (self.access_token, self.expires_at) {
            (Some(access_token), Some(expires_at)) => match parse_epoch_millis(&expires_at) {
                Some(expires_at) => {
                    return SessionState::Authenticated(TokenSet {
                        access_token,
                        refresh_token: self.refresh_token,
                        expires_at,
                    })
                }
                None => {
                    warn!("profile '{profile}': unreadable expires_at '{expires_at}', ignoring stored tokens");
                    return SessionState::Unauthenticated;
                }
            },
            (None, None) => {}
            _ => {
                warn!("profile '{profile}': access token and expiry must be stored together, ignoring stored tokens");
                return SessionState::Unauthenticated;
            }
        }

        match self.code_verifier {
            Some(code_verifier) => SessionState::Authorizing {
                code_verifier,
                return_fragment: self.return_fragment,
            },
            None => SessionState::Unauthenticated,
        }
    }
}

fn parse_epoch_millis(raw: &str) -> Option<DateTime<Utc>> {
    let millis = raw.trim().parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}
