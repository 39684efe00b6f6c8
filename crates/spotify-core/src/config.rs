use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

pub const CLIENT_ID_VAR: &str = "SPOTIFY_CLIENT_ID";
pub const REDIRECT_URI_VAR: &str = "SPOTIFY_REDIRECT_URI";
pub const SCOPES_VAR: &str = "SPOTIFY_SCOPES";
pub const API_BASE_VAR: &str = "SPOTIFY_API_BASE";

/// Application-specific configuration helpers.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("app", "spotify-session", "spotify-session-rs")
            .ok_or(ConfigError::MissingProjectDirs)?;
        let config_dir = dirs.config_dir();
        Self::create(config_dir)
    }

    /// Use an explicit directory (created with user-only permissions if missing).
    pub fn create(root: &Path) -> Result<Self, ConfigError> {
        fs::create_dir_all(root).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Wrap a directory without touching the filesystem.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the credentials file for the given profile.
    pub fn credentials_file(&self, profile: &str) -> PathBuf {
        self.root.join(format!("credentials-{profile}.json"))
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Settings overridable through the environment. Unset or blank variables keep defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpotifySettings {
    pub client_id: Option<String>,
    pub redirect_uri: Option<Url>,
    pub scopes: Option<Vec<String>>,
    pub api_base: Option<Url>,
}

impl SpotifySettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };
        let parse_url = |key: &'static str| -> Result<Option<Url>, ConfigError> {
            read(key)
                .map(|raw| {
                    Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl { var: key, source })
                })
                .transpose()
        };

        let scopes = read(SCOPES_VAR)
            .map(|raw| {
                raw.split_whitespace()
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .filter(|scopes| !scopes.is_empty());

        Ok(Self {
            client_id: read(CLIENT_ID_VAR),
            redirect_uri: parse_url(REDIRECT_URI_VAR)?,
            scopes,
            api_base: parse_url(API_BASE_VAR)?,
        })
    }
}

/// Errors that can occur when working with configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for spotify-session-rs")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("invalid URL in {var}: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}
