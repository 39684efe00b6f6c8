use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by authentication and credential management routines.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("no code verifier stored; authorization was not started by this session")]
    MissingVerifier,
    #[error("token exchange rejected {status}: {body}")]
    TokenExchange { status: StatusCode, body: String },
    #[error("no refresh token stored")]
    NoRefreshToken,
    #[error("token refresh rejected {status}: {body}")]
    Refresh { status: StatusCode, body: String },
    #[error("unusable token endpoint response: {0}")]
    InvalidTokenResponse(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("authorization listener terminated before receiving redirect")]
    ListenerClosed,
    #[error("authorization request denied ({0})")]
    AccessDenied(String),
    #[error("authorization response missing code parameter")]
    MissingAuthorizationCode,
    #[error("failed to launch system browser: {0}")]
    BrowserLaunch(String),
    #[error("invalid authorization response: {0}")]
    InvalidAuthorizationResponse(String),
}

impl AuthError {
    /// Transport failures may succeed on retry; provider rejections will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Transport(_))
    }

    /// Whether the caller has to send the user through authorization again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::MissingVerifier
                | AuthError::TokenExchange { .. }
                | AuthError::NoRefreshToken
                | AuthError::Refresh { .. }
                | AuthError::InvalidTokenResponse(_)
                | AuthError::AuthRequired
                | AuthError::AccessDenied(_)
        )
    }
}
