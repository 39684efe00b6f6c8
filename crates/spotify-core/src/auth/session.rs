use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Credentials minted by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    /// Build a token set from an `expires_in` (seconds) relative to `received_at`.
    ///
    /// `None` when the lifetime is not positive or the expiry is out of range.
    pub fn issued(
        access_token: String,
        refresh_token: Option<String>,
        received_at: DateTime<Utc>,
        expires_in: i64,
    ) -> Option<Self> {
        if expires_in <= 0 {
            return None;
        }
        let lifetime = Duration::try_milliseconds(expires_in.checked_mul(1000)?)?;
        Some(Self {
            access_token,
            refresh_token,
            expires_at: received_at.checked_add_signed(lifetime)?,
        })
    }

    /// No skew margin: the token is invalid from the exact expiry instant on.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Persisted authentication state for one profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Unauthenticated,
    /// Verifier stored, waiting for the provider to redirect back.
    Authorizing {
        code_verifier: String,
        return_fragment: Option<String>,
    },
    Authenticated(TokenSet),
}

impl SessionState {
    pub fn tokens(&self) -> Option<&TokenSet> {
        match self {
            SessionState::Authenticated(tokens) => Some(tokens),
            _ => None,
        }
    }

    pub fn code_verifier(&self) -> Option<&str> {
        match self {
            SessionState::Authorizing { code_verifier, .. } => Some(code_verifier),
            _ => None,
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.tokens().and_then(|tokens| tokens.refresh_token.as_deref())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> SessionStatus {
        match self {
            SessionState::Unauthenticated => SessionStatus::Unauthenticated,
            SessionState::Authorizing { .. } => SessionStatus::Authorizing,
            SessionState::Authenticated(tokens) if tokens.is_expired_at(now) => {
                SessionStatus::Expired {
                    expires_at: tokens.expires_at,
                }
            }
            SessionState::Authenticated(tokens) => SessionStatus::Authenticated {
                expires_at: tokens.expires_at,
            },
        }
    }
}

/// Caller-facing view of the session, with expiry resolved against a clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unauthenticated,
    Authorizing,
    Authenticated { expires_at: DateTime<Utc> },
    Expired { expires_at: DateTime<Utc> },
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Unauthenticated => write!(f, "not logged in"),
            SessionStatus::Authorizing => write!(f, "authorization pending"),
            SessionStatus::Authenticated { expires_at } => {
                write!(f, "authenticated (token expires at {expires_at})")
            }
            SessionStatus::Expired { expires_at } => {
                write!(f, "token expired at {expires_at}; refresh required")
            }
        }
    }
}
