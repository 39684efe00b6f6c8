mod browser;
mod callback;
mod clock;
mod credential_store;
mod error;
mod flow;
mod manager;
mod oauth;
mod pkce;
mod session;
mod utils;

pub use browser::run_loopback_flow;
pub use callback::{code_from_url, parse_callback_input};
pub use clock::{Clock, SystemClock};
pub use credential_store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::AuthError;
pub use flow::{AuthFlow, FlowPreference, InvalidFlow};
pub use manager::{AuthSession, CodeExchange, RequestOptions, DEFAULT_API_BASE};
pub use oauth::{
    OAuthClient, OAuthConfig, OAuthEndpoints, DEFAULT_CLIENT_ID, DEFAULT_REDIRECT_URI,
    DEFAULT_SCOPES,
};
pub use pkce::{challenge_for, PkcePair};
pub use reqwest::Method;
pub use session::{SessionState, SessionStatus, TokenSet};
