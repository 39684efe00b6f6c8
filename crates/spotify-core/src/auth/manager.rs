use std::sync::Arc;

use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use tokio::sync::Mutex;
use url::Url;

use super::callback::parse_callback_input;
use super::{
    AuthError, Clock, CredentialStore, OAuthClient, PkcePair, SessionState, SessionStatus,
    SystemClock, TokenSet,
};

pub const DEFAULT_API_BASE: &str = "https://api.spotify.com/v1";

/// Result of a successful authorization code exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeExchange {
    pub tokens: TokenSet,
    /// Application state saved by [`AuthSession::begin_authorization`].
    pub return_fragment: Option<String>,
}

/// Per-request settings merged into an authenticated API call.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, AuthError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }
}

/// Owns the PKCE lifecycle for one credential-store profile and issues
/// authenticated Web API requests, refreshing credentials when needed.
///
/// Share it behind an `Arc`; refreshes are serialized so concurrent callers
/// that all observe an expired token trigger a single token-endpoint call.
pub struct AuthSession<S> {
    store: Mutex<S>,
    refresh_lock: Mutex<()>,
    oauth: OAuthClient,
    api_base: Url,
    profile: String,
    clock: Arc<dyn Clock>,
}

impl<S> AuthSession<S>
where
    S: CredentialStore + Send + Sync + 'static,
{
    pub fn new(store: S, oauth: OAuthClient, profile: impl Into<String>) -> Self {
        Self {
            store: Mutex::new(store),
            refresh_lock: Mutex::new(()),
            oauth,
            api_base: Url::parse(DEFAULT_API_BASE).expect("valid API base"),
            profile: profile.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_api_base(mut self, api_base: Url) -> Self {
        self.api_base = api_base;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    pub async fn state(&self) -> Result<SessionState, AuthError> {
        let store = self.store.lock().await;
        store.load(&self.profile)
    }

    pub async fn status(&self) -> Result<SessionStatus, AuthError> {
        Ok(self.state().await?.status_at(self.clock.now()))
    }

    async fn persist(&self, state: &SessionState) -> Result<(), AuthError> {
        let store = self.store.lock().await;
        store.save(&self.profile, state)
    }

    /// Store a fresh PKCE verifier and return the authorize URL to send the user to.
    ///
    /// The provider drops URL fragments on redirect, so any application state
    /// carried in one is kept here and handed back by [`Self::exchange_code`].
    pub async fn begin_authorization(
        &self,
        return_fragment: Option<&str>,
    ) -> Result<Url, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let pkce = PkcePair::generate();
        let return_fragment = return_fragment
            .map(|fragment| fragment.trim_start_matches('#'))
            .filter(|fragment| !fragment.is_empty())
            .map(str::to_owned);

        self.persist(&SessionState::Authorizing {
            code_verifier: pkce.verifier().to_owned(),
            return_fragment,
        })
        .await?;

        debug!("profile '{}': authorization started", self.profile);
        Ok(self.oauth.authorization_url(&pkce))
    }

    /// Trade an authorization code for tokens using the stored verifier.
    pub async fn exchange_code(&self, code: &str) -> Result<CodeExchange, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let (code_verifier, return_fragment) = match self.state().await? {
            SessionState::Authorizing {
                code_verifier,
                return_fragment,
            } => (code_verifier, return_fragment),
            _ => return Err(AuthError::MissingVerifier),
        };

        let pkce = PkcePair::from_verifier(code_verifier);
        let tokens = self
            .oauth
            .exchange_code(code, &pkce, self.clock.as_ref())
            .await?;

        self.persist(&SessionState::Authenticated(tokens.clone()))
            .await?;
        debug!(
            "profile '{}': authenticated until {}",
            self.profile, tokens.expires_at
        );
        Ok(CodeExchange {
            tokens,
            return_fragment,
        })
    }

    /// Complete authorization from the redirect target, callback URL, or pasted code.
    pub async fn handle_callback(&self, input: &str) -> Result<CodeExchange, AuthError> {
        let code = parse_callback_input(input)?;
        self.exchange_code(&code).await
    }

    /// Stored access token, or `None` once `now >= expires_at`.
    pub async fn valid_access_token(&self) -> Result<Option<String>, AuthError> {
        let now = self.clock.now();
        Ok(self
            .state()
            .await?
            .tokens()
            .filter(|tokens| !tokens.is_expired_at(now))
            .map(|tokens| tokens.access_token.clone()))
    }

    /// Mint a new access token with the stored refresh token.
    ///
    /// A rejected or unusable refresh ends the session; transport failures
    /// leave it untouched.
    pub async fn refresh(&self) -> Result<String, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let state = self.state().await?;
        self.refresh_locked(state).await
    }

    async fn refresh_locked(&self, state: SessionState) -> Result<String, AuthError> {
        let refresh_token = state
            .refresh_token()
            .ok_or(AuthError::NoRefreshToken)?
            .to_owned();

        match self
            .oauth
            .refresh(&refresh_token, self.clock.as_ref())
            .await
        {
            Ok(mut tokens) => {
                if tokens.refresh_token.is_none() {
                    tokens.refresh_token = Some(refresh_token);
                }
                let access_token = tokens.access_token.clone();
                self.persist(&SessionState::Authenticated(tokens)).await?;
                debug!("profile '{}': access token refreshed", self.profile);
                Ok(access_token)
            }
            Err(err @ (AuthError::Refresh { .. } | AuthError::InvalidTokenResponse(_))) => {
                warn!(
                    "profile '{}': refresh rejected, ending session: {err}",
                    self.profile
                );
                let store = self.store.lock().await;
                store.clear(&self.profile)?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Token for the next attempt. Reuses a token another caller refreshed while
    /// this one waited on the lock; `rejected` is the token the API just refused.
    async fn fresh_token(&self, rejected: Option<&str>) -> Result<String, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let state = self.state().await?;
        if let Some(tokens) = state.tokens() {
            let usable = !tokens.is_expired_at(self.clock.now())
                && rejected != Some(tokens.access_token.as_str());
            if usable {
                return Ok(tokens.access_token.clone());
            }
        }

        self.refresh_locked(state).await.map_err(|err| match err {
            AuthError::NoRefreshToken
            | AuthError::Refresh { .. }
            | AuthError::InvalidTokenResponse(_) => AuthError::AuthRequired,
            other => other,
        })
    }

    /// Issue a Web API request with bearer credentials.
    ///
    /// An expired token is refreshed before sending. A 401 triggers one refresh
    /// and one retry; the retry's response is returned whatever its status.
    pub async fn authenticated_request(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<Response, AuthError> {
        let url = self.resource_url(path)?;

        let token = match self.valid_access_token().await? {
            Some(token) => token,
            None => self.fresh_token(None).await?,
        };

        let response = self.send(&url, &options, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("{} {} returned 401; refreshing once", options.method, url.path());
        let token = self.fresh_token(Some(token.as_str())).await?;
        self.send(&url, &options, &token).await
    }

    /// Forget every stored credential. Safe to call when already logged out.
    pub async fn end_session(&self) -> Result<(), AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let store = self.store.lock().await;
        store.clear(&self.profile)?;
        debug!("profile '{}': session ended", self.profile);
        Ok(())
    }

    fn resource_url(&self, path: &str) -> Result<Url, AuthError> {
        let base = self.api_base.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }

    async fn send(
        &self,
        url: &Url,
        options: &RequestOptions,
        token: &str,
    ) -> Result<Response, AuthError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.extend(options.headers.clone());
        headers.remove(AUTHORIZATION);

        let mut request = self
            .oauth
            .http()
            .request(options.method.clone(), url.clone())
            .headers(headers)
            .bearer_auth(token);
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        Ok(request.send().await?)
    }
}
