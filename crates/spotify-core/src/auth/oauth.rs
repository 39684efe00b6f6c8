use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Client, Response};
use serde::Deserialize;
use url::Url;

use super::{AuthError, Clock, PkcePair, TokenSet};
use crate::config::SpotifySettings;

pub const DEFAULT_CLIENT_ID: &str = "d99bb196bf4a4d05bd7ee06d9d6cdb61";
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:4173/callback";
pub const DEFAULT_AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const DEFAULT_SCOPES: &[&str; 9] = &[
    "user-read-playback-state",
    "user-modify-playback-state",
    "user-read-currently-playing",
    "playlist-modify-public",
    "playlist-modify-private",
    "playlist-read-private",
    "playlist-read-collaborative",
    "user-library-read",
    "user-library-modify",
];

const DEFAULT_USER_AGENT: &str = "spotify-session-rs/0.1.0";
const TOKEN_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// OAuth client configuration supplied by consumers.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
}

impl OAuthConfig {
    pub fn new<S: Into<String>>(client_id: S, redirect_uri: Url) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri,
            scopes: vec![],
        }
    }

    pub fn with_defaults() -> Result<Self, AuthError> {
        let redirect_uri = Url::parse(DEFAULT_REDIRECT_URI)?;
        Ok(Self::new(DEFAULT_CLIENT_ID, redirect_uri).with_scopes(DEFAULT_SCOPES.iter().copied()))
    }

    /// Defaults overridden by whatever the environment provides.
    pub fn from_settings(settings: &SpotifySettings) -> Result<Self, AuthError> {
        let mut config = Self::with_defaults()?;
        if let Some(client_id) = &settings.client_id {
            config.client_id = client_id.clone();
        }
        if let Some(redirect_uri) = &settings.redirect_uri {
            config.redirect_uri = redirect_uri.clone();
        }
        if let Some(scopes) = &settings.scopes {
            config.scopes = scopes.clone();
        }
        Ok(config)
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }
}

/// Spotify accounts endpoints.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorization_url: Url,
    pub token_url: Url,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            authorization_url: Url::parse(DEFAULT_AUTHORIZE_URL).unwrap(),
            token_url: Url::parse(DEFAULT_TOKEN_URL).unwrap(),
        }
    }
}

/// Performs PKCE token exchanges against the Spotify accounts service.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    config: OAuthConfig,
    endpoints: OAuthEndpoints,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig) -> Result<Self, AuthError> {
        Self::with_endpoints(config, OAuthEndpoints::default())
    }

    pub fn with_endpoints(
        config: OAuthConfig,
        endpoints: OAuthEndpoints,
    ) -> Result<Self, AuthError> {
        let http = Client::builder().user_agent(DEFAULT_USER_AGENT).build()?;
        Ok(Self {
            http,
            config,
            endpoints,
        })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Authorize URL the user agent must be sent to.
    pub fn authorization_url(&self, pkce: &PkcePair) -> Url {
        let mut url = self.endpoints.authorization_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("client_id", &self.config.client_id);
            pairs.append_pair("response_type", "code");
            pairs.append_pair("redirect_uri", self.config.redirect_uri.as_str());
            if !self.config.scopes.is_empty() {
                pairs.append_pair("scope", &self.config.scopes.join(" "));
            }
            pairs.append_pair("code_challenge_method", "S256");
            pairs.append_pair("code_challenge", pkce.challenge());
        }
        url
    }

    /// Exchange an authorization code for access/refresh tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        pkce: &PkcePair,
        clock: &dyn Clock,
    ) -> Result<TokenSet, AuthError> {
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code_verifier", pkce.verifier()),
        ];

        let response = self
            .http
            .post(self.endpoints.token_url.clone())
            .form(&form)
            .timeout(TOKEN_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchange { status, body });
        }

        let payload = TokenResponse::read(response).await?;
        let received_at = clock.now();
        debug!(
            "authorization code exchanged; token valid for {}s",
            payload.expires_in
        );
        payload.into_token_set(received_at)
    }

    /// Mint a new access token. The returned set carries a refresh token only
    /// when the provider rotated it.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        clock: &dyn Clock,
    ) -> Result<TokenSet, AuthError> {
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http
            .post(self.endpoints.token_url.clone())
            .form(&form)
            .timeout(TOKEN_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Refresh { status, body });
        }

        let payload = TokenResponse::read(response).await?;
        let received_at = clock.now();
        debug!(
            "access token refreshed; rotated refresh token: {}",
            payload.refresh_token.is_some()
        );
        payload.into_token_set(received_at)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

impl TokenResponse {
    /// A body that fails to decode is a provider fault, not a transport one.
    async fn read(response: Response) -> Result<Self, AuthError> {
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|err| AuthError::InvalidTokenResponse(err.to_string()))
    }

    fn into_token_set(self, received_at: DateTime<Utc>) -> Result<TokenSet, AuthError> {
        let expires_in = self.expires_in;
        TokenSet::issued(
            self.access_token,
            self.refresh_token,
            received_at,
            expires_in,
        )
        .ok_or_else(|| {
            AuthError::InvalidTokenResponse(format!("expires_in out of range: {expires_in}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::testing::ManualClock;
    use chrono::{Duration, TimeZone};
    use httpmock::prelude::*;
    use reqwest::StatusCode;

    fn received_at() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_000_000).unwrap()
    }

    fn clock() -> ManualClock {
        ManualClock::new(received_at())
    }

    fn test_client(server: &MockServer) -> OAuthClient {
        let config = OAuthConfig::new(
            "client-id",
            Url::parse("http://localhost/callback").unwrap(),
        );
        let endpoints = OAuthEndpoints {
            authorization_url: Url::parse("http://localhost/authorize").unwrap(),
            token_url: Url::parse(&server.url("/api/token")).unwrap(),
        };
        OAuthClient::with_endpoints(config, endpoints).unwrap()
    }

    #[test]
    fn authorization_url_carries_pkce_parameters() {
        let config = OAuthConfig::with_defaults().unwrap();
        let client = OAuthClient::new(config).unwrap();
        let pkce = PkcePair::generate();
        let url = client.authorization_url(&pkce);

        assert_eq!(url.host_str(), Some("accounts.spotify.com"));
        assert_eq!(url.path(), "/authorize");
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], DEFAULT_CLIENT_ID);
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], DEFAULT_REDIRECT_URI);
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["code_challenge"], pkce.challenge());
        assert_eq!(params["scope"].split(' ').count(), DEFAULT_SCOPES.len());
        assert!(!params.contains_key("code_verifier"));
    }

    #[tokio::test]
    async fn exchange_code_success() {
        let server = MockServer::start();
        let pkce = PkcePair::generate();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .body_contains("grant_type=authorization_code")
                .body_contains("client_id=client-id")
                .body_contains("code=code123")
                .body_contains("redirect_uri=http%3A%2F%2Flocalhost%2Fcallback")
                .body_contains(format!("code_verifier={}", pkce.verifier()));
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "abc123",
                "token_type": "Bearer",
                "scope": "user-read-playback-state",
                "expires_in": 3600,
                "refresh_token": "refresh456"
            }));
        });

        let client = test_client(&server);
        let tokens = client
            .exchange_code("code123", &pkce, &clock())
            .await
            .unwrap();
        mock.assert();
        assert_eq!(tokens.access_token, "abc123");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh456"));
        assert_eq!(tokens.expires_at, received_at() + Duration::seconds(3600));
    }

    #[tokio::test]
    async fn exchange_rejection_is_typed() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/token");
            then.status(400).body("invalid_grant");
        });

        let client = test_client(&server);
        let err = client
            .exchange_code("bad", &PkcePair::generate(), &clock())
            .await
            .unwrap_err();
        mock.assert();
        match err {
            AuthError::TokenExchange { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "invalid_grant");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_sends_refresh_grant() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/token")
                .body_contains("grant_type=refresh_token")
                .body_contains("refresh_token=refresh456")
                .body_contains("client_id=client-id");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "new-access",
                "token_type": "Bearer",
                "expires_in": 7200
            }));
        });

        let client = test_client(&server);
        let tokens = client.refresh("refresh456", &clock()).await.unwrap();
        mock.assert();
        assert_eq!(tokens.access_token, "new-access");
        assert!(tokens.refresh_token.is_none());
        assert_eq!(tokens.expires_at, received_at() + Duration::seconds(7200));
    }

    #[tokio::test]
    async fn refresh_rejection_is_typed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/token");
            then.status(400).body("{\"error\":\"invalid_grant\"}");
        });

        let client = test_client(&server);
        let err = client.refresh("revoked", &clock()).await.unwrap_err();
        assert!(matches!(err, AuthError::Refresh { status, .. } if status == StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn out_of_range_expiry_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "x",
                "expires_in": 9_000_000_000_000_i64
            }));
        });

        let client = test_client(&server);
        let err = client.refresh("refresh456", &clock()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidTokenResponse(_)), "unexpected error: {err:?}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn negative_expiry_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "x",
                "expires_in": -60
            }));
        });

        let client = test_client(&server);
        let err = client
            .exchange_code("code123", &PkcePair::generate(), &clock())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidTokenResponse(_)), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn malformed_token_body_is_not_retryable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/token");
            then.status(200)
                .header("content-type", "text/html")
                .body("<html>oops</html>");
        });

        let client = test_client(&server);
        let err = client.refresh("refresh456", &clock()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidTokenResponse(_)), "unexpected error: {err:?}");
        assert!(!err.is_retryable());

        let err = client
            .exchange_code("code123", &PkcePair::generate(), &clock())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidTokenResponse(_)), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_is_transport_error() {
        let config = OAuthConfig::new(
            "client-id",
            Url::parse("http://localhost/callback").unwrap(),
        );
        let endpoints = OAuthEndpoints {
            authorization_url: Url::parse("http://127.0.0.1:9/authorize").unwrap(),
            token_url: Url::parse("http://127.0.0.1:9/api/token").unwrap(),
        };
        let client = OAuthClient::with_endpoints(config, endpoints).unwrap();
        let err = client.refresh("refresh", &clock()).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err:?}");
    }

    #[test]
    fn settings_override_defaults() {
        let settings = SpotifySettings {
            client_id: Some("custom".into()),
            redirect_uri: Some(Url::parse("http://127.0.0.1:8888/callback").unwrap()),
            scopes: Some(vec!["streaming".into()]),
            api_base: None,
        };
        let config = OAuthConfig::from_settings(&settings).unwrap();
        assert_eq!(config.client_id, "custom");
        assert_eq!(config.redirect_uri.port(), Some(8888));
        assert_eq!(config.scopes, vec!["streaming"]);
    }
}
