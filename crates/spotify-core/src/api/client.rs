use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{AuthError, AuthSession, CredentialStore, RequestOptions};

/// Errors returned by the Web API helpers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {status} body: {body}")]
    HttpStatus { status: StatusCode, body: String },
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Most ids the several-tracks endpoint accepts per call.
const TRACK_BATCH: usize = 50;

/// Typed helpers over [`AuthSession::authenticated_request`] for the
/// endpoints a playback controller needs.
pub struct SpotifyApi<S> {
    session: Arc<AuthSession<S>>,
}

impl<S> Clone for SpotifyApi<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

impl<S> SpotifyApi<S>
where
    S: CredentialStore + Send + Sync + 'static,
{
    pub fn new(session: Arc<AuthSession<S>>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &AuthSession<S> {
        &self.session
    }

    /// Profile of the authenticated user.
    pub async fn me(&self) -> ApiResult<User> {
        self.get_json("/me", RequestOptions::get()).await
    }

    /// `None` when nothing is playing (the API answers 204).
    pub async fn currently_playing(&self) -> ApiResult<Option<CurrentlyPlaying>> {
        let response = self
            .session
            .authenticated_request("/me/player/currently-playing", RequestOptions::get())
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        Ok(Some(response.json().await?))
    }

    /// Resume playback, or start the given track URIs.
    pub async fn play(&self, uris: &[String]) -> ApiResult<()> {
        let mut options = RequestOptions::put();
        if !uris.is_empty() {
            options = options.json(&serde_json::json!({ "uris": uris }))?;
        }
        self.send("/me/player/play", options).await
    }

    /// Play a playlist or album, optionally starting at one of its tracks.
    pub async fn play_context(
        &self,
        context_uri: &str,
        offset_uri: Option<&str>,
    ) -> ApiResult<()> {
        let mut body = serde_json::json!({ "context_uri": context_uri });
        if let Some(uri) = offset_uri {
            body["offset"] = serde_json::json!({ "uri": uri });
        }
        let options = RequestOptions::put().json(&body)?;
        self.send("/me/player/play", options).await
    }

    pub async fn pause(&self) -> ApiResult<()> {
        self.send("/me/player/pause", RequestOptions::put()).await
    }

    pub async fn next(&self) -> ApiResult<()> {
        self.send("/me/player/next", RequestOptions::post()).await
    }

    pub async fn previous(&self) -> ApiResult<()> {
        self.send("/me/player/previous", RequestOptions::post())
            .await
    }

    pub async fn set_volume(&self, percent: u8) -> ApiResult<()> {
        let options = RequestOptions::put().query("volume_percent", percent.min(100));
        self.send("/me/player/volume", options).await
    }

    pub async fn set_shuffle(&self, enabled: bool) -> ApiResult<()> {
        let options = RequestOptions::put().query("state", enabled);
        self.send("/me/player/shuffle", options).await
    }

    pub async fn set_repeat(&self, mode: RepeatMode) -> ApiResult<()> {
        let options = RequestOptions::put().query("state", mode);
        self.send("/me/player/repeat", options).await
    }

    pub async fn add_to_queue(&self, uri: &str) -> ApiResult<()> {
        let options = RequestOptions::post().query("uri", uri);
        self.send("/me/player/queue", options).await
    }

    /// Current user's playlists; `limit` is clamped to the API's 1..=50.
    pub async fn playlists(&self, limit: u32) -> ApiResult<Page<Playlist>> {
        let options = RequestOptions::get().query("limit", limit.clamp(1, 50));
        self.get_json("/me/playlists", options).await
    }

    /// Entries of one playlist. Accepts a bare id or a `spotify:playlist:` URI.
    pub async fn playlist_tracks(
        &self,
        playlist: &str,
        limit: u32,
    ) -> ApiResult<Page<PlaylistItem>> {
        let path = format!("/playlists/{}/tracks", bare_id(playlist, "playlist"));
        let options = RequestOptions::get().query("limit", limit.clamp(1, 50));
        self.get_json(&path, options).await
    }

    pub async fn artist_top_tracks(&self, artist: &str, market: &str) -> ApiResult<Vec<Track>> {
        #[derive(Deserialize)]
        struct TopTracks {
            tracks: Vec<Track>,
        }

        let path = format!("/artists/{}/top-tracks", bare_id(artist, "artist"));
        let options = RequestOptions::get().query("market", market);
        let top: TopTracks = self.get_json(&path, options).await?;
        Ok(top.tracks)
    }

    /// Look up several tracks by id or `spotify:track:` URI, in batches the
    /// API accepts. Unknown ids are skipped.
    pub async fn tracks(&self, tracks: &[String]) -> ApiResult<Vec<Track>> {
        #[derive(Deserialize)]
        struct Tracks {
            tracks: Vec<Option<Track>>,
        }

        let mut found = Vec::with_capacity(tracks.len());
        for batch in tracks.chunks(TRACK_BATCH) {
            let ids = batch
                .iter()
                .map(|track| bare_id(track, "track"))
                .collect::<Vec<_>>()
                .join(",");
            let options = RequestOptions::get().query("ids", ids);
            let page: Tracks = self.get_json("/tracks", options).await?;
            found.extend(page.tracks.into_iter().flatten());
        }
        Ok(found)
    }

    pub async fn search_tracks(&self, query: &str, limit: u32) -> ApiResult<Page<Track>> {
        #[derive(Deserialize)]
        struct SearchEnvelope {
            tracks: Page<Track>,
        }

        let options = RequestOptions::get()
            .query("q", query)
            .query("type", "track")
            .query("limit", limit.clamp(1, 50));
        let envelope: SearchEnvelope = self.get_json("/search", options).await?;
        Ok(envelope.tracks)
    }

    async fn get_json<R>(&self, path: &str, options: RequestOptions) -> ApiResult<R>
    where
        R: DeserializeOwned,
    {
        let response = self.session.authenticated_request(path, options).await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<R>().await?)
    }

    async fn send(&self, path: &str, options: RequestOptions) -> ApiResult<()> {
        let response = self.session.authenticated_request(path, options).await?;
        ensure_success(response).await?;
        Ok(())
    }
}

/// Strip a `spotify:<kind>:` prefix, leaving other input untouched.
fn bare_id<'a>(value: &'a str, kind: &str) -> &'a str {
    value
        .strip_prefix("spotify:")
        .and_then(|rest| rest.strip_prefix(kind))
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(value)
}

async fn ensure_success(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::HttpStatus { status, body });
    }
    Ok(response)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub country: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub total: u32,
    pub next: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artist {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Album {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: Option<String>,
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub artists: Vec<Artist>,
    pub album: Option<Album>,
}

impl Track {
    pub fn artist_names(&self) -> String {
        self.artists
            .iter()
            .map(|artist| artist.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentlyPlaying {
    pub is_playing: bool,
    pub progress_ms: Option<u64>,
    pub item: Option<Track>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistOwner {
    pub id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistTracks {
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub uri: String,
    pub owner: Option<PlaylistOwner>,
    pub tracks: Option<PlaylistTracks>,
}

/// One playlist entry; `track` is null for removed or local items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub added_at: Option<String>,
    pub track: Option<Track>,
}

/// Player repeat state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatMode {
    Track,
    Context,
    Off,
}

impl FromStr for RepeatMode {
    type Err = InvalidRepeatMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "track" => Ok(RepeatMode::Track),
            "context" | "playlist" | "album" => Ok(RepeatMode::Context),
            "off" => Ok(RepeatMode::Off),
            other => Err(InvalidRepeatMode(other.to_owned())),
        }
    }
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            RepeatMode::Track => "track",
            RepeatMode::Context => "context",
            RepeatMode::Off => "off",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Error)]
#[error("invalid repeat mode '{0}' (expected track, context or off)")]
pub struct InvalidRepeatMode(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use httpmock::prelude::*;
    use url::Url;

    use crate::auth::{
        MemoryCredentialStore, OAuthClient, OAuthConfig, OAuthEndpoints, SessionState, TokenSet,
    };

    fn api(server: &MockServer) -> SpotifyApi<MemoryCredentialStore> {
        let store = MemoryCredentialStore::new();
        store
            .save(
                "default",
                &SessionState::Authenticated(TokenSet {
                    access_token: "token".into(),
                    refresh_token: Some("refresh".into()),
                    expires_at: Utc::now() + Duration::hours(1),
                }),
            )
            .unwrap();
        let oauth = OAuthClient::with_endpoints(
            OAuthConfig::new("client", Url::parse("http://127.0.0.1/callback").unwrap()),
            OAuthEndpoints {
                authorization_url: Url::parse(&server.url("/authorize")).unwrap(),
                token_url: Url::parse(&server.url("/api/token")).unwrap(),
            },
        )
        .unwrap();
        let session = AuthSession::new(store, oauth, "default")
            .with_api_base(Url::parse(&server.url("/v1")).unwrap());
        SpotifyApi::new(Arc::new(session))
    }

    fn track_json(id: &str, name: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": name,
            "uri": format!("spotify:track:{id}"),
            "duration_ms": 180000,
            "artists": [{ "id": "a1", "name": "Artist One" }, { "id": "a2", "name": "Artist Two" }],
            "album": { "id": "al1", "name": "Album" }
        })
    }

    #[tokio::test]
    async fn me_returns_profile() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/me")
                .header("authorization", "Bearer token");
            then.status(200).json_body_obj(&serde_json::json!({
                "id": "user-1",
                "display_name": "Listener",
                "product": "premium"
            }));
        });

        let user = api(&server).me().await.unwrap();
        mock.assert();
        assert_eq!(user.id, "user-1");
        assert_eq!(user.display_name.as_deref(), Some("Listener"));
        assert!(user.email.is_none());
    }

    #[tokio::test]
    async fn nothing_playing_is_none() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/me/player/currently-playing");
            then.status(204);
        });
        assert!(api(&server).currently_playing().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn currently_playing_parses_track() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/me/player/currently-playing");
            then.status(200).json_body_obj(&serde_json::json!({
                "is_playing": true,
                "progress_ms": 4200,
                "item": track_json("t1", "Song")
            }));
        });
        let playing = api(&server).currently_playing().await.unwrap().unwrap();
        assert!(playing.is_playing);
        let track = playing.item.unwrap();
        assert_eq!(track.artist_names(), "Artist One, Artist Two");
    }

    #[tokio::test]
    async fn search_sends_track_query() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/search")
                .query_param("q", "daft punk")
                .query_param("type", "track")
                .query_param("limit", "50");
            then.status(200).json_body_obj(&serde_json::json!({
                "tracks": { "items": [track_json("t1", "One More Time")], "total": 1, "next": null }
            }));
        });
        let page = api(&server).search_tracks("daft punk", 500).await.unwrap();
        mock.assert();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].uri, "spotify:track:t1");
    }

    #[tokio::test]
    async fn playback_controls_hit_player_endpoints() {
        let server = MockServer::start();
        let play = server.mock(|when, then| {
            when.method(PUT)
                .path("/v1/me/player/play")
                .json_body_obj(&serde_json::json!({ "uris": ["spotify:track:t1"] }));
            then.status(204);
        });
        let next = server.mock(|when, then| {
            when.method(POST).path("/v1/me/player/next");
            then.status(204);
        });
        let volume = server.mock(|when, then| {
            when.method(PUT)
                .path("/v1/me/player/volume")
                .query_param("volume_percent", "100");
            then.status(204);
        });
        let queue = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/me/player/queue")
                .query_param("uri", "spotify:track:t2");
            then.status(204);
        });

        let api = api(&server);
        api.play(&["spotify:track:t1".to_string()]).await.unwrap();
        api.next().await.unwrap();
        api.set_volume(150).await.unwrap();
        api.add_to_queue("spotify:track:t2").await.unwrap();
        play.assert();
        next.assert();
        volume.assert();
        queue.assert();
    }

    #[tokio::test]
    async fn play_context_starts_at_offset() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(PUT)
                .path("/v1/me/player/play")
                .json_body_obj(&serde_json::json!({
                    "context_uri": "spotify:playlist:p1",
                    "offset": { "uri": "spotify:track:t3" }
                }));
            then.status(204);
        });
        api(&server)
            .play_context("spotify:playlist:p1", Some("spotify:track:t3"))
            .await
            .unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn shuffle_and_repeat_set_player_state() {
        let server = MockServer::start();
        let shuffle = server.mock(|when, then| {
            when.method(PUT)
                .path("/v1/me/player/shuffle")
                .query_param("state", "true");
            then.status(204);
        });
        let repeat = server.mock(|when, then| {
            when.method(PUT)
                .path("/v1/me/player/repeat")
                .query_param("state", "track");
            then.status(204);
        });

        let api = api(&server);
        api.set_shuffle(true).await.unwrap();
        api.set_repeat(RepeatMode::Track).await.unwrap();
        shuffle.assert();
        repeat.assert();
    }

    #[test]
    fn repeat_modes_parse() {
        assert_eq!("Track".parse::<RepeatMode>().unwrap(), RepeatMode::Track);
        assert_eq!("playlist".parse::<RepeatMode>().unwrap(), RepeatMode::Context);
        assert_eq!(RepeatMode::Off.to_string(), "off");
        assert_eq!("loop".parse::<RepeatMode>().unwrap_err().0, "loop");
    }

    #[tokio::test]
    async fn playlist_tracks_accepts_uri() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/playlists/p1/tracks")
                .query_param("limit", "50");
            then.status(200).json_body_obj(&serde_json::json!({
                "items": [
                    { "added_at": "2024-01-01T00:00:00Z", "track": track_json("t1", "Song") },
                    { "added_at": null, "track": null }
                ],
                "total": 2,
                "next": null
            }));
        });
        let page = api(&server)
            .playlist_tracks("spotify:playlist:p1", 50)
            .await
            .unwrap();
        mock.assert();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].track.as_ref().unwrap().name, "Song");
        assert!(page.items[1].track.is_none());
    }

    #[tokio::test]
    async fn artist_top_tracks_uses_market() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/artists/a1/top-tracks")
                .query_param("market", "US");
            then.status(200).json_body_obj(&serde_json::json!({
                "tracks": [track_json("t1", "Hit"), track_json("t2", "Other Hit")]
            }));
        });
        let tracks = api(&server).artist_top_tracks("a1", "US").await.unwrap();
        mock.assert();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[1].uri, "spotify:track:t2");
    }

    #[tokio::test]
    async fn track_lookup_batches_and_skips_unknown() {
        let server = MockServer::start();
        let first_batch = (0..50).map(|i| format!("t{i}")).collect::<Vec<_>>().join(",");
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/tracks")
                .query_param("ids", first_batch.as_str());
            then.status(200).json_body_obj(&serde_json::json!({
                "tracks": [track_json("t0", "First"), null]
            }));
        });
        let second = server.mock(|when, then| {
            when.method(GET).path("/v1/tracks").query_param("ids", "t50");
            then.status(200).json_body_obj(&serde_json::json!({
                "tracks": [track_json("t50", "Last")]
            }));
        });

        let ids: Vec<String> = (0..51).map(|i| format!("spotify:track:t{i}")).collect();
        let tracks = api(&server).tracks(&ids).await.unwrap();
        first.assert();
        second.assert();
        let names: Vec<_> = tracks.iter().map(|track| track.name.as_str()).collect();
        assert_eq!(names, ["First", "Last"]);
    }

    #[tokio::test]
    async fn empty_track_lookup_skips_request() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/v1/tracks");
            then.status(200);
        });
        assert!(api(&server).tracks(&[]).await.unwrap().is_empty());
        mock.assert_hits(0);
    }

    #[test]
    fn bare_ids_strip_matching_prefix_only() {
        assert_eq!(bare_id("spotify:track:abc", "track"), "abc");
        assert_eq!(bare_id("abc", "track"), "abc");
        assert_eq!(bare_id("spotify:album:abc", "track"), "spotify:album:abc");
    }

    #[tokio::test]
    async fn provider_errors_are_reported_with_body() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path("/v1/me/player/pause");
            then.status(404)
                .body("{\"error\":{\"status\":404,\"message\":\"No active device found\"}}");
        });
        let err = api(&server).pause().await.unwrap_err();
        match err {
            ApiError::HttpStatus { status, body } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert!(body.contains("No active device"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn playlists_limit_is_clamped() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/me/playlists")
                .query_param("limit", "1");
            then.status(200).json_body_obj(&serde_json::json!({
                "items": [{
                    "id": "p1",
                    "name": "Mix",
                    "uri": "spotify:playlist:p1",
                    "owner": { "id": "user-1", "display_name": "Listener" },
                    "tracks": { "total": 12 }
                }],
                "total": 1,
                "next": null
            }));
        });
        let page = api(&server).playlists(0).await.unwrap();
        mock.assert();
        assert_eq!(page.items[0].tracks.as_ref().unwrap().total, 12);
    }
}
