use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::debug;
use spotify_core::api::{
    ApiError, CurrentlyPlaying, Page, Playlist, PlaylistItem, RepeatMode, SpotifyApi, Track, User,
};
use spotify_core::auth::{
    run_loopback_flow, AuthError, AuthFlow, AuthSession, CodeExchange, FileCredentialStore,
    FlowPreference, Method, OAuthClient, OAuthConfig, RequestOptions,
};
use spotify_core::config::{ConfigLocator, SpotifySettings};
use tokio::task;
use url::Url;

const DEFAULT_PROFILE: &str = "default";

type Session = AuthSession<FileCredentialStore>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Spotify playback control from the terminal")]
struct Cli {
    /// Profile name for stored credentials
    #[arg(long, global = true, default_value = DEFAULT_PROFILE)]
    profile: String,
    /// Override the directory holding stored credentials
    #[arg(long = "config-dir", global = true)]
    config_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authentication related commands
    #[command(subcommand)]
    Auth(AuthCommand),
    /// User account details
    #[command(subcommand)]
    User(UserCommand),
    /// Playback control
    #[command(subcommand)]
    Player(PlayerCommand),
    /// Playlist browsing
    #[command(subcommand)]
    Playlist(PlaylistCommand),
    /// Artist lookups
    #[command(subcommand)]
    Artist(ArtistCommand),
    /// Track lookups
    #[command(subcommand)]
    Track(TrackCommand),
    /// Search the catalogue for tracks
    Search(SearchArgs),
    /// Issue a raw authenticated Web API request
    Request(RequestArgs),
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Log in to Spotify with the PKCE authorization flow
    Login(LoginArgs),
    /// Start authorization and print the URL without waiting for the redirect
    Url(UrlArgs),
    /// Finish authorization with the redirect URL or code
    Callback(CallbackArgs),
    /// Show the stored session state
    Status,
    /// Force an access token refresh
    Refresh,
    /// Forget stored credentials for a profile
    Logout,
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Use manual copy/paste flow instead of the loopback listener
    #[arg(long)]
    manual: bool,
    /// Print the authorization URL without launching a browser
    #[arg(long = "no-browser")]
    no_browser: bool,
    /// Application state to hand back after authorization
    #[arg(long)]
    fragment: Option<String>,
}

#[derive(Args, Debug)]
struct UrlArgs {
    /// Application state to hand back after authorization
    #[arg(long)]
    fragment: Option<String>,
}

#[derive(Args, Debug)]
struct CallbackArgs {
    /// Redirect URL (or bare code) received from Spotify
    input: String,
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Show the current authenticated user
    Me(JsonArgs),
}

#[derive(Args, Debug)]
struct JsonArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum PlayerCommand {
    /// Show the currently playing track
    Now(JsonArgs),
    /// Resume playback, play the given track URIs, or play a playlist/album
    Play {
        /// Track URIs (spotify:track:...)
        #[arg(conflicts_with = "context")]
        uris: Vec<String>,
        /// Playlist or album URI to play
        #[arg(long)]
        context: Option<String>,
        /// Track URI inside the context to start from
        #[arg(long, requires = "context")]
        offset: Option<String>,
    },
    /// Pause playback
    Pause,
    /// Skip to the next track
    Next,
    /// Go back to the previous track
    Previous,
    /// Set the volume (0-100)
    Volume {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        percent: u8,
    },
    /// Add a track URI to the playback queue
    Queue { uri: String },
    /// Turn shuffle on (or off with --off)
    Shuffle {
        #[arg(long)]
        off: bool,
    },
    /// Set the repeat mode: track, context or off
    Repeat {
        #[arg(default_value = "track")]
        mode: RepeatMode,
    },
}

#[derive(Subcommand, Debug)]
enum PlaylistCommand {
    /// List your playlists
    List(PlaylistListArgs),
    /// List the tracks of a playlist
    Tracks(PlaylistTracksArgs),
}

#[derive(Args, Debug)]
struct PlaylistTracksArgs {
    /// Playlist id or spotify:playlist: URI
    playlist: String,
    /// Maximum number of tracks to return
    #[arg(long, default_value_t = 50)]
    limit: u32,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum ArtistCommand {
    /// Show an artist's top tracks
    Top(ArtistTopArgs),
}

#[derive(Args, Debug)]
struct ArtistTopArgs {
    /// Artist id or spotify:artist: URI
    artist: String,
    /// Market (ISO 3166-1 alpha-2 country code)
    #[arg(long, default_value = "US")]
    market: String,
    /// Start playing the top tracks
    #[arg(long)]
    play: bool,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum TrackCommand {
    /// Look up tracks by id or URI
    Info(TrackInfoArgs),
}

#[derive(Args, Debug)]
struct TrackInfoArgs {
    /// Track ids or spotify:track: URIs
    #[arg(required = true)]
    tracks: Vec<String>,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct PlaylistListArgs {
    /// Maximum number of playlists to return
    #[arg(long, default_value_t = 50)]
    limit: u32,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Search terms
    query: String,
    /// Maximum number of tracks to return
    #[arg(long, default_value_t = 10)]
    limit: u32,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// Path below the API base, e.g. /me/player
    path: String,
    /// HTTP method
    #[arg(long, short = 'X', default_value = "GET")]
    method: String,
    /// JSON request body
    #[arg(long)]
    data: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    if dotenvy::dotenv().is_err() {
        debug!("no .env file loaded");
    }

    let cli = Cli::parse();
    let result = run(cli).await;
    if let Err(err) = &result {
        if needs_login(err) {
            eprintln!("Run `spotify auth login` to authenticate.");
        }
    }
    result
}

async fn run(cli: Cli) -> Result<()> {
    let session = Arc::new(build_session(&cli.profile, cli.config_dir.as_deref())?);
    match cli.command {
        Commands::Auth(cmd) => match cmd {
            AuthCommand::Login(args) => auth_login(&session, args).await?,
            AuthCommand::Url(args) => auth_url(&session, args).await?,
            AuthCommand::Callback(args) => auth_callback(&session, args).await?,
            AuthCommand::Status => auth_status(&session).await?,
            AuthCommand::Refresh => auth_refresh(&session).await?,
            AuthCommand::Logout => auth_logout(&session).await?,
        },
        Commands::User(UserCommand::Me(args)) => user_me(session, args).await?,
        Commands::Player(cmd) => player(session, cmd).await?,
        Commands::Playlist(PlaylistCommand::List(args)) => playlist_list(session, args).await?,
        Commands::Playlist(PlaylistCommand::Tracks(args)) => playlist_tracks(session, args).await?,
        Commands::Artist(ArtistCommand::Top(args)) => artist_top(session, args).await?,
        Commands::Track(TrackCommand::Info(args)) => track_info(session, args).await?,
        Commands::Search(args) => search(session, args).await?,
        Commands::Request(args) => raw_request(&session, args).await?,
    }
    Ok(())
}

fn build_session(profile: &str, config_dir: Option<&std::path::Path>) -> Result<Session> {
    let settings = SpotifySettings::from_env().context("invalid Spotify settings")?;
    let config = OAuthConfig::from_settings(&settings)?;
    let oauth = OAuthClient::new(config).context("failed to build OAuth client")?;

    let locator = match config_dir {
        Some(dir) => ConfigLocator::create(dir),
        None => ConfigLocator::new(),
    }
    .context("unable to initialise credential store")?;
    let store = FileCredentialStore::new(locator);

    let mut session = AuthSession::new(store, oauth, profile);
    if let Some(api_base) = settings.api_base {
        session = session.with_api_base(api_base);
    }
    Ok(session)
}

async fn auth_login(session: &Session, args: LoginArgs) -> Result<()> {
    let preference = FlowPreference::detect();
    let flow = if args.manual {
        AuthFlow::Manual
    } else {
        preference.preferred()
    };
    let open_browser = preference.browser_available() && !args.no_browser;
    let fragment = args.fragment.as_deref();

    let exchange = match flow {
        AuthFlow::Browser => {
            match run_loopback_flow(session, open_browser, fragment, print_authorization_url).await
            {
                Ok(exchange) => exchange,
                Err(AuthError::BrowserLaunch(reason)) => {
                    eprintln!(
                        "Failed to launch browser ({reason}); falling back to manual copy/paste flow."
                    );
                    manual_login(session, fragment).await?
                }
                Err(AuthError::Io(err)) => {
                    eprintln!(
                        "Unable to listen on the redirect URI ({err}); using manual copy/paste flow."
                    );
                    manual_login(session, fragment).await?
                }
                Err(other) => return Err(other.into()),
            }
        }
        AuthFlow::Manual => manual_login(session, fragment).await?,
    };

    report_login(session, &exchange);
    Ok(())
}

async fn manual_login(session: &Session, fragment: Option<&str>) -> Result<CodeExchange> {
    let url = session.begin_authorization(fragment).await?;
    print_authorization_url(&url)?;
    let input = prompt_for_code().await?;
    Ok(session
        .handle_callback(&input)
        .await
        .context("failed to complete authorization")?)
}

fn report_login(session: &Session, exchange: &CodeExchange) {
    println!(
        "Login succeeded. Credentials stored for profile '{}'.",
        session.profile()
    );
    println!("Token expires at {} (UTC).", exchange.tokens.expires_at);
    if let Some(fragment) = &exchange.return_fragment {
        println!("Restored application state: #{fragment}");
    }
}

async fn auth_url(session: &Session, args: UrlArgs) -> Result<()> {
    let url = session.begin_authorization(args.fragment.as_deref()).await?;
    print_authorization_url(&url)?;
    println!("Then run `spotify auth callback '<redirect URL>'`.");
    Ok(())
}

async fn auth_callback(session: &Session, args: CallbackArgs) -> Result<()> {
    let exchange = session
        .handle_callback(&args.input)
        .await
        .context("failed to complete authorization")?;
    report_login(session, &exchange);
    Ok(())
}

async fn auth_status(session: &Session) -> Result<()> {
    let status = session.status().await?;
    println!("Profile '{}': {status}", session.profile());
    Ok(())
}

async fn auth_refresh(session: &Session) -> Result<()> {
    session
        .refresh()
        .await
        .context("failed to refresh access token")?;
    println!("{}", session.status().await?);
    Ok(())
}

async fn auth_logout(session: &Session) -> Result<()> {
    session
        .end_session()
        .await
        .context("failed to remove stored credentials")?;
    println!("Deleted credentials for profile '{}'.", session.profile());
    Ok(())
}

async fn prompt_for_code() -> Result<String, AuthError> {
    task::spawn_blocking(|| {
        use std::io::{self, Write};
        print!("Paste the redirect URL or code: ");
        io::stdout().flush().map_err(AuthError::Io)?;
        let mut input = String::new();
        io::stdin().read_line(&mut input).map_err(AuthError::Io)?;
        Ok(input.trim().to_owned())
    })
    .await
    .map_err(|_| AuthError::ListenerClosed)?
}

fn print_authorization_url(url: &Url) -> Result<(), AuthError> {
    println!("\nAuthorize the application by visiting:\n  {}\n", url);
    Ok(())
}

async fn user_me(session: Arc<Session>, args: JsonArgs) -> Result<()> {
    let user = SpotifyApi::new(session)
        .me()
        .await
        .context("profile request failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&user)?);
    } else {
        render_user(&user);
    }
    Ok(())
}

fn render_user(user: &User) {
    println!("Id:      {}", user.id);
    if let Some(name) = &user.display_name {
        println!("Name:    {name}");
    }
    if let Some(email) = &user.email {
        println!("Email:   {email}");
    }
    if let Some(product) = &user.product {
        println!("Plan:    {product}");
    }
}

async fn player(session: Arc<Session>, cmd: PlayerCommand) -> Result<()> {
    let api = SpotifyApi::new(session);
    match cmd {
        PlayerCommand::Now(args) => {
            let playing = api
                .currently_playing()
                .await
                .context("playback state request failed")?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&playing)?);
            } else {
                render_now_playing(playing.as_ref());
            }
        }
        PlayerCommand::Play {
            uris,
            context,
            offset,
        } => match context {
            Some(context) => api
                .play_context(&context, offset.as_deref())
                .await
                .context("play failed")?,
            None => api.play(&uris).await.context("play failed")?,
        },
        PlayerCommand::Pause => api.pause().await.context("pause failed")?,
        PlayerCommand::Next => api.next().await.context("skip failed")?,
        PlayerCommand::Previous => api.previous().await.context("previous failed")?,
        PlayerCommand::Volume { percent } => api
            .set_volume(percent)
            .await
            .context("volume change failed")?,
        PlayerCommand::Queue { uri } => {
            api.add_to_queue(&uri).await.context("queueing failed")?;
            println!("Queued {uri}");
        }
        PlayerCommand::Shuffle { off } => {
            api.set_shuffle(!off).await.context("shuffle change failed")?;
            println!("Shuffle {}", if off { "off" } else { "on" });
        }
        PlayerCommand::Repeat { mode } => {
            api.set_repeat(mode).await.context("repeat change failed")?;
            println!("Repeat {mode}");
        }
    }
    Ok(())
}

fn render_now_playing(playing: Option<&CurrentlyPlaying>) {
    let Some(playing) = playing else {
        println!("Nothing is playing.");
        return;
    };
    let Some(track) = &playing.item else {
        println!("Playing something that is not a track.");
        return;
    };
    let state = if playing.is_playing { "Playing" } else { "Paused" };
    let progress = playing.progress_ms.unwrap_or_default();
    println!(
        "{state}: {} - {} [{} / {}]",
        track.name,
        track.artist_names(),
        format_duration(progress),
        format_duration(track.duration_ms)
    );
}

async fn playlist_list(session: Arc<Session>, args: PlaylistListArgs) -> Result<()> {
    let page = SpotifyApi::new(session)
        .playlists(args.limit)
        .await
        .context("playlist request failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else {
        render_playlists(&page);
    }
    Ok(())
}

fn render_playlists(page: &Page<Playlist>) {
    if page.items.is_empty() {
        println!("No playlists found.");
        return;
    }
    for playlist in &page.items {
        let tracks = playlist
            .tracks
            .as_ref()
            .map(|tracks| tracks.total)
            .unwrap_or_default();
        println!(
            "{:<24} {:>5} tracks  {}",
            playlist.id,
            tracks,
            truncate(&playlist.name, 60)
        );
    }
}

async fn playlist_tracks(session: Arc<Session>, args: PlaylistTracksArgs) -> Result<()> {
    let page = SpotifyApi::new(session)
        .playlist_tracks(&args.playlist, args.limit)
        .await
        .context("playlist tracks request failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else {
        render_tracks(&playable_tracks(&page.items));
    }
    Ok(())
}

fn playable_tracks(items: &[PlaylistItem]) -> Vec<Track> {
    items.iter().filter_map(|item| item.track.clone()).collect()
}

async fn artist_top(session: Arc<Session>, args: ArtistTopArgs) -> Result<()> {
    let api = SpotifyApi::new(session);
    let tracks = api
        .artist_top_tracks(&args.artist, &args.market)
        .await
        .context("top tracks request failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&tracks)?);
    } else {
        render_tracks(&tracks);
    }
    if args.play && !tracks.is_empty() {
        let uris: Vec<String> = tracks.iter().map(|track| track.uri.clone()).collect();
        api.play(&uris).await.context("play failed")?;
    }
    Ok(())
}

async fn track_info(session: Arc<Session>, args: TrackInfoArgs) -> Result<()> {
    let tracks = SpotifyApi::new(session)
        .tracks(&args.tracks)
        .await
        .context("track lookup failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&tracks)?);
    } else {
        render_tracks(&tracks);
    }
    Ok(())
}

async fn search(session: Arc<Session>, args: SearchArgs) -> Result<()> {
    let page = SpotifyApi::new(session)
        .search_tracks(&args.query, args.limit)
        .await
        .context("search request failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else {
        render_tracks(&page.items);
    }
    Ok(())
}

fn render_tracks(tracks: &[Track]) {
    if tracks.is_empty() {
        println!("No tracks found.");
        return;
    }
    for track in tracks {
        println!(
            "{:<38} {:>6}  {} - {}",
            track.uri,
            format_duration(track.duration_ms),
            truncate(&track.name, 40),
            truncate(&track.artist_names(), 40)
        );
    }
}

async fn raw_request(session: &Session, args: RequestArgs) -> Result<()> {
    let method = args
        .method
        .to_ascii_uppercase()
        .parse::<Method>()
        .with_context(|| format!("invalid HTTP method '{}'", args.method))?;
    let mut options = RequestOptions::new(method);
    if let Some(data) = &args.data {
        let body: serde_json::Value =
            serde_json::from_str(data).context("--data must be valid JSON")?;
        options = options.json(&body)?;
    }

    let response = session.authenticated_request(&args.path, options).await?;
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) if !text.is_empty() => println!("{text}"),
        Err(_) => {}
    }
    if !status.is_success() {
        bail!("request failed with status {status}");
    }
    Ok(())
}

fn needs_login(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(auth) = cause.downcast_ref::<AuthError>() {
            return auth.requires_login();
        }
        matches!(
            cause.downcast_ref::<ApiError>(),
            Some(ApiError::Auth(auth)) if auth.requires_login()
        )
    })
}

fn format_duration(ms: u64) -> String {
    let seconds = ms / 1000;
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

fn truncate(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        return value.to_owned();
    }
    let mut truncated: String = value.chars().take(max_len.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}
