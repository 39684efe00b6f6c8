use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use url::Url;

use super::callback::parse_callback_input;
use super::{AuthError, AuthSession, CodeExchange, CredentialStore};

const SUCCESS_HTML: &str = r#"<html><body><h1>Authentication complete</h1><p>You may close this window and return to the terminal.</p></body></html>"#;
const ERROR_HTML: &str = r#"<html><body><h1>Authentication failed</h1><p>Please return to the terminal for details.</p></body></html>"#;
const NOT_FOUND_HTML: &str = r#"<html><body><h1>Not found</h1></body></html>"#;

/// Run the whole authorization round-trip with a listener on the configured
/// loopback redirect URI. `notify_authorization_url` sees the authorize URL
/// before the browser is launched.
pub async fn run_loopback_flow<S, F>(
    session: &AuthSession<S>,
    open_browser: bool,
    return_fragment: Option<&str>,
    notify_authorization_url: F,
) -> Result<CodeExchange, AuthError>
where
    S: CredentialStore + Send + Sync + 'static,
    F: Fn(&Url) -> Result<(), AuthError>,
{
    let redirect_uri = session.oauth().config().redirect_uri.clone();
    let host = redirect_uri
        .host_str()
        .ok_or_else(|| {
            AuthError::InvalidAuthorizationResponse("redirect URI has no host".into())
        })?
        .to_owned();
    let port = redirect_uri.port_or_known_default().unwrap_or(80);
    let listener = TcpListener::bind((host.as_str(), port)).await?;
    debug!("listening for the authorization redirect on {host}:{port}");

    let auth_url = session.begin_authorization(return_fragment).await?;
    notify_authorization_url(&auth_url)?;

    if open_browser {
        open::that(auth_url.as_str()).map_err(|err| AuthError::BrowserLaunch(err.to_string()))?;
    }

    let (tx, rx) = oneshot::channel();
    let callback_path = redirect_uri.path().to_owned();
    tokio::spawn(async move {
        let result = accept_authorization(listener, callback_path).await;
        let _ = tx.send(result);
    });

    let code = rx.await.map_err(|_| AuthError::ListenerClosed)??;
    session.exchange_code(&code).await
}

async fn accept_authorization(
    listener: TcpListener,
    callback_path: String,
) -> Result<String, AuthError> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        let mut buffer = [0u8; 4096];
        let n = match stream.read(&mut buffer).await {
            Ok(0) => {
                debug!("connection from {addr} closed without a request");
                continue;
            }
            Ok(n) => n,
            Err(err) => {
                debug!("failed to read from {addr}: {err}");
                continue;
            }
        };
        let request = String::from_utf8_lossy(&buffer[..n]);
        let target = match parse_request_target(&request) {
            Ok(target) => target,
            Err(err) => {
                debug!("ignoring connection from {addr}: {err}");
                continue;
            }
        };

        let path = target.split('?').next().unwrap_or_default();
        if path != callback_path {
            if let Err(err) = respond(&mut stream, 404, NOT_FOUND_HTML).await {
                debug!("failed to answer {path}: {err}");
            }
            continue;
        }

        let result = parse_callback_input(target);
        let (status, body) = match result {
            Ok(_) => (200, SUCCESS_HTML),
            Err(_) => (400, ERROR_HTML),
        };
        respond(&mut stream, status, body).await?;
        let _ = stream.shutdown().await;
        return result;
    }
}

fn parse_request_target(request: &str) -> Result<&str, AuthError> {
    let first_line = request
        .lines()
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing request line".into()))?;
    let mut parts = first_line.split_whitespace();
    let _method = parts
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing method".into()))?;
    parts
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing path".into()))
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) -> Result<(), AuthError> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let response = format!(
        "{status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
