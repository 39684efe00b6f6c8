use url::Url;

use super::AuthError;

/// Extract the authorization code from whatever the redirect handed back:
/// a full callback URL, a bare request target (`/callback?code=...`), or
/// the raw code pasted by the user.
pub fn parse_callback_input(input: &str) -> Result<String, AuthError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AuthError::InvalidAuthorizationResponse(
            "empty input".into(),
        ));
    }

    if let Ok(url) = Url::parse(input) {
        return code_from_url(&url);
    }

    if input.starts_with('/') || input.starts_with('?') {
        let url = Url::parse(&format!("http://localhost{}", with_leading_slash(input)))?;
        return code_from_url(&url);
    }

    Ok(input.to_owned())
}

/// Read `?code=` or `?error=` from a callback URL.
pub fn code_from_url(url: &Url) -> Result<String, AuthError> {
    let mut code: Option<String> = None;
    let mut error: Option<String> = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(err) = error {
        return Err(AuthError::AccessDenied(err));
    }
    code.filter(|code| !code.is_empty())
        .ok_or(AuthError::MissingAuthorizationCode)
}

fn with_leading_slash(target: &str) -> String {
    if target.starts_with('/') {
        target.to_owned()
    } else {
        format!("/{target}")
    }
}
