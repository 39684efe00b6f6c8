use std::env;

/// Ways the CLI can complete authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlow {
    /// Loopback listener on the redirect URI, browser opened automatically.
    Browser,
    /// Print the URL, user pastes the redirect URL or code back.
    Manual,
}

/// Helper responsible for inferring which flow to start with.
#[derive(Debug)]
pub struct FlowPreference {
    preferred: AuthFlow,
    browser_available: bool,
}

impl FlowPreference {
    /// Detect the preferred flow based on environment variables and display availability.
    pub fn detect() -> Self {
        Self::from_lookup(
            |key| env::var(key).ok(),
            cfg!(any(target_os = "windows", target_os = "macos")),
        )
    }

    fn from_lookup<F>(lookup: F, desktop_os: bool) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(flow) =
            lookup("SPOTIFY_AUTH_FLOW").and_then(|value| value.parse::<AuthFlow>().ok())
        {
            return Self {
                preferred: flow,
                browser_available: matches!(flow, AuthFlow::Browser),
            };
        }

        let browser_available = browser_available(&lookup, desktop_os);
        let preferred = if browser_available {
            AuthFlow::Browser
        } else {
            AuthFlow::Manual
        };
        Self {
            preferred,
            browser_available,
        }
    }

    /// Preferred flow to offer to the user.
    pub fn preferred(&self) -> AuthFlow {
        self.preferred
    }

    /// Whether we should attempt to spawn the system browser automatically.
    pub fn browser_available(&self) -> bool {
        self.browser_available
    }
}

fn browser_available<F>(lookup: &F, desktop_os: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    if lookup("SPOTIFY_NO_BROWSER").is_some() {
        return false;
    }

    let display = lookup("DISPLAY").is_some() || lookup("WAYLAND_DISPLAY").is_some();
    if lookup("SSH_CONNECTION").is_some() && !display {
        return false;
    }

    display || desktop_os
}

impl std::str::FromStr for AuthFlow {
    type Err = InvalidFlow;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "browser" | "loopback" => Ok(AuthFlow::Browser),
            "manual" | "code" | "paste" => Ok(AuthFlow::Manual),
            other => Err(InvalidFlow(other.to_owned())),
        }
    }
}

impl std::fmt::Display for AuthFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            AuthFlow::Browser => "browser",
            AuthFlow::Manual => "manual",
        };
        write!(f, "{value}")
    }
}

/// Error reported when parsing an unsupported flow.
#[derive(Debug, thiserror::Error)]
#[error("invalid auth flow '{0}'")]
pub struct InvalidFlow(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn detect(vars: &[(&str, &str)], desktop_os: bool) -> FlowPreference {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FlowPreference::from_lookup(|key| vars.get(key).cloned(), desktop_os)
    }

    #[test]
    fn parse_flow_variants() {
        assert_eq!("browser".parse::<AuthFlow>().unwrap(), AuthFlow::Browser);
        assert_eq!("Manual".parse::<AuthFlow>().unwrap(), AuthFlow::Manual);
        assert_eq!("paste".parse::<AuthFlow>().unwrap(), AuthFlow::Manual);
    }

    #[test]
    fn invalid_flow() {
        let err = "device".parse::<AuthFlow>().unwrap_err();
        assert_eq!(err.0, "device");
    }

    #[test]
    fn explicit_flow_wins() {
        let pref = detect(&[("SPOTIFY_AUTH_FLOW", "manual"), ("DISPLAY", ":0")], true);
        assert_eq!(pref.preferred(), AuthFlow::Manual);
        assert!(!pref.browser_available());
    }

    #[test]
    fn headless_ssh_falls_back_to_manual() {
        let pref = detect(&[("SSH_CONNECTION", "10.0.0.1 22 10.0.0.2 50000")], false);
        assert_eq!(pref.preferred(), AuthFlow::Manual);
    }

    #[test]
    fn display_enables_browser() {
        let pref = detect(&[("WAYLAND_DISPLAY", "wayland-0")], false);
        assert_eq!(pref.preferred(), AuthFlow::Browser);
        let pref = detect(&[("DISPLAY", ":0"), ("SPOTIFY_NO_BROWSER", "1")], false);
        assert_eq!(pref.preferred(), AuthFlow::Manual);
    }
}
