//! Spotify PKCE session handling and authenticated Web API access shared by front-ends.

pub mod api;
pub mod auth;
pub mod config;
