mod client;

pub use client::{
    Album, ApiError, ApiResult, Artist, CurrentlyPlaying, InvalidRepeatMode, Page, Playlist,
    PlaylistItem, PlaylistOwner, PlaylistTracks, RepeatMode, SpotifyApi, Track, User,
};
