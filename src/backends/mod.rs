//! Media-library adapter abstractions and concrete implementations.

use std::collections::BTreeSet;

pub mod plex;

/// Artist record as read from the media library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtistRecord {
    pub id: String,
    pub name: String,
    pub genres: BTreeSet<String>,
    /// Library-relative artwork reference, when the artist has one.
    pub artwork: Option<String>,
}

/// Album record belonging to one artist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumRecord {
    pub id: String,
    pub title: String,
    pub year: Option<i32>,
    pub genres: BTreeSet<String>,
    pub artwork: Option<String>,
}

/// Failures raised by library adapters.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("library request failed ({status}): {summary}")]
    Http { status: u16, summary: String },

    #[error("library transport error: {0}")]
    Transport(String),

    #[error("library response parse failed: {0}")]
    Parse(String),

    #[error("no music library section found")]
    NoMusicSection,
}

/// Interface implemented by concrete media-library adapters.
pub trait LibraryBackend: Send + Sync {
    fn list_artists(&self) -> Result<Vec<ArtistRecord>, LibraryError>;
    fn fetch_albums(&self, artist: &ArtistRecord) -> Result<Vec<AlbumRecord>, LibraryError>;
    fn set_genres(
        &self,
        artist: &ArtistRecord,
        genres: &BTreeSet<String>,
    ) -> Result<(), LibraryError>;
    /// Installs new artwork. `Ok(false)` means the library declined the upload.
    fn upload_artwork(&self, artist: &ArtistRecord, image: &[u8]) -> Result<bool, LibraryError>;
    /// Downloads the artist's current artwork. `Ok(None)` when it has none.
    fn artwork_bytes(&self, artist: &ArtistRecord) -> Result<Option<Vec<u8>>, LibraryError>;
    fn album_artwork_bytes(&self, album: &AlbumRecord) -> Result<Option<Vec<u8>>, LibraryError>;
    /// Re-reads the artist after a write.
    fn refresh(&self, artist: &ArtistRecord) -> Result<ArtistRecord, LibraryError>;
}

/// Truncates a response body for log and error output.
pub fn summarize_body(body: &str, max_chars: usize) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut summary: String = collapsed.chars().take(max_chars).collect();
    summary.push_str("...");
    summary
}

#[cfg(test)]
mod tests {
    use super::summarize_body;

    #[test]
    fn test_summarize_body_collapses_whitespace_and_truncates() {
        assert_eq!(summarize_body("  a \n b  ", 10), "a b");
        assert_eq!(summarize_body("abcdefghij", 4), "abcd...");
    }
}
