//! Plex Media Server library adapter implementation.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::backends::{summarize_body, AlbumRecord, ArtistRecord, LibraryBackend, LibraryError};
use crate::pacing::Sleeper;

const CLIENT_ID: &str = "artist-enricher";
const ARTIST_TYPE: &str = "8";
const PAGE_SIZE: usize = 300;
const MAX_ARTWORK_BYTES: u64 = 20 * 1024 * 1024;
const ERROR_SUMMARY_CHARS: usize = 200;

/// Connection settings for one Plex server.
#[derive(Debug, Clone)]
pub struct PlexProfile {
    pub base_url: String,
    pub token: String,
    /// Music section title to use; empty selects the first music section.
    pub library_section: String,
    pub request_timeout: Duration,
    /// Pause after a poster upload so the server can process the image.
    pub settle_delay: Duration,
    pub installed_artwork_timeout: Duration,
    pub artwork_download_timeout: Duration,
}

/// Plex adapter backed by `ureq`.
pub struct PlexAdapter {
    http_client: ureq::Agent,
    profile: PlexProfile,
    section_key: String,
    sleeper: Arc<dyn Sleeper>,
}

impl PlexAdapter {
    /// Connects to the server and resolves the music library section.
    pub fn connect(profile: PlexProfile, sleeper: Arc<dyn Sleeper>) -> Result<Self, LibraryError> {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(profile.request_timeout)
            .timeout_write(profile.request_timeout)
            .build();
        let mut adapter = Self {
            http_client,
            profile,
            section_key: String::new(),
            sleeper,
        };

        let identity = adapter.request_json("/identity", &[])?;
        let version = identity
            .get("MediaContainer")
            .and_then(|value| value.get("version"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(
            "Connected to Plex server at {} (version {version})",
            adapter.base_url()
        );

        adapter.section_key = adapter.resolve_music_section()?;
        Ok(adapter)
    }

    fn base_url(&self) -> &str {
        self.profile.base_url.trim().trim_end_matches('/')
    }

    fn request(&self, method: &str, path: &str, params: &[(String, String)]) -> ureq::Request {
        let mut url = format!("{}{}", self.base_url(), path);
        if !params.is_empty() {
            let query = params
                .iter()
                .map(|(key, value)| {
                    format!(
                        "{}={}",
                        urlencoding::encode(key),
                        urlencoding::encode(value)
                    )
                })
                .collect::<Vec<_>>()
                .join("&");
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }
        self.http_client
            .request(method, &url)
            .set("X-Plex-Token", &self.profile.token)
            .set("X-Plex-Client-Identifier", CLIENT_ID)
            .set("Accept", "application/json")
    }

    fn map_request_error(error: ureq::Error) -> LibraryError {
        match error {
            ureq::Error::Status(status, response) => {
                let body = response.into_string().unwrap_or_default();
                LibraryError::Http {
                    status,
                    summary: summarize_body(&body, ERROR_SUMMARY_CHARS),
                }
            }
            ureq::Error::Transport(transport) => LibraryError::Transport(transport.to_string()),
        }
    }

    fn request_json(&self, path: &str, params: &[(String, String)]) -> Result<Value, LibraryError> {
        let response = self
            .request("GET", path, params)
            .call()
            .map_err(Self::map_request_error)?;
        response
            .into_json::<Value>()
            .map_err(|err| LibraryError::Parse(format!("{path}: {err}")))
    }

    fn metadata_items(payload: &Value) -> Vec<&Value> {
        match payload
            .get("MediaContainer")
            .and_then(|value| value.get("Metadata"))
        {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(item @ Value::Object(_)) => vec![item],
            _ => Vec::new(),
        }
    }

    fn parse_genres(item: &Value) -> BTreeSet<String> {
        match item.get("Genre") {
            Some(Value::Array(tags)) => tags
                .iter()
                .filter_map(|tag| tag.get("tag").and_then(Value::as_str))
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    fn string_field(item: &Value, key: &str) -> Option<String> {
        let value = match item.get(key)? {
            Value::String(value) => value.clone(),
            Value::Number(number) => number.to_string(),
            _ => return None,
        };
        (!value.trim().is_empty()).then_some(value)
    }

    fn parse_artist(item: &Value) -> Option<ArtistRecord> {
        Some(ArtistRecord {
            id: Self::string_field(item, "ratingKey")?,
            name: Self::string_field(item, "title").unwrap_or_else(|| "Unknown Artist".to_string()),
            genres: Self::parse_genres(item),
            artwork: Self::string_field(item, "thumb"),
        })
    }

    fn parse_album(item: &Value) -> Option<AlbumRecord> {
        let year = item.get("year").and_then(|value| {
            value
                .as_i64()
                .and_then(|number| i32::try_from(number).ok())
                .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
        });
        Some(AlbumRecord {
            id: Self::string_field(item, "ratingKey")?,
            title: Self::string_field(item, "title").unwrap_or_else(|| "Unknown Album".to_string()),
            year,
            genres: Self::parse_genres(item),
            artwork: Self::string_field(item, "thumb"),
        })
    }

    fn resolve_music_section(&self) -> Result<String, LibraryError> {
        let payload = self.request_json("/library/sections", &[])?;
        let directories = match payload
            .get("MediaContainer")
            .and_then(|value| value.get("Directory"))
        {
            Some(Value::Array(items)) => items.iter().collect::<Vec<_>>(),
            Some(item @ Value::Object(_)) => vec![item],
            _ => Vec::new(),
        };
        let wanted = self.profile.library_section.trim();
        directories
            .into_iter()
            .filter(|directory| directory.get("type").and_then(Value::as_str) == Some("artist"))
            .find(|directory| {
                wanted.is_empty()
                    || directory
                        .get("title")
                        .and_then(Value::as_str)
                        .is_some_and(|title| title.eq_ignore_ascii_case(wanted))
            })
            .and_then(|directory| Self::string_field(directory, "key"))
            .ok_or(LibraryError::NoMusicSection)
    }

    fn download(&self, path: &str, timeout: Duration) -> Result<Option<Vec<u8>>, LibraryError> {
        let response = match self.request("GET", path, &[]).timeout(timeout).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(error) => return Err(Self::map_request_error(error)),
        };
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_ARTWORK_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|err| LibraryError::Transport(format!("artwork read failed: {err}")))?;
        Ok(Some(bytes))
    }

    fn image_content_type(image: &[u8]) -> &'static str {
        match image::guess_format(image) {
            Ok(image::ImageFormat::Png) => "image/png",
            _ => "image/jpeg",
        }
    }

    /// Single-part `multipart/form-data` body carrying the image as `file`.
    fn multipart_body(boundary: &str, image: &[u8], content_type: &str) -> Vec<u8> {
        let filename = if content_type == "image/png" {
            "poster.png"
        } else {
            "poster.jpg"
        };
        let mut body = Vec::with_capacity(image.len() + 256);
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(image);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    }
}

impl LibraryBackend for PlexAdapter {
    fn list_artists(&self) -> Result<Vec<ArtistRecord>, LibraryError> {
        let path = format!("/library/sections/{}/all", self.section_key);
        let mut offset = 0usize;
        let mut artists = Vec::new();
        loop {
            let payload = self.request_json(
                &path,
                &[
                    ("type".to_string(), ARTIST_TYPE.to_string()),
                    ("X-Plex-Container-Start".to_string(), offset.to_string()),
                    ("X-Plex-Container-Size".to_string(), PAGE_SIZE.to_string()),
                ],
            )?;
            let page = Self::metadata_items(&payload);
            let page_len = page.len();
            artists.extend(page.into_iter().filter_map(Self::parse_artist));
            offset = offset.saturating_add(page_len);
            if page_len < PAGE_SIZE {
                break;
            }
        }
        debug!("Plex section {} listed {} artists", self.section_key, artists.len());
        Ok(artists)
    }

    fn fetch_albums(&self, artist: &ArtistRecord) -> Result<Vec<AlbumRecord>, LibraryError> {
        let payload =
            self.request_json(&format!("/library/metadata/{}/children", artist.id), &[])?;
        Ok(Self::metadata_items(&payload)
            .into_iter()
            .filter_map(Self::parse_album)
            .collect())
    }

    fn set_genres(
        &self,
        artist: &ArtistRecord,
        genres: &BTreeSet<String>,
    ) -> Result<(), LibraryError> {
        let mut params = vec![
            ("type".to_string(), ARTIST_TYPE.to_string()),
            ("id".to_string(), artist.id.clone()),
        ];
        for (index, genre) in genres.iter().enumerate() {
            params.push((format!("genre[{index}].tag.tag"), genre.clone()));
        }
        params.push(("genre.locked".to_string(), "1".to_string()));

        self.request(
            "PUT",
            &format!("/library/sections/{}/all", self.section_key),
            &params,
        )
        .call()
        .map_err(Self::map_request_error)?;
        Ok(())
    }

    /// Posts the raw image, falling back to a multipart upload when the
    /// server refuses the raw body.
    fn upload_artwork(&self, artist: &ArtistRecord, image: &[u8]) -> Result<bool, LibraryError> {
        let path = format!("/library/metadata/{}/posters", artist.id);
        let content_type = Self::image_content_type(image);
        let response = match self
            .request("POST", &path, &[])
            .set("Content-Type", content_type)
            .send_bytes(image)
        {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    "Direct poster upload failed for {}, trying multipart: {}",
                    artist.name,
                    Self::map_request_error(error)
                );
                let boundary = format!("artist-enricher-{}", Uuid::new_v4().simple());
                self.request("POST", &path, &[])
                    .set(
                        "Content-Type",
                        &format!("multipart/form-data; boundary={boundary}"),
                    )
                    .send_bytes(&Self::multipart_body(&boundary, image, content_type))
                    .map_err(Self::map_request_error)?
            }
        };
        debug!(
            "Plex poster upload for {} returned status {}",
            artist.name,
            response.status()
        );
        self.sleeper.sleep(self.profile.settle_delay);
        Ok((200..300).contains(&response.status()))
    }

    fn artwork_bytes(&self, artist: &ArtistRecord) -> Result<Option<Vec<u8>>, LibraryError> {
        let Some(thumb) = artist.artwork.as_deref() else {
            return Ok(None);
        };
        self.download(thumb, self.profile.installed_artwork_timeout)
    }

    fn album_artwork_bytes(&self, album: &AlbumRecord) -> Result<Option<Vec<u8>>, LibraryError> {
        let Some(thumb) = album.artwork.as_deref() else {
            return Ok(None);
        };
        self.download(thumb, self.profile.artwork_download_timeout)
    }

    fn refresh(&self, artist: &ArtistRecord) -> Result<ArtistRecord, LibraryError> {
        let payload = self.request_json(&format!("/library/metadata/{}", artist.id), &[])?;
        Self::metadata_items(&payload)
            .into_iter()
            .find_map(Self::parse_artist)
            .ok_or_else(|| LibraryError::Parse(format!("artist {} missing on reload", artist.id)))
    }
}
