//! In-memory collaborators for unit and scenario tests.

use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::artwork_fetcher::ArtworkFetcher;
use crate::backends::{AlbumRecord, ArtistRecord, LibraryBackend, LibraryError};
use crate::catalog::{CatalogBackend, CatalogDetails, CatalogError, CatalogMatch};
use crate::pacing::Sleeper;

/// Pseudo-random pixels so encoded files are not trivially compressible.
pub fn noisy_image(width: u32, height: u32) -> DynamicImage {
    let mut state: u32 = width.wrapping_mul(31).wrapping_add(height);
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |_, _| {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        let [r, g, b, _] = state.to_le_bytes();
        Rgb([r, g, b])
    }))
}

pub fn encoded_image(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, format)
        .expect("test image should encode");
    cursor.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encoded_image(&noisy_image(width, height), ImageFormat::Png)
}

pub fn artist(id: &str, name: &str, genres: &[&str], artwork: Option<&str>) -> ArtistRecord {
    ArtistRecord {
        id: id.to_string(),
        name: name.to_string(),
        genres: genres.iter().map(|genre| genre.to_string()).collect(),
        artwork: artwork.map(ToOwned::to_owned),
    }
}

pub fn genre_set(genres: &[&str]) -> BTreeSet<String> {
    genres.iter().map(|genre| genre.to_string()).collect()
}

#[derive(Default)]
struct LibraryState {
    artists: Vec<ArtistRecord>,
    albums: HashMap<String, Vec<AlbumRecord>>,
    artwork: HashMap<String, Vec<u8>>,
    album_artwork: HashMap<String, Vec<u8>>,
    genre_writes: Vec<(String, BTreeSet<String>)>,
    uploads: Vec<(String, Vec<u8>)>,
    panic_on_albums: BTreeSet<String>,
    reject_uploads: bool,
    list_fails: bool,
    genre_writes_fail: bool,
    genre_writes_ignored: bool,
}

/// Library whose artists, albums and artwork live in memory.
#[derive(Default)]
pub struct FakeLibrary {
    state: Mutex<LibraryState>,
}

impl FakeLibrary {
    fn state(&self) -> MutexGuard<'_, LibraryState> {
        self.state.lock().expect("fake library lock")
    }

    pub fn with_artists(artists: Vec<ArtistRecord>) -> Self {
        let library = Self::default();
        library.state().artists = artists;
        library
    }

    pub fn set_artwork(&self, artist_id: &str, bytes: Vec<u8>) {
        self.state().artwork.insert(artist_id.to_string(), bytes);
    }

    pub fn add_album(&self, artist_id: &str, album: AlbumRecord, artwork: Option<Vec<u8>>) {
        let mut state = self.state();
        if let Some(bytes) = artwork {
            state.album_artwork.insert(album.id.clone(), bytes);
        }
        state
            .albums
            .entry(artist_id.to_string())
            .or_default()
            .push(album);
    }

    pub fn panic_on_albums_for(&self, artist_id: &str) {
        self.state().panic_on_albums.insert(artist_id.to_string());
    }

    pub fn reject_uploads(&self) {
        self.state().reject_uploads = true;
    }

    pub fn fail_listing(&self) {
        self.state().list_fails = true;
    }

    /// Every genre edit returns an HTTP error.
    pub fn fail_genre_writes(&self) {
        self.state().genre_writes_fail = true;
    }

    /// Genre edits are accepted but never show up on refresh.
    pub fn ignore_genre_writes(&self) {
        self.state().genre_writes_ignored = true;
    }

    pub fn genre_writes(&self) -> Vec<(String, BTreeSet<String>)> {
        self.state().genre_writes.clone()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.state().uploads.clone()
    }

    pub fn stored_artist(&self, artist_id: &str) -> Option<ArtistRecord> {
        self.state()
            .artists
            .iter()
            .find(|artist| artist.id == artist_id)
            .cloned()
    }
}

impl LibraryBackend for FakeLibrary {
    fn list_artists(&self) -> Result<Vec<ArtistRecord>, LibraryError> {
        let state = self.state();
        if state.list_fails {
            return Err(LibraryError::Transport("connection refused".to_string()));
        }
        Ok(state.artists.clone())
    }

    fn fetch_albums(&self, artist: &ArtistRecord) -> Result<Vec<AlbumRecord>, LibraryError> {
        let (should_panic, albums) = {
            let state = self.state();
            (
                state.panic_on_albums.contains(&artist.id),
                state.albums.get(&artist.id).cloned().unwrap_or_default(),
            )
        };
        if should_panic {
            panic!("album listing exploded for {}", artist.id);
        }
        Ok(albums)
    }

    fn set_genres(
        &self,
        artist: &ArtistRecord,
        genres: &BTreeSet<String>,
    ) -> Result<(), LibraryError> {
        let mut state = self.state();
        state.genre_writes.push((artist.id.clone(), genres.clone()));
        if state.genre_writes_fail {
            return Err(LibraryError::Http {
                status: 500,
                summary: "genre edit refused".to_string(),
            });
        }
        if state.genre_writes_ignored {
            return Ok(());
        }
        if let Some(stored) = state.artists.iter_mut().find(|stored| stored.id == artist.id) {
            stored.genres = genres.clone();
        }
        Ok(())
    }

    fn upload_artwork(&self, artist: &ArtistRecord, image: &[u8]) -> Result<bool, LibraryError> {
        let mut state = self.state();
        state.uploads.push((artist.id.clone(), image.to_vec()));
        if state.reject_uploads {
            return Ok(false);
        }
        state.artwork.insert(artist.id.clone(), image.to_vec());
        let reference = format!("/library/metadata/{}/thumb/1", artist.id);
        if let Some(stored) = state.artists.iter_mut().find(|stored| stored.id == artist.id) {
            stored.artwork = Some(reference);
        }
        Ok(true)
    }

    fn artwork_bytes(&self, artist: &ArtistRecord) -> Result<Option<Vec<u8>>, LibraryError> {
        if artist.artwork.is_none() {
            return Ok(None);
        }
        Ok(self.state().artwork.get(&artist.id).cloned())
    }

    fn album_artwork_bytes(&self, album: &AlbumRecord) -> Result<Option<Vec<u8>>, LibraryError> {
        Ok(self.state().album_artwork.get(&album.id).cloned())
    }

    fn refresh(&self, artist: &ArtistRecord) -> Result<ArtistRecord, LibraryError> {
        self.stored_artist(&artist.id)
            .ok_or_else(|| LibraryError::Parse(format!("artist {} missing", artist.id)))
    }
}

/// Catalog keyed by artist name, counting every backend call.
#[derive(Default)]
pub struct FakeCatalog {
    matches: Mutex<HashMap<String, CatalogMatch>>,
    details: Mutex<HashMap<String, CatalogDetails>>,
    calls: AtomicUsize,
}

impl FakeCatalog {
    pub fn add_match(&self, name: &str, found: CatalogMatch) {
        self.matches
            .lock()
            .expect("fake catalog lock")
            .insert(name.to_string(), found);
    }

    pub fn add_details(&self, catalog_id: &str, details: CatalogDetails) {
        self.details
            .lock()
            .expect("fake catalog lock")
            .insert(catalog_id.to_string(), details);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CatalogBackend for FakeCatalog {
    fn search_artist(&self, name: &str) -> Result<Option<CatalogMatch>, CatalogError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .matches
            .lock()
            .expect("fake catalog lock")
            .get(name)
            .cloned())
    }

    fn artist_details(&self, catalog_id: &str) -> Result<CatalogDetails, CatalogError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.details
            .lock()
            .expect("fake catalog lock")
            .get(catalog_id)
            .cloned()
            .ok_or(CatalogError::NotFound)
    }
}

/// Serves canned bytes per URL.
#[derive(Default)]
pub struct FakeArtworkFetcher {
    images: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl FakeArtworkFetcher {
    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.images
            .lock()
            .expect("fake fetcher lock")
            .insert(url.to_string(), bytes);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("fake fetcher lock").clone()
    }
}

impl ArtworkFetcher for FakeArtworkFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        self.requests
            .lock()
            .expect("fake fetcher lock")
            .push(url.to_string());
        self.images
            .lock()
            .expect("fake fetcher lock")
            .get(url)
            .cloned()
            .ok_or_else(|| format!("no image at {url}"))
    }
}

/// Records every requested sleep without blocking.
#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleeper lock").clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("sleeper lock").push(duration);
    }
}

/// One request seen by `scripted_server`.
pub struct CapturedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Local HTTP server answering one connection per scripted `(status, body)`
/// pair. Joining the handle returns the captured requests in order.
pub fn scripted_server(
    responses: Vec<(u16, &'static str)>,
) -> (String, JoinHandle<Vec<CapturedRequest>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let base_url = format!("http://{}", listener.local_addr().expect("local addr"));
    let handle = thread::spawn(move || {
        let mut captured = Vec::new();
        for (status, body) in responses {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream);
            let mut request_line = String::new();
            reader.read_line(&mut request_line).expect("request line");
            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("header line");
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    headers.push((name.trim().to_string(), value.trim().to_string()));
                }
            }
            let request = CapturedRequest {
                request_line: request_line.trim_end().to_string(),
                headers,
                body: Vec::new(),
            };
            let content_length = request
                .header("content-length")
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(0);
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).expect("request body");
            let mut stream = reader.into_inner();
            write!(
                stream,
                "HTTP/1.1 {status} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .expect("write response");
            captured.push(CapturedRequest {
                body: request_body,
                ..request
            });
        }
        captured
    });
    (base_url, handle)
}
