//! Spotify Web API catalog adapter implementation.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info, warn};
use serde_json::Value;

use crate::backends::summarize_body;
use crate::catalog::{CatalogBackend, CatalogDetails, CatalogError, CatalogImage, CatalogMatch};

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE_URL: &str = "https://api.spotify.com/v1";
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);
const ERROR_SUMMARY_CHARS: usize = 160;

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Spotify adapter using the client-credentials flow.
pub struct SpotifyAdapter {
    http_client: ureq::Agent,
    token_url: String,
    api_base_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<AccessToken>>,
    /// Serializes token requests; `token` is never held across one.
    refresh_gate: Mutex<()>,
}

impl SpotifyAdapter {
    /// Creates the adapter and fetches an initial access token.
    pub fn connect(
        client_id: &str,
        client_secret: &str,
        request_timeout: Duration,
    ) -> Result<Self, CatalogError> {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(request_timeout)
            .timeout_write(request_timeout)
            .build();
        let adapter = Self::with_endpoints(
            http_client,
            TOKEN_URL,
            API_BASE_URL,
            client_id,
            client_secret,
        );
        adapter.access_token()?;
        info!("Spotify client initialized");
        Ok(adapter)
    }

    fn with_endpoints(
        http_client: ureq::Agent,
        token_url: &str,
        api_base_url: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        Self {
            http_client,
            token_url: token_url.to_string(),
            api_base_url: api_base_url.to_string(),
            client_id: client_id.trim().to_string(),
            client_secret: client_secret.trim().to_string(),
            token: Mutex::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    fn basic_auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.client_id, self.client_secret);
        format!("Basic {}", STANDARD.encode(credentials))
    }

    fn request_token(&self) -> Result<AccessToken, CatalogError> {
        let response = self
            .http_client
            .post(&self.token_url)
            .set("Authorization", &self.basic_auth_header())
            .send_form(&[("grant_type", "client_credentials")])
            .map_err(|error| match Self::map_request_error(error) {
                CatalogError::Http { status, summary } => {
                    CatalogError::Auth(format!("token request failed ({status}): {summary}"))
                }
                other => other,
            })?;
        let payload: Value = response
            .into_json()
            .map_err(|err| CatalogError::Parse(format!("token response: {err}")))?;
        let value = payload
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| CatalogError::Auth("token response missing access_token".to_string()))?
            .to_string();
        let expires_in = payload
            .get("expires_in")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3600));
        Ok(AccessToken {
            value,
            expires_at: Instant::now() + expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN),
        })
    }

    fn cached_token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|token| Instant::now() < token.expires_at)
            .map(|token| token.value.clone())
    }

    fn access_token(&self) -> Result<String, CatalogError> {
        if let Some(value) = self.cached_token() {
            return Ok(value);
        }
        let _gate = self
            .refresh_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Another worker may have refreshed while this one waited.
        if let Some(value) = self.cached_token() {
            return Ok(value);
        }
        debug!("Requesting Spotify access token");
        let token = self.request_token()?;
        let value = token.value.clone();
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Ok(value)
    }

    /// Drops the cached token if it is still the one that was rejected.
    fn invalidate_token(&self, rejected: &str) {
        let mut cached = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if cached.as_ref().is_some_and(|token| token.value == rejected) {
            *cached = None;
        }
    }

    fn parse_retry_after(value: Option<&str>) -> Duration {
        value
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER)
    }

    fn map_request_error(error: ureq::Error) -> CatalogError {
        match error {
            ureq::Error::Status(429, response) => CatalogError::RateLimited {
                retry_after: Self::parse_retry_after(response.header("Retry-After")),
            },
            ureq::Error::Status(404, _) => CatalogError::NotFound,
            ureq::Error::Status(401, response) => CatalogError::Auth(summarize_body(
                &response.into_string().unwrap_or_default(),
                ERROR_SUMMARY_CHARS,
            )),
            ureq::Error::Status(status, response) => CatalogError::Http {
                status,
                summary: summarize_body(
                    &response.into_string().unwrap_or_default(),
                    ERROR_SUMMARY_CHARS,
                ),
            },
            ureq::Error::Transport(transport) => CatalogError::Transport(transport.to_string()),
        }
    }

    /// Authorized GET. A rejected token is refreshed and the call retried once.
    fn get_json(&self, url: &str) -> Result<Value, CatalogError> {
        let mut retried = false;
        loop {
            let token = self.access_token()?;
            let result = self
                .http_client
                .get(url)
                .set("Authorization", &format!("Bearer {token}"))
                .set("Accept", "application/json")
                .call();
            let error = match result {
                Ok(response) => {
                    return response
                        .into_json::<Value>()
                        .map_err(|err| CatalogError::Parse(err.to_string()))
                }
                Err(error) => Self::map_request_error(error),
            };
            if !matches!(error, CatalogError::Auth(_)) {
                return Err(error);
            }
            self.invalidate_token(&token);
            if retried {
                return Err(error);
            }
            warn!("Spotify rejected the access token; refreshing and retrying");
            retried = true;
        }
    }

    fn parse_images(item: &Value) -> Vec<CatalogImage> {
        let Some(Value::Array(images)) = item.get("images") else {
            return Vec::new();
        };
        images
            .iter()
            .filter_map(|image| {
                let url = image.get("url").and_then(Value::as_str)?.to_string();
                let dimension = |key: &str| {
                    image
                        .get(key)
                        .and_then(Value::as_u64)
                        .and_then(|value| u32::try_from(value).ok())
                        .unwrap_or(0)
                };
                Some(CatalogImage {
                    width: dimension("width"),
                    height: dimension("height"),
                    url,
                })
            })
            .collect()
    }

    fn parse_details(item: &Value) -> CatalogDetails {
        let genres = match item.get("genres") {
            Some(Value::Array(genres)) => genres
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|genre| !genre.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
            _ => Default::default(),
        };
        let popularity = item
            .get("popularity")
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(0);
        CatalogDetails {
            genres,
            images: Self::parse_images(item),
            popularity,
        }
    }

    fn parse_search_payload(payload: &Value) -> Result<Option<CatalogMatch>, CatalogError> {
        let items = payload
            .get("artists")
            .and_then(|value| value.get("items"))
            .and_then(Value::as_array)
            .ok_or_else(|| CatalogError::Parse("search response missing artists.items".into()))?;
        let Some(item) = items.first() else {
            return Ok(None);
        };
        let catalog_id = item
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CatalogError::Parse("search result missing id".to_string()))?
            .to_string();
        let name = item
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let details = Self::parse_details(item);
        Ok(Some(CatalogMatch {
            catalog_id,
            name,
            genres: details.genres,
            images: details.images,
            popularity: details.popularity,
        }))
    }
}

impl CatalogBackend for SpotifyAdapter {
    fn search_artist(&self, name: &str) -> Result<Option<CatalogMatch>, CatalogError> {
        let url = format!(
            "{}/search?q={}&type=artist&limit=1",
            self.api_base_url,
            urlencoding::encode(name)
        );
        let payload = self.get_json(&url)?;
        Self::parse_search_payload(&payload)
    }

    fn artist_details(&self, catalog_id: &str) -> Result<CatalogDetails, CatalogError> {
        let url = format!(
            "{}/artists/{}",
            self.api_base_url,
            urlencoding::encode(catalog_id)
        );
        let payload = self.get_json(&url)?;
        Ok(Self::parse_details(&payload))
    }
}
