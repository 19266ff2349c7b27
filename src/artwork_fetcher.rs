//! Downloads catalog artwork candidates.

use std::io::Read;
use std::time::Duration;

use log::debug;

const MAX_CANDIDATE_BYTES: u64 = 20 * 1024 * 1024;

/// Fetches image bytes for a catalog image URL.
pub trait ArtworkFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String>;
}

/// Plain HTTP fetcher with a fixed per-request timeout.
pub struct HttpArtworkFetcher {
    http_client: ureq::Agent,
    timeout: Duration,
}

impl HttpArtworkFetcher {
    pub fn new(timeout: Duration) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .build();
        Self {
            http_client,
            timeout,
        }
    }
}

impl ArtworkFetcher for HttpArtworkFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .http_client
            .get(url)
            .timeout(self.timeout)
            .call()
            .map_err(|err| match err {
                ureq::Error::Status(status, _) => format!("artwork download returned {status}"),
                ureq::Error::Transport(transport) => {
                    format!("artwork download failed: {transport}")
                }
            })?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_CANDIDATE_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|err| format!("artwork read failed: {err}"))?;
        debug!("Downloaded {} artwork bytes from {url}", bytes.len());
        Ok(bytes)
    }
}
