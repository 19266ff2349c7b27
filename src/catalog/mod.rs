//! Music-catalog adapter abstractions and match payloads.

use std::collections::BTreeSet;
use std::time::Duration;

pub mod spotify;

/// Candidate artist image offered by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogImage {
    pub width: u32,
    pub height: u32,
    pub url: String,
}

impl CatalogImage {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Best single catalog match for a searched artist name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogMatch {
    pub catalog_id: String,
    pub name: String,
    pub genres: BTreeSet<String>,
    pub images: Vec<CatalogImage>,
    pub popularity: u32,
}

/// Supplementary fields fetched for a known catalog id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogDetails {
    pub genres: BTreeSet<String>,
    pub images: Vec<CatalogImage>,
    pub popularity: u32,
}

impl CatalogMatch {
    /// Returns a match whose detail fields come from `details`.
    pub fn with_details(self, details: CatalogDetails) -> Self {
        Self {
            genres: details.genres,
            images: details.images,
            popularity: details.popularity,
            ..self
        }
    }

    /// Largest-area candidate; on equal area the earlier candidate wins.
    pub fn largest_image(&self) -> Option<&CatalogImage> {
        self.images.iter().fold(None, |best, image| match best {
            Some(current) if current.area() >= image.area() => Some(current),
            _ => Some(image),
        })
    }
}

/// Failures raised by catalog adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("catalog entry not found")]
    NotFound,

    #[error("catalog authentication failed: {0}")]
    Auth(String),

    #[error("catalog request failed ({status}): {summary}")]
    Http { status: u16, summary: String },

    #[error("catalog transport error: {0}")]
    Transport(String),

    #[error("catalog response parse failed: {0}")]
    Parse(String),
}

/// Interface implemented by concrete catalog adapters.
pub trait CatalogBackend: Send + Sync {
    /// Searches by artist name. `Ok(None)` when the search has no results.
    fn search_artist(&self, name: &str) -> Result<Option<CatalogMatch>, CatalogError>;
    fn artist_details(&self, catalog_id: &str) -> Result<CatalogDetails, CatalogError>;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{CatalogDetails, CatalogImage, CatalogMatch};

    fn image(width: u32, height: u32, url: &str) -> CatalogImage {
        CatalogImage {
            width,
            height,
            url: url.to_string(),
        }
    }

    fn sample_match(images: Vec<CatalogImage>) -> CatalogMatch {
        CatalogMatch {
            catalog_id: "cat-1".to_string(),
            name: "Alice".to_string(),
            genres: BTreeSet::from(["rock".to_string()]),
            images,
            popularity: 10,
        }
    }

    #[test]
    fn test_largest_image_selects_maximum_area() {
        let candidate = sample_match(vec![
            image(100, 100, "small"),
            image(300, 200, "wide"),
            image(250, 250, "square"),
        ]);
        let largest = candidate.largest_image().expect("largest image should exist");
        assert_eq!((largest.width, largest.height), (250, 250));
        assert_eq!(largest.url, "square");
    }

    #[test]
    fn test_largest_image_prefers_wide_when_its_area_is_largest() {
        let candidate = sample_match(vec![
            image(100, 100, "small"),
            image(300, 200, "wide"),
            image(240, 240, "square"),
        ]);
        let largest = candidate.largest_image().expect("largest image should exist");
        assert_eq!((largest.width, largest.height), (300, 200));
        assert_eq!(largest.url, "wide");
    }

    #[test]
    fn test_largest_image_keeps_first_on_tie() {
        let candidate = sample_match(vec![image(200, 300, "first"), image(300, 200, "second")]);
        assert_eq!(
            candidate.largest_image().map(|image| image.url.as_str()),
            Some("first")
        );
        assert!(sample_match(Vec::new()).largest_image().is_none());
    }

    #[test]
    fn test_with_details_replaces_detail_fields_and_keeps_identity() {
        let merged = sample_match(vec![image(64, 64, "thumb")]).with_details(CatalogDetails {
            genres: BTreeSet::from(["indie".to_string()]),
            images: vec![image(640, 640, "full")],
            popularity: 77,
        });
        assert_eq!(merged.catalog_id, "cat-1");
        assert_eq!(merged.name, "Alice");
        assert!(merged.genres.contains("indie"));
        assert_eq!(merged.images.len(), 1);
        assert_eq!(merged.popularity, 77);
    }
}
