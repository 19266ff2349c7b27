//! Per-artist reconciliation: decide what changes, apply them, and report
//! a terminal outcome.
//!
//! Genres are only ever merged (existing ∪ catalog ∪ album genres), so a
//! write never removes a tag the library already had. Artwork is replaced
//! only when the installed artwork fails verification, trying the catalog's
//! largest image first and then album artwork from newest to oldest.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::artwork_fetcher::ArtworkFetcher;
use crate::backends::{AlbumRecord, ArtistRecord, LibraryBackend, LibraryError};
use crate::catalog::CatalogMatch;
use crate::catalog_matcher::{CatalogMatcher, MatchOutcome};
use crate::image_pipeline::{ArtworkRejection, ArtworkValidator};
use crate::logging::RunScope;

pub const NOT_FOUND_MESSAGE: &str = "Not found in catalog";
pub const PARTIAL_FAILURE_MESSAGE: &str = "Needed updates could not be applied";
const PLACEHOLDER_GENRE: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyDone,
    NoActionNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Success,
    PartialFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    Error(String),
}

/// Terminal state of one artist within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtistOutcome {
    Skipped(SkipReason),
    Updated(UpdateResult),
    Failed(FailureKind),
}

impl ArtistOutcome {
    /// Value stored in the ledger's success flag.
    pub fn success(&self) -> bool {
        matches!(
            self,
            Self::Skipped(_) | Self::Updated(UpdateResult::Success)
        )
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Skipped(_) | Self::Updated(UpdateResult::Success) => None,
            Self::Updated(UpdateResult::PartialFailure) => Some(PARTIAL_FAILURE_MESSAGE.to_string()),
            Self::Failed(FailureKind::NotFound) => Some(NOT_FOUND_MESSAGE.to_string()),
            Self::Failed(FailureKind::Error(reason)) => Some(reason.clone()),
        }
    }
}

/// What a reconciliation pass decided for one artist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationDecision {
    pub combined_genres: BTreeSet<String>,
    pub genre_change_needed: bool,
    pub artwork_change_needed: bool,
    pub success: bool,
}

impl ReconciliationDecision {
    pub fn evaluate<'a>(
        existing: &BTreeSet<String>,
        catalog_genres: &BTreeSet<String>,
        album_genres: impl IntoIterator<Item = &'a BTreeSet<String>>,
        artwork_valid: bool,
    ) -> Self {
        let mut combined_genres = existing.clone();
        combined_genres.extend(catalog_genres.iter().cloned());
        for genres in album_genres {
            combined_genres.extend(genres.iter().cloned());
        }
        let genre_change_needed = (existing.is_empty() && !combined_genres.is_empty())
            || combined_genres != *existing;
        Self {
            combined_genres,
            genre_change_needed,
            artwork_change_needed: !artwork_valid,
            success: false,
        }
    }

    pub fn changes_needed(&self) -> bool {
        self.genre_change_needed || self.artwork_change_needed
    }

    /// Settles the final outcome given whether any needed change landed.
    pub fn conclude(&mut self, changes_made: bool) -> ArtistOutcome {
        let outcome = if !self.changes_needed() {
            ArtistOutcome::Skipped(SkipReason::NoActionNeeded)
        } else if changes_made {
            ArtistOutcome::Updated(UpdateResult::Success)
        } else {
            ArtistOutcome::Updated(UpdateResult::PartialFailure)
        };
        self.success = outcome.success();
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcilePolicy {
    /// Skip the catalog for artists that already have genres and valid artwork.
    pub skip_complete_artists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub outcome: ArtistOutcome,
    pub catalog_id: Option<String>,
    pub decision: Option<ReconciliationDecision>,
}

impl ReconcileReport {
    fn without_match(outcome: ArtistOutcome) -> Self {
        Self {
            outcome,
            catalog_id: None,
            decision: None,
        }
    }
}

/// Failures inside a single reconciliation step.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error("artwork rejected: {0}")]
    Artwork(#[from] ArtworkRejection),

    #[error("artwork download failed: {0}")]
    Download(String),
}

pub struct Reconciler {
    library: Arc<dyn LibraryBackend>,
    matcher: Arc<CatalogMatcher>,
    validator: Arc<ArtworkValidator>,
    fetcher: Arc<dyn ArtworkFetcher>,
    policy: ReconcilePolicy,
    scope: RunScope,
}

impl Reconciler {
    pub fn new(
        library: Arc<dyn LibraryBackend>,
        matcher: Arc<CatalogMatcher>,
        validator: Arc<ArtworkValidator>,
        fetcher: Arc<dyn ArtworkFetcher>,
        policy: ReconcilePolicy,
        scope: RunScope,
    ) -> Self {
        Self {
            library,
            matcher,
            validator,
            fetcher,
            policy,
            scope,
        }
    }

    pub fn reconcile(&self, artist: &ArtistRecord) -> ReconcileReport {
        info!("[{}] Reconciling artist: {}", self.scope, artist.name);
        let artwork_valid = self
            .validator
            .verify_installed(self.library.as_ref(), artist);

        if self.policy.skip_complete_artists && !artist.genres.is_empty() && artwork_valid {
            info!(
                "[{}] {} already has genres and artwork, skipping",
                self.scope, artist.name
            );
            return ReconcileReport::without_match(ArtistOutcome::Skipped(
                SkipReason::NoActionNeeded,
            ));
        }

        let found = match self.matcher.search_artist(&artist.name) {
            MatchOutcome::Found(found) => found,
            MatchOutcome::NotFound => {
                return ReconcileReport::without_match(ArtistOutcome::Failed(FailureKind::NotFound))
            }
            MatchOutcome::RateLimited { retry_after } => {
                return ReconcileReport::without_match(ArtistOutcome::Failed(FailureKind::Error(
                    format!("Catalog still rate limited (retry after {retry_after:?})"),
                )))
            }
            MatchOutcome::Failed(reason) => {
                return ReconcileReport::without_match(ArtistOutcome::Failed(FailureKind::Error(
                    reason,
                )))
            }
        };
        let found = self.fold_details(found);

        let albums = match self.library.fetch_albums(artist) {
            Ok(albums) => albums,
            Err(err) => {
                warn!(
                    "[{}] Could not list albums for {}: {}",
                    self.scope, artist.name, err
                );
                Vec::new()
            }
        };

        let mut decision = ReconciliationDecision::evaluate(
            &artist.genres,
            &found.genres,
            albums.iter().map(|album| &album.genres),
            artwork_valid,
        );
        debug!(
            "[{}] {}: existing genres {:?}, combined {:?}",
            self.scope, artist.name, artist.genres, decision.combined_genres
        );

        let mut changes_made = false;
        if decision.genre_change_needed {
            match self.apply_genres(artist, &decision.combined_genres) {
                Ok(()) => changes_made = true,
                Err(err) => error!(
                    "[{}] Error updating genres for {}: {}",
                    self.scope, artist.name, err
                ),
            }
        } else {
            info!("[{}] No genre updates needed for {}", self.scope, artist.name);
        }

        if decision.artwork_change_needed {
            info!(
                "[{}] {} needs artwork (missing or invalid)",
                self.scope, artist.name
            );
            if self.install_artwork(artist, &found, &albums) {
                changes_made = true;
            }
        }

        let outcome = decision.conclude(changes_made);
        match &outcome {
            ArtistOutcome::Updated(UpdateResult::PartialFailure) => warn!(
                "[{}] Updates were needed but could not be made for {}",
                self.scope, artist.name
            ),
            other => info!("[{}] {}: {:?}", self.scope, artist.name, other),
        }
        ReconcileReport {
            outcome,
            catalog_id: Some(found.catalog_id),
            decision: Some(decision),
        }
    }

    fn fold_details(&self, found: CatalogMatch) -> CatalogMatch {
        match self.matcher.artist_details(&found.catalog_id) {
            MatchOutcome::Found(details) => found.with_details(details),
            other => {
                debug!(
                    "[{}] Keeping search data for {}: details {:?}",
                    self.scope, found.name, other
                );
                found
            }
        }
    }

    fn apply_genres(
        &self,
        artist: &ArtistRecord,
        combined: &BTreeSet<String>,
    ) -> Result<(), ReconcileError> {
        let genres = if combined.is_empty() {
            BTreeSet::from([PLACEHOLDER_GENRE.to_string()])
        } else {
            combined.clone()
        };
        info!(
            "[{}] Setting genres for {} to {:?}",
            self.scope, artist.name, genres
        );
        self.library.set_genres(artist, &genres)?;
        let refreshed = self.library.refresh(artist)?;
        if !refreshed.genres.is_superset(&genres) {
            warn!(
                "[{}] Genre write for {} not reflected yet (library reports {:?})",
                self.scope, artist.name, refreshed.genres
            );
        }
        Ok(())
    }

    fn install_artwork(
        &self,
        artist: &ArtistRecord,
        found: &CatalogMatch,
        albums: &[AlbumRecord],
    ) -> bool {
        if let Some(image) = found.largest_image() {
            info!(
                "[{}] Trying catalog image {}x{} for {}",
                self.scope, image.width, image.height, artist.name
            );
            let attempt = self
                .fetcher
                .fetch(&image.url)
                .map_err(ReconcileError::Download)
                .and_then(|bytes| self.install_candidate(artist, &bytes));
            if self.report_attempt(artist, "catalog", attempt) {
                return true;
            }
        }

        let mut candidates: Vec<&AlbumRecord> = albums
            .iter()
            .filter(|album| album.artwork.is_some())
            .collect();
        candidates.sort_by_key(|album| Reverse(album.year));
        for album in candidates {
            let source = format!("album {} ({})", album.title, album.id);
            let attempt = match self.library.album_artwork_bytes(album) {
                Ok(Some(bytes)) => self.install_candidate(artist, &bytes),
                Ok(None) => continue,
                Err(err) => Err(err.into()),
            };
            if self.report_attempt(artist, &source, attempt) {
                return true;
            }
        }
        false
    }

    fn report_attempt(
        &self,
        artist: &ArtistRecord,
        source: &str,
        attempt: Result<bool, ReconcileError>,
    ) -> bool {
        match attempt {
            Ok(true) => {
                info!(
                    "[{}] Installed artwork for {} from {source}",
                    self.scope, artist.name
                );
                true
            }
            Ok(false) => {
                warn!(
                    "[{}] Artwork from {source} did not stick for {}",
                    self.scope, artist.name
                );
                false
            }
            Err(err) => {
                warn!(
                    "[{}] Artwork from {source} unusable for {}: {}",
                    self.scope, artist.name, err
                );
                false
            }
        }
    }

    /// Validates, uploads, and confirms one candidate.
    fn install_candidate(
        &self,
        artist: &ArtistRecord,
        bytes: &[u8],
    ) -> Result<bool, ReconcileError> {
        let normalized = self.validator.validate(bytes)?;
        if !self.library.upload_artwork(artist, &normalized)? {
            return Ok(false);
        }
        let refreshed = self.library.refresh(artist)?;
        let installed = self.library.artwork_bytes(&refreshed)?;
        Ok(installed.is_some_and(|bytes| !bytes.is_empty()))
    }
}
