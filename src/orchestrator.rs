//! Drives one enrichment pass over the whole library.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};

use crate::backends::{ArtistRecord, LibraryBackend, LibraryError};
use crate::ledger::{Ledger, LedgerStats, LedgerUpdate};
use crate::logging::RunScope;
use crate::pacing::Sleeper;
use crate::reconciler::{
    ArtistOutcome, FailureKind, ReconcileReport, Reconciler, SkipReason, UpdateResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Parallel { workers: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub mode: ExecutionMode,
    pub batch_size: usize,
    /// Courtesy pause after each attempted artist (sequential) or batch (parallel).
    pub batch_pause: Duration,
    pub show_progress: bool,
}

/// Per-outcome counts for one pass plus the ledger totals afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub listed: usize,
    pub already_done: usize,
    pub no_action_needed: usize,
    pub updated: usize,
    pub partial_failure: usize,
    pub not_found: usize,
    pub errors: usize,
    /// Attempted artists whose ledger write failed.
    pub unrecorded: usize,
    pub ledger: LedgerStats,
}

impl RunSummary {
    fn record(&mut self, processed: &ProcessedArtist) {
        match &processed.outcome {
            ArtistOutcome::Skipped(SkipReason::AlreadyDone) => self.already_done += 1,
            ArtistOutcome::Skipped(SkipReason::NoActionNeeded) => self.no_action_needed += 1,
            ArtistOutcome::Updated(UpdateResult::Success) => self.updated += 1,
            ArtistOutcome::Updated(UpdateResult::PartialFailure) => self.partial_failure += 1,
            ArtistOutcome::Failed(FailureKind::NotFound) => self.not_found += 1,
            ArtistOutcome::Failed(FailureKind::Error(_)) => self.errors += 1,
        }
        if processed.attempted() && !processed.recorded {
            self.unrecorded += 1;
        }
    }

    pub fn attempted(&self) -> usize {
        self.listed.saturating_sub(self.already_done)
    }
}

struct ProcessedArtist {
    outcome: ArtistOutcome,
    recorded: bool,
}

impl ProcessedArtist {
    fn attempted(&self) -> bool {
        self.outcome != ArtistOutcome::Skipped(SkipReason::AlreadyDone)
    }
}

pub struct BatchOrchestrator {
    library: Arc<dyn LibraryBackend>,
    ledger: Arc<Ledger>,
    reconciler: Arc<Reconciler>,
    sleeper: Arc<dyn Sleeper>,
    settings: OrchestratorSettings,
    scope: RunScope,
}

impl BatchOrchestrator {
    pub fn new(
        library: Arc<dyn LibraryBackend>,
        ledger: Arc<Ledger>,
        reconciler: Arc<Reconciler>,
        sleeper: Arc<dyn Sleeper>,
        settings: OrchestratorSettings,
        scope: RunScope,
    ) -> Self {
        Self {
            library,
            ledger,
            reconciler,
            sleeper,
            settings,
            scope,
        }
    }

    /// Processes every listed artist. Only a failure to list artists aborts.
    pub fn run(&self) -> Result<RunSummary, LibraryError> {
        let artists = self.library.list_artists()?;
        info!("[{}] Found {} artists", self.scope, artists.len());

        let progress = self.progress_bar(artists.len());
        let mut summary = RunSummary {
            listed: artists.len(),
            ..RunSummary::default()
        };

        match self.settings.mode {
            ExecutionMode::Sequential => {
                for artist in &artists {
                    let processed = self.process_artist(artist, &progress);
                    summary.record(&processed);
                    if processed.attempted() {
                        self.sleeper.sleep(self.settings.batch_pause);
                    }
                }
            }
            ExecutionMode::Parallel { workers } => {
                let batch_size = self.settings.batch_size.max(1);
                for (index, batch) in artists.chunks(batch_size).enumerate() {
                    info!(
                        "[{}] Processing batch {} ({} artists)",
                        self.scope,
                        index + 1,
                        batch.len()
                    );
                    let results = self.process_batch(batch, workers.max(1), &progress);
                    let attempted = results.iter().any(ProcessedArtist::attempted);
                    for processed in &results {
                        summary.record(processed);
                    }
                    if attempted {
                        self.sleeper.sleep(self.settings.batch_pause);
                    }
                }
            }
        }

        progress.finish_with_message("done");
        summary.ledger = self.ledger.stats();
        info!(
            "[{}] Processing completed. Total: {}, Successful: {}, Failed: {}",
            self.scope, summary.ledger.total, summary.ledger.successful, summary.ledger.failed
        );
        if summary.unrecorded > 0 {
            warn!(
                "[{}] {} artists could not be recorded in the ledger",
                self.scope, summary.unrecorded
            );
        }
        Ok(summary)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.settings.show_progress {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            progress.set_style(style.progress_chars("=> "));
        }
        progress
    }

    fn process_batch(
        &self,
        batch: &[ArtistRecord],
        workers: usize,
        progress: &ProgressBar,
    ) -> Vec<ProcessedArtist> {
        let next = AtomicUsize::new(0);
        let worker_count = workers.min(batch.len());
        thread::scope(|scope| {
            let handles: Vec<_> = (0..worker_count)
                .map(|_| {
                    scope.spawn(|| {
                        let mut results = Vec::new();
                        loop {
                            let index = next.fetch_add(1, Ordering::SeqCst);
                            let Some(artist) = batch.get(index) else {
                                break;
                            };
                            results.push(self.process_artist(artist, progress));
                        }
                        results
                    })
                })
                .collect();

            let mut results = Vec::with_capacity(batch.len());
            for handle in handles {
                match handle.join() {
                    Ok(worker_results) => results.extend(worker_results),
                    Err(payload) => error!(
                        "[{}] Enrichment worker crashed: {}",
                        self.scope,
                        panic_payload_to_string(payload.as_ref())
                    ),
                }
            }
            results
        })
    }

    fn process_artist(&self, artist: &ArtistRecord, progress: &ProgressBar) -> ProcessedArtist {
        if !self.ledger.try_claim(&artist.id) {
            info!(
                "[{}] Skipping already processed artist: {}",
                self.scope, artist.name
            );
            progress.inc(1);
            return ProcessedArtist {
                outcome: ArtistOutcome::Skipped(SkipReason::AlreadyDone),
                recorded: false,
            };
        }

        progress.set_message(artist.name.clone());
        let report = match catch_unwind(AssertUnwindSafe(|| self.reconciler.reconcile(artist))) {
            Ok(report) => report,
            Err(payload) => {
                let reason = panic_payload_to_string(payload.as_ref());
                error!(
                    "[{}] Unexpected error processing {}: {}",
                    self.scope, artist.name, reason
                );
                ReconcileReport {
                    outcome: ArtistOutcome::Failed(FailureKind::Error(format!(
                        "Unexpected error: {reason}"
                    ))),
                    catalog_id: None,
                    decision: None,
                }
            }
        };

        if let Some(decision) = &report.decision {
            debug!(
                "[{}] {}: genre change {}, artwork change {}, success {}",
                self.scope,
                artist.name,
                decision.genre_change_needed,
                decision.artwork_change_needed,
                decision.success
            );
        }

        let update = LedgerUpdate {
            artist_id: artist.id.clone(),
            artist_name: artist.name.clone(),
            catalog_id: report.catalog_id.clone(),
            success: report.outcome.success(),
            error_message: report.outcome.error_message(),
        };
        let recorded = match self.ledger.mark_processed(&update) {
            Ok(()) => true,
            Err(err) => {
                error!(
                    "[{}] Failed to record outcome for {}: {}",
                    self.scope, artist.name, err
                );
                false
            }
        };
        progress.inc(1);
        ProcessedArtist {
            outcome: report.outcome,
            recorded,
        }
    }
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}
