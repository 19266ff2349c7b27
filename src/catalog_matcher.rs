//! Paced, retry-bounded access to the music catalog.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::catalog::{CatalogBackend, CatalogDetails, CatalogError, CatalogMatch};
use crate::logging::RunScope;
use crate::pacing::RequestPacer;

/// Result of one logical catalog call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome<T> {
    Found(T),
    NotFound,
    /// The service kept throttling after the retry budget was spent.
    RateLimited { retry_after: Duration },
    Failed(String),
}

/// Wraps a catalog backend with shared pacing and bounded rate-limit retry.
pub struct CatalogMatcher {
    backend: Arc<dyn CatalogBackend>,
    pacer: Arc<RequestPacer>,
    max_rate_limit_retries: u32,
    scope: RunScope,
}

impl CatalogMatcher {
    pub fn new(
        backend: Arc<dyn CatalogBackend>,
        pacer: Arc<RequestPacer>,
        max_rate_limit_retries: u32,
        scope: RunScope,
    ) -> Self {
        Self {
            backend,
            pacer,
            max_rate_limit_retries,
            scope,
        }
    }

    /// Searches the catalog for the best single match for `name`.
    pub fn search_artist(&self, name: &str) -> MatchOutcome<CatalogMatch> {
        info!("[{}] Searching catalog for artist: {name}", self.scope);
        match self.call_with_retry("search", name, |backend| backend.search_artist(name)) {
            MatchOutcome::Found(Some(found)) => {
                info!(
                    "[{}] Found catalog artist: {} (popularity {})",
                    self.scope, found.name, found.popularity
                );
                MatchOutcome::Found(found)
            }
            MatchOutcome::Found(None) => {
                info!("[{}] No catalog results for: {name}", self.scope);
                MatchOutcome::NotFound
            }
            MatchOutcome::NotFound => MatchOutcome::NotFound,
            MatchOutcome::RateLimited { retry_after } => MatchOutcome::RateLimited { retry_after },
            MatchOutcome::Failed(reason) => MatchOutcome::Failed(reason),
        }
    }

    /// Fetches detail fields for a known catalog id.
    pub fn artist_details(&self, catalog_id: &str) -> MatchOutcome<CatalogDetails> {
        info!("[{}] Fetching catalog details for id: {catalog_id}", self.scope);
        self.call_with_retry("details", catalog_id, |backend| {
            backend.artist_details(catalog_id)
        })
    }

    fn call_with_retry<T, F>(&self, label: &str, subject: &str, operation: F) -> MatchOutcome<T>
    where
        F: Fn(&dyn CatalogBackend) -> Result<T, CatalogError>,
    {
        let max_attempts = self.max_rate_limit_retries.saturating_add(1);
        let mut attempt = 1u32;
        loop {
            self.pacer.wait_for_slot();
            match operation(self.backend.as_ref()) {
                Ok(value) => return MatchOutcome::Found(value),
                Err(CatalogError::NotFound) => return MatchOutcome::NotFound,
                Err(CatalogError::RateLimited { retry_after }) if attempt < max_attempts => {
                    warn!(
                        "[{}] Catalog {label} for '{subject}' rate limited; retrying in {:?} (attempt {attempt}/{max_attempts})",
                        self.scope, retry_after
                    );
                    self.pacer.sleeper().sleep(retry_after);
                    attempt = attempt.saturating_add(1);
                }
                Err(CatalogError::RateLimited { retry_after }) => {
                    error!(
                        "[{}] Catalog {label} for '{subject}' still rate limited after {attempt} attempts",
                        self.scope
                    );
                    return MatchOutcome::RateLimited { retry_after };
                }
                Err(other) => {
                    error!(
                        "[{}] Catalog {label} for '{subject}' failed: {other}",
                        self.scope
                    );
                    return MatchOutcome::Failed(other.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{CatalogMatcher, MatchOutcome};
    use crate::catalog::{CatalogBackend, CatalogDetails, CatalogError, CatalogMatch};
    use crate::logging::RunScope;
    use crate::pacing::{RequestPacer, Sleeper};

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Call(u32),
        Sleep(Duration),
    }

    type EventLog = Arc<Mutex<Vec<Event>>>;

    struct LoggingSleeper {
        events: EventLog,
    }

    impl Sleeper for LoggingSleeper {
        fn sleep(&self, duration: Duration) {
            self.events
                .lock()
                .expect("event log lock")
                .push(Event::Sleep(duration));
            // Only pacing waits are short enough to actually sleep for.
            if duration <= Duration::from_millis(50) {
                std::thread::sleep(duration);
            }
        }
    }

    struct ScriptedCatalog {
        responses: Mutex<VecDeque<Result<Option<CatalogMatch>, CatalogError>>>,
        calls: Mutex<u32>,
        events: EventLog,
    }

    impl CatalogBackend for ScriptedCatalog {
        fn search_artist(&self, _name: &str) -> Result<Option<CatalogMatch>, CatalogError> {
            let call = {
                let mut calls = self.calls.lock().expect("call counter lock");
                *calls += 1;
                *calls
            };
            self.events
                .lock()
                .expect("event log lock")
                .push(Event::Call(call));
            self.responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .unwrap_or(Ok(None))
        }

        fn artist_details(&self, _catalog_id: &str) -> Result<CatalogDetails, CatalogError> {
            Err(CatalogError::NotFound)
        }
    }

    fn sample_match() -> CatalogMatch {
        CatalogMatch {
            catalog_id: "cat-alice".to_string(),
            name: "Alice".to_string(),
            genres: BTreeSet::from(["rock".to_string()]),
            images: Vec::new(),
            popularity: 50,
        }
    }

    fn matcher_with(
        responses: Vec<Result<Option<CatalogMatch>, CatalogError>>,
    ) -> (CatalogMatcher, Arc<ScriptedCatalog>, EventLog) {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let backend = Arc::new(ScriptedCatalog {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(0),
            events: Arc::clone(&events),
        });
        let pacer = Arc::new(RequestPacer::new(
            Duration::from_millis(1),
            Arc::new(LoggingSleeper {
                events: Arc::clone(&events),
            }),
        ));
        let matcher = CatalogMatcher::new(backend.clone(), pacer, 1, RunScope::new("test"));
        (matcher, backend, events)
    }

    fn rate_limited(secs: u64) -> Result<Option<CatalogMatch>, CatalogError> {
        Err(CatalogError::RateLimited {
            retry_after: Duration::from_secs(secs),
        })
    }

    #[test]
    fn test_rate_limit_waits_retry_after_before_single_retry() {
        let (matcher, backend, events) =
            matcher_with(vec![rate_limited(3), Ok(Some(sample_match()))]);

        let outcome = matcher.search_artist("Alice");

        assert_eq!(outcome, MatchOutcome::Found(sample_match()));
        assert_eq!(*backend.calls.lock().expect("call counter lock"), 2);
        let events = events.lock().expect("event log lock").clone();
        let long_wait = events
            .iter()
            .position(|event| matches!(event, Event::Sleep(d) if *d >= Duration::from_secs(3)))
            .expect("retry-after wait should be recorded");
        let first_call = events
            .iter()
            .position(|event| *event == Event::Call(1))
            .expect("first call should be recorded");
        let second_call = events
            .iter()
            .position(|event| *event == Event::Call(2))
            .expect("retried call should be recorded");
        assert!(first_call < long_wait);
        assert!(long_wait < second_call);
    }

    #[test]
    fn test_persistent_rate_limit_stops_after_one_retry() {
        let (matcher, backend, _) =
            matcher_with(vec![rate_limited(2), rate_limited(2), Ok(Some(sample_match()))]);

        let outcome = matcher.search_artist("Alice");

        assert_eq!(
            outcome,
            MatchOutcome::RateLimited {
                retry_after: Duration::from_secs(2)
            }
        );
        assert_eq!(*backend.calls.lock().expect("call counter lock"), 2);
    }

    #[test]
    fn test_empty_search_is_not_found() {
        let (matcher, backend, _) = matcher_with(vec![Ok(None)]);
        assert_eq!(matcher.search_artist("Nobody"), MatchOutcome::NotFound);
        assert_eq!(*backend.calls.lock().expect("call counter lock"), 1);
    }

    #[test]
    fn test_other_errors_are_terminal_without_retry() {
        let (matcher, backend, _) = matcher_with(vec![
            Err(CatalogError::Http {
                status: 500,
                summary: "boom".to_string(),
            }),
            Ok(Some(sample_match())),
        ]);

        let outcome = matcher.search_artist("Alice");

        assert!(matches!(outcome, MatchOutcome::Failed(ref reason) if reason.contains("500")));
        assert_eq!(*backend.calls.lock().expect("call counter lock"), 1);
    }

    #[test]
    fn test_details_not_found_maps_to_not_found() {
        let (matcher, _, _) = matcher_with(Vec::new());
        assert_eq!(matcher.artist_details("missing"), MatchOutcome::NotFound);
    }
}
