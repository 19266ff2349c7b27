mod artwork_fetcher;
mod backends;
mod catalog;
mod catalog_matcher;
mod config;
mod credentials;
mod image_pipeline;
mod ledger;
mod logging;
mod orchestrator;
mod pacing;
mod reconciler;
#[cfg(test)]
mod test_support;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info};

use artwork_fetcher::HttpArtworkFetcher;
use backends::plex::{PlexAdapter, PlexProfile};
use catalog::spotify::SpotifyAdapter;
use catalog_matcher::CatalogMatcher;
use config::{Config, ConfigError, EnrichmentMode};
use credentials::SecretKind;
use image_pipeline::{ArtworkThresholds, ArtworkValidator};
use ledger::Ledger;
use logging::RunScope;
use orchestrator::{BatchOrchestrator, ExecutionMode, OrchestratorSettings};
use pacing::{RequestPacer, Sleeper, ThreadSleeper};
use reconciler::{ReconcilePolicy, Reconciler};

#[derive(Parser)]
#[command(
    name = "artist-enricher",
    version,
    about = "Fill in artist genres and artwork from a music catalog"
)]
struct Cli {
    /// Config file; defaults to the platform config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Enrich every artist not yet recorded in the ledger
    Run {
        /// Process one artist at a time
        #[arg(long)]
        sequential: bool,
        /// Worker count for parallel batches
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, help = "Disable the progress bar")]
        no_progress: bool,
    },
    /// Print ledger totals, or one artist's entry
    Stats {
        #[arg(long)]
        artist: Option<String>,
    },
    /// Store a secret read from stdin in the OS keyring
    StoreSecret {
        #[arg(value_enum)]
        kind: SecretKind,
    },
}

fn ledger_path(config: &Config) -> Result<PathBuf, ConfigError> {
    match config.database.path.clone() {
        Some(path) => Ok(path),
        None => config::default_database_path(),
    }
}

fn required_secret(
    configured: &str,
    kind: SecretKind,
    account: &str,
    setting: &'static str,
) -> Result<String, Box<dyn std::error::Error>> {
    credentials::resolve_secret(configured, kind, account)?
        .ok_or_else(|| ConfigError::Missing(setting).into())
}

fn run_enrichment(
    config: &Config,
    sequential: bool,
    workers: Option<usize>,
    show_progress: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let scope = RunScope::generate();
    info!("[{scope}] Starting artist enrichment");

    let plex_token = required_secret(
        &config.plex.token,
        SecretKind::Plex,
        &config.plex.base_url,
        "plex.token",
    )?;
    let spotify_secret = required_secret(
        &config.spotify.client_secret,
        SecretKind::Spotify,
        &config.spotify.client_id,
        "spotify.client_secret",
    )?;

    let sleeper: Arc<dyn Sleeper> = Arc::new(ThreadSleeper);
    let library = Arc::new(PlexAdapter::connect(
        PlexProfile {
            base_url: config.plex.base_url.clone(),
            token: plex_token,
            library_section: config.plex.library_section.clone(),
            request_timeout: Duration::from_secs(config.plex.request_timeout_secs),
            settle_delay: Duration::from_millis(config.plex.settle_delay_ms),
            installed_artwork_timeout: Duration::from_secs(config.artwork.installed_timeout_secs),
            artwork_download_timeout: Duration::from_secs(config.artwork.download_timeout_secs),
        },
        Arc::clone(&sleeper),
    )?);
    let catalog = Arc::new(SpotifyAdapter::connect(
        &config.spotify.client_id,
        &spotify_secret,
        Duration::from_secs(config.enrichment.catalog_timeout_secs),
    )?);
    let ledger = Arc::new(Ledger::open(&ledger_path(config)?)?);

    let pacer = Arc::new(RequestPacer::new(
        config.enrichment.catalog_min_interval(),
        Arc::clone(&sleeper),
    ));
    info!(
        "[{scope}] Catalog requests spaced at least {:?} apart",
        pacer.min_interval()
    );
    let matcher = Arc::new(CatalogMatcher::new(
        catalog,
        pacer,
        config.enrichment.max_rate_limit_retries,
        scope.clone(),
    ));
    let validator = Arc::new(ArtworkValidator::new(
        ArtworkThresholds {
            upload_min_edge_px: config.artwork.upload_min_edge_px,
            installed_min_edge_px: config.artwork.installed_min_edge_px,
            installed_min_bytes: config.artwork.installed_min_bytes,
            jpeg_quality: config.artwork.jpeg_quality,
        },
        scope.clone(),
    ));
    let fetcher = Arc::new(HttpArtworkFetcher::new(Duration::from_secs(
        config.artwork.download_timeout_secs,
    )));
    let reconciler = Arc::new(Reconciler::new(
        library.clone(),
        matcher,
        validator,
        fetcher,
        ReconcilePolicy {
            skip_complete_artists: config.enrichment.skip_complete_artists,
        },
        scope.clone(),
    ));

    let mode = if sequential || config.enrichment.mode == EnrichmentMode::Sequential {
        ExecutionMode::Sequential
    } else {
        ExecutionMode::Parallel {
            workers: workers
                .unwrap_or(config.enrichment.max_workers)
                .clamp(1, 32),
        }
    };
    let orchestrator = BatchOrchestrator::new(
        library,
        ledger,
        reconciler,
        sleeper,
        OrchestratorSettings {
            mode,
            batch_size: config.enrichment.batch_size,
            batch_pause: config.enrichment.batch_pause(),
            show_progress,
        },
        scope.clone(),
    );

    let summary = orchestrator.run().map_err(|err| {
        error!("[{scope}] Run aborted: {err}");
        err
    })?;
    println!(
        "Processed {} of {} artists. Ledger total: {}, successful: {}, failed: {}",
        summary.attempted(),
        summary.listed,
        summary.ledger.total,
        summary.ledger.successful,
        summary.ledger.failed
    );
    println!(
        "This run: {} updated, {} already complete, {} partial, {} not found, {} errors, {} skipped",
        summary.updated,
        summary.no_action_needed,
        summary.partial_failure,
        summary.not_found,
        summary.errors,
        summary.already_done
    );
    Ok(())
}

fn print_stats(config: &Config, artist: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = Ledger::open(&ledger_path(config)?)?;
    if let Some(artist_id) = artist {
        match ledger.entry(artist_id)? {
            Some(entry) => println!(
                "{} ({}): success={}, catalog_id={}, processed_at={}, error={}",
                entry.artist_name,
                entry.artist_id,
                entry.success,
                entry.catalog_id.as_deref().unwrap_or("-"),
                entry
                    .processed_at
                    .map(|millis| millis.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                entry.error_message.as_deref().unwrap_or("-")
            ),
            None => println!("No ledger entry for artist {artist_id}"),
        }
        return Ok(());
    }
    let stats = ledger.stats();
    println!(
        "Total: {}, Successful: {}, Failed: {}",
        stats.total, stats.successful, stats.failed
    );
    Ok(())
}

fn store_secret(config: &Config, kind: SecretKind) -> Result<(), Box<dyn std::error::Error>> {
    let account = match kind {
        SecretKind::Plex => config.plex.base_url.as_str(),
        SecretKind::Spotify => config.spotify.client_id.as_str(),
    };
    if account.trim().is_empty() {
        return Err(ConfigError::Missing(match kind {
            SecretKind::Plex => "plex.base_url",
            SecretKind::Spotify => "spotify.client_id",
        })
        .into());
    }
    eprintln!("Enter the secret and press Enter:");
    let mut secret = String::new();
    std::io::stdin().lock().read_line(&mut secret)?;
    let secret = secret.trim();
    if secret.is_empty() {
        return Err("no secret entered".into());
    }
    credentials::set_secret(kind, account, secret)?;
    info!("Stored {:?} secret in the OS keyring", kind);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };
    let config = match config::load(&config_path) {
        Ok(config) => config,
        Err(ConfigError::CreatedDefault(path)) => {
            eprintln!(
                "Config file not found. Created defaults at {}; add Plex and Spotify credentials and run again.",
                path.display()
            );
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    logging::init(&config.logging)?;

    match cli.command.unwrap_or(Command::Run {
        sequential: false,
        workers: None,
        no_progress: false,
    }) {
        Command::Run {
            sequential,
            workers,
            no_progress,
        } => run_enrichment(&config, sequential, workers, !no_progress),
        Command::Stats { artist } => print_stats(&config, artist.as_deref()),
        Command::StoreSecret { kind } => store_secret(&config, kind),
    }
}
