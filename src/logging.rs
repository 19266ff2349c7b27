//! Logger setup and per-run log scoping.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;

use env_logger::Target;
use log::{LevelFilter, Log, Metadata, Record};
use uuid::Uuid;

use crate::config::LoggingConfig;

/// Run id carried by every component of one enrichment run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScope {
    run_id: Arc<str>,
}

impl RunScope {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: Arc::from(run_id),
        }
    }

    /// Fresh scope with a short random id.
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self::new(&id[..8])
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run {}", self.run_id())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open log file: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    AlreadyInitialized(#[from] log::SetLoggerError),
}

fn build_logger(level: LevelFilter, target: Option<Target>) -> env_logger::Logger {
    let mut clog = colog::default_builder();
    clog.filter(None, level);
    if let Some(target) = target {
        clog.target(target);
    }
    clog.build()
}

/// Console logger plus an optional file logger with its own level.
struct SplitLogger {
    console: env_logger::Logger,
    file: Option<env_logger::Logger>,
}

impl SplitLogger {
    fn max_level(&self) -> LevelFilter {
        let console = self.console.filter();
        self.file
            .as_ref()
            .map_or(console, |file| console.max(file.filter()))
    }
}

impl Log for SplitLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.console.enabled(metadata)
            || self.file.as_ref().is_some_and(|file| file.enabled(metadata))
    }

    fn log(&self, record: &Record<'_>) {
        self.console.log(record);
        if let Some(file) = &self.file {
            file.log(record);
        }
    }

    fn flush(&self) {
        self.console.flush();
        if let Some(file) = &self.file {
            file.flush();
        }
    }
}

/// Installs the global logger and a panic hook that routes panics through it.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let file = match config.path.as_deref() {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(build_logger(
                config.file_level.to_level_filter(),
                Some(Target::Pipe(Box::new(file))),
            ))
        }
        None => None,
    };
    let logger = SplitLogger {
        console: build_logger(config.level.to_level_filter(), None),
        file,
    };
    let max_level = logger.max_level();
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(max_level);

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    use env_logger::Target;
    use log::{Level, LevelFilter, Log, Record};

    use super::{build_logger, RunScope, SplitLogger};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().expect("buffer lock")).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("buffer lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn split_logger(console: &SharedBuffer, file: &SharedBuffer) -> SplitLogger {
        SplitLogger {
            console: build_logger(
                LevelFilter::Info,
                Some(Target::Pipe(Box::new(console.clone()))),
            ),
            file: Some(build_logger(
                LevelFilter::Debug,
                Some(Target::Pipe(Box::new(file.clone()))),
            )),
        }
    }

    #[test]
    fn test_debug_records_reach_only_the_file() {
        let console = SharedBuffer::default();
        let file = SharedBuffer::default();
        let logger = split_logger(&console, &file);

        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .target("artist_enricher")
                .args(format_args!("catalog detail"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("artist_enricher")
                .args(format_args!("batch started"))
                .build(),
        );
        logger.flush();

        assert!(!console.text().contains("catalog detail"));
        assert!(console.text().contains("batch started"));
        assert!(file.text().contains("catalog detail"));
        assert!(file.text().contains("batch started"));
        assert_eq!(logger.max_level(), LevelFilter::Debug);
    }

    #[test]
    fn test_max_level_without_file_follows_console() {
        let logger = SplitLogger {
            console: build_logger(LevelFilter::Warn, None),
            file: None,
        };
        assert_eq!(logger.max_level(), LevelFilter::Warn);
    }

    #[test]
    fn test_generated_scopes_are_short_and_unique() {
        let first = RunScope::generate();
        let second = RunScope::generate();
        assert_eq!(first.run_id().len(), 8);
        assert_ne!(first, second);
    }

    #[test]
    fn test_scope_display_prefixes_run_id() {
        assert_eq!(RunScope::new("abc123").to_string(), "run abc123");
    }
}
