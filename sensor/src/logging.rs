use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;
use thiserror::Error;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l:<5}] {t} {m}{n}";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Unknown log level '{0}'")]
    Level(String),

    #[error("Failed to create log file: {0}")]
    File(#[from] std::io::Error),

    #[error("Failed to build log config: {0}")]
    Build(String),

    #[error("Logging initialization failed: {0}")]
    Init(#[from] log::SetLoggerError),
}

/// Logging to stderr plus an optional append-only file. Call once at startup.
pub fn init_logger(file: Option<&Path>, level: &str) -> Result<(), LoggingError> {
    let level: LevelFilter = level.parse().map_err(|_| LoggingError::Level(level.to_string()))?;

    let console = ConsoleAppender::builder().target(Target::Stderr).encoder(Box::new(PatternEncoder::new(PATTERN))).build();
    let mut config = Config::builder().appender(Appender::builder().build("console", Box::new(console)));
    let mut root = Root::builder().appender("console");

    if let Some(path) = file {
        let logfile = FileAppender::builder().encoder(Box::new(PatternEncoder::new(PATTERN))).append(true).build(path)?;
        config = config.appender(Appender::builder().build("file", Box::new(logfile)));
        root = root.appender("file");
    }

    let config = config.build(root.build(level)).map_err(|e| LoggingError::Build(e.to_string()))?;
    log4rs::init_config(config)?;
    Ok(())
}
