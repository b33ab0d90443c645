//! Process-wide `tracing` subscriber with `log` records bridged in.

use once_cell::sync::OnceCell;
use std::env;
use std::path::{Path, PathBuf};
use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::fmt::{self, time::OffsetTime};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::common::config::LogConfig;
use crate::errors::{ConfigError, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Set once the first `init_logger` call got past the disabled check.
static INSTALLED: OnceCell<Option<WorkerGuard>> = OnceCell::new();

const QUIET_DEPENDENCIES: &str = "sqlx=warn,sea_orm=warn,hyper=warn,reqwest=warn";

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Env-filter directive for this crate and user code, e.g. `debug`
    pub level: String,
    /// Daily rolled file; its file name is the rolling prefix
    pub file: Option<PathBuf>,
    pub console: bool,
    pub json: bool,
}

impl LoggerConfig {
    /// Console plus `logs/{name}.*.log`.
    pub fn for_spider(name: &str) -> Self {
        Self {
            file: Some(Path::new("logs").join(name)),
            ..Self::default()
        }
    }

    fn directive(&self) -> String {
        format!("{},{QUIET_DEPENDENCIES}", self.level.to_lowercase())
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            console: true,
            json: false,
        }
    }
}

impl From<&LogConfig> for LoggerConfig {
    fn from(cfg: &LogConfig) -> Self {
        Self {
            level: cfg.level.clone(),
            file: cfg.file_path.clone(),
            console: cfg.console,
            json: cfg.json,
        }
    }
}

/// `DISABLE_LOGS=1|true|yes|on` turns logging off entirely.
pub fn is_logging_disabled() -> bool {
    env::var("DISABLE_LOGS")
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn timer() -> OffsetTime<Rfc3339> {
    OffsetTime::new(UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC), Rfc3339)
}

fn console_layer(json: bool) -> BoxedLayer {
    if json {
        fmt::layer().json().with_timer(timer()).boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(true)
            .with_timer(timer())
            .boxed()
    }
}

fn file_layer(path: &Path, json: bool) -> Result<(BoxedLayer, WorkerGuard)> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let prefix = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "spider".to_string());
    let appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(dir)
        .map_err(|e| ConfigError::Invalid(format!("log file {}: {e}", path.display())))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer().with_writer(writer).with_ansi(false).with_timer(timer());
    let layer: BoxedLayer = if json { layer.json().boxed() } else { layer.boxed() };
    Ok((layer, guard))
}

/// Installs the global subscriber once; later calls return immediately.
pub fn init_logger(config: LoggerConfig) -> Result<()> {
    if is_logging_disabled() || INSTALLED.get().is_some() {
        return Ok(());
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.console {
        layers.push(console_layer(config.json));
    }
    let guard = match &config.file {
        Some(path) => {
            let (layer, guard) = file_layer(path, config.json)?;
            layers.push(layer);
            Some(guard)
        }
        None => None,
    };
    if INSTALLED.set(guard).is_err() {
        // lost a race with a concurrent init
        return Ok(());
    }

    let _ = LogTracer::init();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directive()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry().with(layers).with(filter).try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_log_config() {
        let cfg = LogConfig {
            enabled: true,
            level: "DEBUG".into(),
            file_path: None,
            console: false,
            json: true,
        };
        let logger = LoggerConfig::from(&cfg);
        assert!(!logger.console);
        assert!(logger.json);
        assert!(logger.directive().starts_with("debug,"));
    }

    #[test]
    fn test_for_spider_writes_under_logs() {
        let cfg = LoggerConfig::for_spider("news");
        assert_eq!(cfg.file, Some(PathBuf::from("logs").join("news")));
        assert!(cfg.console);
    }

    #[test]
    fn test_file_layer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("spider");
        let (_layer, _guard) = file_layer(&path, false).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn test_init_twice_is_noop() {
        let cfg = LoggerConfig {
            console: false,
            ..LoggerConfig::default()
        };
        assert!(init_logger(cfg.clone()).is_ok());
        assert!(init_logger(cfg).is_ok());
    }
}
