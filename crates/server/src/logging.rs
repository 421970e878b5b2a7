//! Structured file logging for the server process.
//!
//! Every knob is read from `TOOLRELAY_LOG_*` variables; `RUST_LOG` is the
//! filter fallback.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const ENV_PREFIX: &str = "TOOLRELAY_LOG_";
const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE_NAME: &str = "server.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

/// Resolved logging options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub log_path: PathBuf,
    pub format: LogFormat,
    pub filter: String,
    pub truncate_on_start: bool,
    pub run_id: String,
}

impl LogSettings {
    /// Settings for a log file under `log_dir`, read from the process env.
    pub fn from_env(log_dir: &Path) -> Self {
        Self::resolve(log_dir, |name| std::env::var(name).ok())
    }

    fn resolve(log_dir: &Path, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.trim().is_empty())
        };

        let filter = var("FILTER")
            .or_else(|| lookup(EnvFilter::DEFAULT_ENV))
            .filter(|f| EnvFilter::try_new(f).is_ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());

        let run_id = var("RUN_ID").unwrap_or_else(|| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            format!("pid-{}-{}", std::process::id(), now)
        });

        Self {
            log_path: log_dir.join(LOG_FILE_NAME),
            format: LogFormat::parse(var("FORMAT").as_deref()),
            filter,
            truncate_on_start: var("TRUNCATE").as_deref() == Some("1"),
            run_id,
        }
    }

    fn log_dir(&self) -> &Path {
        self.log_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

/// Install the global subscriber writing to `settings.log_path`.
pub fn init_logging(settings: &LogSettings) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(settings.log_dir())?;

    if settings.truncate_on_start {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&settings.log_path)?;
    }

    let file_appender = tracing_appender::rolling::never(settings.log_dir(), LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let registry = tracing_subscriber::registry().with(EnvFilter::try_new(&settings.filter)?);
    match settings.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %settings.log_path.display(),
        format = settings.format.as_str(),
        run_id = %settings.run_id,
        filter = %settings.filter,
    );

    Ok(LoggingHandle {
        run_id: settings.run_id.clone(),
        guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::resolve(Path::new("/data/logs"), |name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_to_json_with_builtin_filter() {
        let settings = resolve(&[]);
        assert_eq!(settings.log_path, Path::new("/data/logs/server.log"));
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.filter, DEFAULT_FILTER);
        assert!(!settings.truncate_on_start);
        assert!(settings.run_id.starts_with("pid-"));
    }

    #[test]
    fn prefixed_vars_override_rust_log() {
        let settings = resolve(&[
            ("TOOLRELAY_LOG_FORMAT", "Pretty"),
            ("TOOLRELAY_LOG_FILTER", "debug"),
            ("TOOLRELAY_LOG_TRUNCATE", "1"),
            ("TOOLRELAY_LOG_RUN_ID", "run-7"),
            ("RUST_LOG", "warn"),
        ]);
        assert_eq!(settings.format, LogFormat::Pretty);
        assert_eq!(settings.filter, "debug");
        assert!(settings.truncate_on_start);
        assert_eq!(settings.run_id, "run-7");
    }

    #[test]
    fn rust_log_is_the_filter_fallback() {
        assert_eq!(resolve(&[("RUST_LOG", "warn")]).filter, "warn");
        assert_eq!(
            resolve(&[("TOOLRELAY_LOG_FILTER", "  ")]).filter,
            DEFAULT_FILTER
        );
    }
}
