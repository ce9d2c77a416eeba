//! Subscriber setup for scanetl binaries
//!
//! Engine components never hold a logger. They emit `tracing` events inside
//! `stage`, `lane` and `provider` spans; the binary decides where those go by
//! installing one subscriber through [`init_logging`].
//!
//! Environment overrides, all optional:
//!
//! | variable | values |
//! |---|---|
//! | `SCANETL_LOG_LEVEL` | `trace`, `debug`, `info`, `warn`, `error` |
//! | `SCANETL_LOG_OUTPUT` | `console`, `file`, `both` |
//! | `SCANETL_LOG_FORMAT` | `text`, `json` |
//! | `SCANETL_LOG_DIR` | directory for daily rolled files |
//! | `SCANETL_LOG_FILTER` | extra directives, e.g. `scanetl_engine::sink=trace` |
//!
//! ```no_run
//! use scanetl_common::logging::{init_logging, LogConfig};
//!
//! let config = LogConfig::cli(true).merge_env().unwrap_or_default();
//! let _guard = init_logging(&config).ok();
//! tracing::info!(stage = "masscan", "stage started");
//! ```

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Directives applied before user filters; client crates are chatty at debug.
const QUIET_DEPENDENCIES: &[&str] = &[
    "sqlx=warn",
    "hyper=info",
    "hyper_util=info",
    "reqwest=info",
    "suppaftp=info",
    "html5ever=warn",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" => Ok(LogOutput::Both),
            other => Err(anyhow!("unknown log output `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("unknown log format `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub level: Level,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Where daily files go when `output` includes a file
    pub log_dir: PathBuf,
    /// File name prefix, `scanetl` gives `scanetl.2026-10-18`
    pub file_prefix: String,
    pub filter: Option<String>,
    /// Log span close events with their busy/idle time
    pub span_timings: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("logs"),
            file_prefix: "scanetl".to_string(),
            filter: None,
            span_timings: false,
        }
    }
}

impl LogConfig {
    /// Console config for the command line; `verbose` lowers the level to
    /// debug and turns on span timings.
    pub fn cli(verbose: bool) -> Self {
        Self {
            level: if verbose { Level::DEBUG } else { Level::INFO },
            span_timings: verbose,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Overlay `SCANETL_LOG_*` variables on `self`
    pub fn merge_env(self) -> Result<Self> {
        self.merge_from(|key| std::env::var(key).ok())
    }

    fn merge_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(level) = lookup("SCANETL_LOG_LEVEL") {
            self.level = level
                .parse()
                .map_err(|_| anyhow!("unknown log level `{}`", level))?;
        }
        if let Some(output) = lookup("SCANETL_LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Some(format) = lookup("SCANETL_LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(dir) = lookup("SCANETL_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(filter) = lookup("SCANETL_LOG_FILTER") {
            self.filter = Some(filter);
        }
        Ok(self)
    }
}

/// Keeps the non-blocking file writer alive; drop it at exit to flush
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = build_filter(config)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut file_guard = None;

    if config.output.console() {
        layers.push(fmt_layer(config, std::io::stderr, true));
    }

    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("cannot create log directory {}", config.log_dir.display())
        })?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(config, writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(LoggingGuard { _file: file_guard })
}

/// `RUST_LOG` first, then the level, the dependency defaults and the
/// configured directives; later directives win for the same target.
fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let extra = config.filter.as_deref().unwrap_or_default();
    let directives = QUIET_DEPENDENCIES
        .iter()
        .copied()
        .chain(extra.split(','))
        .map(str::trim)
        .filter(|d| !d.is_empty());

    for directive in directives {
        let parsed = directive
            .parse()
            .with_context(|| format!("bad log filter directive `{}`", directive))?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let spans = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_span_events(spans);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().with_current_span(true).boxed(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_cli_verbosity() {
        assert_eq!(LogConfig::cli(false).level, Level::INFO);
        let verbose = LogConfig::cli(true);
        assert_eq!(verbose.level, Level::DEBUG);
        assert!(verbose.span_timings);
    }

    #[test]
    fn test_env_overrides_cli_flag() {
        let config = LogConfig::cli(true)
            .merge_from(env(&[
                ("SCANETL_LOG_LEVEL", "warn"),
                ("SCANETL_LOG_OUTPUT", "both"),
                ("SCANETL_LOG_FORMAT", "JSON"),
                ("SCANETL_LOG_DIR", "/var/log/scanetl"),
            ]))
            .unwrap();

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.output, LogOutput::Both);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.log_dir, PathBuf::from("/var/log/scanetl"));
        // untouched by the environment
        assert!(config.span_timings);
    }

    #[test]
    fn test_bad_env_values_are_errors() {
        assert!(LogConfig::default()
            .merge_from(env(&[("SCANETL_LOG_LEVEL", "loud")]))
            .is_err());
        assert!(LogConfig::default()
            .merge_from(env(&[("SCANETL_LOG_OUTPUT", "syslog")]))
            .is_err());
    }

    #[test]
    fn test_filter_directives() {
        let mut config = LogConfig::default();
        config.filter = Some("scanetl_engine::sink=trace, ".to_string());
        assert!(build_filter(&config).is_ok());

        config.filter = Some("sqlx=notalevel".to_string());
        assert!(build_filter(&config).is_err());
    }
}
