//! Subscriber setup for the CLI
//!
//! The library only emits `tracing` events and spans; installing a subscriber
//! is the application's job. This module builds the registry the
//! `imgly-upscale` binary uses: an `EnvFilter` derived from `-v` flags (or an
//! explicit directive), console/compact/JSON formatting and optional file output.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Line format of the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TracingFormat {
    /// Colored human-readable lines
    #[default]
    Console,
    /// Uncolored single lines for CI logs
    Compact,
    /// One JSON object per event
    #[cfg(feature = "tracing-json")]
    Json,
}

impl std::str::FromStr for TracingFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "console" => Ok(Self::Console),
            "compact" => Ok(Self::Compact),
            #[cfg(feature = "tracing-json")]
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Where events are written
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TracingOutput {
    #[default]
    Console,
    #[cfg(feature = "tracing-files")]
    File(std::path::PathBuf),
    #[cfg(feature = "tracing-files")]
    Both(std::path::PathBuf),
}

/// Keeps the non-blocking file writer alive; dropping it flushes pending lines
#[derive(Debug, Default)]
#[must_use = "file output stops when the guard is dropped"]
pub struct TracingGuard {
    #[cfg(feature = "tracing-files")]
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

#[derive(Debug, Default)]
pub struct TracingConfig {
    /// 0 = info, 1 = debug, 2+ = trace
    pub verbosity: u8,
    pub format: TracingFormat,
    pub output: TracingOutput,
    /// Explicit filter directive; wins over `verbosity`
    pub env_filter: Option<String>,
    /// Correlates every line of one CLI invocation
    pub session_id: Option<String>,
}

impl TracingConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: TracingOutput) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn with_session_id<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Filter directive for the verbosity level. Third-party crates stay at
    /// `warn` below trace so backend runtimes do not flood the output.
    #[must_use]
    pub fn verbosity_to_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn,imgly_upscale=info",
            1 => "warn,imgly_upscale=debug",
            _ => "trace",
        }
    }

    fn filter(&self) -> anyhow::Result<EnvFilter> {
        let directive = self
            .env_filter
            .as_deref()
            .unwrap_or_else(|| self.verbosity_to_filter());
        Ok(EnvFilter::try_new(directive)?)
    }

    /// Install the global subscriber.
    ///
    /// # Errors
    /// Fails on an invalid filter directive or when a subscriber is already set.
    pub fn init(self) -> anyhow::Result<TracingGuard> {
        let registry = Registry::default().with(self.filter()?);
        #[allow(unused_mut)]
        let mut guard = TracingGuard::default();

        match &self.output {
            TracingOutput::Console => match self.format {
                TracingFormat::Console => registry
                    .with(fmt::layer().with_target(false).compact())
                    .try_init()?,
                TracingFormat::Compact => registry
                    .with(fmt::layer().with_ansi(false).with_target(false).compact())
                    .try_init()?,
                #[cfg(feature = "tracing-json")]
                TracingFormat::Json => registry
                    .with(fmt::layer().json().with_current_span(true).with_span_list(true))
                    .try_init()?,
            },
            #[cfg(feature = "tracing-files")]
            TracingOutput::File(path) | TracingOutput::Both(path) => {
                let directory = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| std::path::Path::new("."));
                let file_name = path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("imgly-upscale.log"));
                let (writer, file_guard) =
                    tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
                guard._file = Some(file_guard);

                let file_layer = fmt::layer().with_ansi(false).with_writer(writer);
                let console_layer = matches!(self.output, TracingOutput::Both(_))
                    .then(|| fmt::layer().with_target(false).compact());
                registry.with(file_layer).with(console_layer).try_init()?;
            },
        }

        if let Some(session_id) = &self.session_id {
            tracing::info!(%session_id, "🚀 Upscale session started");
        }
        Ok(guard)
    }
}

/// Subscriber with CLI defaults and a fresh session id
///
/// # Errors
/// See [`TracingConfig::init`].
pub fn init_cli_tracing(verbosity: u8, format: TracingFormat) -> anyhow::Result<TracingGuard> {
    TracingConfig::new()
        .with_verbosity(verbosity)
        .with_format(format)
        .with_session_id(uuid::Uuid::new_v4().to_string())
        .init()
}

/// Spans shared by the CLI commands
pub mod spans {
    use tracing::{Level, Span};

    pub fn file(path: &std::path::Path, scale: u32) -> Span {
        tracing::span!(Level::INFO, "file", path = %path.display(), scale)
    }

    pub fn batch(file_count: usize, concurrency: usize) -> Span {
        tracing::span!(Level::INFO, "batch", file_count, concurrency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(
            TracingConfig::new().verbosity_to_filter(),
            "warn,imgly_upscale=info"
        );
        assert_eq!(
            TracingConfig::new().with_verbosity(1).verbosity_to_filter(),
            "warn,imgly_upscale=debug"
        );
        assert_eq!(TracingConfig::new().with_verbosity(7).verbosity_to_filter(), "trace");
    }

    #[test]
    fn test_explicit_filter_wins() {
        let config = TracingConfig::new()
            .with_verbosity(2)
            .with_env_filter("imgly_upscale::backends=debug");
        assert!(config.filter().is_ok());
        assert!(TracingConfig::new().with_env_filter("imgly_upscale=loud").filter().is_err());
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("compact".parse::<TracingFormat>().unwrap(), TracingFormat::Compact);
        assert!("xml".parse::<TracingFormat>().is_err());
    }
}
