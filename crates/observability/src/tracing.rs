//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Log output format.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line (default; what log shippers expect).
    #[default]
    Json,
    /// Human-readable text for local development.
    Pretty,
}

impl LogFormat {
    /// Parse a format name; unknown names fall back to JSON.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    /// Read the format from `LOG_FORMAT`, defaulting to JSON.
    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

/// Initialize tracing/logging for the process.
///
/// Filtering is configurable via `RUST_LOG` (default `info`).
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.with_target(true).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats() {
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(" TEXT "), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("whatever"), LogFormat::Json);
    }

    #[test]
    fn init_twice_is_harmless() {
        init(LogFormat::Pretty);
        init(LogFormat::Json);
    }
}
