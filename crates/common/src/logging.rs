//! Logging utilities for reachability components.

use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Output format for the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Parse a format name as it appears in config files. Unknown names fall back to text.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(|n| n.trim().to_ascii_lowercase()) {
            Some(n) if n == "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Build the env filter, letting RUST_LOG override the configured level.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Build the stdout fmt layer in the requested format.
pub fn fmt_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_name() {
        assert_eq!(LogFormat::from_name(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::from_name(Some(" JSON ")), LogFormat::Json);
        assert_eq!(LogFormat::from_name(Some("text")), LogFormat::Text);
        assert_eq!(LogFormat::from_name(Some("pretty")), LogFormat::Text);
        assert_eq!(LogFormat::from_name(None), LogFormat::Text);
    }
}
