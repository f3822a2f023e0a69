use std::io;
/// Structured logging utilities for regscan
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize structured logging with optional JSON output
pub fn init_logging(json_output: bool, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let default_directive = if verbose { "regscan=debug" } else { "regscan=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let registry = Registry::default().with(env_filter);

    if json_output {
        // JSON output for log aggregation
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::NONE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

/// Shortens a digest for log output: `sha256:abcdef12...` -> `abcdef12`
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map(|(_, h)| h).unwrap_or(digest);
    match hex.char_indices().nth(12) {
        Some((end, _)) => &hex[..end],
        None => hex,
    }
}

#[macro_export]
macro_rules! log_layer_fetch {
    ($digest:expr, $size:expr) => {
        tracing::debug!(
            layer = %$crate::logging::short_digest(&$digest),
            size_bytes = $size,
            "Layer fetched"
        );
    };
}

#[macro_export]
macro_rules! log_register_attempt {
    ($attempt:expr, $db_version:expr) => {
        tracing::info!(
            attempt = $attempt,
            db_version = %$db_version,
            "Registering with controller"
        );
    };
}

#[macro_export]
macro_rules! log_manifest_fetch {
    ($name:expr, $reference:expr, $schema:expr, $digest:expr) => {
        tracing::debug!(
            name = %$name,
            reference = %$reference,
            schema = ?$schema,
            digest = %$digest,
            "Manifest fetched"
        );
    };
}

/// Lifecycle events emitted by the scanner
#[derive(Debug, Clone)]
pub enum ScanEvent {
    DatabaseLoaded { version: String, entries: usize },
    Registered { scanner_id: String },
    SessionEnded { scanner_id: String },
    Deregistered { scanner_id: String },
    ImageResolved { reference: String, digest: String, layers: usize },
}

impl std::fmt::Display for ScanEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DatabaseLoaded { version, entries } => {
                write!(f, "Database {} loaded ({} entries)", version, entries)
            }
            Self::Registered { scanner_id } => write!(f, "Scanner {} registered", scanner_id),
            Self::SessionEnded { scanner_id } => {
                write!(f, "Controller ended session of scanner {}", scanner_id)
            }
            Self::Deregistered { scanner_id } => {
                write!(f, "Scanner {} deregistered", scanner_id)
            }
            Self::ImageResolved {
                reference,
                digest,
                layers,
            } => write!(
                f,
                "Resolved {} to {} ({} layers)",
                reference,
                short_digest(digest),
                layers
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_digest_strips_algorithm() {
        assert_eq!(
            short_digest("sha256:0123456789abcdef0123"),
            "0123456789ab"
        );
        assert_eq!(short_digest("abc"), "abc");
    }

    #[test]
    fn test_short_digest_keeps_multibyte_chars_whole() {
        assert_eq!(short_digest("sha256:aaaaaaaaaaaé00"), "aaaaaaaaaaaé");
        assert_eq!(short_digest("sha256:ééé"), "ééé");
    }

    #[test]
    fn test_image_resolved_event_formatting() {
        let event = ScanEvent::ImageResolved {
            reference: "library/alpine:3.19".to_string(),
            digest: "sha256:deadbeefcafe0000".to_string(),
            layers: 3,
        };
        let display = event.to_string();
        assert!(display.contains("library/alpine:3.19"));
        assert!(display.contains("deadbeefcafe"));
        assert!(display.contains("3 layers"));
    }

    #[test]
    fn test_database_event_formatting() {
        let event = ScanEvent::DatabaseLoaded {
            version: "2.870".to_string(),
            entries: 42,
        };
        assert_eq!(event.to_string(), "Database 2.870 loaded (42 entries)");
    }
}
