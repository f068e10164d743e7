use std::sync::Arc;

use anyhow::anyhow;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Crates of the media stack that log per packet at debug and below.
const MEDIA_STACK_TARGETS: &[&str] = &["webrtc", "webrtc_ice", "webrtc_srtp", "webrtc_dtls"];

/// Install the global subscriber for `config`.
///
/// `RUST_LOG` overrides the configured level. Forwarding components log
/// inside the span their owner hands them, so the peer and track fields
/// are attached to every event.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let directives = filter_directives(&config.level)?;
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(directives))?;

    let writer = match &config.file_path {
        Some(path) => BoxMakeWriter::new(Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer = if config.format == "json" {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()?;
    Ok(())
}

/// Filter for `level`, keeping the media stack at warn unless asked for less.
fn filter_directives(level: &str) -> anyhow::Result<String> {
    let level = match level.to_ascii_lowercase().as_str() {
        "warning" => Level::WARN,
        other => other
            .parse::<Level>()
            .map_err(|_| anyhow!("invalid log level: {level}"))?,
    };
    let media = level.min(Level::WARN).as_str().to_ascii_lowercase();

    let mut directives = level.as_str().to_ascii_lowercase();
    for target in MEDIA_STACK_TARGETS {
        directives.push_str(&format!(",{target}={media}"));
    }
    Ok(directives)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_stack_capped_at_warn() {
        let directives = filter_directives("TRACE").unwrap();
        assert!(directives.starts_with("trace,"));
        assert!(directives.contains(",webrtc=warn"));
        assert!(directives.contains(",webrtc_ice=warn"));
    }

    #[test]
    fn test_quieter_level_applies_to_media_stack() {
        let directives = filter_directives("error").unwrap();
        assert!(directives.starts_with("error,"));
        assert!(directives.contains(",webrtc=error"));
        assert_eq!(filter_directives("warning").unwrap(), filter_directives("warn").unwrap());
    }

    #[test]
    fn test_init_rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
        assert!(filter_directives("verbose").is_err());
    }
}
