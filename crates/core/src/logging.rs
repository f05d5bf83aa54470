//! Logging
//!
//! Structured logging through `tracing`, as human-readable text or JSON lines,
//! selected at runtime. All output goes to stderr so stdout stays free for the
//! output of processes run in build containers.
//!
//! ## Environment Variables
//!
//! * `STEVEDORE_LOG_FORMAT` - `json` for JSON lines, anything else for text
//! * `STEVEDORE_LOG` - filter directives, e.g. `stevedore_core=debug`
//! * `RUST_LOG` - fallback filter when `STEVEDORE_LOG` is unset
//! * `STEVEDORE_LOG_SPAN_EVENTS` - span lifecycle events to log
//!   (`new`, `close`, `enter`, `exit`, `active`, `full`, `none`; comma separated)

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FORMAT_ENV: &str = "STEVEDORE_LOG_FORMAT";
pub const LOG_FILTER_ENV: &str = "STEVEDORE_LOG";
pub const LOG_SPAN_EVENTS_ENV: &str = "STEVEDORE_LOG_SPAN_EVENTS";

static INIT: Once = Once::new();

/// Initialize logging; later calls are no-ops
///
/// `format` is `"text"` or `"json"`; when `None` the format comes from
/// `STEVEDORE_LOG_FORMAT`, defaulting to text. `level` overrides the
/// environment filter when given.
///
/// ```rust
/// use stevedore_core::logging;
///
/// logging::init(None, None).expect("Failed to initialize logging");
/// ```
pub fn init(format: Option<&str>, level: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter(level);

        let env_format = std::env::var(LOG_FORMAT_ENV).ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");
        let span_events = span_events_for_format(effective_format);

        match effective_format {
            "json" => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {}", effective_format);
    });

    Ok(())
}

fn create_env_filter(level: Option<&str>) -> EnvFilter {
    if let Some(level) = level {
        return EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    }
    if let Ok(spec) = std::env::var(LOG_FILTER_ENV) {
        EnvFilter::try_new(&spec).unwrap_or_else(|_| {
            tracing::warn!(
                "Invalid {} specification '{}', using default 'info'",
                LOG_FILTER_ENV,
                spec
            );
            EnvFilter::new("info")
        })
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Span lifecycle events: env override, else new+close for JSON and none for text
fn span_events_for_format(format: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    if let Ok(raw) = std::env::var(LOG_SPAN_EVENTS_ENV) {
        return parse_span_events(&raw);
    }

    match format {
        "json" => FmtSpan::NEW | FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    }
}

fn parse_span_events(raw: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    let mut acc = FmtSpan::NONE;
    for token in raw.split(&[',', '|'][..]).map(|t| t.trim().to_lowercase()) {
        acc |= match token.as_str() {
            "new" => FmtSpan::NEW,
            "close" => FmtSpan::CLOSE,
            "enter" => FmtSpan::ENTER,
            "exit" => FmtSpan::EXIT,
            "active" => FmtSpan::ACTIVE,
            "full" => FmtSpan::FULL,
            _ => FmtSpan::NONE,
        };
    }
    acc
}

pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmt::format::FmtSpan;

    #[test]
    fn test_init_multiple_calls_safe() {
        assert!(init(None, None).is_ok());
        assert!(init(Some("json"), Some("debug")).is_ok());
        assert!(init(Some("invalid"), None).is_ok());
        assert!(is_initialized());
    }

    #[test]
    fn test_explicit_level_wins_and_bad_level_falls_back() {
        let _filter = create_env_filter(Some("stevedore_core=trace"));
        let _filter = create_env_filter(Some("invalid_spec_@@=="));
    }

    #[test]
    fn test_parse_span_events() {
        assert_eq!(parse_span_events("new,close"), FmtSpan::NEW | FmtSpan::CLOSE);
        assert_eq!(parse_span_events("none"), FmtSpan::NONE);
        assert_eq!(parse_span_events(" FULL "), FmtSpan::FULL);
        assert_eq!(parse_span_events("bogus"), FmtSpan::NONE);
    }
}
