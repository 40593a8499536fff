//! Structured logging setup, following the grounding codebase's
//! `cmd_util::env` service-init convention: a compact or JSON `fmt` layer
//! gated by `EnvFilter`, defaulting to `info` when `RUST_LOG` is unset.

use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Call once from the process entry point. `LOG_FORMAT=json` switches to
/// structured JSON output for log aggregation; anything else is compact.
pub fn init_service_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE);

    let result = match std::env::var("LOG_FORMAT") {
        Ok(s) if s == "json" => builder.json().try_init(),
        _ => builder.compact().try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized");
    }
}

/// Call from `#[cfg(test)]` setup. Non-fatal if another test already
/// initialized it.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init();
}
