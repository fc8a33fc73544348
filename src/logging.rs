//! `tracing-subscriber` initialisation shared by both binaries. Level and
//! format come from config so an operator can flip to JSON logs in a
//! container without touching code.

use tracing_subscriber::EnvFilter;

/// Maps the config's `fatal` level onto tracing's `error`, the closest
/// built-in level; `tracing` has no separate fatal level.
fn normalize_level(level: &str) -> &str {
    match level {
        "fatal" => "error",
        other => other,
    }
}

/// Installs the global subscriber. Call once, at the very top of `main`,
/// before any other module logs.
pub fn init(level: &str, format: &str) {
    let filter = EnvFilter::try_new(normalize_level(level)).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
