use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` picks the filter (default `info`),
/// `MAILBRIDGE_LOG_JSON=1` switches to JSON lines. Calling it twice is harmless.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let is_json = std::env::var("MAILBRIDGE_LOG_JSON").ok().as_deref() == Some("1");

    let result = if is_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("subscriber already installed");
    }
}
