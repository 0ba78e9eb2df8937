//! Tracing subscriber setup for hosts that embed the bridge.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber writing to stderr.
///
/// Level comes from `PATCHBAY_LOG` (trace/debug/info/warn/error, default
/// info); `LOG_FORMAT=json` switches to JSON output. Safe to call more
/// than once: later calls are no-ops.
pub fn init() {
    let filter = match EnvFilter::try_from_env("PATCHBAY_LOG") {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info"),
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
