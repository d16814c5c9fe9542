//! Telemetry
//!
//! Sets up `tracing-subscriber` for hosts embedding the marketplace. Pretty
//! output in debug builds, JSON with span context in release builds. HTTP
//! client internals stay at `warn` so registry traffic does not drown out
//! install progress.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::MarketplaceConfig;

/// Crates whose chatter is capped at `warn` regardless of the chosen level
const QUIET_TARGETS: &[&str] = &["hyper", "reqwest", "rustls", "h2"];

/// Filter directive used when `RUST_LOG` is unset
fn default_filter(log_level: &str) -> String {
    let mut directives = vec![
        log_level.to_string(),
        format!("nexus_marketplace={}", log_level),
        format!("pluginsdk={}", log_level),
    ];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{}=warn", target)));
    directives.join(",")
}

/// Initialize the tracing subscriber with the given log level.
///
/// Priority: `RUST_LOG` env var > `log_level` parameter > default "info".
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(log_level)));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .ok();
    }
}

/// Initialize at the level named in `marketplace.toml`
pub fn init_telemetry_from_config(config: &MarketplaceConfig) {
    init_telemetry_with_level(&config.log_level);
}

/// Initialize with the "info" level unless `RUST_LOG` says otherwise
pub fn init_telemetry() {
    init_telemetry_with_level("info");
}
