//! Bootstrap utilities for domo binaries.

/// Environment variable controlling log verbosity.
pub const LOG_ENV_VAR: &str = "DOMO_LOG";

/// Initialize tracing from the `DOMO_LOG` environment variable.
///
/// Defaults to "info" when unset.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
