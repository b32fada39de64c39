//! Logger setup for the gateway binary. Library code only uses the `log` macros.

use env_logger::Env;

/// Initialise `env_logger` with `default_level`; `RUST_LOG` takes precedence.
/// Safe to call more than once.
pub fn init(default_level: &str) {
    let result = env_logger::Builder::from_env(Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .try_init();
    if result.is_ok() {
        log::debug!("Logging initialised at {}", default_level);
    }
}
