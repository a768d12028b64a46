//! Process-wide tracing setup for hosts that load the bridge as a library.
//!
//! `THOTH_LOG` takes an `EnvFilter` directive (default `info`);
//! `THOTH_LOG_FORMAT=json` switches to JSON lines. Output goes to stderr.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub const ENV_LOG: &str = "THOTH_LOG";
pub const ENV_LOG_FORMAT: &str = "THOTH_LOG_FORMAT";

static INIT: Once = Once::new();

/// Install the subscriber once. A subscriber the host already installed
/// is left in place.
pub fn init() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var(ENV_LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        let _ = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
    });
}
