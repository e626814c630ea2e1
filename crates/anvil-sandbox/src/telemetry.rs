//! Tracing initialisation for anvil binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! because the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "ANVIL_LOG";
/// Set to `json` to force JSON output.
pub const LOG_FORMAT_ENV: &str = "ANVIL_LOG_FORMAT";

/// Initialise the global tracing subscriber.
///
/// * `json` emits newline-delimited JSON; `ANVIL_LOG_FORMAT=json` forces it.
/// * `level` is the default verbosity when neither `ANVIL_LOG` nor
///   `RUST_LOG` is set.
///
/// Logs go to stderr so stdout stays clean for verdicts and `--json` output.
pub fn init_tracing(json: bool, level: Level) {
    let json = json || json_requested();
    let env_filter = filter_from_env().unwrap_or_else(|| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

fn filter_from_env() -> Option<EnvFilter> {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .ok()
}

fn json_requested() -> bool {
    std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
