//! Logging setup.
//!
//! Besides the usual `RUST_LOG` / level-string filters, the server accepts
//! a numeric verbosity tier:
//!
//! | tier | filter | what shows up |
//! |------|--------|---------------|
//! | 0    | off    | nothing |
//! | 1-2  | info   | startup, shutdown, protocol violations |
//! | 3-7  | debug  | connections opening and closing, greetings |
//! | 8-9  | trace  | PING, every received line, state transitions |

use crate::config::Config;
use tracing_subscriber::EnvFilter;

/// Map a verbosity tier to a filter directive.
pub fn verbosity_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "off",
        1..=2 => "info",
        3..=7 => "debug",
        _ => "trace",
    }
}

/// Pick the filter directive: `RUST_LOG` wins, then verbosity, then level.
fn filter_directive(config: &Config) -> String {
    match config.verbosity {
        Some(tier) => verbosity_filter(tier).to_string(),
        None => config.log_level.clone(),
    }
}

/// Initialize the global subscriber.
pub fn init(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
