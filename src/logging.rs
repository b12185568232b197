//! Console logging for the command-line tool.

use tracing_subscriber::EnvFilter;

/// Install a coloured fmt subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the level is `info`, or `debug` once
/// `verbose` is non-zero, which also shows every command sent to a bus.
pub fn init(verbose: u8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let default_level = if verbose > 0 { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init()
}
