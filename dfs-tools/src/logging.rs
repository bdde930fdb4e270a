//! Logging backend selection. Call sites throughout the workspace only ever
//! use the `log` facade (`log::{trace,debug,info,warn,error}`); this module
//! is the single place that picks a concrete subscriber.

use anyhow::{Context, Result};

/// Installs a logger for a long-running daemon.
///
/// `syslog` picks `syslog::Facility::LOG_DAEMON` so the process can run
/// under traditional process supervision without re-plumbing call sites.
/// Otherwise `env_logger` is installed, honoring `RUST_LOG` with `filter`
/// as the default when the environment variable is unset.
pub fn init(binary_name: &'static str, syslog: bool, filter: &str) -> Result<()> {
    if syslog {
        let formatter = self::syslog::Formatter3164 {
            facility: self::syslog::Facility::LOG_DAEMON,
            hostname: None,
            process: binary_name.into(),
            pid: std::process::id(),
        };
        let logger =
            self::syslog::unix(formatter).context("failed to connect to the syslog socket")?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .context("a logger was already installed")?;
        log::set_max_level(log::LevelFilter::Info);
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

// Re-exported so callers don't need a direct `syslog` dependency just to
// name `Facility`/`BasicLogger` in their own main().
pub use ::syslog;
