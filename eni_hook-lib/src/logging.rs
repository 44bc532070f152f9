use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: &str = "info";
const DEBUG_LOG_FILTER: &str = "debug";

pub const ENV_VAR_LOG_FILE: &str = "ENI_HOOK_LOG_FILE";
pub const ENV_VAR_DEBUG: &str = "ENI_HOOK_DEBUG";

/// Filter from `RUST_LOG`, falling back to `info`, or `debug` when requested.
fn filter(debug: bool) -> EnvFilter {
    let fallback = if debug { DEBUG_LOG_FILTER } else { DEFAULT_LOG_FILTER };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Appends plain log lines to `log_path`.
///
/// Fails if the file cannot be opened or created. Panics if a global
/// subscriber has already been set.
pub fn setup_log_file(log_path: &Path, debug: bool) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
        .with(filter(debug))
        .init();
    tracing::debug!(log_file = %log_path.display(), "logging initialized with file output");
    Ok(())
}

/// Logs to stderr, leaving stdout to the DHCP client.
///
/// Panics if a global subscriber has already been set.
pub fn setup_stderr(debug: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_ansi(false))
        .with(filter(debug))
        .init();
    tracing::debug!("logging initialized with stderr output");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_raises_default_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(filter(false).to_string(), "info");
        assert_eq!(filter(true).to_string(), "debug");
    }
}
