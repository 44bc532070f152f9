use clap::Parser;

use std::path::PathBuf;

use eni_hook_lib::{config, logging, trigger};

/// EC2 interface address hook - converges an interface's addresses, policy rules
/// and routing table onto what the instance metadata service reports
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// DHCP client event (post-bound or post-renew)
    pub hook: String,

    /// Interface the DHCP event is about
    #[arg(long, env = trigger::ENV_VAR_INTERFACE)]
    pub interface: Option<String>,

    /// IPv4 prefix length of the lease
    #[arg(long, env = trigger::ENV_VAR_MASK)]
    pub mask: Option<String>,

    /// General configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
    )]
    pub config_path: PathBuf,

    /// Enable debug logging
    #[arg(long, env = logging::ENV_VAR_DEBUG)]
    pub debug: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, env = logging::ENV_VAR_LOG_FILE)]
    pub log_file: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
