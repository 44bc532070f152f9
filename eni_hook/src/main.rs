use std::process;

use eni_hook_lib::config::{self, Config};
use eni_hook_lib::imds::ImdsClient;
use eni_hook_lib::interface::{self, Interface};
use eni_hook_lib::logging;
use eni_hook_lib::trigger::Trigger;

mod cli;
mod lock;
mod reconcile;

use lock::InterfaceLock;
use reconcile::{RealNetOps, Reconciler};

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn setup_logging(args: &cli::Cli) -> Result<(), exitcode::ExitCode> {
    match &args.log_file {
        Some(path) => logging::setup_log_file(path, args.debug).map_err(|err| {
            eprintln!("unable to open log file {}: {err}", path.display());
            exitcode::IOERR
        }),
        None => {
            logging::setup_stderr(args.debug);
            Ok(())
        }
    }
}

fn trigger(args: &cli::Cli) -> Result<Trigger, exitcode::ExitCode> {
    Trigger::from_raw(&args.hook, args.interface.as_deref(), args.mask.as_deref()).map_err(|err| {
        tracing::error!(error = %err, hook = %args.hook, "invalid trigger");
        exitcode::USAGE
    })
}

async fn load_config(args: &cli::Cli) -> Result<Config, exitcode::ExitCode> {
    config::load(&args.config_path).await.map_err(|err| {
        tracing::error!(error = %err, path = %args.config_path.display(), "unable to load configuration");
        exitcode::CONFIG
    })
}

async fn resolve_interface(config: &Config, name: &str) -> Result<Interface, exitcode::ExitCode> {
    Interface::from_system(&config.system.sysfs_net, name, &config.routing)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, interface = %name, "unable to resolve interface");
            match err {
                interface::Error::NotFound(_) => exitcode::NOINPUT,
                interface::Error::NoOrdinal(_) | interface::Error::TableOverflow(_) => exitcode::CONFIG,
                interface::Error::NoMac(_) | interface::Error::IO(_) => exitcode::IOERR,
            }
        })
}

async fn run(args: cli::Cli) -> Result<(), exitcode::ExitCode> {
    let trigger = trigger(&args)?;
    let config = load_config(&args).await?;
    let iface = resolve_interface(&config, &trigger.interface).await?;
    tracing::info!(hook = %trigger.hook, interface = %iface, mask_bits = trigger.mask_bits, "handling DHCP event");

    let _lock = InterfaceLock::acquire(&config.system.lock_dir, &iface.name)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "unable to lock interface");
            exitcode::IOERR
        })?;

    let metadata = ImdsClient::from_config(&config.metadata).map_err(|err| {
        tracing::error!(error = %err, "unable to create metadata client");
        exitcode::SOFTWARE
    })?;

    let reconciler = Reconciler::new(RealNetOps, metadata, config.polling.clone());
    let report = reconciler
        .reconcile(&iface, trigger.mask_bits)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "reconciliation aborted");
            match err {
                reconcile::Error::Ipv4Unavailable { .. } => exitcode::UNAVAILABLE,
                _ => exitcode::SOFTWARE,
            }
        })?;

    if report.failures() > 0 {
        tracing::warn!(
            failures = report.failures(),
            mutations = report.mutations(),
            "interface partially converged"
        );
    } else {
        tracing::info!(mutations = report.mutations(), "interface converged");
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = cli::parse();

    if let Err(code) = setup_logging(&args) {
        process::exit(code);
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    match run(args).await {
        Ok(_) => (),
        Err(exitcode::OK) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}
