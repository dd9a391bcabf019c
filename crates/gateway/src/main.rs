//! edge-gateway - Edge Telemetry Gateway
//!
//! Usage:
//!   edge-gateway [OPTIONS] [gateway.toml]
//!
//! Without a config file the built-in defaults apply. Any key can be
//! overridden with `GATEWAY__SECTION__KEY` environment variables.

use gateway::{init_logging, init_metrics, Gateway, GatewayConfig};
use std::path::PathBuf;
use tracing::info;

/// Parsed command-line arguments
struct Args {
    config_path: Option<PathBuf>,
    check_only: bool,
}

fn parse_args() -> Args {
    let mut result = Args {
        config_path: None,
        check_only: false,
    };

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--check" => result.check_only = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("edge-gateway {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => result.config_path = Some(PathBuf::from(arg)),
            _ => eprintln!("Unknown argument: {}", arg),
        }
    }

    result
}

fn print_help() {
    eprintln!(
        r#"edge-gateway - Edge Telemetry Gateway

USAGE:
    edge-gateway [OPTIONS] [CONFIG]

ARGS:
    [CONFIG]    Configuration file (TOML, YAML or JSON)

OPTIONS:
    --check          Validate the configuration and exit
    -h, --help       Print help
    -V, --version    Print version

ENVIRONMENT:
    GATEWAY__<SECTION>__<KEY>    Override a configuration key
    RUST_LOG                     Log filter, overrides logging.level
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    let config = GatewayConfig::load(args.config_path.as_deref())?;

    if args.check_only {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_logging(&config.logging);
    info!("=== Edge Telemetry Gateway v{} ===", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &args.config_path {
        info!("Configuration loaded from {}", path.display());
    }

    if let Some(listen) = &config.metrics.listen {
        init_metrics(listen)?;
    }

    let gateway = Gateway::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");

    let snapshot = gateway.shutdown().await;
    info!(
        "Stopped: {} frames accepted, {} batches sealed, {} published",
        snapshot.ingestion.accepted, snapshot.offline.batches_sealed, snapshot.publisher.published
    );
    Ok(())
}
