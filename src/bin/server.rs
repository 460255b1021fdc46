//! agentlink server binary
//!
//! Usage: agentlink-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to a JSON configuration file
//!   --psk <SECRET>       Run on a free loopback port with this secret
//!   -h, --help           Print help information

use std::env;

use agentlink::pake::Psk;
use agentlink::server::{Server, ServerConfig, ServerConfigFile};
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            let content = std::fs::read_to_string(&args[2])?;
            let file: ServerConfigFile = serde_json::from_str(&content)?;
            run_server(file.to_config()?).await?;
        }
        "--psk" => {
            if args.len() < 3 {
                eprintln!("Error: --psk requires a secret");
                return Ok(());
            }
            let mut config = ServerConfig::new(Psk::new(&args[2]));
            if args.iter().any(|a| a == "--tls") {
                config = config.with_tls();
            }
            run_server(config).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"agentlink reference server

USAGE:
    agentlink-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to a JSON configuration file
    --psk <SECRET> [--tls]  Run on a free loopback port with this secret
    -h, --help              Print help information

EXAMPLE CONFIGURATION:
    {{
        "listen_addr": "127.0.0.1",
        "listen_port": 8443,
        "tls": true,
        "psk": "change me",
        "padding": 256,
        "session_timeout": "1h"
    }}
"#
    );
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    config.validate()?;

    let server = Server::new(config)?;
    let metrics = server.command().metrics().clone();
    tracing::info!(
        public_key = %hex::encode(server.command().pake().public_key()),
        "OPAQUE server key"
    );

    let (ready_tx, ready_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(server.run(ready_tx, shutdown_rx));

    if let Ok(addr) = ready_rx.await {
        tracing::info!(%addr, "ready; press Ctrl-C to stop");
    }

    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(());
    task.await??;

    println!("{}", metrics.format_report());
    Ok(())
}
