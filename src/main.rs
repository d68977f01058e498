use anyhow::{Context, Result};
use clap::Parser;
use siprelay::config::Config;
use siprelay::SipServer;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "siprelay",
    about = "SIP registrar and proxy with an RTP media relay",
    version
)]
struct Cli {
    /// Configuration file (TOML); SIPRELAY__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the log level (RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("load configuration")?;
    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    init_tracing(cli.log_level.as_deref().unwrap_or(&config.logging.level));

    info!("Starting siprelay");
    let server = SipServer::start(&config)
        .await
        .context("start SIP server")?;
    info!("Commands: make-call <from> <to>, list-registrations, list-calls, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&server, line.trim()).await {
                        break;
                    }
                }
                // stdin closed; keep serving until Ctrl-C
                Ok(None) => {
                    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
                    break;
                }
                Err(e) => {
                    error!("Failed to read console input: {}", e);
                    break;
                }
            }
        }
    }

    server.stop().await;
    Ok(())
}

/// Returns false when the console asked to quit
async fn run_command(server: &SipServer, line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => {}
        ["make-call", from, to] => match server.make_call(from, to).await {
            Ok(call_id) => println!("Calling {} -> {} ({})", from, to, call_id),
            Err(e) => println!("make-call failed: {}", e),
        },
        ["list-registrations"] => {
            let registrations = server.registrations().await;
            if registrations.is_empty() {
                println!("No registrations");
            }
            for r in registrations {
                println!(
                    "{:<12} {:<22} expires {}",
                    r.extension,
                    r.contact,
                    r.expires_at().format("%H:%M:%S")
                );
            }
        }
        ["list-calls"] => {
            let calls = server.active_calls().await;
            if calls.is_empty() {
                println!("No calls");
            }
            for call in calls {
                println!(
                    "{}  {} -> {}  {}",
                    call.call_id, call.caller, call.callee, call.state
                );
            }
        }
        ["quit"] | ["exit"] => return false,
        _ => println!("Unknown command: {}", line),
    }
    true
}

fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => EnvFilter::new(value),
        Err(_) => EnvFilter::new(level),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}
