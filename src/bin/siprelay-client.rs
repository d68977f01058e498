//! Demo user agent: registers an extension, optionally calls another one,
//! and prints what happens until Ctrl-C.

use anyhow::{bail, Context, Result};
use clap::Parser;
use siprelay::config::Config;
use siprelay::{ClientAgent, ClientEvent};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "siprelay-client", about = "SIP test client for siprelay", version)]
struct Cli {
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extension to register as
    #[arg(short, long)]
    username: Option<String>,

    #[arg(short, long)]
    password: Option<String>,

    /// Server address
    #[arg(long)]
    server: Option<IpAddr>,

    #[arg(long)]
    server_port: Option<u16>,

    /// Call this extension once registered
    #[arg(long)]
    call: Option<String>,

    /// Hang up after this many seconds of talk time
    #[arg(long)]
    duration: Option<u64>,

    /// Digits to send as DTMF once a call connects
    #[arg(long)]
    dtmf: Option<String>,

    /// Reject incoming calls instead of answering them
    #[arg(long)]
    no_answer: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("load configuration")?;
    init_tracing(&config.logging.level);

    let mut client = config.client;
    if let Some(username) = cli.username {
        client.username = username;
    }
    if let Some(password) = cli.password {
        client.password = password;
    }
    if let Some(server) = cli.server {
        client.server_host = server;
    }
    if let Some(port) = cli.server_port {
        client.server_port = port;
    }
    if cli.no_answer {
        client.auto_answer = false;
    }

    let (agent, mut events) = ClientAgent::start(client)
        .await
        .context("start client agent")?;
    agent.register().await?;

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ClientEvent::Registered { expires } => {
                info!("Registered for {}s", expires);
                if let Some(target) = cli.call.as_deref() {
                    agent.call(target).await?;
                }
            }
            ClientEvent::RegistrationFailed { status } => bail!("registration failed with {}", status),
            ClientEvent::RegistrationTimeout => bail!("registration timed out"),
            ClientEvent::AuthenticationFailed { attempts } => {
                bail!("authentication failed after {} attempts", attempts)
            }
            ClientEvent::IncomingCall { call_id, from } => info!("Incoming call {} from {}", call_id, from),
            ClientEvent::CallRinging { call_id } => info!("Ringing ({})", call_id),
            ClientEvent::CallAnswered { call_id, remote_media } => {
                info!("Call {} connected, sending audio to {}", call_id, remote_media);
                for digit in cli.dtmf.as_deref().unwrap_or_default().chars() {
                    agent.send_dtmf(&call_id, digit).await?;
                }
                if let Some(secs) = cli.duration {
                    tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                    agent.hangup(&call_id).await?;
                }
            }
            ClientEvent::CallFailed { call_id, status } => warn!("Call {} failed with {}", call_id, status),
            ClientEvent::CallEnded { call_id } => {
                let stats = agent.media_stats().await;
                info!(
                    "Call {} ended: {} packets sent, {} received",
                    call_id, stats.packets_sent, stats.packets_received
                );
            }
        }
    }

    agent.stop().await;
    Ok(())
}

fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = std::env::var(EnvFilter::DEFAULT_ENV)
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}
