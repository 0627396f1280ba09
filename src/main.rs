//! Keywire CLI
//!
//! Runs any of the three roles: the relay server, a desktop receiver,
//! or a terminal sender.

use clap::{Parser, Subcommand};
use keywire::{
    config::Config,
    executor::Executor,
    keymap::LoggingSimulator,
    policy::{Modifiers, PolicyGate},
    sender::{SendResult, SenderSession},
    sequence::PersistedCounter,
    server::{self, ServerConfig},
    transport::{PullChannel, PushChannel},
    VERSION,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keywire")]
#[command(version = VERSION)]
#[command(about = "Remote keystroke relay between a phone and a desktop", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Port to listen on (0 for random)
        #[arg(long, default_value = "3000")]
        port: u16,
    },

    /// Run a desktop receiver that executes incoming keystrokes
    Receive {
        /// Room to join (omit for local mode over the push transport)
        #[arg(long)]
        room: Option<String>,

        /// Transport to use: push or pull
        #[arg(long, default_value = "push")]
        transport: String,

        /// Relay base URL (defaults to the configured one)
        #[arg(long)]
        server: Option<String>,
    },

    /// Run a terminal sender reading lines from stdin
    Send {
        /// Room to join (omit for local mode)
        #[arg(long)]
        room: Option<String>,

        /// Relay base URL (defaults to the configured one)
        #[arg(long)]
        server: Option<String>,
    },

    /// Show or change configuration
    Config {
        /// Enable or disable the sanitize check
        #[arg(long)]
        sanitize: Option<bool>,

        /// Enable or disable the shortcut denylist
        #[arg(long)]
        denylist_enabled: Option<bool>,

        /// Replace the denylist (comma-separated shortcut tokens)
        #[arg(long)]
        denylist: Option<String>,

        /// Set the relay base URL
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => cmd_serve(port).await,
        Commands::Receive {
            room,
            transport,
            server,
        } => cmd_receive(room, &transport, server).await,
        Commands::Send { room, server } => cmd_send(room, server).await,
        Commands::Config {
            sanitize,
            denylist_enabled,
            denylist,
            server,
        } => cmd_config(sanitize, denylist_enabled, denylist, server),
    }
}

async fn cmd_serve(port: u16) -> anyhow::Result<()> {
    let (addr, shutdown) = server::run(ServerConfig::new(port)).await?;
    println!("Keywire relay v{VERSION} listening on http://{addr}");
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    let _ = shutdown.send(());
    println!("Shutting down");
    Ok(())
}

async fn cmd_receive(
    room: Option<String>,
    transport: &str,
    server: Option<String>,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let base_url = server.unwrap_or_else(|| config.server_url.clone());
    let executor = Executor::new(LoggingSimulator);

    println!("Keywire receiver v{VERSION}");
    match room {
        Some(ref room) => println!("Room: {room}"),
        None => println!("Local mode"),
    }
    println!("Press Ctrl+C to stop");

    match transport {
        "push" => {
            let join = room.map(|r| (r, keywire::protocol::Role::Receiver));
            let mut channel = PushChannel::connect(&Config::ws_url_for(&base_url), join).await?;
            tokio::select! {
                result = executor.run(&mut channel) => result?,
                _ = tokio::signal::ctrl_c() => println!("\nStopping receiver"),
            }
        }
        "pull" => {
            let room = room
                .ok_or_else(|| anyhow::anyhow!("the pull transport requires --room"))?;
            let mut channel = PullChannel::new(&base_url, &room)?
                .with_intervals(config.poll_interval, config.poll_backoff);
            tokio::select! {
                result = executor.run(&mut channel) => result?,
                _ = tokio::signal::ctrl_c() => println!("\nStopping receiver"),
            }
        }
        other => anyhow::bail!("unknown transport '{other}' (expected push or pull)"),
    }
    Ok(())
}

async fn cmd_send(room: Option<String>, server: Option<String>) -> anyhow::Result<()> {
    let config = Config::load()?;
    config.ensure_directories()?;
    let base_url = server.unwrap_or_else(|| config.server_url.clone());

    let mut gate = PolicyGate::with_denylist_csv(&config.denylist);
    gate.sanitize_enabled = config.sanitize_enabled;
    gate.denylist_enabled = config.denylist_enabled;
    let counter = PersistedCounter::load(&config.counter_path)?;

    let (mut session, mut status_rx) = SenderSession::connect_with_timeout(
        &Config::ws_url_for(&base_url),
        room.clone(),
        gate,
        counter,
        config.ack_timeout,
    )
    .await?;

    println!("Keywire sender v{VERSION}");
    match room {
        Some(ref room) => println!("Room: {room}"),
        None => println!("Local mode"),
    }
    println!("Type a line to send it as a block of text.");
    println!("  /key <Name>   send a single key (e.g. /key Enter)");
    println!("  /word <text>  send one word (trailing space added)");
    println!("Press Ctrl+C or close stdin to stop.");

    let status_task = tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            println!("  [{status}]");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.is_empty() {
            continue;
        }

        let result = if let Some(key) = line.strip_prefix("/key ") {
            match session.send_key(key.trim(), Modifiers::default()).await? {
                SendResult::Sent(id) => Some(id),
                SendResult::Rejected => {
                    println!("  [rejected by sanitization]");
                    None
                }
                SendResult::Blocked(token) => {
                    println!("  [blocked shortcut: {token}]");
                    None
                }
            }
        } else if let Some(word) = line.strip_prefix("/word ") {
            Some(session.send_word(word).await?)
        } else {
            Some(session.send_block(&line).await?)
        };

        if result.is_none() && !session.is_connected() {
            break;
        }
    }

    session.shutdown().await;
    status_task.abort();
    println!("Sender session closed");
    Ok(())
}

fn cmd_config(
    sanitize: Option<bool>,
    denylist_enabled: Option<bool>,
    denylist: Option<String>,
    server: Option<String>,
) -> anyhow::Result<()> {
    let mut config = Config::load()?;

    let changed =
        sanitize.is_some() || denylist_enabled.is_some() || denylist.is_some() || server.is_some();
    if let Some(sanitize) = sanitize {
        config.sanitize_enabled = sanitize;
    }
    if let Some(enabled) = denylist_enabled {
        config.denylist_enabled = enabled;
    }
    if let Some(denylist) = denylist {
        config.denylist = denylist;
    }
    if let Some(server) = server {
        config.server_url = server;
    }
    if changed {
        config.save()?;
        println!("Configuration saved.");
        println!();
    }

    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
