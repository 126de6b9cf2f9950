//! # parley-chat
//!
//! Terminal client for the Parley chat relay.
//!
//! ```bash
//! parley-chat --name alice
//! parley-chat --server 10.0.0.5:5050
//! ```
//!
//! Type a line and press enter to send it. `/quit`, end of input, or
//! Ctrl+C leaves the chat.

use anyhow::{bail, Context, Result};
use clap::Parser;
use parley_client::{ChatClient, EchoFilter, Notification, DEFAULT_SERVER};
use parley_protocol::{chat_line, split_sender};
use std::io::{BufRead, Write};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "parley-chat", version, about = "Terminal client for Parley")]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = DEFAULT_SERVER)]
    server: String,

    /// Nickname shown before your messages
    #[arg(short, long)]
    name: Option<String>,
}

const QUIT_COMMAND: &str = "/quit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_client=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut input = spawn_stdin_reader();

    let name = match cli.name {
        Some(name) => name.trim().to_string(),
        None => prompt_name(&mut input).await?,
    };
    if name.is_empty() {
        bail!("Nickname must not be empty");
    }

    let (mut client, mut inbox) = ChatClient::connect(cli.server.as_str(), name)
        .await
        .context("Could not join the chat")?;
    println!("*** Connected to {} as {}", client.peer(), client.nickname());

    let mut echo = EchoFilter::new();

    loop {
        tokio::select! {
            line = input.recv() => {
                let Some(line) = line else { break };
                if line.trim() == QUIT_COMMAND {
                    break;
                }
                match client.send(&line).await {
                    Ok(true) => echo.sent(chat_line(client.nickname(), &line)),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, "Send failed");
                        break;
                    }
                }
            }
            notification = inbox.recv() => match notification {
                Some(Notification::Message(line)) => {
                    if echo.should_display(&line) {
                        match split_sender(&line) {
                            Some((name, text)) => println!("[{name}] {text}"),
                            None => println!("{line}"),
                        }
                    }
                }
                Some(Notification::Closed) | None => {
                    println!("*** Server closed the connection");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await;
    println!("*** Disconnected");
    Ok(())
}

/// Read stdin on a plain thread so a pending read never holds up runtime
/// shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn prompt_name(input: &mut mpsc::UnboundedReceiver<String>) -> Result<String> {
    loop {
        print!("Nickname: ");
        std::io::stdout().flush()?;
        match input.recv().await {
            Some(line) if !line.trim().is_empty() => return Ok(line.trim().to_string()),
            Some(_) => continue,
            None => bail!("No nickname given"),
        }
    }
}
