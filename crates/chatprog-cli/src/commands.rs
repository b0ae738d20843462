//! CLI subcommand implementations.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use tokio::io::{AsyncBufReadExt, BufReader};

use chatprog_core::client::{self, SessionSender};
use chatprog_core::crypto::Identity;
use chatprog_core::protocol::{Command, CommandKind, Payload, ServerMsg};
use chatprog_core::server::{Server, ServerConfig};

/// Run the chat server until ctrl-c.
pub async fn serve(bind: String, port: u16, managers: Vec<String>, tick_ms: u64) -> Result<()> {
    let config = ServerConfig {
        bind,
        port,
        manager_names: managers,
        tick: Duration::from_millis(tick_ms),
        ..ServerConfig::default()
    };
    let server = Server::bind(config).await.context("failed to bind listener")?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    server.run().await.context("server terminated abnormally")
}

/// Connect to a server and chat from the terminal.
pub async fn chat(host: &str, name: &str, port: u16) -> Result<()> {
    println!("Generating identity...");
    let identity = Identity::generate().context("failed to generate identity")?;

    let session = client::connect(host, port, name, &identity)
        .await
        .context("failed to join the chat")?;
    println!("Connected as {name}. Type /help for commands, /quit to leave.");

    let (mut sender, mut receiver) = session.split();
    let recv_task = tokio::spawn(async move {
        loop {
            match receiver.receive().await {
                Ok(Some(payload)) => render(&payload),
                Ok(None) => {
                    println!("Connection closed by server.");
                    break;
                }
                Err(e) => {
                    eprintln!("Receive error: {e}");
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match dispatch_line(&mut sender, &line).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => eprintln!("{e:#}"),
        }
    }

    // the server closes our connection once the quit is processed
    if timeout_join(recv_task).await.is_err() {
        eprintln!("Receive loop did not finish cleanly.");
    }
    Ok(())
}

async fn timeout_join(task: tokio::task::JoinHandle<()>) -> std::result::Result<(), ()> {
    match tokio::time::timeout(Duration::from_secs(2), task).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(()),
        Err(_) => Err(()),
    }
}

/// Turn one input line into protocol traffic. Returns `Ok(true)` on quit.
async fn dispatch_line(sender: &mut SessionSender, line: &str) -> Result<bool> {
    if !line.starts_with('/') {
        sender.send(&Payload::Msg(line.to_string())).await?;
        return Ok(false);
    }

    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");
    match command {
        "/help" => {
            sender
                .send(&Payload::Command(Command::no_args(CommandKind::Help)))
                .await?
        }
        "/quit" => {
            sender.send(&Payload::quit()).await?;
            return Ok(true);
        }
        "/view-managers" => {
            sender
                .send(&Payload::Command(Command::no_args(CommandKind::ViewManagers)))
                .await?
        }
        "/list" => {
            sender
                .send(&Payload::Command(Command::no_args(CommandKind::List)))
                .await?
        }
        "/tell" => {
            let target = parts.next().unwrap_or("");
            let msg = parts.collect::<Vec<_>>().join(" ");
            sender
                .send(&Payload::Command(Command::tell(target, msg)))
                .await?
        }
        "/kick" | "/promote" | "/demote" | "/mute" | "/unmute" => {
            let kind = match command {
                "/kick" => CommandKind::Kick,
                "/promote" => CommandKind::Promote,
                "/demote" => CommandKind::Demote,
                "/mute" => CommandKind::Mute,
                _ => CommandKind::Unmute,
            };
            let target = parts.next().unwrap_or("");
            sender
                .send(&Payload::Command(Command::one_arg(kind, target)))
                .await?
        }
        "/send-file" => {
            let path = parts.next().unwrap_or("");
            if path.is_empty() {
                eprintln!("Usage: /send-file <path>");
                return Ok(false);
            }
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {path}"))?;
            let filename = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string());
            sender.send(&Payload::FileAttachSend { filename }).await?;
            sender.send(&Payload::Bytes(data)).await?;
        }
        "/download" => {
            let descriptor = parts.next().unwrap_or("");
            sender
                .send(&Payload::Msg(format!("DOWNLOAD:{descriptor}")))
                .await?;
        }
        _ => eprintln!("Unknown command, try /help."),
    }
    Ok(false)
}

/// Print one received payload.
fn render(payload: &Payload) {
    match payload {
        Payload::Server(msg) => println!("{}", format_server_msg(msg)),
        Payload::FileAttachRecv(notice) => println!(
            "* {} shared a file: {} ({})",
            notice.sender, notice.filename, notice.id
        ),
        Payload::Bytes(data) => println!("* received {} bytes", data.len()),
        Payload::Msg(text) => println!("{text}"),
        _ => {}
    }
}

/// `[HH:MM] name: msg`, or `[HH:MM] msg` for system messages.
fn format_server_msg(msg: &ServerMsg) -> String {
    let time = Local
        .timestamp_opt(msg.timestamp as i64, 0)
        .single()
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    if msg.is_system() {
        format!("[{time}] {}", msg.msg)
    } else {
        format!("[{time}] {}: {}", msg.name, msg.msg)
    }
}
