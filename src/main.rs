// Headless Wavechat client. Connects the sync engine to a server and maps
// stdin lines to intents; useful for demos and manual protocol testing.
// The real UI subscribes to the same channels this binary prints from.

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use wavechat::auth::{NullAttachmentStore, StaticTokenProvider};
use wavechat::sync::{StoreUpdate, SyncError};
use wavechat::utils::setup_logging;
use wavechat::{ChatClient, SyncConfig};

#[derive(Parser, Debug)]
#[command(name = "wavechat", about = "Headless realtime chat client")]
struct Args {
    /// Websocket endpoint of the chat server
    #[arg(long, default_value = "ws://localhost:8080/ws")]
    server: String,

    /// Local user id
    #[arg(long)]
    user: String,

    /// Bearer token for the realtime connection
    #[arg(long)]
    token: String,

    /// Optional log file; defaults to stdout
    #[arg(long)]
    log_file: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    setup_logging(args.log_file.as_deref(), level)?;

    let config = SyncConfig::new(args.server);
    let client = ChatClient::new(
        args.user,
        config,
        Arc::new(StaticTokenProvider::new(args.token)),
        Arc::new(NullAttachmentStore),
    );
    client.initialize().await?;

    let mut updates = client.subscribe_updates();
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            match update {
                StoreUpdate::MessageAdded { conversation_id, message } => {
                    println!("[{}] {}: {}", conversation_id, message.sender_id, message.text);
                }
                StoreUpdate::MessageUpdated { message, .. } => {
                    println!("(updated {} -> {})", message.id, message.status.as_str());
                }
                StoreUpdate::TypingChanged { conversation_id, is_typing } => {
                    if is_typing {
                        println!("({} is typing...)", conversation_id);
                    }
                }
                StoreUpdate::PresenceChanged { user_id, state } => {
                    println!("({} is now {})", user_id, state.as_str());
                }
                other => log::debug!("store update: {:?}", other),
            }
        }
    });

    let mut errors = client.subscribe_errors();
    tokio::spawn(async move {
        while let Some(err) = errors.recv().await {
            match err {
                SyncError::Auth(reason) => eprintln!("auth error: {}", reason),
                other => eprintln!("error: {}", other),
            }
        }
    });

    println!("Commands: /open <id>, /status, /quit, or '<recipient> <text>' to send.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        client.note_activity().await;

        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if line == "/status" {
            let status = client.connection_status();
            println!(
                "connection: {:?} (socket ready: {}, attempts: {})",
                status.state, status.socket_ready, status.attempts
            );
            continue;
        }
        if let Some(id) = line.strip_prefix("/open ") {
            client.set_active(id.trim()).await?;
            println!("active conversation: {}", id.trim());
            continue;
        }

        match line.split_once(' ') {
            Some((to, text)) => {
                let msg = client.send_message(to, text, Vec::new(), None).await?;
                println!("(sent {} as {})", msg.id, msg.status.as_str());
            }
            None => println!("usage: <recipient> <text>"),
        }
    }

    client.cleanup().await;
    Ok(())
}
