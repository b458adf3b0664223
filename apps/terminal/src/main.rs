use anyhow::{anyhow, Result};
use chat_core::{ChatClient, ClientEvent, ViewportInstruction};
use clap::Parser;
use shared::domain::{ConversationId, MessageContent, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    credential: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(credential) = args.credential {
        settings.credential = Some(credential);
    }
    let credential = settings
        .credential
        .ok_or_else(|| anyhow!("no credential; pass --credential or set CHAT_CREDENTIAL"))?;

    let client = ChatClient::with_http(&settings.server_url, &credential)?;
    println!("signed in as user {}", client.user_id().0);

    let push_task = client.connect_push(&settings.server_url)?;
    client.refresh_conversations().await?;

    let mut events = client.subscribe_events();
    let printer = client.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&printer, event).await;
        }
    });

    println!("commands: list | open <conversation> | send <peer> <text> | older | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "list" => {
                for summary in client.conversations().await {
                    println!(
                        "{:<16} {:<20} unread={} {}",
                        summary.conversation_id.0,
                        summary.display_name,
                        summary.unread_count,
                        summary.last_message_preview.as_deref().unwrap_or("")
                    );
                }
            }
            "open" => {
                let conversation_id = ConversationId(rest.trim().to_string());
                if let Err(err) = client.open_conversation(conversation_id).await {
                    warn!(error = %err, "open failed");
                }
            }
            "older" => {
                if let Err(err) = client.load_older_messages().await {
                    warn!(error = %err, "older page fetch failed");
                }
            }
            "send" => {
                let Some((peer, text)) = rest.split_once(' ') else {
                    println!("usage: send <peer> <text>");
                    continue;
                };
                let Ok(peer_id) = peer.parse::<i64>() else {
                    println!("peer must be a numeric user id");
                    continue;
                };
                if let Err(err) = client
                    .send_message(UserId(peer_id), MessageContent::text(text), None)
                    .await
                {
                    warn!(error = %err, "send failed");
                }
            }
            "quit" | "exit" => break,
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }

    push_task.abort();
    Ok(())
}

async fn print_event(client: &ChatClient, event: ClientEvent) {
    match event {
        ClientEvent::ConversationsUpdated(conversations) => {
            println!("-- {} conversations --", conversations.len());
        }
        ClientEvent::TimelineUpdated {
            conversation_id,
            viewport,
        } => {
            if client.active_conversation().await.as_ref() != Some(&conversation_id) {
                return;
            }
            let messages = client.timeline(&conversation_id).await;
            match viewport {
                Some(ViewportInstruction::PreserveScrollPosition { prepended }) => {
                    println!("-- {prepended} older messages loaded --");
                }
                Some(_) | None => {}
            }
            if let Some(message) = messages.last() {
                println!(
                    "[{}] {}: {} ({:?})",
                    message.created_at.format("%H:%M:%S"),
                    message.sender_id.0,
                    message.content.preview(),
                    message.status
                );
            }
        }
        ClientEvent::MessageFailed {
            conversation_id, ..
        } => {
            println!("!! send failed in {}", conversation_id.0);
        }
        ClientEvent::LinkPreviewReady {
            conversation_id,
            message_id,
        } => {
            println!(
                "-- link preview ready for message {} in {} --",
                message_id.0, conversation_id.0
            );
        }
        ClientEvent::Error(message) => {
            println!("!! {message}");
        }
    }
}
