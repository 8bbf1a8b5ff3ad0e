use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    config::{load_settings_from, DEFAULT_CONFIG_FILE},
    ClientEvent, MessagingClient,
};
use shared::domain::{DeliveryStatus, LocalIdentity, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Headless host: mounts the messaging client, prints its events and sends
/// every stdin line to the open counterpart.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    counterpart: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let settings = load_settings_from(&args.config)?;
    let display_name = args.display_name.unwrap_or_else(|| args.user_id.clone());
    let identity = LocalIdentity::new(args.user_id, display_name);
    let client =
        MessagingClient::new(identity, settings).context("failed to build messaging client")?;

    let mut events = client.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "console: events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    client.mount().await;
    if let Some(counterpart) = args.counterpart {
        if let Err(err) = client.select_counterpart(UserId::from(counterpart)).await {
            warn!(error = %err, "console: could not open conversation");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(err) = client.send_message(line).await {
            eprintln!("! {}", err.alert_text());
        }
    }

    client.unmount().await;
    printer.abort();
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::ConnectionStateChanged(state) => println!("[hub] {state:?}"),
        ClientEvent::MessageAppended(message) => {
            let arrow = if message.is_local_sender { ">" } else { "<" };
            println!("{arrow} {}: {}", message.counterpart(), message.body);
        }
        ClientEvent::DeliveryUpdated { status, .. } => {
            if *status == DeliveryStatus::Failed {
                println!("! last message was not delivered");
            }
        }
        ClientEvent::ThreadLoaded {
            counterpart,
            messages,
        } => {
            println!("-- conversation with {counterpart} ({} messages)", messages.len());
            for message in messages {
                let who = if message.is_local_sender { "me" } else { message.sender_id.as_str() };
                println!("   {} {who}: {}", message.sent_at.format("%H:%M"), message.body);
            }
        }
        ClientEvent::ConversationsUpdated(conversations) => {
            println!("[directory] {} conversations", conversations.len());
        }
        ClientEvent::ConversationTouched(conversation) => {
            println!(
                "[directory] {}: {}",
                conversation.display_name, conversation.last_message
            );
        }
        ClientEvent::InterestRequestsUpdated(requests) => {
            for request in requests {
                println!(
                    "[interest] {} from {} for job {}: {:?}",
                    request.id, request.requester_name, request.job_post_id, request.status
                );
            }
        }
        ClientEvent::Notification(alert) => {
            println!(
                "[notification] {}: {}",
                alert.notification.sender_name, alert.notification.message
            );
        }
        ClientEvent::AlertExpired(_) => {}
        ClientEvent::Alert { message } => println!("! {message}"),
        ClientEvent::Error(message) => eprintln!("error: {message}"),
    }
}
