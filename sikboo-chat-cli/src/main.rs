//! Sikboo Chat CLI
//!
//! Terminal client for group purchase chats: browse history, follow the live
//! feed and send messages.

mod config;
mod diagnostics;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use diagnostics::{ChatCommand, Cli};
use sikboo_chat_protocol::{
    ChatMessage, ChatRoom, ConversationId, HttpHistoryClient, LoadOutcome, MessageCache,
    ProtocolError, StompClient,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// How often idle conversations are dropped from the cache while watching
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared services for one CLI invocation
struct Services {
    config: Config,
    client: Arc<StompClient>,
    history: Arc<HttpHistoryClient>,
    cache: MessageCache,
}

impl Services {
    fn new(config: Config) -> Result<Self> {
        let history = HttpHistoryClient::new(&config.history_config())
            .context("Failed to create history client")?;
        let client = StompClient::websocket(config.connection_config());
        let cache = MessageCache::new(config.cache_config());

        Ok(Self {
            config,
            client: Arc::new(client),
            history: Arc::new(history),
            cache,
        })
    }

    async fn open_room(&self, conversation: ConversationId, member: Option<i64>) -> ChatRoom {
        ChatRoom::open(
            conversation,
            member.or(self.config.chat.member_id),
            self.client.clone(),
            self.history.clone(),
            self.cache.clone(),
            self.config.room_config(),
        )
        .await
    }

    async fn shutdown(&self, mut room: ChatRoom) {
        room.close().await;
        self.client.close().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let result = match cli.command {
        ChatCommand::Watch {
            conversation,
            pages,
            member,
        } => watch(config, conversation, pages, member).await,
        ChatCommand::History {
            conversation,
            pages,
            size,
        } => history(config, conversation, pages, size).await,
        ChatCommand::Count { conversation } => count(config, conversation).await,
        ChatCommand::Send {
            conversation,
            text,
            http,
            member,
        } => send(config, conversation, &text, http, member).await,
        ChatCommand::DumpConfig { show_sensitive } => dump_config(&config, show_sensitive),
    };

    if let Err(error) = result {
        eprintln!("{}", describe_error(&error));
        std::process::exit(1);
    }
    Ok(())
}

/// Error text for the terminal, using the core's user facing wording when available
fn describe_error(error: &anyhow::Error) -> String {
    let Some(protocol) = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ProtocolError>())
    else {
        return format!("Error: {:#}", error);
    };

    let mut text = format!("{}: {}", error, protocol.user_message());
    if protocol.requires_user_action() {
        text.push_str(" Check the configuration and arguments.");
    } else if protocol.is_recoverable() {
        text.push_str(" Run the command again to retry.");
    }
    text
}

/// Load the newest page plus up to `pages - 1` older ones (`pages == 0` loads everything)
async fn load_pages(room: &ChatRoom, pages: usize) -> Result<()> {
    room.load_initial()
        .await
        .context("Failed to load message history")?;

    let mut loaded = 1;
    while pages == 0 || loaded < pages {
        match room.load_more().await.context("Failed to load older messages")? {
            LoadOutcome::Loaded { .. } => loaded += 1,
            LoadOutcome::AlreadyLoaded
            | LoadOutcome::Exhausted
            | LoadOutcome::InFlight
            | LoadOutcome::Discarded => break,
        }
    }
    Ok(())
}

async fn watch(
    config: Config,
    conversation: ConversationId,
    pages: usize,
    member: Option<i64>,
) -> Result<()> {
    let services = Services::new(config)?;
    let room = services.open_room(conversation, member).await;
    let mut updates = room.updates();

    if let Err(e) = services
        .client
        .wait_until_connected(services.config.connect_timeout())
        .await
    {
        warn!("Live feed unavailable: {}", e);
        eprintln!("{}", e.user_message());
    }

    if let Err(e) = load_pages(&room, pages).await {
        services.shutdown(room).await;
        return Err(e);
    }

    let view = room.messages().await;
    for message in &view {
        println!("{}", format_message(message));
    }
    // History is complete before following, so from here the view only grows at the end
    let mut printed = view.len();

    if room.member_id().is_none() {
        eprintln!("No member id configured, sending is disabled");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut sweep = tokio::time::interval(CACHE_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) if update.conversation != conversation => {}
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    let view = room.messages().await;
                    for message in view.iter().skip(printed) {
                        println!("{}", format_message(message));
                    }
                    printed = view.len();
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line.context("Failed to read stdin")? {
                Some(text) if text.trim().is_empty() => {}
                Some(text) => {
                    if !room.send(&text) {
                        eprintln!("Not sent (connection {})", room.connection_state());
                    }
                }
                None => stdin_open = false,
            },
            _ = sweep.tick() => {
                let evicted = services.cache.evict_expired().await;
                if evicted > 0 {
                    debug!("Dropped {} idle conversations", evicted);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    services.shutdown(room).await;
    Ok(())
}

async fn history(
    mut config: Config,
    conversation: ConversationId,
    pages: usize,
    size: Option<usize>,
) -> Result<()> {
    if let Some(size) = size {
        config.chat.page_size = size;
    }
    let services = Services::new(config)?;
    let room = services.open_room(conversation, None).await;

    let loaded = load_pages(&room, pages).await;
    if loaded.is_ok() {
        let view = room.messages().await;
        for message in &view {
            println!("{}", format_message(message));
        }
        if room.has_more().await {
            eprintln!("({} messages shown, older history available)", view.len());
        }
    }

    services.shutdown(room).await;
    loaded
}

async fn count(config: Config, conversation: ConversationId) -> Result<()> {
    let services = Services::new(config)?;
    let room = services.open_room(conversation, None).await;

    let total = room.message_count().await;
    services.shutdown(room).await;

    println!("{}", total.context("Failed to fetch message count")?);
    Ok(())
}

async fn send(
    config: Config,
    conversation: ConversationId,
    text: &str,
    http: bool,
    member: Option<i64>,
) -> Result<()> {
    let services = Services::new(config)?;
    let room = services.open_room(conversation, member).await;

    let result = if http {
        room.send_via_http(text)
            .await
            .map(|created| println!("{}", format_message(&created)))
            .context("Failed to post message")
    } else {
        match services
            .client
            .wait_until_connected(services.config.connect_timeout())
            .await
        {
            Ok(()) if room.send(text) => Ok(()),
            Ok(()) => Err(anyhow::anyhow!(
                "Message was not sent (empty text or no member id)"
            )),
            Err(e) => Err(anyhow::Error::new(e).context("Live connection unavailable")),
        }
    };

    services.shutdown(room).await;
    result
}

fn dump_config(config: &Config, show_sensitive: bool) -> Result<()> {
    let shown = if show_sensitive {
        config.clone()
    } else {
        config.redacted()
    };
    let text = toml::to_string_pretty(&shown).context("Failed to serialize config")?;
    print!("{}", text);
    Ok(())
}

/// One line per message: `[time] sender: text`
fn format_message(message: &ChatMessage) -> String {
    let time = message
        .sent_at()
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "--".to_string());
    let sender = match &message.member_name {
        Some(name) => format!("{} (#{})", name, message.member_id),
        None => format!("#{}", message.member_id),
    };
    format!("[{}] {}: {}", time, sender, message.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_protocol_error() {
        let error = anyhow::Error::new(ProtocolError::HttpStatus {
            status: 404,
            body: String::new(),
        })
        .context("Failed to load message history");
        assert_eq!(
            describe_error(&error),
            "Failed to load message history: This group purchase no longer exists. \
             Check the configuration and arguments."
        );

        let error = anyhow::Error::new(ProtocolError::Timeout("count".to_string()));
        assert!(describe_error(&error).ends_with("Run the command again to retry."));

        let error = anyhow::anyhow!("stdin closed");
        assert_eq!(describe_error(&error), "Error: stdin closed");
    }

    #[test]
    fn test_format_message() {
        let mut message = ChatMessage::with_id(1, ConversationId::new(42), 7, "hello");
        assert_eq!(format_message(&message), "[--] #7: hello");

        message.member_name = Some("Mina".to_string());
        message.created_at = Some("2025-11-13T17:05:00".to_string());
        assert_eq!(format_message(&message), "[2025-11-13 17:05] Mina (#7): hello");
    }
}
