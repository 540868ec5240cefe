//! `MarketChat` console client.
//!
//! Connects to the marketplace chat backend, opens one conversation and
//! keeps it in sync: sends are shown at once and reconciled with the server,
//! pushes and refetches are merged in, failures can be retried or discarded.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/marketchat/config.toml`).
//!
//! ```bash
//! # In-process fake server
//! cargo run --bin marketchat -- --demo
//!
//! # Live server
//! MARKETCHAT_TOKEN=... cargo run --bin marketchat -- \
//!     --api-url https://api.example.com --socket-url wss://api.example.com/ws \
//!     --user-id 42 --with 0f6b7e8a-2d1c-4b7a-9a51-3f1f2e4d5c6b
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use marketchat::api::ChatApi;
use marketchat::api::http::HttpApi;
use marketchat::api::memory::InMemoryApi;
use marketchat::chat::{ChatError, ChatEvent, ChatSession, reasons};
use marketchat::config::{CliArgs, ClientConfig};
use marketchat::connection::{ConnectionEvent, ConnectionManager};
use marketchat::presentation::{day_label, group_by_day};
use marketchat::sync::Message;
use marketchat::sync::delivery::DeliveryStatus;
use marketchat::transport::loopback::{LoopbackConnector, LoopbackServer};
use marketchat::transport::websocket::WsConnector;
use marketchat::transport::{Connector, Credential, SharedCredential};
use marketchat_proto::event::ServerEvent;
use marketchat_proto::ids::UserId;
use marketchat_proto::message::Draft;
use marketchat_proto::rest::Role;
use marketchat_proto::typing::TypingNotice;

const DEMO_ME: &str = "demo-buyer";
const DEMO_SELLER: &str = "7d1e0c52-4a8b-4f3e-9b61-2c5d8e9f0a13";

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = ClientConfig::load(&cli).map_err(|e| {
        eprintln!("Error: {e}");
        io::Error::other(e)
    })?;

    // Logs go to a file; stdout belongs to the conversation view.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!(demo = cli.demo, "marketchat starting");
    let result = if cli.demo {
        run_demo(&cli, &config).await
    } else {
        run_live(&cli, &config).await
    };
    tracing::info!("marketchat exiting");
    result
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("marketchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run_live(cli: &CliArgs, config: &ClientConfig) -> io::Result<()> {
    let Some(endpoints) = config.endpoints() else {
        eprintln!(
            "Missing server settings: --api-url, --socket-url, --user-id and --token \
             (or MARKETCHAT_TOKEN) are required. Use --demo to try the client offline."
        );
        return Ok(());
    };
    let credential = Arc::new(SharedCredential::new(Credential::new(
        endpoints.user_id.clone(),
        endpoints.token,
    )));
    let api = HttpApi::new(&endpoints.api_url, credential.clone(), config.rest_timeout)
        .map_err(io::Error::other)?;
    let connector = WsConnector::new(&endpoints.socket_url).map_err(io::Error::other)?;
    let connection = ConnectionManager::new(connector, credential, config.connection.clone());
    let (session, events) = ChatSession::new(
        endpoints.user_id,
        Arc::new(api),
        connection,
        config.chat.clone(),
    );
    run_console(&session, events, cli, config.role).await
}

async fn run_demo(cli: &CliArgs, config: &ClientConfig) -> io::Result<()> {
    let me = UserId::new(DEMO_ME);
    let seller = UserId::new(DEMO_SELLER);
    let api = InMemoryApi::new(me.clone());
    let (connector, server) = LoopbackConnector::create();

    let existing = api.add_conversation(Role::Buyer, UserId::new("lamp-shop"), "Vintage Lamp Shop");
    if api
        .seed_message(&existing, UserId::new("lamp-shop"), "Your lamp ships tomorrow.")
        .is_none()
    {
        tracing::warn!(conversation = %existing, "demo conversation missing, not seeded");
    }
    install_demo_seller(&api, &server, &me);

    let credential = Arc::new(SharedCredential::new(Credential::new(me.clone(), "demo")));
    let connection = ConnectionManager::new(connector, credential, config.connection.clone());
    let (session, events) =
        ChatSession::new(me, Arc::new(api), connection, config.chat.clone());

    let mut cli_args = CliArgs {
        with: cli.with.clone(),
        conversation: cli.conversation.clone(),
        ..CliArgs::default()
    };
    if cli_args.with.is_none() && cli_args.conversation.is_none() {
        cli_args.with = Some(seller.to_string());
    }
    run_console(&session, events, &cli_args, Role::Buyer).await
}

/// Make the fake backend behave like a live one: every persisted message is
/// pushed, and the seller answers the buyer after a short pause.
fn install_demo_seller(api: &InMemoryApi, server: &LoopbackServer, me: &UserId) {
    let replier = api.clone();
    let server = server.clone();
    let me = me.clone();
    api.on_persist(move |dto| {
        server.push(ServerEvent::NewMessage(dto.clone()));
        if dto.message.sender_id != me {
            return;
        }
        let (api, server, conversation) =
            (replier.clone(), server.clone(), dto.conversation_id.clone());
        let seller = UserId::new(DEMO_SELLER);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            server.push(ServerEvent::TypingStart(TypingNotice {
                user_id: seller.clone(),
            }));
            tokio::time::sleep(Duration::from_millis(1500)).await;
            server.push(ServerEvent::TypingStop(TypingNotice {
                user_id: seller.clone(),
            }));
            if let Some(reply) = api.seed_message(&conversation, seller, "Yes, it's still available!")
            {
                server.push(ServerEvent::NewMessage(reply));
            }
        });
    });
}

/// One console session: open the requested conversation, then interleave
/// stdin commands with session events until `/quit` or EOF.
async fn run_console<A: ChatApi, C: Connector>(
    session: &ChatSession<A, C>,
    mut events: mpsc::Receiver<ChatEvent>,
    cli: &CliArgs,
    role: Role,
) -> io::Result<()> {
    if let Err(e) = session.connect().await {
        println!("* Could not connect ({e}); retrying in the background");
    }
    if let Err(e) = session.load_conversations(role).await {
        println!("* Conversation list unavailable: {e}");
    }

    let opened = match (&cli.with, &cli.conversation) {
        (Some(with), _) => session.open_with(&UserId::new(with.as_str()), with).await,
        (None, Some(raw)) => session.open_raw(raw).await,
        (None, None) => {
            print_conversations(session);
            println!("* Use /open <key> to open a conversation");
            Err(ChatError::NoOpenConversation)
        }
    };
    match opened {
        Ok(key) => {
            println!("* Opened {key}");
            render(session);
        }
        Err(ChatError::NoOpenConversation) => {}
        Err(e) => println!("* {e}"),
    }
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_line(session, line.trim()).await {
                    break;
                }
            }
            Some(event) = events.recv() => show_event(session, &event),
        }
    }
    session.logout().await;
    Ok(())
}

/// Handles one input line. Returns `false` to quit.
async fn handle_line<A: ChatApi, C: Connector>(session: &ChatSession<A, C>, line: &str) -> bool {
    let (command, argument) = line.split_once(' ').unwrap_or((line, ""));
    let argument = argument.trim();
    match command {
        "" => {}
        "/quit" | "/exit" => return false,
        "/help" => print_help(),
        "/list" => print_conversations(session),
        "/refresh" => match session.refresh_open().await {
            Ok(()) => render(session),
            Err(e) => println!("* {e}"),
        },
        "/reconnect" => {
            if let Err(e) = session.retry_connection().await {
                println!("* {e}");
            }
        }
        "/search" => match session.search(argument).await {
            Ok(_) => print_conversations(session),
            Err(e) => println!("* {e}"),
        },
        "/open" => match session.open_raw(argument).await {
            Ok(key) => {
                println!("* Opened {key}");
                render(session);
            }
            Err(e) => println!("* {e}"),
        },
        "/retry" | "/discard" => {
            let Some(message) = nth_own_message(session, argument) else {
                println!("* No message #{argument}");
                return true;
            };
            let Some(client_id) = message.client_id else {
                println!("* Message #{argument} is already delivered");
                return true;
            };
            let result = if command == "/retry" {
                session.retry(&client_id).await
            } else {
                session.discard(&client_id)
            };
            if let Err(e) = result {
                println!("* {e}");
            }
        }
        _ if command.starts_with('/') => println!("* Unknown command {command}"),
        _ => {
            session.input_changed(line).await;
            match session.send(Draft::text(line)).await {
                Ok(_) => {}
                Err(ChatError::Validation(e)) => println!("* {}", reasons::describe_validation(&e)),
                Err(e) => println!("* {e}"),
            }
        }
    }
    true
}

fn nth_own_message<A: ChatApi, C: Connector>(
    session: &ChatSession<A, C>,
    argument: &str,
) -> Option<Message> {
    let index: usize = argument.parse().ok()?;
    session
        .open_thread()
        .into_iter()
        .nth(index.checked_sub(1)?)
        .filter(|m| m.is_own)
}

fn show_event<A: ChatApi, C: Connector>(session: &ChatSession<A, C>, event: &ChatEvent) {
    match event {
        ChatEvent::ThreadUpdated { key } => {
            if session.open_key().as_ref() == Some(key) {
                render(session);
            }
        }
        ChatEvent::SendFailed { reason, .. } => {
            println!("* {reason} (/retry <n> or /discard <n>)");
        }
        ChatEvent::ConversationUpgraded { from, to } => println!("* {from} is now {to}"),
        ChatEvent::ConversationsChanged { total_unread } if *total_unread > 0 => {
            println!("* {total_unread} unread");
        }
        ChatEvent::LoadFailed { reason, .. } => println!("* {reason}"),
        ChatEvent::PresenceChanged { user_id, online } => {
            println!("* {user_id} is {}", if *online { "online" } else { "offline" });
        }
        ChatEvent::TypingChanged {
            user_id,
            typing: true,
        } => println!("* {user_id} is typing..."),
        ChatEvent::Connectivity(state) => println!("* Connection: {state}"),
        ChatEvent::Connection(ConnectionEvent::AuthRejected { reason }) => {
            println!("* Signed out by server: {reason}");
        }
        ChatEvent::Connection(ConnectionEvent::ReconnectFailed { attempts }) => {
            println!("* Gave up reconnecting after {attempts} attempts; /reconnect to retry");
        }
        _ => {}
    }
}

fn render<A: ChatApi, C: Connector>(session: &ChatSession<A, C>) {
    let thread = session.open_thread();
    let today = Local::now().date_naive();
    println!();
    let mut number = 0;
    for group in group_by_day(&thread, &Local) {
        println!("--- {} ---", day_label(group.day, today));
        for message in group.messages {
            number += 1;
            let time = message
                .timestamp
                .as_datetime()
                .with_timezone(&Local)
                .format("%H:%M");
            let who = if message.is_own {
                "You".to_string()
            } else {
                message.sender_id.to_string()
            };
            let body = message
                .content
                .as_deref()
                .or(message.attachment_url.as_deref())
                .unwrap_or_default();
            let status = if message.is_own && message.status != DeliveryStatus::Confirmed {
                format!(" [{}]", message.status)
            } else if message.is_own {
                format!(" {}", message.status.symbol())
            } else {
                String::new()
            };
            println!("{number:>3}. {time} {who}: {body}{status}");
        }
    }
    let typing = session.typing_users();
    if !typing.is_empty() {
        let names: Vec<String> = typing.iter().map(ToString::to_string).collect();
        println!("    {} typing...", names.join(", "));
    }
}

fn print_conversations<A: ChatApi, C: Connector>(session: &ChatSession<A, C>) {
    let conversations = session.conversations();
    if conversations.is_empty() {
        println!("* No conversations");
        return;
    }
    println!("Conversations ({} unread):", session.total_unread());
    for conversation in conversations {
        let preview = conversation
            .last_message
            .as_ref()
            .and_then(|m| m.content.as_deref())
            .unwrap_or("");
        let online = if conversation.counterparty.online {
            " (online)"
        } else {
            ""
        };
        let unread = if conversation.unread > 0 {
            format!(" [{}]", conversation.unread)
        } else {
            String::new()
        };
        println!(
            "  {} {}{online}{unread}: {preview}",
            conversation.key, conversation.counterparty.name
        );
    }
}

fn print_help() {
    println!(
        "Type to send. Commands: /list, /search <q>, /open <key>, /refresh, \
         /retry <n>, /discard <n>, /reconnect, /quit"
    );
}
