//! medrt CLI - follow notifications and chat in image rooms from a terminal

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use medrt::protocol::{ChatMessage, Notification};
use medrt::{
    ChatSession, ConnectOptions, ConnectionManager, HttpNotificationApi, Id, Namespace,
    NotificationClient, NotificationUpdate, StaticToken, TokenProvider,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "medrt")]
#[command(about = "Real-time notifications and image-room chat")]
#[command(version)]
struct Cli {
    /// Server URL
    #[arg(
        short,
        long,
        env = "MEDRT_SERVER_URL",
        default_value = "http://localhost:3000"
    )]
    server: String,

    /// REST API base URL [default: <server>/api]
    #[arg(long, env = "MEDRT_API_URL")]
    api: Option<String>,

    /// Bearer token
    #[arg(short, long, env = "MEDRT_TOKEN", hide_env_values = true)]
    token: String,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recent notifications
    Notifications {
        /// Keep running and print notifications as they arrive
        #[arg(short, long)]
        follow: bool,
    },

    /// Mark a notification as read
    MarkRead {
        /// Notification ID
        id: String,
    },

    /// Join an image room and chat interactively (one message per line)
    Chat {
        /// Image ID of the room
        #[arg(short, long)]
        image: String,
    },

    /// Send one message to an image room and wait for the acknowledgement
    Send {
        /// Image ID of the room
        #[arg(short, long)]
        image: String,

        /// Message content
        #[arg(short, long)]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medrt=info,medrt_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let api_url = cli.api_url();
    let tokens: Arc<dyn TokenProvider> = Arc::new(StaticToken::new(cli.token.clone()));
    let manager = ConnectionManager::new(cli.server.clone());

    let result = match cli.command {
        Commands::Notifications { follow } => {
            run_notifications(&manager, &api_url, tokens, follow, cli.json).await
        }
        Commands::MarkRead { id } => run_mark_read(&manager, &api_url, tokens, &id).await,
        Commands::Chat { image } => run_chat(&manager, tokens, &image, cli.json).await,
        Commands::Send { image, message } => run_send(&manager, tokens, &image, &message).await,
    };

    manager.shutdown().await;
    result
}

impl Cli {
    fn api_url(&self) -> String {
        self.api
            .clone()
            .unwrap_or_else(|| format!("{}/api", self.server.trim_end_matches('/')))
    }
}

async fn notification_client(
    manager: &ConnectionManager,
    api_url: &str,
    tokens: Arc<dyn TokenProvider>,
) -> Result<NotificationClient> {
    let api = Arc::new(HttpNotificationApi::new(api_url, Arc::clone(&tokens)));
    let handle = manager
        .prepare(Namespace::Notifications, tokens, ConnectOptions::default())
        .await?;
    let client = NotificationClient::attach(&handle, api, Some(100));
    handle.start();
    handle
        .wait_connected()
        .await
        .context("Failed to connect to notification service")?;
    Ok(client)
}

async fn run_notifications(
    manager: &ConnectionManager,
    api_url: &str,
    tokens: Arc<dyn TokenProvider>,
    follow: bool,
    json: bool,
) -> Result<()> {
    let client = notification_client(manager, api_url, tokens).await?;
    client.refresh().await?;

    let notifications = client.snapshot();
    if notifications.is_empty() {
        println!("No notifications.");
    } else {
        println!("Notifications ({} unread):", client.unread_count());
        println!("{:─<60}", "");
        for notification in &notifications {
            print_notification(notification, json)?;
        }
    }

    if !follow {
        return Ok(());
    }

    println!("Waiting for notifications (Ctrl-C to quit)...");
    let _subscription = client.subscribe(move |update| match update {
        NotificationUpdate::Received(notification) => {
            if let Err(e) = print_notification(notification, json) {
                tracing::warn!("Failed to print notification: {}", e);
            }
        }
        NotificationUpdate::ServerError(error) => eprintln!("Server error: {}", error.message),
        _ => {}
    });

    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn run_mark_read(
    manager: &ConnectionManager,
    api_url: &str,
    tokens: Arc<dyn TokenProvider>,
    id: &str,
) -> Result<()> {
    let client = notification_client(manager, api_url, tokens).await?;
    client.refresh().await?;

    let outcome = client.mark_as_read(id).await?;
    println!("{}: {:?} ({} unread)", id, outcome, client.unread_count());
    Ok(())
}

/// Join a room and wait for the server to confirm
async fn joined_session(
    manager: &ConnectionManager,
    tokens: Arc<dyn TokenProvider>,
    image: &str,
) -> Result<ChatSession> {
    let handle = manager
        .prepare(Namespace::Chat, tokens, ConnectOptions::chat())
        .await?;
    let chat = ChatSession::attach(&handle);
    handle.start();
    handle
        .wait_connected()
        .await
        .context("Failed to connect to chat service")?;

    chat.join(image)?;
    let room = Id::from(image);
    match tokio::time::timeout(Duration::from_secs(10), chat.wait_joined(&room)).await {
        Ok(Ok(())) => Ok(chat),
        Ok(Err(_)) => Err(anyhow!("Server refused to join room {}", image)),
        Err(_) => Err(anyhow!("Timed out joining room {}", image)),
    }
}

async fn run_chat(
    manager: &ConnectionManager,
    tokens: Arc<dyn TokenProvider>,
    image: &str,
    json: bool,
) -> Result<()> {
    let chat = joined_session(manager, tokens, image).await?;
    println!("Joined room {} (Ctrl-C to quit)", image);

    let _messages = chat.on_message(move |message| {
        if let Err(e) = print_message(message, json) {
            tracing::warn!("Failed to print message: {}", e);
        }
    });
    let _typing = chat.on_typing(|typing| println!("  {} is typing...", typing.user_id));
    let _errors = chat.on_error(|error| eprintln!("Server error: {}", error.message));
    let _health = chat.on_health(|health| tracing::info!("Connection health: {:?}", health));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match chat.send(image, line) {
                    // Our own message comes back as newMessage and is printed there
                    Ok(pending) => drop(pending),
                    Err(e) => eprintln!("Not sent: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    chat.leave(image)?;
    Ok(())
}

async fn run_send(
    manager: &ConnectionManager,
    tokens: Arc<dyn TokenProvider>,
    image: &str,
    message: &str,
) -> Result<()> {
    let chat = joined_session(manager, tokens, image).await?;
    let id = chat.send(image, message)?.await?;
    println!("Sent message {}", id);
    Ok(())
}

fn print_notification(notification: &Notification, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(notification)?);
        return Ok(());
    }

    let marker = if notification.read { " " } else { "*" };
    println!(
        "{} {} [{}] {} - {}",
        marker,
        notification
            .created_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M"),
        notification.id,
        notification.title,
        notification.message
    );
    Ok(())
}

fn print_message(message: &ChatMessage, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(message)?);
        return Ok(());
    }

    println!(
        "[{}] {}: {}",
        message.timestamp.with_timezone(&chrono::Local).format("%H:%M"),
        message.sender.id(),
        message.content
    );
    Ok(())
}
