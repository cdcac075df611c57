//! Herald CLI - terminal host for the notification engine.
//!
//! This is the main binary entry point. See the `herald` library
//! for the core functionality.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use herald::api::ReadStatus;
use herald::bridge::{HostState, Mutation, StateBridge};
use herald::dispatch::sinks::{ConsoleToasts, LogNavigator, LogNotifier, TerminalBell};
use herald::preferences::ChannelTogglesPatch;
use herald::{
    CableTransport, Config, ConnectionState, DeliveryChannel, Dispatcher, HistoryQuery,
    LocalCache, Notification, NotificationApi, NotificationEngine, NotificationId,
    PreferenceStore, PreferencesPatch, Priority,
};
use mimalloc::MiMalloc;

/// Global allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "herald")]
#[command(version)]
#[command(about = "Real-time notification listener")]
struct Cli {
    /// Write logs to this file instead of stderr (or set HERALD_LOG_FILE)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and present notifications until Ctrl-C
    Listen,
    /// List notification history from the server
    History(HistoryArgs),
    /// Mark notifications (or all of them) read
    Read {
        /// Notification ids
        #[arg(required_unless_present = "all")]
        ids: Vec<String>,
        /// Mark everything read
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },
    /// Delete a notification on the server and from the local history
    Delete {
        /// Notification id
        id: String,
    },
    /// Show or change delivery preferences
    Prefs {
        #[command(subcommand)]
        command: PrefsCommand,
    },
    /// Ask the server to send a test notification
    TestSend {
        /// Channel to test (in_app, push, email, sms); repeatable
        #[arg(long = "channel", required = true)]
        channels: Vec<DeliveryChannel>,
    },
    /// Show or set configuration (`token` stores the API token)
    Config {
        key: Option<String>,
        value: Option<String>,
    },
}

#[derive(Args)]
struct HistoryArgs {
    /// Page number
    #[arg(long, default_value_t = 1)]
    page: u32,
    /// Page size
    #[arg(long, default_value_t = herald::constants::HISTORY_PAGE_SIZE)]
    limit: u32,
    /// Only unread notifications
    #[arg(long)]
    unread: bool,
    /// Filter by category
    #[arg(long)]
    category: Option<String>,
    /// Filter by priority (low, medium, high, critical)
    #[arg(long, value_parser = parse_priority)]
    priority: Option<Priority>,
    /// Filter by notification type
    #[arg(long = "type")]
    kind: Option<String>,
    /// Free-text search
    #[arg(long)]
    search: Option<String>,
}

#[derive(Subcommand)]
enum PrefsCommand {
    /// Print current preferences
    Show,
    /// Update preferences
    Set {
        /// Turn sound on or off
        #[arg(long)]
        sound: Option<bool>,
        /// Category to change
        #[arg(long, requires_all = ["channel", "enabled"])]
        category: Option<String>,
        /// Channel to change within the category
        #[arg(long, requires = "category")]
        channel: Option<DeliveryChannel>,
        /// New value for the channel
        #[arg(long, requires = "category")]
        enabled: Option<bool>,
    },
}

fn parse_priority(s: &str) -> Result<Priority, String> {
    Priority::parse(s).ok_or_else(|| format!("unknown priority '{s}'"))
}

fn init_logging(log_file: Option<PathBuf>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    let log_file = log_file.or_else(|| std::env::var("HERALD_LOG_FILE").ok().map(PathBuf::from));
    if let Some(path) = log_file {
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file)?;

    match cli.command {
        Commands::Listen => listen(Config::load()?).await?,
        Commands::History(args) => history(&Config::load()?, args).await?,
        Commands::Read { ids, all } => read(&Config::load()?, ids, all).await?,
        Commands::Delete { id } => delete(&Config::load()?, id.into()).await?,
        Commands::Prefs { command } => prefs(&Config::load()?, command).await?,
        Commands::TestSend { channels } => {
            let receipt = api_client(&Config::load()?)?.send_test(&channels).await?;
            let channels: Vec<_> = receipt.channels.iter().map(|c| c.as_str()).collect();
            match receipt.notification_id {
                Some(id) => println!("Test notification {} queued for {}", id, channels.join(", ")),
                None => println!("Test notification queued for {}", channels.join(", ")),
            }
        }
        Commands::Config { key, value } => config_command(key, value)?,
    }

    Ok(())
}

fn api_client(config: &Config) -> Result<NotificationApi> {
    if !config.has_token() {
        anyhow::bail!("No token configured. Run `herald config token <TOKEN>` or set HERALD_TOKEN.");
    }
    Ok(NotificationApi::new(
        config.server_url.clone(),
        config.token.clone(),
    )?)
}

fn open_cache(config: &Config) -> LocalCache {
    let Some(path) = &config.cache_path else {
        return LocalCache::new(config.cache_capacity);
    };
    LocalCache::open(path, config.cache_capacity).unwrap_or_else(|e| {
        log::warn!("Ignoring unreadable cache {}: {}", path.display(), e);
        LocalCache::new(config.cache_capacity)
    })
}

/// Host state for the terminal: prints connection changes, logs the rest.
struct TerminalHost;

impl HostState for TerminalHost {
    fn publish(&self, mutation: Mutation) {
        match mutation {
            Mutation::ConnectionStatusChanged { status } => match &status {
                ConnectionState::Failed { reason } => {
                    eprintln!("connection failed: {reason} (restart `herald listen` to retry)");
                }
                ConnectionState::Reconnecting {
                    attempt,
                    next_retry_ms,
                } => eprintln!("reconnecting (attempt {attempt}) in {next_retry_ms}ms"),
                other => eprintln!("connection: {other}"),
            },
            other => log::debug!("Host mutation: {:?}", other),
        }
    }
}

async fn listen(config: Config) -> Result<()> {
    let api = api_client(&config)?;

    let dispatcher = Dispatcher::new(PreferenceStore::default())
        .with_system_notifier(Arc::new(LogNotifier::default()))
        .with_sound_player(Arc::new(TerminalBell))
        .with_toast_presenter(Arc::new(ConsoleToasts))
        .with_navigator(Arc::new(LogNavigator))
        .with_dismiss_after(config.system_dismiss());

    let engine = NotificationEngine::builder(Arc::new(CableTransport::new(
        config.server_url.clone(),
    )))
    .policy(config.reconnect.policy())
    .cache(open_cache(&config))
    .dispatcher(dispatcher)
    .api(api)
    .build();

    if let Err(e) = engine.refresh_preferences().await {
        log::warn!("Using default preferences: {}", e);
    }

    let bridge = StateBridge::new(Arc::new(TerminalHost));
    let bridge_task = bridge.attach_to(&engine);

    engine.connect(config.credential())?;
    println!(
        "Listening on {} ({} unread). Press Ctrl-C to stop.",
        config.server_url,
        engine.unread_count()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    log::info!("Shutting down");
    engine.disconnect();
    bridge_task.abort();
    Ok(())
}

fn print_notification(n: &Notification) {
    println!(
        "{} {}  {}  [{}] {} - {}",
        if n.is_unread() { "*" } else { " " },
        n.id,
        n.created_at.format("%Y-%m-%d %H:%M"),
        n.priority.as_str(),
        n.title,
        n.message
    );
}

async fn history(config: &Config, args: HistoryArgs) -> Result<()> {
    let query = HistoryQuery {
        page: args.page,
        limit: args.limit,
        status: args.unread.then_some(ReadStatus::Unread),
        category: args.category,
        priority: args.priority,
        kind: args.kind,
        search: args.search,
        ..Default::default()
    };
    let page = api_client(config)?.list(&query).await?;

    if page.notifications.is_empty() {
        println!("No notifications.");
    }
    for n in &page.notifications {
        print_notification(n);
    }
    println!(
        "Page {}/{} ({} total, {} unread)",
        page.pagination.page,
        page.pagination.total_pages.max(1),
        page.pagination.total,
        page.unread_count
    );
    Ok(())
}

async fn read(config: &Config, ids: Vec<String>, all: bool) -> Result<()> {
    let api = api_client(config)?;
    let mut cache = open_cache(config);

    if all {
        api.mark_all_read().await?;
        let changed = cache.mark_all_read();
        println!("Marked all read ({changed} local)");
        return Ok(());
    }

    let ids: Vec<NotificationId> = ids.into_iter().map(NotificationId::from).collect();
    match ids.as_slice() {
        [] => anyhow::bail!("Notification id required"),
        [id] => api.mark_read(id).await?,
        many => api.mark_many_read(many).await?,
    }
    for id in &ids {
        cache.mark_read(id);
    }
    println!(
        "Marked {} read ({} unread locally)",
        ids.len(),
        cache.unread_count()
    );
    Ok(())
}

async fn delete(config: &Config, id: NotificationId) -> Result<()> {
    api_client(config)?.delete(&id).await?;
    let mut cache = open_cache(config);
    match cache.remove(&id) {
        Some(_) => println!("Deleted {id} ({} unread locally)", cache.unread_count()),
        None => println!("Deleted {id}"),
    }
    Ok(())
}

async fn prefs(config: &Config, command: PrefsCommand) -> Result<()> {
    let api = api_client(config)?;
    let preferences = match command {
        PrefsCommand::Show => api.get_preferences().await?,
        PrefsCommand::Set {
            sound,
            category,
            channel,
            enabled,
        } => {
            let mut patch = PreferencesPatch {
                sound_enabled: sound,
                ..Default::default()
            };
            if let (Some(category), Some(channel), Some(enabled)) = (category, channel, enabled) {
                patch
                    .categories
                    .insert(category, ChannelTogglesPatch::set(channel, enabled));
            }
            if patch.is_empty() {
                anyhow::bail!("Nothing to change; pass --sound or --category/--channel/--enabled");
            }
            api.update_preferences(&patch).await?
        }
    };
    println!("{}", serde_json::to_string_pretty(&preferences)?);
    Ok(())
}

fn config_command(key: Option<String>, value: Option<String>) -> Result<()> {
    let dir = Config::config_dir()?;
    let mut config = Config::load()?;
    match (key.as_deref(), value) {
        (None, _) => println!("{}", serde_json::to_string_pretty(&config)?),
        (Some("token"), Some(token)) => {
            config.save_token(&dir, &token)?;
            println!("Token saved.");
        }
        (Some("token"), None) => println!(
            "{}",
            if config.has_token() { "(set)" } else { "(not set)" }
        ),
        (Some(key), None) => {
            let json = serde_json::to_value(&config)?;
            let pointer = format!("/{}", key.replace('.', "/"));
            match json.pointer(&pointer) {
                Some(value) => println!("{value}"),
                None => anyhow::bail!("Unknown config key '{key}'"),
            }
        }
        (Some(key), Some(value)) => {
            config.set(key, &value)?;
            config.save()?;
            println!("{key} = {value}");
        }
    }
    Ok(())
}
