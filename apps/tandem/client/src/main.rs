use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tandem_client::{
    cli::{self, Cli, Command, ConnectionArgs, ConsoleCommand, ListenArgs, RoomArgs, SyncArgs},
    telemetry, ChannelEvent, CommandSurface, CommandTokenProvider, FileConfigStore, GitCli,
    RoomChannel, Session, ShellBuildTool, StaticTokenProvider,
};
use tandem_core::{
    decode, ConfigPatch, ConfigStore, Dispatcher, MessageKind, SessionConfig, TokenProvider,
    TracingNotifier,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;
    let cli = Cli::parse();

    let store: Arc<dyn ConfigStore> = Arc::new(match &cli.connection.config {
        Some(path) => FileConfigStore::new(path),
        None => FileConfigStore::open_default().context("failed to locate session config")?,
    });
    apply_overrides(&cli.connection, store.as_ref()).await?;

    match cli.command {
        Command::Listen(args) => listen(&cli.connection, store, args).await,
        Command::Sync(args) => sync_once(&cli.connection, store, args).await,
        Command::Room(args) => room(store.as_ref(), args).await,
    }
}

async fn apply_overrides(connection: &ConnectionArgs, store: &dyn ConfigStore) -> Result<()> {
    if connection.server.is_none() && connection.room.is_none() {
        return Ok(());
    }
    store
        .set(ConfigPatch {
            base_url: connection.server.clone(),
            room_id: connection.room.clone(),
            ..ConfigPatch::default()
        })
        .await
        .context("failed to save connection overrides")?;
    Ok(())
}

fn token_provider(connection: &ConnectionArgs) -> Result<Arc<dyn TokenProvider>> {
    if let Some(command) = &connection.token_command {
        return Ok(Arc::new(CommandTokenProvider::from_command_line(command)?));
    }
    Ok(Arc::new(StaticTokenProvider::new(
        connection.token.clone().unwrap_or_default(),
    )))
}

async fn listen(connection: &ConnectionArgs, store: Arc<dyn ConfigStore>, args: ListenArgs) -> Result<()> {
    let mut git = GitCli::new();
    for mapping in &args.repos {
        let (name, path) = GitCli::parse_mapping(mapping)?;
        git = git.with_repo(name, path);
    }
    if args.search_roots.is_empty() {
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        git = git.with_search_root(cwd);
    }
    for root in args.search_roots {
        git = git.with_search_root(root);
    }

    let notifier = Arc::new(TracingNotifier);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(git),
        Arc::new(ShellBuildTool::new(args.configure, args.build)),
        notifier.clone(),
    ));
    let (channel, events) = RoomChannel::new(
        token_provider(connection)?,
        store.clone(),
        notifier,
        connection.channel_settings(),
    );
    let session = Session::spawn(channel.clone(), events, dispatcher);
    let surface = CommandSurface::new(channel, store);

    let config = surface.join().await.context("failed to join room")?;
    println!(
        "joined room {} on {}",
        config.server.room_id, config.server.base_url
    );
    println!("{}", cli::CONSOLE_HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match cli::parse_console(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Quit)) => break,
            Ok(Some(command)) => run_console(&surface, command).await,
            Err(message) => eprintln!("{message}"),
        }
    }

    surface.disconnect();
    session.shutdown();
    info!("left room");
    Ok(())
}

async fn run_console(surface: &CommandSurface, command: ConsoleCommand) {
    let result = match command {
        ConsoleCommand::Sync(record) => surface.sync(record).await.map(|record| {
            println!("sent {record}");
        }),
        ConsoleCommand::Resync => surface.resync().await.map(|record| {
            println!("resent {record}");
        }),
        ConsoleCommand::Reconnect => surface.reconnect().await.map(|_| {
            println!("reconnected");
        }),
        ConsoleCommand::Room(room) => surface.set_room(Some(room), None).await.map(|config| {
            println!("joined room {}", config.server.room_id);
        }),
        ConsoleCommand::Help => {
            println!("{}", cli::CONSOLE_HELP);
            Ok(())
        }
        ConsoleCommand::Quit => Ok(()),
    };
    if let Err(err) = result {
        warn!(reason = err.label(), error = %err, "command failed");
        eprintln!("error: {err}");
    }
}

async fn sync_once(connection: &ConnectionArgs, store: Arc<dyn ConfigStore>, args: SyncArgs) -> Result<()> {
    let record = args.record().map_err(|message| anyhow!(message))?;
    let (channel, mut events) = RoomChannel::new(
        token_provider(connection)?,
        store.clone(),
        Arc::new(TracingNotifier),
        connection.channel_settings(),
    );
    let surface = CommandSurface::new(channel, store);

    surface.join().await.context("failed to join room")?;
    let sent = surface.sync(record).await.context("failed to send sync")?;

    let acked = tokio::time::timeout(
        Duration::from_secs(args.ack_timeout_secs),
        wait_for_ack(&mut events),
    )
    .await
    .unwrap_or(false);
    surface.disconnect();

    if !acked {
        bail!("relay did not acknowledge {sent}");
    }
    println!("sent {sent}");
    Ok(())
}

async fn wait_for_ack(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Frame { text, .. } => {
                let is_ack = decode(text.as_bytes())
                    .map(|envelope| envelope.kind == MessageKind::Ack.as_str())
                    .unwrap_or(false);
                if is_ack {
                    return true;
                }
            }
            ChannelEvent::Closed { .. } => return false,
        }
    }
    false
}

async fn room(store: &dyn ConfigStore, args: RoomArgs) -> Result<()> {
    let config = if args.room.is_some() || args.server.is_some() {
        store
            .set(ConfigPatch {
                room_id: args.room,
                base_url: args.server,
                ..ConfigPatch::default()
            })
            .await?
    } else {
        store.get().await?
    };
    print_room(&config);
    Ok(())
}

fn print_room(config: &SessionConfig) {
    println!("server: {}", config.server.base_url);
    println!("room:   {}", config.room_id().unwrap_or("(none)"));
    if let Some(record) = &config.sync_data {
        println!("last:   {record}");
    }
}
