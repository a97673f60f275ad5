use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use botworld_client::backend::{Backend, RemoteBackend};
use botworld_client::config::ClientConfig;
use botworld_client::controller::{Controller, ControllerConfig, ControllerEvent};
use botworld_client::store::session::load_session;
use botworld_client::store::{FileStorage, OwnedBots, Storage};
use botworld_client::world::World;

const LEADERBOARD_INTERVAL: Duration = Duration::from_secs(10);
const LEADERBOARD_ROWS: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Botworld Client v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::load_or_default();
    config.validate()?;

    let storage: Arc<dyn Storage> = Arc::new(
        FileStorage::new(&config.state_dir)
            .with_context(|| format!("opening state directory {}", config.state_dir.display()))?,
    );

    let session = load_session(storage.as_ref())?;

    let world_id = config
        .world_id
        .clone()
        .or_else(|| session.as_ref().map(|s| s.world_id.clone()))
        .context("no world to join: set WORLD_ID")?;

    // The stored bot only applies to the world it was tracked in
    let bot_id = config.bot_id.clone().or_else(|| {
        session
            .filter(|s| s.world_id == world_id)
            .and_then(|s| s.bot_id)
    });

    info!(
        "Configuration loaded: server={}, world={}, bot={}",
        config.server_url,
        world_id,
        bot_id.as_ref().map(|b| b.to_string()).unwrap_or_else(|| "-".to_string())
    );

    let owned = OwnedBots::load(world_id.clone(), storage.clone())?;
    let world = Arc::new(World::new(owned));
    let backend = Backend::Remote(RemoteBackend::new(config.remote(world_id)?));

    let (controller, events) = Controller::new(
        backend,
        world.clone(),
        ControllerConfig {
            retry_delay: config.reconnect_delay,
            storage: Some(storage),
        },
    );
    let controller = Arc::new(controller);

    tokio::spawn(log_status(controller.clone()));
    tokio::spawn(log_events(events));
    tokio::spawn(log_leaderboard(world));

    if let Err(e) = controller.join(bot_id).await {
        warn!("First join attempt failed, retrying in the background: {}", e);
    }

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl+C handler")?;
    info!("Shutting down...");

    controller.close().await;
    println!("{}", controller.metrics().to_prometheus());

    Ok(())
}

async fn log_status(controller: Arc<Controller>) {
    let mut status = controller.subscribe_status();

    while status.changed().await.is_ok() {
        let value = *status.borrow_and_update();
        info!("Connection status: {}", value);
    }
}

async fn log_events(mut events: mpsc::UnboundedReceiver<ControllerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ControllerEvent::BotNotFound(id) => {
                warn!("Bot {} not found, watching the whole world instead", id);
            }
        }
    }
}

async fn log_leaderboard(world: Arc<World>) {
    let mut interval = tokio::time::interval(LEADERBOARD_INTERVAL);

    loop {
        interval.tick().await;

        let rows = world.leaderboard();
        if rows.is_empty() {
            continue;
        }

        info!("Leaderboard ({} bots):", rows.len());
        for row in rows.iter().take(LEADERBOARD_ROWS) {
            info!(
                "  #{:<3} {:<24} score={:<6} age={}{}",
                row.nth,
                row.id.to_string(),
                row.score,
                row.age,
                if row.known { " (yours)" } else { "" }
            );
        }
    }
}
