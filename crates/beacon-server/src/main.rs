use std::sync::Arc;

use beacon_core::config::BeaconConfig;
use beacon_sandbox::BoaRunner;
use beacon_scheduler::{Collaborators, WidgetScheduler};
use beacon_widgets::{ChaChaCodec, EventBroadcaster, SqliteStore, WidgetCoordinator};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Runs the widget refresh scheduler against a local SQLite database.
#[derive(Debug, Parser)]
#[command(name = "beacon-server", version)]
struct Cli {
    /// Path to beacon.toml (falls back to BEACON_CONFIG, then ~/.beacon/beacon.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_server=info,beacon_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > BEACON_CONFIG env > ~/.beacon/beacon.toml
    let config_path = cli.config.or_else(|| std::env::var("BEACON_CONFIG").ok());
    let config = BeaconConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        BeaconConfig::default()
    });
    if config.uses_default_secret() {
        warn!("secrets.key is the built-in placeholder; set BEACON_SECRETS_KEY before storing real credentials");
    }

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    beacon_widgets::init_db(&db)?;
    info!("database migrations complete");

    let store = Arc::new(SqliteStore::new(db));
    let broadcaster = Arc::new(EventBroadcaster::new());
    let deps = Collaborators {
        store: store.clone(),
        definitions: store,
        codec: Arc::new(ChaChaCodec::from_passphrase(&config.secrets.key)),
        runner: Arc::new(BoaRunner::new(&config.sandbox)),
        publisher: broadcaster.clone(),
    };
    let scheduler = WidgetScheduler::new(deps.clone(), &config);
    let coordinator = WidgetCoordinator::new(&deps, scheduler);

    // Trace every outgoing update until a transport is attached.
    let mut updates = broadcaster.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(envelope) => debug!(
                    audience = ?envelope.audience,
                    update_type = ?envelope.event.update_type,
                    "update published"
                ),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "update trace lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let armed = coordinator.start()?;
    info!(armed, "Beacon scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    coordinator.shutdown();
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
