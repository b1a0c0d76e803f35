use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lms_assessment::{
    collaborators::{BroadcastNotifier, StaticDirectory},
    config::Config,
    db,
    services::{Collaborators, Engine},
    store::Storage,
    sweep,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "lms_assessment=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let storage = match &config.database_url {
        Some(url) => {
            let pool = db::connect(url, config.db_max_connections).await?;
            tracing::info!("using postgres storage");
            Storage::postgres(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage");
            Storage::in_memory()
        }
    };

    let directory = match &config.directory_file {
        Some(path) => StaticDirectory::from_file(path)?,
        None => {
            tracing::warn!("DIRECTORY_FILE not set, no courses or modules are known");
            StaticDirectory::default()
        }
    };
    let notifier = BroadcastNotifier::new(256);
    let collab = Collaborators::from_directory(Arc::new(directory), Arc::new(notifier));

    let addr = format!("{}:{}", config.host, config.port);
    let engine = Engine::new(config, storage, collab);
    sweep::spawn(engine.clone());

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, lms_assessment::app(engine)).await?;
    Ok(())
}
