//! Entry point for `armonite-coordinator`. Parses config, wires the bus,
//! persistence layer and [`Coordinator`] together, and serves the Control
//! API. This is the only place those pieces are wired — every other module
//! talks to them through the `MessageBus`/`PersistenceAdapter` traits.

use std::sync::Arc;

use armonite::api;
use armonite::bus::{InMemoryBus, MessageBus};
use armonite::config::CoordinatorArgs;
use armonite::coordinator::Coordinator;
use armonite::logging;
use armonite::persistence::{InMemoryPersistence, PersistenceAdapter, SqlitePersistence};
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = CoordinatorArgs::parse();
    logging::init(&args.log_level, &args.log_format);

    if let Err(e) = args.validate() {
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(args).await {
        error!(error = %e, "coordinator exited with a fatal error");
        std::process::exit(1);
    }
}

async fn run(args: CoordinatorArgs) -> Result<(), Box<dyn std::error::Error>> {
    let bus: Arc<dyn MessageBus> = if args.dev {
        info!("running in --dev mode: in-memory bus, in-memory persistence");
        Arc::new(InMemoryBus::new())
    } else {
        Arc::new(armonite::bus::NatsBus::connect(&args.bus_url()).await?)
    };

    let persistence: Arc<dyn PersistenceAdapter> = if args.dev {
        Arc::new(InMemoryPersistence::new())
    } else {
        Arc::new(SqlitePersistence::connect(&args.dsn, args.db_max_open).await?)
    };

    let coordinator = Coordinator::new(bus, persistence);
    coordinator.start().await?;

    let app = api::router(Arc::clone(&coordinator));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.http_port)).await?;
    info!(port = args.http_port, "control API listening");

    axum::serve(listener, app).await?;
    Ok(())
}
