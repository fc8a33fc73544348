//! Entry point for `armonite-agent`. Parses config, wires the bus, and runs
//! the agent control loop until Ctrl-C or the process is signalled to stop.

use std::sync::Arc;

use armonite::agent::{Agent, AgentConfig};
use armonite::bus::{InMemoryBus, MessageBus};
use armonite::config::AgentArgs;
use armonite::logging;
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = AgentArgs::parse();
    logging::init(&args.log_level, &args.log_format);

    if let Err(e) = args.validate() {
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(args).await {
        error!(error = %e, "agent exited with a fatal error");
        std::process::exit(1);
    }
}

async fn run(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let bus: Arc<dyn MessageBus> = if args.dev {
        info!("running in --dev mode: in-memory bus");
        Arc::new(InMemoryBus::new())
    } else {
        Arc::new(armonite::bus::NatsBus::connect(&args.bus_url()).await?)
    };

    let mut config = AgentConfig {
        agent_id: args.agent_id(),
        region: args.region.clone(),
        concurrency: args.concurrency,
        dev_mode: args.dev,
        rate_limit: args.rate_limit,
        default_think_time: args.think_time(),
        keep_alive: args.keep_alive,
    };
    config.apply_dev_ceiling();

    info!(agent_id = %config.agent_id, region = %config.region, concurrency = config.concurrency, "starting agent");

    let agent = Agent::new(config, bus);
    agent.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, unregistering");
    agent.shutdown().await;
    Ok(())
}
