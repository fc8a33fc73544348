//! armonite: a distributed HTTP load generator. A coordinator process
//! accepts test plans over a Control API and drives a fleet of agent
//! processes over a message bus; agents run the actual HTTP workers and
//! stream telemetry back.
//!
//! This crate is shared by the `armonite-coordinator` and `armonite-agent`
//! binaries under `src/bin/`; each wires a subset of these modules together
//! for its own role.

pub mod aggregator;
pub mod agent;
pub mod api;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod duration;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod ramp;
pub mod rate_limiter;
pub mod registry;
pub mod run_manager;
pub mod worker_pool;
pub mod yaml_config;
