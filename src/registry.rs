//! Coordinator Registry: tracks connected agents and detects staleness.
//! The map is guarded by a short-held lock; the janitor task and the
//! registration/heartbeat handlers are the only writers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::model::{AgentExecutionState, AgentInfo};

const STALE_AFTER_SECS: i64 = 60;
const JANITOR_INTERVAL_SECS: u64 = 30;

#[derive(Default)]
pub struct Registry {
    agents: RwLock<HashMap<String, AgentInfo>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Registry::default())
    }

    /// Upserts an agent on registration. Returns `true` if this is a
    /// previously-unseen agent (used by the caller to log a new-agent event
    /// and to re-check run quorum).
    pub async fn register(&self, id: &str, region: &str, concurrency: u32, now: DateTime<Utc>) -> bool {
        let mut agents = self.agents.write().await;
        let is_new = !agents.contains_key(id);
        agents
            .entry(id.to_string())
            .and_modify(|a| {
                a.last_seen = now;
                a.region = region.to_string();
                a.concurrency = concurrency;
            })
            .or_insert_with(|| AgentInfo {
                id: id.to_string(),
                region: region.to_string(),
                concurrency,
                connected_at: now,
                last_seen: now,
                execution_state: AgentExecutionState::Idle,
            });
        is_new
    }

    pub async fn unregister(&self, id: &str) {
        self.agents.write().await.remove(id);
    }

    pub async fn heartbeat(&self, id: &str, now: DateTime<Utc>) {
        if let Some(agent) = self.agents.write().await.get_mut(id) {
            agent.last_seen = now;
        }
    }

    pub async fn set_execution_state(&self, id: &str, state: AgentExecutionState) {
        if let Some(agent) = self.agents.write().await.get_mut(id) {
            agent.execution_state = state;
        }
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn list(&self) -> Vec<AgentInfo> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<AgentInfo> {
        self.agents.read().await.get(id).cloned()
    }

    /// Removes agents whose `last_seen` is older than the 60s stale
    /// threshold. Called by the janitor loop every 30s. Stale removal never
    /// fails a running run — completion timers are authoritative.
    pub async fn evict_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let stale_after = chrono::Duration::seconds(STALE_AFTER_SECS);
        let mut agents = self.agents.write().await;
        let stale_ids: Vec<String> = agents
            .values()
            .filter(|a| a.is_stale(now, stale_after))
            .map(|a| a.id.clone())
            .collect();
        for id in &stale_ids {
            agents.remove(id);
        }
        stale_ids
    }

    /// Spawns the background janitor task. Returns a handle the caller may
    /// abort on shutdown.
    pub fn spawn_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(JANITOR_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                let removed = registry.evict_stale(Utc::now()).await;
                for id in removed {
                    warn!(agent_id = %id, "evicted stale agent");
                }
            }
        })
    }

    pub async fn log_new_agent(&self, id: &str) {
        info!(agent_id = %id, "new agent registered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_idempotent_per_agent() {
        let registry = Registry::new();
        let now = Utc::now();
        assert!(registry.register("a1", "us-east", 10, now).await);
        assert!(!registry.register("a1", "us-east", 10, now).await);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn unregister_removes_agent() {
        let registry = Registry::new();
        registry.register("a1", "us-east", 10, Utc::now()).await;
        registry.unregister("a1").await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn heartbeat_updates_last_seen() {
        let registry = Registry::new();
        let t0 = Utc::now();
        registry.register("a1", "us-east", 10, t0).await;
        let t1 = t0 + chrono::Duration::seconds(30);
        registry.heartbeat("a1", t1).await;
        assert_eq!(registry.get("a1").await.unwrap().last_seen, t1);
    }

    #[tokio::test]
    async fn stale_agents_are_evicted_after_60s() {
        let registry = Registry::new();
        let t0 = Utc::now();
        registry.register("a1", "us-east", 10, t0).await;
        let still_fresh = t0 + chrono::Duration::seconds(59);
        assert!(registry.evict_stale(still_fresh).await.is_empty());

        let stale = t0 + chrono::Duration::seconds(61);
        let evicted = registry.evict_stale(stale).await;
        assert_eq!(evicted, vec!["a1".to_string()]);
        assert_eq!(registry.count().await, 0);
    }
}
