//! Fleet: the shared server collection.
//!
//! Every server lives in its own slot guarded by two locks:
//!   - `server`: short read/write access to the record itself
//!   - `lease`:  single-writer ownership, held across simulated delays
//!
//! The record can only be mutated through a `ServerLease`, so whoever holds
//! the lease (a rollout applying config, or drift remediation) is the only
//! writer for that server until the lease is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use super::types::{Environment, Server, ServerStatus};

pub struct ServerSlot {
    server: RwLock<Server>,
    lease: Mutex<()>,
}

impl ServerSlot {
    fn new(server: Server) -> Self {
        Self {
            server: RwLock::new(server),
            lease: Mutex::new(()),
        }
    }

    /// Clone the current record.
    pub async fn read(&self) -> Server {
        self.server.read().await.clone()
    }

    /// Wait until the slot is free and take ownership of it.
    pub async fn lease(&self) -> ServerLease<'_> {
        ServerLease {
            slot: self,
            _guard: self.lease.lock().await,
        }
    }

    /// Take ownership only if nobody else holds it.
    pub fn try_lease(&self) -> Option<ServerLease<'_>> {
        let guard = self.lease.try_lock().ok()?;
        Some(ServerLease {
            slot: self,
            _guard: guard,
        })
    }
}

/// Exclusive write access to one server.
pub struct ServerLease<'a> {
    slot: &'a ServerSlot,
    _guard: MutexGuard<'a, ()>,
}

impl ServerLease<'_> {
    pub async fn server(&self) -> Server {
        self.slot.read().await
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut Server) -> R) -> R {
        let mut server = self.slot.server.write().await;
        f(&mut *server)
    }
}

/// Counts by status and by running version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub deploying: usize,
    pub versions: BTreeMap<String, usize>,
}

impl FleetSummary {
    pub fn from_servers(servers: &[Server]) -> Self {
        let count = |status: ServerStatus| servers.iter().filter(|s| s.status == status).count();

        let mut versions = BTreeMap::new();
        for server in servers {
            *versions
                .entry(server.current_config_version.clone())
                .or_insert(0) += 1;
        }

        Self {
            total: servers.len(),
            healthy: count(ServerStatus::Healthy),
            unhealthy: count(ServerStatus::Unhealthy),
            deploying: count(ServerStatus::Deploying),
            versions,
        }
    }
}

#[derive(Clone)]
pub struct Fleet {
    slots: Arc<Vec<ServerSlot>>,
}

impl Fleet {
    pub fn new(servers: Vec<Server>) -> Self {
        Self {
            slots: Arc::new(servers.into_iter().map(ServerSlot::new).collect()),
        }
    }

    /// Build `size` healthy servers all running `initial_version`.
    pub fn generate(size: usize, environment: Environment, initial_version: &str, domain: &str) -> Self {
        let now = Utc::now();
        let servers = (0..size)
            .map(|i| Server {
                id: format!("server-{i:04}"),
                hostname: format!("app-{i}.{environment}.{domain}"),
                environment,
                status: ServerStatus::Healthy,
                current_config_version: initial_version.to_string(),
                desired_config_version: initial_version.to_string(),
                last_sync: now,
            })
            .collect();
        Self::new(servers)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots in stable fleet order.
    pub fn slots(&self) -> &[ServerSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&ServerSlot> {
        self.slots.get(index)
    }

    /// Clone every record in fleet order.
    pub async fn snapshot(&self) -> Vec<Server> {
        let mut servers = Vec::with_capacity(self.slots.len());
        for slot in self.slots.iter() {
            servers.push(slot.read().await);
        }
        servers
    }

    pub async fn summary(&self) -> FleetSummary {
        FleetSummary::from_servers(&self.snapshot().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_builds_stable_ids() {
        let fleet = Fleet::generate(3, Environment::Prod, "v1.0.0", "example.com");
        let servers = fleet.snapshot().await;
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].id, "server-0000");
        assert_eq!(servers[2].hostname, "app-2.prod.example.com");
        assert!(servers.iter().all(|s| s.status == ServerStatus::Healthy));
        assert!(servers.iter().all(|s| s.current_config_version == "v1.0.0"));
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let fleet = Fleet::generate(1, Environment::Dev, "v1", "example.com");
        let slot = fleet.slot(0).unwrap();

        let lease = slot.lease().await;
        assert!(slot.try_lease().is_none());

        lease
            .update(|s| s.current_config_version = "v2".to_string())
            .await;
        drop(lease);

        assert!(slot.try_lease().is_some());
        assert_eq!(slot.read().await.current_config_version, "v2");
    }

    #[tokio::test]
    async fn summary_counts_status_and_versions() {
        let fleet = Fleet::generate(4, Environment::Prod, "v1", "example.com");
        fleet
            .slot(1)
            .unwrap()
            .lease()
            .await
            .update(|s| {
                s.status = ServerStatus::Unhealthy;
                s.current_config_version = "v2".to_string();
            })
            .await;

        let summary = fleet.summary().await;
        assert_eq!(summary.total, 4);
        assert_eq!(summary.healthy, 3);
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(summary.deploying, 0);
        assert_eq!(summary.versions.get("v1"), Some(&3));
        assert_eq!(summary.versions.get("v2"), Some(&1));
    }
}
