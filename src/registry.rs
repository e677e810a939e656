//! Named routers
//!
//! A [`Registry`] is built once at startup, one router per configured group,
//! and handed to whatever needs to look routers up by name. Entries are never
//! replaced.

use crate::config::Config;
use crate::router::ShardRouter;
use crate::storage::RedisStore;
use crate::{Error, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Registry<S> {
    routers: DashMap<String, Arc<ShardRouter<S>>>,
}

impl<S> Registry<S> {
    pub fn new() -> Self {
        Self {
            routers: DashMap::new(),
        }
    }

    /// Add a router under `name`; a name can only be registered once
    pub fn register(
        &self,
        name: impl Into<String>,
        router: ShardRouter<S>,
    ) -> Result<Arc<ShardRouter<S>>> {
        match self.routers.entry(name.into()) {
            Entry::Occupied(occupied) => Err(Error::Config(format!(
                "router {} is already registered",
                occupied.key()
            ))),
            Entry::Vacant(vacant) => {
                let router = Arc::new(router);
                info!(name = %vacant.key(), shards = router.len(), "Router registered");
                vacant.insert(Arc::clone(&router));
                Ok(router)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ShardRouter<S>>> {
        self.routers.get(name).map(|router| Arc::clone(router.value()))
    }

    /// Visit every router; order is unspecified
    pub fn for_each(&self, mut visitor: impl FnMut(&str, &ShardRouter<S>)) {
        for entry in &self.routers {
            visitor(entry.key(), entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry<RedisStore> {
    /// One Redis-backed router per configured group
    pub fn connect(config: &Config) -> Result<Self> {
        let registry = Self::new();
        for group in &config.groups {
            registry.register(group.name.clone(), ShardRouter::connect(&group.shards)?)?;
        }
        Ok(registry)
    }

    /// Reap every pool once; returns the number of connections closed
    pub fn reap(&self) -> usize {
        let mut removed = 0;
        self.for_each(|_, router| router.for_each(|instance| removed += instance.store().reap()));
        removed
    }
}

/// Reap pooled connections every `interval` until `cancel` fires
pub fn spawn_reaper(
    registry: Arc<Registry<RedisStore>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.reap();
                    if removed > 0 {
                        debug!(removed, "Connection reaper pass");
                    }
                }
            }
        }
        info!("Connection reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupConfig, ShardConfig};

    fn router(hosts: &[&str]) -> ShardRouter<()> {
        ShardRouter::new(
            hosts
                .iter()
                .map(|host| (ShardConfig::new(*host, 6379), ()))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let registry = Registry::new();
        registry.register("sessions", router(&["a", "b"])).unwrap();
        registry.register("limits", router(&["c"])).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("sessions").unwrap().len(), 2);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = Registry::new();
        let first = registry.register("sessions", router(&["a"])).unwrap();

        let Err(err) = registry.register("sessions", router(&["b"])) else {
            panic!("duplicate registration accepted");
        };
        assert!(matches!(err, Error::Config(_)));
        // the first registration is untouched
        assert!(Arc::ptr_eq(&first, &registry.get("sessions").unwrap()));
    }

    #[test]
    fn test_for_each() {
        let registry = Registry::new();
        registry.register("a", router(&["x"])).unwrap();
        registry.register("b", router(&["y", "z"])).unwrap();

        let mut seen = Vec::new();
        registry.for_each(|name, router| seen.push((name.to_string(), router.len())));
        seen.sort();
        assert_eq!(seen, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_connect_builds_one_router_per_group() {
        let config = Config {
            groups: vec![
                GroupConfig {
                    name: "cache".to_string(),
                    shards: vec![ShardConfig::new("127.0.0.1", 1), ShardConfig::new("127.0.0.1", 2)],
                },
                GroupConfig {
                    name: "limits".to_string(),
                    shards: vec![ShardConfig::new("127.0.0.1", 3)],
                },
            ],
            ..Config::default()
        };

        let registry = Registry::connect(&config).unwrap();
        assert_eq!(registry.get("cache").unwrap().len(), 2);
        assert_eq!(registry.get("limits").unwrap().len(), 1);
        assert_eq!(registry.reap(), 0);
    }

    #[tokio::test]
    async fn test_connect_rejects_duplicate_group() {
        let group = GroupConfig {
            name: "cache".to_string(),
            shards: vec![ShardConfig::new("127.0.0.1", 1)],
        };
        let config = Config {
            groups: vec![group.clone(), group],
            ..Config::default()
        };
        assert!(matches!(Registry::connect(&config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_reaper_stops_on_cancel() {
        let registry = Arc::new(Registry::<RedisStore>::new());
        let cancel = CancellationToken::new();
        let handle = spawn_reaper(Arc::clone(&registry), Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
