//! Consistent-hash routing over backend instances
//!
//! Every instance contributes `virtual_count + 1` nodes to the ring. A node's
//! position is the CRC32 (IEEE) of `host:port-index#vnode`, a key's position
//! is the CRC32 of the key, and the key belongs to the first node at or
//! clockwise after it. The ring never changes after construction, so the
//! mapping is identical in every process built from the same shard list.

use crate::config::ShardConfig;
use crate::storage::RedisStore;
use crate::{Error, Result};
use tracing::info;

/// One physical shard on the ring
pub struct BackendInstance<S> {
    id: String,
    hash_code: u32,
    config: ShardConfig,
    store: S,
}

impl<S> BackendInstance<S> {
    /// `host:port-index`
    pub fn id(&self) -> &str {
        &self.id
    }

    /// CRC32 of the instance id
    pub fn hash_code(&self) -> u32 {
        self.hash_code
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RingNode {
    hash: u32,
    instance: usize,
}

/// Deterministic key → instance mapping
pub struct ShardRouter<S> {
    instances: Vec<BackendInstance<S>>,
    ring: Vec<RingNode>,
}

impl<S> ShardRouter<S> {
    /// Build a ring from already-opened stores
    pub fn new(shards: Vec<(ShardConfig, S)>) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::OptionEmpty);
        }

        let mut instances = Vec::with_capacity(shards.len());
        let mut ring = Vec::new();
        for (position, (config, store)) in shards.into_iter().enumerate() {
            config.validate()?;
            let id = config.instance_id();
            for vnode in 0..=config.virtual_count {
                ring.push(RingNode {
                    hash: crc32fast::hash(format!("{id}#{vnode}").as_bytes()),
                    instance: position,
                });
            }
            instances.push(BackendInstance {
                hash_code: crc32fast::hash(id.as_bytes()),
                id,
                config,
                store,
            });
        }
        // ties on hash resolve by configuration order
        ring.sort_unstable();

        info!(
            instances = instances.len(),
            ring_nodes = ring.len(),
            "Shard ring built"
        );

        Ok(Self { instances, ring })
    }

    /// Build a ring, opening each store with `open`
    pub fn build(
        configs: &[ShardConfig],
        mut open: impl FnMut(&ShardConfig) -> Result<S>,
    ) -> Result<Self> {
        let shards = configs
            .iter()
            .map(|config| Ok((config.clone(), open(config)?)))
            .collect::<Result<Vec<_>>>()?;
        Self::new(shards)
    }

    /// Instance owning `key`
    pub fn route(&self, key: &str) -> &BackendInstance<S> {
        let hash = crc32fast::hash(key.as_bytes());
        let slot = self.ring.partition_point(|node| node.hash < hash);
        let node = self.ring.get(slot).unwrap_or(&self.ring[0]);
        &self.instances[node.instance]
    }

    /// Instance by configuration order
    pub fn route_by_index(&self, index: usize) -> Option<&BackendInstance<S>> {
        self.instances.get(index)
    }

    /// Visit every instance in configuration order
    pub fn for_each(&self, mut visitor: impl FnMut(&BackendInstance<S>)) {
        for instance in &self.instances {
            visitor(instance);
        }
    }

    pub fn instances(&self) -> impl Iterator<Item = &BackendInstance<S>> {
        self.instances.iter()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Number of nodes on the ring
    pub fn ring_size(&self) -> usize {
        self.ring.len()
    }
}

impl ShardRouter<RedisStore> {
    /// Open one Redis pool per shard
    pub fn connect(configs: &[ShardConfig]) -> Result<Self> {
        Self::build(configs, |config| Ok(RedisStore::open(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn shards(layout: &[(&str, u32)]) -> Vec<(ShardConfig, ())> {
        layout
            .iter()
            .enumerate()
            .map(|(index, (host, virtual_count))| {
                let mut config = ShardConfig::new(*host, 6379);
                config.index = index as u32;
                config.virtual_count = *virtual_count;
                (config, ())
            })
            .collect()
    }

    fn owners(router: &ShardRouter<()>, keys: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for i in 0..keys {
            *counts
                .entry(router.route(&format!("user:{i}")).id().to_string())
                .or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_empty_rejected() {
        assert!(matches!(
            ShardRouter::<()>::new(Vec::new()),
            Err(Error::OptionEmpty)
        ));
    }

    #[test]
    fn test_invalid_shard_rejected() {
        let mut layout = shards(&[("a", 0)]);
        layout[0].0.port = 0;
        assert!(matches!(ShardRouter::new(layout), Err(Error::Config(_))));
    }

    #[test]
    fn test_ring_size() {
        let router = ShardRouter::new(shards(&[("a", 0), ("b", 3), ("c", 9)])).unwrap();
        assert_eq!(router.len(), 3);
        assert_eq!(router.ring_size(), 1 + 4 + 10);
    }

    #[test]
    fn test_route_deterministic_across_routers() {
        let layout = [("10.0.0.1", 16), ("10.0.0.2", 16), ("10.0.0.3", 16)];
        let first = ShardRouter::new(shards(&layout)).unwrap();
        let second = ShardRouter::new(shards(&layout)).unwrap();

        for i in 0..500 {
            let key = format!("session:{i}");
            let a = first.route(&key).id();
            assert_eq!(a, first.route(&key).id());
            assert_eq!(a, second.route(&key).id());
        }
    }

    #[test]
    fn test_single_instance_owns_everything() {
        let router = ShardRouter::new(shards(&[("only", 0)])).unwrap();
        assert_eq!(owners(&router, 200).len(), 1);
    }

    #[test]
    fn test_wraps_past_last_node() {
        let router = ShardRouter::new(shards(&[("a", 2), ("b", 2)])).unwrap();
        let last = router.ring.last().unwrap().hash;
        let first_owner = router.ring[0].instance;

        // any key hashing beyond the last node lands on the first node
        let key = (0..100_000)
            .map(|i| format!("k{i}"))
            .find(|k| crc32fast::hash(k.as_bytes()) > last);
        if let Some(key) = key {
            assert_eq!(router.route(&key).id(), router.instances[first_owner].id());
        }
    }

    #[test]
    fn test_virtual_nodes_spread_load() {
        let router = ShardRouter::new(shards(&[("a", 63), ("b", 63), ("c", 63)])).unwrap();
        let counts = owners(&router, 30_000);
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!(*count > 5_000, "unbalanced ring: {counts:?}");
        }
    }

    #[test]
    fn test_more_virtual_nodes_more_keys() {
        let router = ShardRouter::new(shards(&[("small", 0), ("large", 127)])).unwrap();
        let counts = owners(&router, 20_000);
        let large = counts.get("large:6379-1").copied().unwrap_or(0);
        let small = counts.get("small:6379-0").copied().unwrap_or(0);
        assert!(large > small);
    }

    #[test]
    fn test_route_by_index_and_for_each() {
        let router = ShardRouter::new(shards(&[("a", 0), ("b", 0)])).unwrap();
        assert_eq!(router.route_by_index(1).unwrap().id(), "b:6379-1");
        assert!(router.route_by_index(2).is_none());

        let mut seen = Vec::new();
        router.for_each(|instance| seen.push(instance.id().to_string()));
        assert_eq!(seen, vec!["a:6379-0", "b:6379-1"]);
    }

    #[test]
    fn test_hash_code_is_crc32_of_id() {
        let router = ShardRouter::new(shards(&[("a", 0)])).unwrap();
        let instance = router.route_by_index(0).unwrap();
        assert_eq!(instance.hash_code(), crc32fast::hash(b"a:6379-0"));
    }
}
