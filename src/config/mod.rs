//! # Configuration Module
//!
//! Centralizes the engine's layout constants and the programmatic
//! configuration passed to [`crate::store::TreeStore`]. Layout constants
//! carry compile-time assertions for their interdependencies; runtime
//! sizing (cache capacities, lock pool size) travels in [`StoreConfig`].

pub mod constants;
pub use constants::*;

use std::path::{Path, PathBuf};

/// Runtime configuration for a tree store instance.
///
/// All sizing knobs default to the constants in [`constants`]; only the
/// file path is mandatory.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub file_path: PathBuf,
    pub root_name: String,
    pub page_cache_capacity: usize,
    pub node_cache_capacity: usize,
    pub lock_pool_capacity: usize,
}

impl StoreConfig {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            root_name: "root".to_string(),
            page_cache_capacity: DEFAULT_PAGE_CACHE_CAPACITY,
            node_cache_capacity: DEFAULT_NODE_CACHE_CAPACITY,
            lock_pool_capacity: DEFAULT_LOCK_POOL_CAPACITY,
        }
    }

    pub fn root_name(mut self, name: impl Into<String>) -> Self {
        self.root_name = name.into();
        self
    }

    pub fn page_cache_capacity(mut self, frames: usize) -> Self {
        self.page_cache_capacity = frames.max(2);
        self
    }

    pub fn node_cache_capacity(mut self, nodes: usize) -> Self {
        self.node_cache_capacity = nodes.max(1);
        self
    }

    pub fn lock_pool_capacity(mut self, locks: usize) -> Self {
        self.lock_pool_capacity = locks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = StoreConfig::new("/tmp/meta.pmt");
        assert_eq!(cfg.page_cache_capacity, DEFAULT_PAGE_CACHE_CAPACITY);
        assert_eq!(cfg.node_cache_capacity, DEFAULT_NODE_CACHE_CAPACITY);
        assert_eq!(cfg.lock_pool_capacity, DEFAULT_LOCK_POOL_CAPACITY);
        assert_eq!(cfg.root_name, "root");
    }

    #[test]
    fn config_builder_overrides() {
        let cfg = StoreConfig::new("/tmp/meta.pmt")
            .root_name("sg1")
            .page_cache_capacity(8)
            .node_cache_capacity(100)
            .lock_pool_capacity(16);
        assert_eq!(cfg.page_cache_capacity, 8);
        assert_eq!(cfg.node_cache_capacity, 100);
        assert_eq!(cfg.lock_pool_capacity, 16);
        assert_eq!(cfg.root_name, "sg1");
    }

    #[test]
    fn config_enforces_minimum_page_cache() {
        let cfg = StoreConfig::new("/tmp/meta.pmt").page_cache_capacity(0);
        assert_eq!(cfg.page_cache_capacity, 2);
    }
}
