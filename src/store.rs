//! # Cached Tree Store
//!
//! The public face of the engine: a metadata tree whose working set lives
//! in an in-memory arena while the full tree resides in the schema file.
//! The store wires four collaborators together:
//!
//! - the [`NodeArena`](crate::node::NodeArena) owning resident nodes,
//! - the [`CacheCoordinator`](crate::cache::CacheCoordinator) tracking
//!   volatile/pinned/evictable state,
//! - the [`SchemaFile`](crate::storage::SchemaFile) persisting records,
//! - the [`LockManager`](crate::lock::LockManager) serializing per-node
//!   access.
//!
//! ## Locking Protocol
//!
//! Reads probe the children map under an optimistic stamp and fall back
//! to a thread-held read lock when a writer invalidates it. Mutations
//! take the parent's write lock. Node locks are always acquired before
//! the arena lock, and the arena lock guards only brief map mutations.
//! The flush path follows the same order: it takes the write lock of
//! each flushed node in turn, holds no arena guard across schema-file
//! I/O, and so never blocks traffic on unrelated subtrees. Writers to
//! sibling subtrees proceed in parallel.
//!
//! ## Memory Pressure
//!
//! Every operation that grows the arena ends with a capacity check:
//! volatile subtrees are flushed (making them evictable), then cold
//! subtrees are evicted until the arena is back under
//! `node_cache_capacity`. Volatile and pinned nodes are never evicted.

use eyre::{ensure, Result};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cache::CacheCoordinator;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::lock::LockManager;
use crate::node::{NodeArena, NodeId, NodeKind, TreeNode};
use crate::storage::{
    ChildWrite, NodeWriteRequest, SchemaFile, SegmentAddress, SubtreeHint,
};

pub struct TreeStore {
    config: StoreConfig,
    arena: RwLock<NodeArena>,
    root: NodeId,
    file: SchemaFile,
    cache: CacheCoordinator,
    locks: LockManager,
}

impl TreeStore {
    /// Opens or creates the store over the schema file named in `config`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let file = SchemaFile::open(
            &config.file_path,
            &config.root_name,
            config.page_cache_capacity,
        )?;
        let mut arena = NodeArena::new();
        let mut root_node = TreeNode::new(file.root_name(), NodeKind::Internal, None);
        root_node.subtree_addr = SegmentAddress::ROOT;
        let root = arena.alloc(root_node);

        Ok(Self {
            cache: CacheCoordinator::new(config.node_cache_capacity),
            locks: LockManager::new(config.lock_pool_capacity),
            config,
            arena: RwLock::new(arena),
            root,
            file,
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of nodes currently resident in memory.
    pub fn resident_count(&self) -> usize {
        self.arena.read().len()
    }

    pub fn is_resident(&self, id: NodeId) -> bool {
        self.arena.read().get(id).is_some()
    }

    pub fn node_name(&self, id: NodeId) -> Result<String> {
        let arena = self.arena.read();
        let node = arena.get(id).ok_or_else(|| eyre::eyre!("node {id} not resident"))?;
        Ok(node.name.clone())
    }

    pub fn node_kind(&self, id: NodeId) -> Result<NodeKind> {
        let arena = self.arena.read();
        let node = arena.get(id).ok_or_else(|| eyre::eyre!("node {id} not resident"))?;
        Ok(node.kind.clone())
    }

    pub fn is_volatile(&self, id: NodeId) -> bool {
        self.arena.read().get(id).map(|n| n.volatile).unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // reads
    // ------------------------------------------------------------------

    /// Gets a child by name, loading it from the schema file when it is
    /// not resident. Returns `None` when the child exists neither in
    /// memory nor on disk.
    pub fn get_child(&self, parent: NodeId, name: &str) -> Result<Option<NodeId>> {
        if let Some(id) = self.probe_memory(parent, name)? {
            self.cache.on_memory_read(id);
            return Ok(Some(id));
        }

        // disk path under the parent's thread-held read lock
        let guard = self.locks.read(parent, false);
        let parent_addr = {
            let arena = self.arena.read();
            let node = arena
                .get(parent)
                .ok_or_else(|| eyre::eyre!("parent {parent} not resident"))?;
            // a racing writer may have materialized or appended it
            if let Some(id) = node.children.get(name) {
                self.cache.on_memory_read(id);
                return Ok(Some(id));
            }
            node.subtree_addr
        };
        if parent_addr.is_none() {
            // never flushed: every child it has is already in memory
            return Ok(None);
        }

        let record = self.file.read_child(parent_addr, name)?;
        drop(guard);
        match record {
            None => Ok(None),
            Some(rec) => {
                let id = self.materialize(parent, name, rec)?;
                self.trim_protecting(id)?;
                Ok(Some(id))
            }
        }
    }

    /// Runs the capacity check while holding a transient pin on `id`, so
    /// a node is always resident at the instant its access returns.
    fn trim_protecting(&self, id: NodeId) -> Result<()> {
        {
            let mut arena = self.arena.write();
            if arena.get(id).is_none() {
                return Ok(());
            }
            self.cache.pin(&mut arena, id);
        }
        let result = self.ensure_capacity();
        {
            let mut arena = self.arena.write();
            if arena.get(id).is_some() {
                self.cache.unpin(&mut arena, id);
            }
        }
        result
    }

    /// Optimistic in-memory probe: a stamped read of the parent's child
    /// map, falling back to a thread-held read when invalidated.
    fn probe_memory(&self, parent: NodeId, name: &str) -> Result<Option<NodeId>> {
        let stamped = self.locks.stamped_read(parent);
        let hit = {
            let arena = self.arena.read();
            let node = arena
                .get(parent)
                .ok_or_else(|| eyre::eyre!("parent {parent} not resident"))?;
            node.children.get(name)
        };
        if stamped.validate() {
            return Ok(hit);
        }
        drop(stamped);

        let _guard = self.locks.read(parent, false);
        let arena = self.arena.read();
        let node = arena
            .get(parent)
            .ok_or_else(|| eyre::eyre!("parent {parent} not resident"))?;
        Ok(node.children.get(name))
    }

    /// Materializes a disk record as a resident child node.
    fn materialize(&self, parent: NodeId, name: &str, rec: crate::storage::NodeRecord) -> Result<NodeId> {
        let _guard = self.locks.write(parent);
        let mut arena = self.arena.write();
        ensure!(arena.get(parent).is_some(), "parent {parent} evicted mid-read");
        // another thread may have won the materialization race
        if let Some(id) = arena.node(parent).children.get(name) {
            return Ok(id);
        }
        let mut node = TreeNode::new(name, rec.to_kind(), Some(parent));
        node.subtree_addr = rec.subtree_addr();
        let id = arena.alloc(node);
        arena
            .node_mut(parent)
            .children
            .attach_cached(name.to_string(), id);
        self.cache.on_disk_read(id);
        debug!(parent = %parent, name, id = %id, "materialized child from disk");
        Ok(id)
    }

    /// Cursor over all children of a node: resident children first, then
    /// the on-disk chain (skipping names already seen in memory). Disk
    /// children are materialized as the cursor passes them.
    pub fn children(&self, parent: NodeId) -> Result<ChildrenCursor<'_>> {
        let (mut cached, parent_addr) = {
            let arena = self.arena.read();
            let node = arena
                .get(parent)
                .ok_or_else(|| eyre::eyre!("parent {parent} not resident"))?;
            let mut cached: Vec<(String, NodeId)> = node
                .children
                .iter()
                .map(|(name, id)| (name.clone(), id))
                .collect();
            cached.sort_by(|a, b| a.0.cmp(&b.0));
            (cached, node.subtree_addr)
        };
        cached.reverse(); // consumed by pop()
        Ok(ChildrenCursor {
            store: self,
            parent,
            cached,
            disk: if parent_addr.is_some() {
                Some(self.file.children(parent_addr))
            } else {
                None
            },
        })
    }

    // ------------------------------------------------------------------
    // mutations
    // ------------------------------------------------------------------

    /// Appends a new child under `parent`. The child is volatile until the
    /// next flush persists its record.
    pub fn add_child(&self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        let id = {
            let _guard = self.locks.write(parent);
            let mut arena = self.arena.write();
            let parent_node = arena
                .get(parent)
                .ok_or_else(|| eyre::eyre!("parent {parent} not resident"))?;
            if parent_node.children.contains(name) {
                return Err(StoreError::DuplicateKey(name.to_string()).into());
            }
            let node = TreeNode::new(name, kind, Some(parent));
            let id = arena.alloc(node);
            arena.node_mut(parent).children.append(name.to_string(), id);
            self.cache.on_append(&mut arena, id);
            id
        };
        self.ensure_capacity()?;
        Ok(id)
    }

    /// Replaces the payload of an existing child (e.g. a measurement's
    /// alias), marking its on-disk record stale.
    pub fn update_child(&self, parent: NodeId, name: &str, kind: NodeKind) -> Result<()> {
        let _guard = self.locks.write(parent);
        let mut arena = self.arena.write();
        let id = arena
            .get(parent)
            .ok_or_else(|| eyre::eyre!("parent {parent} not resident"))?
            .children
            .get(name)
            .ok_or_else(|| StoreError::KeyNotFound(name.to_string()))?;
        arena.node_mut(id).kind = kind;
        arena.node_mut(parent).children.mark_updated(name);
        self.cache.on_update(&mut arena, id);
        Ok(())
    }

    /// Deletes a child and its whole subtree, both in memory and on disk.
    pub fn delete_child(&self, parent: NodeId, name: &str) -> Result<()> {
        let _guard = self.locks.write(parent);
        let mut arena = self.arena.write();
        let (parent_addr, resident, was_new) = {
            let parent_node = arena
                .get(parent)
                .ok_or_else(|| eyre::eyre!("parent {parent} not resident"))?;
            let resident = parent_node.children.get(name);
            let was_new = parent_node.children.new_children().iter().any(|n| n == name);
            (parent_node.subtree_addr, resident, was_new)
        };

        match resident {
            Some(id) => {
                let subtree_addr = arena.node(id).subtree_addr;
                ensure!(
                    arena.node(id).pin_count == 0,
                    "cannot delete pinned node '{name}'"
                );
                self.cache.remove_subtree(&mut arena, id);
                if !was_new && parent_addr.is_some() {
                    self.file.remove_record(parent_addr, name)?;
                }
                if subtree_addr.is_some() {
                    self.file.delete_subtree_segments(subtree_addr)?;
                }
            }
            None => {
                // on disk only
                if parent_addr.is_none() {
                    return Err(StoreError::KeyNotFound(name.to_string()).into());
                }
                let rec = self
                    .file
                    .read_child(parent_addr, name)?
                    .ok_or_else(|| StoreError::KeyNotFound(name.to_string()))?;
                self.file.remove_record(parent_addr, name)?;
                if rec.subtree_addr().is_some() {
                    self.file.delete_subtree_segments(rec.subtree_addr())?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // pinning
    // ------------------------------------------------------------------

    /// Pins a node (and transitively its ancestors) against eviction.
    pub fn pin(&self, id: NodeId) -> Result<()> {
        let mut arena = self.arena.write();
        ensure!(arena.get(id).is_some(), "cannot pin non-resident node {id}");
        self.cache.pin(&mut arena, id);
        Ok(())
    }

    /// Releases one pin; pins and unpins must balance.
    pub fn unpin(&self, id: NodeId) -> Result<()> {
        let mut arena = self.arena.write();
        ensure!(arena.get(id).is_some(), "cannot unpin non-resident node {id}");
        self.cache.unpin(&mut arena, id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // flush and eviction
    // ------------------------------------------------------------------

    /// Persists every volatile subtree. Subtrees that fail to write stay
    /// volatile and return to the buffer set; the first error surfaces
    /// after all subtrees were attempted.
    ///
    /// Holds the write lock of each flushed node in turn, never all at
    /// once and never the arena lock across schema-file I/O, so traffic
    /// on subtrees outside the flush proceeds in parallel.
    pub fn flush_volatile(&self) -> Result<()> {
        let roots = self.cache.take_buffered_roots();
        if roots.is_empty() {
            return Ok(());
        }
        debug!(subtrees = roots.len(), "flushing volatile subtrees");

        let mut first_err: Option<eyre::Report> = None;
        for root in roots {
            let list = {
                let arena = self.arena.read();
                self.cache.collect_volatile(&arena, root)
            };
            let mut failed = None;
            for id in list {
                let _guard = self.locks.write(id);
                if let Err(e) = self.write_one_node(id) {
                    failed = Some(e);
                    break;
                }
            }
            match failed {
                None => {
                    let arena = self.arena.read();
                    if arena.get(root).is_some() {
                        self.cache.on_subtree_persisted(&arena, root);
                    }
                }
                Some(e) => {
                    warn!(subtree = %root, error = %e, "flush failed; subtree stays volatile");
                    self.cache.restore_buffered_root(root);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Writes one node's dirty children: builds the request under a short
    /// arena read, runs the schema-file write with no arena guard held,
    /// then applies the outcome (pre-allocated child segments, migrated
    /// node segment) and finalizes the written children's cache state.
    ///
    /// The caller holds the node's write lock, so the child buffers
    /// cannot shift between the request build and the finalization.
    fn write_one_node(&self, id: NodeId) -> Result<()> {
        let req = {
            let arena = self.arena.read();
            let node = match arena.get(id) {
                Some(n) => n,
                // finalized and evicted by a concurrent flush
                None => return Ok(()),
            };
            let parent_addr = node
                .parent
                .map(|p| arena.node(p).subtree_addr)
                .unwrap_or(SegmentAddress::NONE);
            let new_children: Vec<ChildWrite> = node
                .children
                .new_children()
                .into_iter()
                .filter_map(|name| node.children.get(&name).map(|cid| (name, cid)))
                .map(|(name, cid)| self.child_write(&arena, name, cid))
                .collect();
            let updated_children: Vec<ChildWrite> = node
                .children
                .updated_children()
                .into_iter()
                .filter_map(|name| node.children.get(&name).map(|cid| (name, cid)))
                .map(|(name, cid)| self.child_write(&arena, name, cid))
                .collect();
            NodeWriteRequest {
                name: node.name.clone(),
                parent_addr,
                addr: node.subtree_addr,
                is_root: node.parent.is_none(),
                new_children,
                updated_children,
            }
        };
        if req.new_children.is_empty() && req.updated_children.is_empty() {
            return Ok(());
        }

        let outcome = self.file.write_node(&req)?;

        let mut arena = self.arena.write();
        if arena.get(id).is_none() {
            return Ok(());
        }
        arena.node_mut(id).subtree_addr = outcome.addr;
        for (name, addr) in outcome.child_addrs {
            if let Some(cid) = arena.node(id).children.get(&name) {
                arena.node_mut(cid).subtree_addr = addr;
            }
        }
        let persisted: Vec<String> = req
            .new_children
            .iter()
            .chain(req.updated_children.iter())
            .map(|c| c.name.clone())
            .collect();
        self.cache.on_node_persisted(&mut arena, id, &persisted);
        Ok(())
    }

    fn child_write(&self, arena: &NodeArena, name: String, cid: NodeId) -> ChildWrite {
        let child = arena.node(cid);
        let record = crate::storage::NodeRecord::from_node(&child.kind, child.subtree_addr);
        let subtree_hint = if child.kind.has_subtree() && child.subtree_addr.is_none() {
            let mut hint = SubtreeHint {
                child_count: child.children.len(),
                ..Default::default()
            };
            for (gname, gid) in child.children.iter() {
                hint.name_bytes += gname.len();
                if let Some(grand) = arena.get(gid) {
                    if grand.kind.is_measurement() {
                        hint.measurement_count += 1;
                        hint.alias_bytes += grand.kind.alias().map_or(0, str::len);
                    }
                }
            }
            Some(hint)
        } else {
            None
        };
        ChildWrite {
            name,
            record,
            subtree_hint,
        }
    }

    /// Brings the resident set back under `node_cache_capacity`: flush
    /// (volatile nodes cannot be evicted), then evict cold subtrees.
    ///
    /// The arena lock is re-taken for each eviction step, so readers
    /// interleave with a long eviction pass instead of stalling behind it.
    pub fn ensure_capacity(&self) -> Result<()> {
        if self.arena.read().len() <= self.cache.capacity() {
            return Ok(());
        }
        self.flush_volatile()?;

        loop {
            let mut arena = self.arena.write();
            if arena.len() <= self.cache.capacity() {
                return Ok(());
            }
            if self.cache.evict(&mut arena).is_empty() {
                warn!(
                    resident = arena.len(),
                    capacity = self.cache.capacity(),
                    "node cache over capacity with nothing evictable"
                );
                return Ok(());
            }
        }
    }

    /// Flushes volatile subtrees and forces the schema file to disk.
    pub fn flush(&self) -> Result<()> {
        self.flush_volatile()?;
        self.file.flush()
    }

    /// Flushes everything and consumes the store.
    pub fn close(self) -> Result<()> {
        self.flush_volatile()?;
        self.file.close()
    }

    /// Page-by-page dump of the backing file, for debugging.
    pub fn inspect(&self) -> Result<String> {
        self.file.inspect()
    }
}

/// Iterator over a node's children, memory first, then the on-disk chain.
///
/// Not restartable; it consumes the chain position as it goes. Items are
/// materialized into the arena as the cursor reaches them.
pub struct ChildrenCursor<'a> {
    store: &'a TreeStore,
    parent: NodeId,
    cached: Vec<(String, NodeId)>,
    disk: Option<crate::storage::ChildrenIter<'a>>,
}

impl Iterator for ChildrenCursor<'_> {
    type Item = Result<NodeId>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((_, id)) = self.cached.pop() {
            self.store.cache.on_memory_read(id);
            return Some(Ok(id));
        }
        let disk = self.disk.as_mut()?;
        loop {
            let (name, rec) = match disk.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            // skip names that were already yielded from memory (their
            // in-memory state may be newer than the disk record)
            let already_resident = {
                let arena = self.store.arena.read();
                match arena.get(self.parent) {
                    Some(node) => node.children.contains(&name),
                    None => return Some(Err(eyre::eyre!("parent evicted during iteration"))),
                }
            };
            if already_resident {
                continue;
            }
            let result = self
                .store
                .materialize(self.parent, &name, rec)
                .and_then(|id| {
                    self.store.trim_protecting(id)?;
                    Ok(id)
                });
            return Some(result);
        }
    }
}
