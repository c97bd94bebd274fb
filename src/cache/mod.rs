//! # Cache Coordinator
//!
//! Tracks the cache status of every resident tree node and drives flush
//! collection and eviction. Resident nodes fall into three disjoint
//! populations:
//!
//! - **Cold set**: evictable nodes (clean, unpinned), kept in a sharded
//!   recency structure so LRU bumps on hot reads do not contend on one
//!   lock.
//! - **Buffer set**: the roots of every maximal volatile subtree. A node
//!   sits in the buffer set iff it is not volatile itself but has at least
//!   one volatile child; flushing snapshots and clears this set.
//! - **Pinned**: anything with a positive pin count, implicit in the node
//!   state.
//!
//! ## Invariants
//!
//! - A volatile node's ancestors are all resident and outside the cold
//!   set, so eviction can never orphan unwritten data.
//! - Pinning is transitive: a node's pin count is at least the pin count
//!   of any descendant. Pins and unpins walk the whole ancestor chain.
//! - Eviction removes a subtree atomically; no partial tear-down leaves
//!   orphans behind in the cold set.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::COLD_SHARD_COUNT;
use crate::node::{NodeArena, NodeId};

struct ColdShard {
    entries: HashMap<NodeId, u64>,
}

/// Per-node cache bookkeeping and the flush/eviction drivers.
pub struct CacheCoordinator {
    cold: Vec<Mutex<ColdShard>>,
    buffer: Mutex<HashSet<NodeId>>,
    tick: AtomicU64,
    evict_cursor: AtomicUsize,
    capacity: usize,
}

impl CacheCoordinator {
    pub fn new(capacity: usize) -> Self {
        Self {
            cold: (0..COLD_SHARD_COUNT)
                .map(|_| {
                    Mutex::new(ColdShard {
                        entries: HashMap::new(),
                    })
                })
                .collect(),
            buffer: Mutex::new(HashSet::new()),
            tick: AtomicU64::new(0),
            evict_cursor: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn shard(&self, id: NodeId) -> &Mutex<ColdShard> {
        &self.cold[id.0 as usize % COLD_SHARD_COUNT]
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert_cold(&self, id: NodeId) {
        let tick = self.next_tick();
        self.shard(id).lock().entries.insert(id, tick);
    }

    fn remove_cold(&self, id: NodeId) -> bool {
        self.shard(id).lock().entries.remove(&id).is_some()
    }

    pub fn cold_contains(&self, id: NodeId) -> bool {
        self.shard(id).lock().entries.contains_key(&id)
    }

    pub fn cold_len(&self) -> usize {
        self.cold.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn buffered_roots(&self) -> Vec<NodeId> {
        self.buffer.lock().iter().copied().collect()
    }

    // ------------------------------------------------------------------
    // cache status transitions
    // ------------------------------------------------------------------

    /// A resident node was read: bump its recency if it is evictable.
    pub fn on_memory_read(&self, id: NodeId) {
        let tick = self.next_tick();
        if let Some(stamp) = self.shard(id).lock().entries.get_mut(&id) {
            *stamp = tick;
        }
    }

    /// A node was materialized from disk: it joins the cold set.
    pub fn on_disk_read(&self, id: NodeId) {
        self.insert_cold(id);
    }

    /// A child was appended in memory: it becomes volatile, its ancestors
    /// leave the cold set, and the first non-volatile ancestor marks the
    /// volatile subtree in the buffer set.
    pub fn on_append(&self, arena: &mut NodeArena, id: NodeId) {
        arena.node_mut(id).volatile = true;
        self.remove_cold(id);
        self.shield_ancestors(arena, id);
    }

    /// A node's record changed in memory: same protocol as append, except
    /// an already-volatile node needs nothing.
    pub fn on_update(&self, arena: &mut NodeArena, id: NodeId) {
        if arena.node(id).volatile {
            return;
        }
        arena.node_mut(id).volatile = true;
        self.remove_cold(id);
        self.shield_ancestors(arena, id);
    }

    /// Pulls the node's ancestors out of the eviction pool and records the
    /// volatile subtree root in the buffer set.
    fn shield_ancestors(&self, arena: &NodeArena, id: NodeId) {
        let mut cur = arena.parent_of(id);
        while let Some(pid) = cur {
            if self.remove_cold(pid) {
                cur = arena.parent_of(pid);
            } else {
                break;
            }
        }
        if let Some(pid) = arena.parent_of(id) {
            if !arena.node(pid).volatile {
                self.buffer.lock().insert(pid);
            }
        }
    }

    // ------------------------------------------------------------------
    // flush support
    // ------------------------------------------------------------------

    /// Snapshots and clears the buffer set. Failed subtrees are re-added
    /// via [`CacheCoordinator::restore_buffered_root`].
    pub fn take_buffered_roots(&self) -> Vec<NodeId> {
        let mut buffer = self.buffer.lock();
        let roots: Vec<NodeId> = buffer.iter().copied().collect();
        buffer.clear();
        roots
    }

    pub fn restore_buffered_root(&self, id: NodeId) {
        self.buffer.lock().insert(id);
    }

    /// Nodes with volatile children under `root`, parents before children:
    /// the flush write list. Pre-allocation of a child's subtree segment
    /// is visible by the time the child itself is written.
    pub fn collect_volatile(&self, arena: &NodeArena, root: NodeId) -> Vec<NodeId> {
        let mut list = Vec::new();
        self.collect_volatile_into(arena, root, &mut list);
        list
    }

    fn collect_volatile_into(&self, arena: &NodeArena, id: NodeId, list: &mut Vec<NodeId>) {
        let node = match arena.get(id) {
            Some(n) => n,
            None => return,
        };
        let mut volatile_children: Vec<(String, NodeId)> = node
            .children
            .iter()
            .filter(|(_, cid)| arena.get(*cid).is_some_and(|c| c.volatile))
            .map(|(name, cid)| (name.clone(), cid))
            .collect();
        if volatile_children.is_empty() {
            return;
        }
        volatile_children.sort_by(|a, b| a.0.cmp(&b.0));
        list.push(id);
        for (_, cid) in volatile_children {
            self.collect_volatile_into(arena, cid, list);
        }
    }

    /// One node's listed children were written out: clear their volatile
    /// state, move them to the committed population and return them to
    /// the cold set. The flush driver calls this right after each node's
    /// write, under that node's write lock.
    ///
    /// A child that gained volatile children of its own while the flush
    /// ran is now the root of a fresh maximal volatile subtree: it goes
    /// to the buffer set instead of the eviction pool.
    pub fn on_node_persisted(&self, arena: &mut NodeArena, id: NodeId, persisted: &[String]) {
        for name in persisted {
            let cid = match arena.node(id).children.get(name) {
                Some(cid) => cid,
                None => continue,
            };
            arena.node_mut(id).children.move_to_committed(name);
            arena.node_mut(cid).volatile = false;
            if arena.node(cid).children.has_volatile_children() {
                self.buffer.lock().insert(cid);
            } else {
                self.insert_cold(cid);
            }
        }
        // a parent-before-child pass buffers an interior node when its
        // record lands before its children do; once its own children are
        // written it is a plain cold node again
        if !arena.node(id).children.has_volatile_children() {
            let was_buffered = self.buffer.lock().remove(&id);
            if was_buffered && arena.parent_of(id).is_some() {
                self.insert_cold(id);
            }
        }
    }

    /// A whole volatile subtree finished flushing: its root and the
    /// root's ancestors re-enter the cold set (the tree root itself
    /// stays out of the pool). The walk stops at any node re-dirtied
    /// while the flush ran; the buffer set covers that chain again.
    pub fn on_subtree_persisted(&self, arena: &NodeArena, subtree_root: NodeId) {
        let mut cur = subtree_root;
        loop {
            if arena.parent_of(cur).is_none() || self.cold_contains(cur) {
                break;
            }
            let node = match arena.get(cur) {
                Some(n) => n,
                None => break,
            };
            if node.volatile || node.children.has_volatile_children() {
                break;
            }
            self.insert_cold(cur);
            match arena.parent_of(cur) {
                Some(p) => cur = p,
                None => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // pinning
    // ------------------------------------------------------------------

    /// Pins a node and its whole ancestor chain. A pinned node is never
    /// evicted; the transitive walk keeps every ancestor at least as
    /// pinned as its descendants.
    pub fn pin(&self, arena: &mut NodeArena, id: NodeId) {
        arena.node_mut(id).pin_count += 1;
        for anc in arena.ancestors(id) {
            arena.node_mut(anc).pin_count += 1;
        }
    }

    /// Releases one pin on a node and its ancestor chain. Pins and unpins
    /// must balance; a leaked pin leaks the whole chain.
    pub fn unpin(&self, arena: &mut NodeArena, id: NodeId) {
        let node = arena.node_mut(id);
        debug_assert!(node.pin_count > 0, "unpin without a pin");
        node.pin_count = node.pin_count.saturating_sub(1);
        for anc in arena.ancestors(id) {
            let node = arena.node_mut(anc);
            debug_assert!(node.pin_count > 0, "ancestor pin underflow");
            node.pin_count = node.pin_count.saturating_sub(1);
        }
    }

    // ------------------------------------------------------------------
    // eviction
    // ------------------------------------------------------------------

    /// Evicts one evictable subtree, chosen LRU-first from a rotating cold
    /// shard. Returns the ids removed from the arena (empty when nothing
    /// is evictable).
    pub fn evict(&self, arena: &mut NodeArena) -> Vec<NodeId> {
        let start = self.evict_cursor.fetch_add(1, Ordering::Relaxed);
        for probe in 0..COLD_SHARD_COUNT {
            let shard_idx = (start + probe) % COLD_SHARD_COUNT;
            let victim = {
                let shard = self.cold[shard_idx].lock();
                shard
                    .entries
                    .iter()
                    .filter(|(id, _)| arena.get(**id).is_some_and(|n| n.is_evictable()))
                    .min_by_key(|(_, stamp)| **stamp)
                    .map(|(id, _)| *id)
            };
            if let Some(id) = victim {
                let removed = self.remove_subtree(arena, id);
                debug!(victim = %id, removed = removed.len(), "evicted subtree");
                return removed;
            }
        }
        Vec::new()
    }

    /// Detaches a node from its parent and drops the whole subtree from
    /// the arena, the cold set and the buffer set, atomically with respect
    /// to the arena borrow.
    pub fn remove_subtree(&self, arena: &mut NodeArena, id: NodeId) -> Vec<NodeId> {
        if let Some(pid) = arena.parent_of(id) {
            let name = arena.node(id).name.clone();
            arena.node_mut(pid).children.remove(&name);
        }
        let mut removed = Vec::new();
        self.drop_recursively(arena, id, &mut removed);
        removed
    }

    fn drop_recursively(&self, arena: &mut NodeArena, id: NodeId, removed: &mut Vec<NodeId>) {
        let children: Vec<NodeId> = match arena.get(id) {
            Some(node) => node.children.iter().map(|(_, cid)| cid).collect(),
            None => return,
        };
        for cid in children {
            self.drop_recursively(arena, cid, removed);
        }
        self.remove_cold(id);
        self.buffer.lock().remove(&id);
        arena.remove(id);
        removed.push(id);
    }

    pub fn clear(&self) {
        for shard in &self.cold {
            shard.lock().entries.clear();
        }
        self.buffer.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, TreeNode};

    struct Fixture {
        arena: NodeArena,
        coord: CacheCoordinator,
        root: NodeId,
    }

    impl Fixture {
        fn new(capacity: usize) -> Self {
            let mut arena = NodeArena::new();
            let root = arena.alloc(TreeNode::new("root", NodeKind::Internal, None));
            Self {
                arena,
                coord: CacheCoordinator::new(capacity),
                root,
            }
        }

        fn append(&mut self, parent: NodeId, name: &str) -> NodeId {
            let id = self
                .arena
                .alloc(TreeNode::new(name, NodeKind::Internal, Some(parent)));
            self.arena
                .node_mut(parent)
                .children
                .append(name.to_string(), id);
            self.coord.on_append(&mut self.arena, id);
            id
        }

        fn load_from_disk(&mut self, parent: NodeId, name: &str) -> NodeId {
            let id = self
                .arena
                .alloc(TreeNode::new(name, NodeKind::Internal, Some(parent)));
            self.arena
                .node_mut(parent)
                .children
                .attach_cached(name.to_string(), id);
            self.coord.on_disk_read(id);
            id
        }
    }

    #[test]
    fn append_marks_volatile_and_buffers_parent() {
        let mut fx = Fixture::new(100);
        let db = fx.append(fx.root, "db");

        assert!(fx.arena.node(db).volatile);
        assert!(!fx.coord.cold_contains(db));
        assert_eq!(fx.coord.buffered_roots(), vec![fx.root]);
    }

    #[test]
    fn append_under_volatile_parent_buffers_nothing_new() {
        let mut fx = Fixture::new(100);
        let db = fx.append(fx.root, "db");
        let dev = fx.append(db, "dev");

        assert!(fx.arena.node(dev).volatile);
        // db is volatile itself, so the subtree root stays the tree root
        assert_eq!(fx.coord.buffered_roots(), vec![fx.root]);
    }

    #[test]
    fn volatile_invariant_ancestors_leave_cold_set() {
        let mut fx = Fixture::new(100);
        let db = fx.load_from_disk(fx.root, "db");
        let dev = fx.load_from_disk(db, "dev");
        assert!(fx.coord.cold_contains(db));
        assert!(fx.coord.cold_contains(dev));

        let s1 = fx.append(dev, "s1");
        assert!(fx.arena.node(s1).volatile);
        assert!(!fx.coord.cold_contains(dev));
        assert!(!fx.coord.cold_contains(db));
        assert_eq!(fx.coord.buffered_roots(), vec![dev]);
    }

    #[test]
    fn update_of_clean_node_shields_ancestors() {
        let mut fx = Fixture::new(100);
        let db = fx.load_from_disk(fx.root, "db");
        let dev = fx.load_from_disk(db, "dev");

        fx.arena.node_mut(db).children.mark_updated("dev");
        fx.coord.on_update(&mut fx.arena, dev);

        assert!(fx.arena.node(dev).volatile);
        assert!(!fx.coord.cold_contains(dev));
        assert!(!fx.coord.cold_contains(db));
        assert_eq!(fx.coord.buffered_roots(), vec![db]);
    }

    #[test]
    fn collect_volatile_orders_parents_first() {
        let mut fx = Fixture::new(100);
        let db = fx.append(fx.root, "db");
        let dev = fx.append(db, "dev");
        let _s1 = fx.append(dev, "s1");

        let list = fx.coord.collect_volatile(&fx.arena, fx.root);
        assert_eq!(list, vec![fx.root, db, dev]);
    }

    #[test]
    fn persist_returns_subtree_to_cold_set() {
        let mut fx = Fixture::new(100);
        let db = fx.append(fx.root, "db");
        let dev = fx.append(db, "dev");

        let roots = fx.coord.take_buffered_roots();
        assert_eq!(roots, vec![fx.root]);
        // the flush driver finalizes each written node in turn, parents
        // first, then releases the subtree root
        fx.coord
            .on_node_persisted(&mut fx.arena, fx.root, &["db".to_string()]);
        fx.coord
            .on_node_persisted(&mut fx.arena, db, &["dev".to_string()]);
        fx.coord.on_subtree_persisted(&fx.arena, fx.root);

        assert!(!fx.arena.node(db).volatile);
        assert!(!fx.arena.node(dev).volatile);
        assert!(fx.coord.cold_contains(db));
        assert!(fx.coord.cold_contains(dev));
        assert!(!fx.coord.cold_contains(fx.root), "tree root is never evictable");
        assert!(!fx.arena.node(db).children.has_volatile_children());
        assert!(fx.coord.buffered_roots().is_empty());
    }

    #[test]
    fn pin_walks_the_whole_ancestor_chain() {
        let mut fx = Fixture::new(100);
        let db = fx.append(fx.root, "db");
        let dev = fx.append(db, "dev");

        fx.coord.pin(&mut fx.arena, dev);
        fx.coord.pin(&mut fx.arena, dev);
        fx.coord.pin(&mut fx.arena, db);

        assert_eq!(fx.arena.node(dev).pin_count, 2);
        assert_eq!(fx.arena.node(db).pin_count, 3);
        assert_eq!(fx.arena.node(fx.root).pin_count, 3);

        fx.coord.unpin(&mut fx.arena, dev);
        fx.coord.unpin(&mut fx.arena, dev);
        fx.coord.unpin(&mut fx.arena, db);

        for id in [dev, db, fx.root] {
            assert_eq!(fx.arena.node(id).pin_count, 0);
        }
    }

    #[test]
    fn pin_invariant_holds_for_descendants() {
        let mut fx = Fixture::new(100);
        let db = fx.append(fx.root, "db");
        let dev = fx.append(db, "dev");
        let s1 = fx.append(dev, "s1");

        fx.coord.pin(&mut fx.arena, s1);
        fx.coord.pin(&mut fx.arena, dev);

        let chain = [s1, dev, db, fx.root];
        for pair in chain.windows(2) {
            assert!(
                fx.arena.node(pair[1]).pin_count >= fx.arena.node(pair[0]).pin_count,
                "ancestor must be pinned at least as much as its descendant"
            );
        }
    }

    #[test]
    fn evict_skips_pinned_and_volatile_nodes() {
        let mut fx = Fixture::new(100);
        let pinned = fx.load_from_disk(fx.root, "pinned");
        let vol = fx.append(fx.root, "vol");
        fx.coord.pin(&mut fx.arena, pinned);

        assert!(fx.coord.evict(&mut fx.arena).is_empty());
        assert!(fx.arena.get(pinned).is_some());
        assert!(fx.arena.get(vol).is_some());
    }

    #[test]
    fn evict_removes_whole_subtree_atomically() {
        let mut fx = Fixture::new(100);
        let db = fx.load_from_disk(fx.root, "db");
        let dev = fx.load_from_disk(db, "dev");
        let s1 = fx.load_from_disk(dev, "s1");

        // db is the LRU entry and its descendants are all evictable
        let removed = fx.coord.evict(&mut fx.arena);
        assert_eq!(removed.len(), 3);
        for id in [db, dev, s1] {
            assert!(fx.arena.get(id).is_none());
            assert!(!fx.coord.cold_contains(id));
        }
        assert!(fx.arena.node(fx.root).children.get("db").is_none());
        assert_eq!(fx.arena.len(), 1);
    }

    #[test]
    fn memory_read_refreshes_recency() {
        let mut fx = Fixture::new(100);
        let a = fx.load_from_disk(fx.root, "a");
        let b = fx.load_from_disk(fx.root, "b");

        // touch a so b becomes the older entry
        fx.coord.on_memory_read(a);

        let removed = fx.coord.evict(&mut fx.arena);
        // shard rotation may pick either shard first; both nodes are
        // evictable, but within one shard the LRU entry wins
        assert_eq!(removed.len(), 1);
        if removed[0] == a {
            assert!(fx.arena.get(b).is_some());
        } else {
            assert_eq!(removed[0], b);
            assert!(fx.arena.get(a).is_some());
        }
    }
}
