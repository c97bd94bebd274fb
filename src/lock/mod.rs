//! # Per-Node Read/Write Locking
//!
//! Writer-preferred multi-reader locks acquired on each tree node during
//! traversal, with two reader modes:
//!
//! - **Thread-held read**: counts the reader and blocks while a writer
//!   holds the lock or writers are queued. Passing `prior = true` bypasses
//!   the waiting-writer check; traversals use it on hot ancestors so a
//!   slow writer deep in the tree cannot starve them.
//! - **Stamped (optimistic) read**: takes a stamp without blocking or
//!   touching any counter. The caller validates the stamp after reading
//!   and falls back to a thread-held read when invalidated.
//!
//! Writers queue first (`waiting_writers`), wait for the lock to drain,
//! then hold it exclusively. Acquiring and releasing a writer both advance
//! the stamp, so the stamp is odd exactly while a writer is active; a
//! stamp validates only if it is even and unchanged.
//!
//! Unlocking a writer wakes one queued writer first, else all readers.
//! There is no in-place read→write upgrade: release and re-acquire.
//!
//! ## Lock Table and Pool
//!
//! Nodes do not own locks permanently. A sharded table attaches a pooled
//! lock to a node on first use and detaches it once no handles remain and
//! the lock is free, returning it to a bounded pool (drops beyond
//! capacity; locks are cheap to reconstruct).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::config::LOCK_SHARD_COUNT;
use crate::node::NodeId;

#[derive(Debug, Default)]
struct LockState {
    readers: i64,
    writer: bool,
    waiting_writers: u32,
}

/// Writer-preferred reader/writer lock with optimistic stamped reads.
#[derive(Debug, Default)]
pub struct StampedWriterPreferredLock {
    state: Mutex<LockState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
    stamp: AtomicU64,
}

impl StampedWriterPreferredLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes an optimistic read stamp. Never blocks.
    pub fn stamped_read(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    /// Whether a stamped read that started at `stamp` observed no
    /// concurrent writer: the stamp is even (no writer active when taken)
    /// and unchanged (no writer acquired since).
    pub fn validate(&self, stamp: u64) -> bool {
        stamp % 2 == 0 && self.stamp.load(Ordering::Acquire) == stamp
    }

    /// Blocking shared acquisition. Without `prior`, queued writers bar
    /// new readers; with `prior`, only an active writer does.
    pub fn thread_read_lock(&self, prior: bool) {
        let mut state = self.state.lock();
        while state.writer || (!prior && state.waiting_writers > 0) {
            self.readers_cv.wait(&mut state);
        }
        state.readers += 1;
    }

    pub fn thread_read_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "read unlock without a reader");
        state.readers -= 1;
        if state.readers == 0 && state.waiting_writers > 0 {
            self.writers_cv.notify_one();
        }
    }

    /// Blocking exclusive acquisition. Queues first so readers arriving
    /// later cannot starve the writer.
    pub fn write_lock(&self) {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while state.readers > 0 || state.writer {
            self.writers_cv.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = true;
        // odd stamp: writer active, all outstanding stamps invalidated
        self.stamp.fetch_add(1, Ordering::Release);
    }

    pub fn write_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer, "write unlock without the writer");
        state.writer = false;
        self.stamp.fetch_add(1, Ordering::Release);
        if state.waiting_writers > 0 {
            self.writers_cv.notify_one();
        } else {
            self.readers_cv.notify_all();
        }
    }

    /// Fully idle: no reader, no writer, nobody queued. Only free locks
    /// may return to the pool.
    pub fn is_free(&self) -> bool {
        let state = self.state.lock();
        state.readers == 0 && !state.writer && state.waiting_writers == 0
    }

    #[cfg(test)]
    fn waiting_writers(&self) -> u32 {
        self.state.lock().waiting_writers
    }
}

/// Bounded stack of idle locks. Borrowing past empty constructs a fresh
/// lock; returning past capacity drops it.
struct LockPool {
    idle: Mutex<Vec<Arc<StampedWriterPreferredLock>>>,
    capacity: usize,
}

impl LockPool {
    fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    fn borrow(&self) -> Arc<StampedWriterPreferredLock> {
        self.idle
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(StampedWriterPreferredLock::new()))
    }

    fn give_back(&self, lock: Arc<StampedWriterPreferredLock>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(lock);
        }
    }
}

struct LockEntry {
    lock: Arc<StampedWriterPreferredLock>,
    handles: u64,
}

struct LockShard {
    entries: Mutex<HashMap<NodeId, LockEntry>>,
}

/// Sharded table lazily attaching pooled locks to nodes.
pub struct LockManager {
    shards: Vec<LockShard>,
    pool: LockPool,
}

impl LockManager {
    pub fn new(pool_capacity: usize) -> Self {
        Self {
            shards: (0..LOCK_SHARD_COUNT)
                .map(|_| LockShard {
                    entries: Mutex::new(HashMap::new()),
                })
                .collect(),
            pool: LockPool::new(pool_capacity),
        }
    }

    fn shard(&self, id: NodeId) -> &LockShard {
        &self.shards[id.0 as usize % LOCK_SHARD_COUNT]
    }

    /// Gets the node's lock, attaching one from the pool on first use.
    /// Every acquisition path goes through here and must be paired with
    /// [`LockManager::release_handle`].
    fn acquire_handle(&self, id: NodeId) -> Arc<StampedWriterPreferredLock> {
        let mut entries = self.shard(id).entries.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.handles += 1;
            return Arc::clone(&entry.lock);
        }
        let lock = self.pool.borrow();
        entries.insert(
            id,
            LockEntry {
                lock: Arc::clone(&lock),
                handles: 1,
            },
        );
        lock
    }

    /// Drops one handle; the last handle on a free lock detaches it and
    /// returns it to the pool.
    fn release_handle(&self, id: NodeId) {
        let mut entries = self.shard(id).entries.lock();
        let detach = match entries.get_mut(&id) {
            Some(entry) => {
                entry.handles -= 1;
                entry.handles == 0 && entry.lock.is_free()
            }
            None => false,
        };
        if detach {
            let entry = entries.remove(&id).expect("entry vanished under lock");
            self.pool.give_back(entry.lock);
        }
    }

    /// Shared lock on a node. `prior` bypasses writer-starvation
    /// protection, for hot ancestors on the traversal path.
    pub fn read(&self, id: NodeId, prior: bool) -> NodeReadGuard<'_> {
        let lock = self.acquire_handle(id);
        lock.thread_read_lock(prior);
        NodeReadGuard {
            manager: self,
            id,
            lock,
        }
    }

    /// Exclusive lock on a node.
    pub fn write(&self, id: NodeId) -> NodeWriteGuard<'_> {
        let lock = self.acquire_handle(id);
        lock.write_lock();
        NodeWriteGuard {
            manager: self,
            id,
            lock,
        }
    }

    /// Optimistic read token for a node. Never blocks.
    pub fn stamped_read(&self, id: NodeId) -> StampedReadGuard<'_> {
        let lock = self.acquire_handle(id);
        let stamp = lock.stamped_read();
        StampedReadGuard {
            manager: self,
            id,
            lock,
            stamp,
        }
    }

    #[cfg(test)]
    fn attached_count(&self) -> usize {
        self.shards.iter().map(|s| s.entries.lock().len()).sum()
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.pool.idle.lock().len()
    }
}

/// RAII shared lock; released (and possibly detached) on drop.
pub struct NodeReadGuard<'a> {
    manager: &'a LockManager,
    id: NodeId,
    lock: Arc<StampedWriterPreferredLock>,
}

impl Drop for NodeReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.thread_read_unlock();
        self.manager.release_handle(self.id);
    }
}

/// RAII exclusive lock; released (and possibly detached) on drop.
pub struct NodeWriteGuard<'a> {
    manager: &'a LockManager,
    id: NodeId,
    lock: Arc<StampedWriterPreferredLock>,
}

impl Drop for NodeWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock();
        self.manager.release_handle(self.id);
    }
}

/// Optimistic read token. Holding it keeps the lock object attached so
/// validation always runs against the same lock the stamp came from.
pub struct StampedReadGuard<'a> {
    manager: &'a LockManager,
    id: NodeId,
    lock: Arc<StampedWriterPreferredLock>,
    stamp: u64,
}

impl StampedReadGuard<'_> {
    /// True iff no writer ran on this node since the stamp was taken.
    pub fn validate(&self) -> bool {
        self.lock.validate(self.stamp)
    }
}

impl Drop for StampedReadGuard<'_> {
    fn drop(&mut self) {
        self.manager.release_handle(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;
    use std::time::Duration;

    fn spin_until(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for: {what}");
    }

    #[test]
    fn readers_share_the_lock() {
        let lock = StampedWriterPreferredLock::new();
        lock.thread_read_lock(false);
        lock.thread_read_lock(false);
        lock.thread_read_unlock();
        lock.thread_read_unlock();
        assert!(lock.is_free());
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(StampedWriterPreferredLock::new());
        lock.write_lock();

        let l = Arc::clone(&lock);
        let acquired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&acquired);
        let reader = thread::spawn(move || {
            l.thread_read_lock(false);
            flag.store(true, Ordering::SeqCst);
            l.thread_read_unlock();
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));

        lock.write_unlock();
        reader.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn queued_writer_blocks_new_readers_but_not_prior() {
        let lock = Arc::new(StampedWriterPreferredLock::new());
        lock.thread_read_lock(false);

        let l = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            l.write_lock();
            l.write_unlock();
        });
        spin_until("writer queued", || lock.waiting_writers() == 1);

        // a prior reader slips past the queued writer
        lock.thread_read_lock(true);
        lock.thread_read_unlock();

        // a plain reader must wait behind the writer
        let l = Arc::clone(&lock);
        let acquired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&acquired);
        let reader = thread::spawn(move || {
            l.thread_read_lock(false);
            flag.store(true, Ordering::SeqCst);
            l.thread_read_unlock();
        });
        thread::sleep(Duration::from_millis(20));
        assert!(
            !acquired.load(Ordering::SeqCst),
            "plain reader overtook a queued writer"
        );

        lock.thread_read_unlock();
        writer.join().unwrap();
        reader.join().unwrap();
        assert!(lock.is_free());
    }

    #[test]
    fn stamp_validates_only_without_writer() {
        let lock = StampedWriterPreferredLock::new();
        let stamp = lock.stamped_read();
        assert!(lock.validate(stamp));

        lock.write_lock();
        // stamp taken while a writer holds the lock can never validate
        let dirty = lock.stamped_read();
        assert!(!lock.validate(dirty));
        lock.write_unlock();

        assert!(!lock.validate(stamp), "pre-write stamp must be invalidated");
        let fresh = lock.stamped_read();
        assert!(lock.validate(fresh));
    }

    #[test]
    fn stamp_survives_thread_readers() {
        let lock = StampedWriterPreferredLock::new();
        let stamp = lock.stamped_read();
        lock.thread_read_lock(false);
        lock.thread_read_unlock();
        assert!(lock.validate(stamp), "readers do not invalidate stamps");
    }

    #[test]
    fn manager_attaches_and_detaches_locks() {
        let manager = LockManager::new(4);
        {
            let _guard = manager.read(NodeId(1), false);
            assert_eq!(manager.attached_count(), 1);
        }
        assert_eq!(manager.attached_count(), 0);
        assert_eq!(manager.pooled_count(), 1);

        // the recycled lock serves the next node
        {
            let _guard = manager.write(NodeId(2));
            assert_eq!(manager.pooled_count(), 0);
        }
        assert_eq!(manager.pooled_count(), 1);
    }

    #[test]
    fn manager_keeps_lock_attached_while_contended() {
        let manager = Arc::new(LockManager::new(4));
        let guard = manager.write(NodeId(7));

        let m = Arc::clone(&manager);
        let observed = Arc::new(AtomicUsize::new(0));
        let obs = Arc::clone(&observed);
        let reader = thread::spawn(move || {
            let _g = m.read(NodeId(7), false);
            obs.store(m.attached_count(), Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(10));
        assert_eq!(manager.attached_count(), 1);
        drop(guard);
        reader.join().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.attached_count(), 0);
    }

    #[test]
    fn pool_drops_beyond_capacity() {
        let manager = LockManager::new(1);
        let a = manager.read(NodeId(1), false);
        let b = manager.read(NodeId(2), false);
        drop(a);
        drop(b);
        assert_eq!(manager.pooled_count(), 1);
    }

    #[test]
    fn stamped_guard_validates_against_writer() {
        let manager = LockManager::new(4);
        let stamped = manager.stamped_read(NodeId(3));
        assert!(stamped.validate());
        {
            let _w = manager.write(NodeId(3));
        }
        assert!(!stamped.validate());
    }

    #[test]
    fn many_threads_hammer_one_lock() {
        let lock = Arc::new(StampedWriterPreferredLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = Arc::clone(&lock);
            let c = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    l.write_lock();
                    c.fetch_add(1, Ordering::Relaxed);
                    l.write_unlock();
                }
            }));
        }
        for _ in 0..4 {
            let l = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    l.thread_read_lock(false);
                    l.thread_read_unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 800);
        assert!(lock.is_free());
    }
}
