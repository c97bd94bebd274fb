//! # Page Cache
//!
//! A bounded pool of 16KB page frames keyed by page index, fronting the
//! schema file. Frames are handed out as `Arc<RwLock<PageFrame>>`; the
//! reference count doubles as the pin count, so eviction only considers
//! frames nobody else holds. Selection is least-recently-used via a
//! per-slot recency stamp.
//!
//! The root page (index 0) is pinned for the lifetime of the cache: every
//! traversal starts there and the engine keeps its address fixed.
//!
//! Eviction never performs I/O itself. Dirty victims are handed back to
//! the caller, which writes them out after the cache lock is released;
//! the map lock is therefore never held across a file operation.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::PAGE_SIZE;

/// One cached page image.
pub struct PageFrame {
    pub data: Box<[u8]>,
    pub dirty: bool,
}

impl PageFrame {
    pub fn zeroed() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            dirty: false,
        }
    }

    pub fn from_bytes(data: Box<[u8]>) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Self { data, dirty: false }
    }
}

/// Shared handle to a cached page. Holding one pins the frame.
pub type FrameRef = Arc<RwLock<PageFrame>>;

struct Slot {
    frame: FrameRef,
    stamp: u64,
}

struct Inner {
    slots: HashMap<u32, Slot>,
    tick: u64,
}

pub struct PageCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::with_capacity(capacity),
                tick: 0,
            }),
            capacity: capacity.max(2),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a frame, bumping its recency.
    pub fn get(&self, page_index: u32) -> Option<FrameRef> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let slot = inner.slots.get_mut(&page_index)?;
        slot.stamp = tick;
        Some(Arc::clone(&slot.frame))
    }

    /// Inserts a frame, returning the winning handle (an earlier insert by
    /// a racing thread wins) plus any dirty frames evicted to make room.
    ///
    /// The caller must write the evicted dirty frames back to the file;
    /// they are no longer reachable through the cache.
    pub fn insert(&self, page_index: u32, frame: PageFrame) -> (FrameRef, Vec<(u32, FrameRef)>) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(slot) = inner.slots.get_mut(&page_index) {
            slot.stamp = tick;
            return (Arc::clone(&slot.frame), Vec::new());
        }

        let frame: FrameRef = Arc::new(RwLock::new(frame));
        inner.slots.insert(
            page_index,
            Slot {
                frame: Arc::clone(&frame),
                stamp: tick,
            },
        );

        let mut evicted_dirty = Vec::new();
        while inner.slots.len() > self.capacity {
            // LRU among unpinned, non-root frames; the map's Arc is the
            // only reference to an unpinned frame
            let victim = inner
                .slots
                .iter()
                .filter(|(idx, slot)| **idx != 0 && Arc::strong_count(&slot.frame) == 1)
                .min_by_key(|(_, slot)| slot.stamp)
                .map(|(idx, _)| *idx);
            match victim {
                Some(idx) => {
                    let slot = inner.slots.remove(&idx).expect("victim vanished");
                    if slot.frame.read().dirty {
                        evicted_dirty.push((idx, slot.frame));
                    }
                }
                None => break, // everything pinned; run over capacity
            }
        }

        (frame, evicted_dirty)
    }

    /// Snapshot of every cached frame, for flush-all.
    pub fn snapshot(&self) -> Vec<(u32, FrameRef)> {
        let inner = self.inner.lock();
        let mut frames: Vec<(u32, FrameRef)> = inner
            .slots
            .iter()
            .map(|(idx, slot)| (*idx, Arc::clone(&slot.frame)))
            .collect();
        frames.sort_unstable_by_key(|(idx, _)| *idx);
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_returns_same_frame() {
        let cache = PageCache::new(4);
        let mut frame = PageFrame::zeroed();
        frame.data[0] = 7;
        let (inserted, evicted) = cache.insert(3, frame);
        assert!(evicted.is_empty());

        let fetched = cache.get(3).unwrap();
        assert!(Arc::ptr_eq(&inserted, &fetched));
        assert_eq!(fetched.read().data[0], 7);
    }

    #[test]
    fn racing_insert_keeps_first_frame() {
        let cache = PageCache::new(4);
        let mut first = PageFrame::zeroed();
        first.data[0] = 1;
        let (winner, _) = cache.insert(5, first);

        let mut second = PageFrame::zeroed();
        second.data[0] = 2;
        let (resolved, _) = cache.insert(5, second);
        assert!(Arc::ptr_eq(&winner, &resolved));
        assert_eq!(resolved.read().data[0], 1);
    }

    #[test]
    fn lru_eviction_prefers_oldest_unpinned() {
        let cache = PageCache::new(2);
        let (_a, _) = cache.insert(1, PageFrame::zeroed());
        let (_b, _) = cache.insert(2, PageFrame::zeroed());
        drop(_a);
        drop(_b);
        cache.get(1); // page 2 becomes LRU

        cache.insert(3, PageFrame::zeroed());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
    }

    #[test]
    fn pinned_frames_survive_eviction() {
        let cache = PageCache::new(2);
        let (pinned, _) = cache.insert(1, PageFrame::zeroed());
        let (b, _) = cache.insert(2, PageFrame::zeroed());
        drop(b);

        cache.insert(3, PageFrame::zeroed());
        assert!(cache.get(1).is_some(), "pinned frame must stay");
        assert!(cache.get(2).is_none(), "unpinned frame was the victim");
        drop(pinned);
    }

    #[test]
    fn root_page_is_never_evicted() {
        let cache = PageCache::new(2);
        let (root, _) = cache.insert(0, PageFrame::zeroed());
        drop(root);
        for idx in 1..10u32 {
            let (f, _) = cache.insert(idx, PageFrame::zeroed());
            drop(f);
        }
        assert!(cache.get(0).is_some());
    }

    #[test]
    fn dirty_victims_are_returned_for_writeback() {
        let cache = PageCache::new(2);
        let (a, _) = cache.insert(1, PageFrame::zeroed());
        a.write().dirty = true;
        drop(a);
        let (b, _) = cache.insert(2, PageFrame::zeroed());
        drop(b);

        cache.get(2); // page 1 is LRU and dirty
        let (_c, evicted) = cache.insert(3, PageFrame::zeroed());
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, 1);
        assert!(evicted[0].1.read().dirty);
    }

    #[test]
    fn over_capacity_when_everything_pinned() {
        let cache = PageCache::new(2);
        let _a = cache.insert(1, PageFrame::zeroed()).0;
        let _b = cache.insert(2, PageFrame::zeroed()).0;
        let _c = cache.insert(3, PageFrame::zeroed()).0;
        assert_eq!(cache.len(), 3);
    }
}
