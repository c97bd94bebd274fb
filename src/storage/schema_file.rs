//! # Schema File
//!
//! The paged file persisting the metadata tree, plus the page cache that
//! fronts it. This is the single durable artifact of the engine: a
//! 256-byte file header followed by 16KB pages, each hosting one or more
//! segments of child records.
//!
//! ## File Layout
//!
//! ```text
//! Offset                    Content
//! ------                    -------
//! 0                         File header (256 bytes)
//! 256                       Page 0 (root page, pinned in cache)
//! 256 + 16384               Page 1
//! ...
//! ```
//!
//! ## File Header (256 bytes, big-endian)
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  -----------------------------------
//! 0       4     last_page_index  Highest allocated page index
//! 4       var   root_name        Length-prefixed root node name
//! ...     1     format_version   On-disk format version
//! ...           reserved         Zero padding to 256 bytes
//! ```
//!
//! Page 0 is created together with the file and carries a maximum-size
//! segment at slot 0: the root node's children always live at segment
//! address `(0, 0)`.
//!
//! ## Growth Policy
//!
//! An insert that overflows a segment walks the chain first. When the
//! chain is exhausted:
//!
//! - below the top size class the segment is *transplanted* into the next
//!   class on a page with room (the parental record is re-pointed);
//! - at the top class a fresh maximum-size segment is allocated and linked
//!   into the chain. Only maximum-size segments ever chain.
//!
//! Overflow is recovered here and never surfaces to callers; the one
//! fatal case is a single record larger than a segment
//! ([`StoreError::ColossalRecord`]).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{
    FILE_HEADER_SIZE, FORMAT_VERSION, PAGE_SIZE, SEG_HEADER_SIZE, SEG_MAX_SIZE, SEG_OFF_SIZE,
    SEG_SIZE_CLASSES,
};
use crate::encoding::{ByteReader, ByteWriter};
use crate::error::{StoreError, StoreResult};
use crate::storage::page::PageMut;
use crate::storage::page_cache::{FrameRef, PageCache, PageFrame};
use crate::storage::record::{self, NodeRecord};
use crate::storage::SegmentAddress;

/// Byte width of one stored record, key prefix included.
fn record_size(key: &str, payload: &[u8]) -> usize {
    4 + key.len() + payload.len()
}

/// Aggregate shape of a node's children, used to size its first segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubtreeHint {
    pub child_count: usize,
    pub name_bytes: usize,
    pub measurement_count: usize,
    pub alias_bytes: usize,
}

/// One child entry to be written into a node's segment.
#[derive(Debug, Clone)]
pub struct ChildWrite {
    pub name: String,
    pub record: NodeRecord,
    /// Present for internal children without a subtree address: the shape
    /// of *their* children, so a segment can be pre-allocated.
    pub subtree_hint: Option<SubtreeHint>,
}

/// Everything the file needs to persist one node's dirty children.
#[derive(Debug)]
pub struct NodeWriteRequest {
    /// The node's own name, for re-pointing its parental record.
    pub name: String,
    /// The parent's subtree segment address; `NONE` for the root.
    pub parent_addr: SegmentAddress,
    /// The node's subtree segment address; `NONE` only for the root on a
    /// fresh file.
    pub addr: SegmentAddress,
    pub is_root: bool,
    pub new_children: Vec<ChildWrite>,
    pub updated_children: Vec<ChildWrite>,
}

/// What the write changed: the node's (possibly migrated) segment address
/// and the segments pre-allocated for its internal children.
#[derive(Debug)]
pub struct NodeWriteOutcome {
    pub addr: SegmentAddress,
    pub child_addrs: Vec<(String, SegmentAddress)>,
}

struct HeaderState {
    last_page_index: u32,
    root_name: String,
}

pub struct SchemaFile {
    path: PathBuf,
    io: Mutex<File>,
    state: Mutex<HeaderState>,
    pages: PageCache,
}

impl SchemaFile {
    /// Opens or creates the schema file and brings the root page into
    /// cache. A fresh file gets page 0 with a maximum-size segment for the
    /// root's children.
    pub fn open<P: AsRef<Path>>(
        path: P,
        root_name: &str,
        page_cache_capacity: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).wrap_err_with(|| {
                    format!("failed to create schema file directory '{}'", parent.display())
                })?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open schema file '{}'", path.display()))?;

        let file_len = file.metadata()?.len();
        let this = if file_len == 0 {
            debug!(path = %path.display(), root = root_name, "creating schema file");
            let this = Self {
                path,
                io: Mutex::new(file),
                state: Mutex::new(HeaderState {
                    last_page_index: 0,
                    root_name: root_name.to_string(),
                }),
                pages: PageCache::new(page_cache_capacity),
            };
            this.init_root_page()?;
            this.write_header()?;
            this
        } else {
            let mut header = vec![0u8; FILE_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)
                .wrap_err("failed to read file header")?;
            let mut r = ByteReader::new(&header);
            let last_page_index = r.read_u32()?;
            let stored_root = r.read_string().wrap_err("corrupt root name in header")?;
            let version = r.read_u8()?;
            ensure!(
                version == FORMAT_VERSION,
                "unsupported schema file version: {} (expected {})",
                version,
                FORMAT_VERSION
            );
            debug!(
                path = %path.display(),
                root = %stored_root,
                pages = last_page_index + 1,
                "opened schema file"
            );
            let this = Self {
                path,
                io: Mutex::new(file),
                state: Mutex::new(HeaderState {
                    last_page_index,
                    root_name: stored_root,
                }),
                pages: PageCache::new(page_cache_capacity),
            };
            // warm the root page; the cache never evicts page 0
            this.fetch_page(0)?;
            this
        };
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root_name(&self) -> String {
        self.state.lock().root_name.clone()
    }

    pub fn last_page_index(&self) -> u32 {
        self.state.lock().last_page_index
    }

    fn init_root_page(&self) -> Result<()> {
        let mut frame = PageFrame::zeroed();
        PageMut::init(&mut frame.data, 0)?;
        {
            let mut page = PageMut::from_bytes(&mut frame.data)?;
            let idx = page.alloc_segment(SEG_MAX_SIZE)?;
            debug_assert_eq!(idx, 0);
        }
        frame.dirty = true;
        let (_, evicted) = self.pages.insert(0, frame);
        debug_assert!(evicted.is_empty());
        Ok(())
    }

    // ------------------------------------------------------------------
    // page access
    // ------------------------------------------------------------------

    fn page_offset(index: u32) -> u64 {
        FILE_HEADER_SIZE as u64 + index as u64 * PAGE_SIZE as u64
    }

    /// Gets a page frame from cache, loading it with one positioned read
    /// on a miss. The cache lock is never held across the I/O.
    fn fetch_page(&self, index: u32) -> Result<FrameRef> {
        ensure!(
            index <= self.state.lock().last_page_index,
            "page index {} out of range",
            index
        );
        if let Some(frame) = self.pages.get(index) {
            return Ok(frame);
        }

        let mut data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        {
            let mut io = self.io.lock();
            io.seek(SeekFrom::Start(Self::page_offset(index)))?;
            let mut read = 0;
            while read < PAGE_SIZE {
                match io.read(&mut data[read..])? {
                    0 => break, // allocated but never flushed: stays zeroed
                    n => read += n,
                }
            }
        }

        let (frame, evicted) = self.pages.insert(index, PageFrame::from_bytes(data));
        self.write_back(evicted)?;
        Ok(frame)
    }

    /// Appends a fresh page to the file and caches it.
    fn allocate_page(&self) -> Result<(u32, FrameRef)> {
        let index = {
            let mut state = self.state.lock();
            state.last_page_index += 1;
            state.last_page_index
        };
        let mut frame = PageFrame::zeroed();
        PageMut::init(&mut frame.data, index)?;
        frame.dirty = true;
        let (frame, evicted) = self.pages.insert(index, frame);
        self.write_back(evicted)?;
        debug!(page = index, "allocated page");
        Ok((index, frame))
    }

    fn write_back(&self, frames: Vec<(u32, FrameRef)>) -> Result<()> {
        for (index, frame) in frames {
            self.write_frame(index, &frame)?;
        }
        Ok(())
    }

    fn write_frame(&self, index: u32, frame: &FrameRef) -> Result<()> {
        let mut guard = frame.write();
        let mut io = self.io.lock();
        io.seek(SeekFrom::Start(Self::page_offset(index)))?;
        io.write_all(&guard.data)
            .wrap_err_with(|| format!("failed to write page {index}"))?;
        guard.dirty = false;
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        let mut header = vec![0u8; FILE_HEADER_SIZE];
        {
            let state = self.state.lock();
            let mut w = ByteWriter::new(&mut header);
            w.write_u32(state.last_page_index)?;
            w.write_string(&state.root_name)?;
            w.write_u8(FORMAT_VERSION)?;
        }
        let mut io = self.io.lock();
        io.seek(SeekFrom::Start(0))?;
        io.write_all(&header).wrap_err("failed to write file header")?;
        Ok(())
    }

    /// Forces the header and every dirty page buffer to disk.
    pub fn flush(&self) -> Result<()> {
        self.write_header()?;
        let mut flushed = 0usize;
        for (index, frame) in self.pages.snapshot() {
            if frame.read().dirty {
                self.write_frame(index, &frame)?;
                flushed += 1;
            }
        }
        self.io.lock().sync_all()?;
        debug!(pages = flushed, "flushed schema file");
        Ok(())
    }

    /// Flushes and releases the file handle (on drop).
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    // ------------------------------------------------------------------
    // read path
    // ------------------------------------------------------------------

    /// Looks up one child record by walking the parent's segment chain:
    /// the given segment first, then `next` links, then `prev` links.
    pub fn read_child(&self, parent_addr: SegmentAddress, name: &str) -> Result<Option<NodeRecord>> {
        ensure!(
            parent_addr.is_some(),
            "cannot read children of a node without a subtree segment"
        );
        match self.locate_record(parent_addr, name)? {
            Some(addr) => {
                let frame = self.fetch_page(addr.page_index())?;
                let guard = frame.read();
                let page = crate::storage::page::PageView::from_bytes(&guard.data)?;
                let seg = page.segment(addr.segment_index())?;
                let payload = seg
                    .lookup(name)?
                    .ok_or_else(|| StoreError::KeyNotFound(name.to_string()))?;
                Ok(Some(NodeRecord::decode(payload)?))
            }
            None => Ok(None),
        }
    }

    /// Lazy stream of `(name, record)` over the parent's segment chain.
    pub fn children(&self, parent_addr: SegmentAddress) -> ChildrenIter<'_> {
        ChildrenIter {
            file: self,
            next_addr: parent_addr,
            queue: std::collections::VecDeque::new(),
        }
    }

    /// Address of the chain segment holding `key`, if any. Walks the
    /// starting segment, then `next` links, then `prev` links.
    fn locate_record(
        &self,
        start: SegmentAddress,
        key: &str,
    ) -> Result<Option<SegmentAddress>> {
        let (found, next, prev) = self.probe_segment(start, key)?;
        if found {
            return Ok(Some(start));
        }
        let mut cur = next;
        while cur.is_some() {
            let (found, next, _) = self.probe_segment(cur, key)?;
            if found {
                return Ok(Some(cur));
            }
            cur = next;
        }
        let mut cur = prev;
        while cur.is_some() {
            let (found, _, prev) = self.probe_segment(cur, key)?;
            if found {
                return Ok(Some(cur));
            }
            cur = prev;
        }
        Ok(None)
    }

    /// Whether the segment at `addr` holds `key`, plus its chain links.
    fn probe_segment(
        &self,
        addr: SegmentAddress,
        key: &str,
    ) -> Result<(bool, SegmentAddress, SegmentAddress)> {
        let frame = self.fetch_page(addr.page_index())?;
        let guard = frame.read();
        let page = crate::storage::page::PageView::from_bytes(&guard.data)?;
        let seg = page.segment(addr.segment_index())?;
        Ok((seg.contains(key)?, seg.next_seg(), seg.prev_seg()))
    }

    // ------------------------------------------------------------------
    // write path
    // ------------------------------------------------------------------

    /// Persists one node's new and updated children into its segment
    /// chain, growing, transplanting or chaining as required.
    pub fn write_node(&self, req: &NodeWriteRequest) -> Result<NodeWriteOutcome> {
        let mut node_addr = if req.addr.is_none() {
            ensure!(
                req.is_root,
                "cannot store node '{}' without a segment address",
                req.name
            );
            SegmentAddress::ROOT
        } else {
            req.addr
        };

        let mut outcome = NodeWriteOutcome {
            addr: node_addr,
            child_addrs: Vec::new(),
        };

        for child in &req.new_children {
            let mut rec = child.record.clone();
            // internal children get their subtree segment up front so the
            // record written below already points at it
            if !rec.is_measurement() && rec.subtree_addr().is_none() {
                let hint = child.subtree_hint.unwrap_or_default();
                let size = estimate_segment_size(&hint);
                let seg_addr = self.pre_allocate_segment(size)?;
                rec.set_subtree_addr(seg_addr);
                outcome.child_addrs.push((child.name.clone(), seg_addr));
            }
            let payload = rec.encode();
            node_addr =
                self.insert_with_growth(node_addr, req, &child.name, &payload, rec.has_alias())?;
        }

        for child in &req.updated_children {
            let payload = child.record.encode();
            node_addr = self.update_with_growth(
                node_addr,
                req,
                &child.name,
                &payload,
                child.record.has_alias(),
            )?;
        }

        outcome.addr = node_addr;
        Ok(outcome)
    }

    /// Removes a node's record from its parent's chain.
    pub fn remove_record(&self, parent_addr: SegmentAddress, name: &str) -> Result<()> {
        let addr = self
            .locate_record(parent_addr, name)?
            .ok_or_else(|| StoreError::KeyNotFound(name.to_string()))?;
        let frame = self.fetch_page(addr.page_index())?;
        let mut guard = frame.write();
        let mut page = PageMut::from_bytes(&mut guard.data)?;
        page.segment_mut(addr.segment_index())?.delete(name)?;
        guard.dirty = true;
        Ok(())
    }

    /// Marks every segment of the chain starting at `addr` deleted.
    pub fn delete_subtree_segments(&self, addr: SegmentAddress) -> Result<()> {
        let mut cur = addr;
        while cur.is_some() {
            let frame = self.fetch_page(cur.page_index())?;
            let mut guard = frame.write();
            let mut page = PageMut::from_bytes(&mut guard.data)?;
            let next = {
                let mut seg = page.segment_mut(cur.segment_index())?;
                let next = seg.next_seg();
                seg.mark_deleted();
                next
            };
            guard.dirty = true;
            cur = next;
        }
        Ok(())
    }

    /// Inserts `(key, payload)` into the chain headed at `node_addr`,
    /// recovering from overflow by transplant or chaining. Returns the
    /// node's (possibly migrated) segment address.
    fn insert_with_growth(
        &self,
        mut node_addr: SegmentAddress,
        req: &NodeWriteRequest,
        key: &str,
        payload: &[u8],
        has_alias: bool,
    ) -> Result<SegmentAddress> {
        let size = record_size(key, payload);
        if size + SEG_HEADER_SIZE + SEG_OFF_SIZE > SEG_MAX_SIZE {
            return Err(StoreError::ColossalRecord {
                key: key.to_string(),
                size,
            }
            .into());
        }

        loop {
            // walk the chain, remembering the tail for growth
            let mut cur = node_addr;
            let tail;
            loop {
                match self.try_insert_at(cur, key, payload, has_alias)? {
                    InsertProbe::Done => return Ok(node_addr),
                    InsertProbe::Full { next } => {
                        if next.is_some() {
                            cur = next;
                        } else {
                            tail = cur;
                            break;
                        }
                    }
                }
            }

            let tail_size = self.segment_size_at(tail)?;
            if tail_size < SEG_MAX_SIZE {
                node_addr = self.grow_by_transplant(tail, tail_size, req)?;
            } else {
                self.append_chain_segment(tail)?;
            }
        }
    }

    /// Updates `key`'s record in the chain headed at `node_addr`. On
    /// overflow, spare capacity on chained siblings is tried before
    /// growing. Returns the node's (possibly migrated) segment address.
    fn update_with_growth(
        &self,
        mut node_addr: SegmentAddress,
        req: &NodeWriteRequest,
        key: &str,
        payload: &[u8],
        has_alias: bool,
    ) -> Result<SegmentAddress> {
        let size = record_size(key, payload);
        if size + SEG_HEADER_SIZE + SEG_OFF_SIZE > SEG_MAX_SIZE {
            return Err(StoreError::ColossalRecord {
                key: key.to_string(),
                size,
            }
            .into());
        }

        let actual = self
            .locate_record(node_addr, key)?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;

        // in-place or grown-in-segment update
        {
            let frame = self.fetch_page(actual.page_index())?;
            let mut guard = frame.write();
            let mut page = PageMut::from_bytes(&mut guard.data)?;
            let mut seg = page.segment_mut(actual.segment_index())?;
            match seg.update(key, payload) {
                Ok(_) => {
                    if has_alias {
                        seg.set_alias_flag();
                    }
                    guard.dirty = true;
                    return Ok(node_addr);
                }
                Err(StoreError::SegmentOverflow) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let seg_size = self.segment_size_at(actual)?;
        if let Some(spare) = self.applicable_linked_segment(actual, size)? {
            debug!(%actual, %spare, key, "moving updated record to chain sibling");
            self.delete_at(actual, key)?;
            match self.try_insert_at(spare, key, payload, has_alias)? {
                InsertProbe::Done => return Ok(node_addr),
                InsertProbe::Full { .. } => {
                    bail!("chain sibling lost its spare capacity mid-update")
                }
            }
        }

        if seg_size == SEG_MAX_SIZE {
            // fresh max-size segment linked right after the full one
            let new_addr = self.append_chain_segment(actual)?;
            self.delete_at(actual, key)?;
            match self.try_insert_at(new_addr, key, payload, has_alias)? {
                InsertProbe::Done => Ok(node_addr),
                InsertProbe::Full { .. } => unreachable!("fresh segment cannot be full"),
            }
        } else {
            node_addr = self.grow_by_transplant(actual, seg_size, req)?;
            self.update_with_growth(node_addr, req, key, payload, has_alias)
        }
    }

    /// Transplants the segment at `addr` into the next size class on a
    /// page with room, re-points the node's parental record, and returns
    /// the new address.
    fn grow_by_transplant(
        &self,
        addr: SegmentAddress,
        old_size: usize,
        req: &NodeWriteRequest,
    ) -> Result<SegmentAddress> {
        let new_size = re_estimate_seg_size(old_size);
        let staged = {
            let frame = self.fetch_page(addr.page_index())?;
            let guard = frame.read();
            let page = crate::storage::page::PageView::from_bytes(&guard.data)?;
            page.segment(addr.segment_index())?.raw().to_vec()
        };

        let new_addr = self.place_segment(new_size, |page| {
            page.transplant_segment(&staged, new_size)
        })?;

        {
            let frame = self.fetch_page(addr.page_index())?;
            let mut guard = frame.write();
            let mut page = PageMut::from_bytes(&mut guard.data)?;
            page.delete_segment(addr.segment_index())?;
            guard.dirty = true;
        }

        if !req.is_root {
            self.update_parental_record(req.parent_addr, &req.name, new_addr)?;
        }
        debug!(node = %req.name, from = %addr, to = %new_addr, new_size, "transplanted segment");
        Ok(new_addr)
    }

    /// Allocates a fresh maximum-size segment and links it into the chain
    /// directly after `after`. Returns the new segment's address.
    fn append_chain_segment(&self, after: SegmentAddress) -> Result<SegmentAddress> {
        let new_addr = self.pre_allocate_segment(SEG_MAX_SIZE)?;

        // old_next may be NONE when appending at the tail
        let old_next = {
            let frame = self.fetch_page(after.page_index())?;
            let mut guard = frame.write();
            let mut page = PageMut::from_bytes(&mut guard.data)?;
            let mut seg = page.segment_mut(after.segment_index())?;
            let old_next = seg.next_seg();
            seg.set_next_seg(new_addr);
            guard.dirty = true;
            old_next
        };
        {
            let frame = self.fetch_page(new_addr.page_index())?;
            let mut guard = frame.write();
            let mut page = PageMut::from_bytes(&mut guard.data)?;
            let mut seg = page.segment_mut(new_addr.segment_index())?;
            seg.set_prev_seg(after);
            seg.set_next_seg(old_next);
            guard.dirty = true;
        }
        if old_next.is_some() {
            let frame = self.fetch_page(old_next.page_index())?;
            let mut guard = frame.write();
            let mut page = PageMut::from_bytes(&mut guard.data)?;
            page.segment_mut(old_next.segment_index())?
                .set_prev_seg(new_addr);
            guard.dirty = true;
        }
        debug!(after = %after, new = %new_addr, "chained max-size segment");
        Ok(new_addr)
    }

    /// Chain sibling of a maximum-size segment with room for one more
    /// record of `size` bytes. Smaller classes never chain.
    fn applicable_linked_segment(
        &self,
        addr: SegmentAddress,
        size: usize,
    ) -> Result<Option<SegmentAddress>> {
        if self.segment_size_at(addr)? < SEG_MAX_SIZE {
            return Ok(None);
        }
        let (next0, prev0) = {
            let frame = self.fetch_page(addr.page_index())?;
            let guard = frame.read();
            let page = crate::storage::page::PageView::from_bytes(&guard.data)?;
            let seg = page.segment(addr.segment_index())?;
            (seg.next_seg(), seg.prev_seg())
        };

        let mut cur = next0;
        while cur.is_some() {
            let frame = self.fetch_page(cur.page_index())?;
            let guard = frame.read();
            let page = crate::storage::page::PageView::from_bytes(&guard.data)?;
            let seg = page.segment(cur.segment_index())?;
            if seg.fits(size) {
                return Ok(Some(cur));
            }
            cur = seg.next_seg();
        }
        let mut cur = prev0;
        while cur.is_some() {
            let frame = self.fetch_page(cur.page_index())?;
            let guard = frame.read();
            let page = crate::storage::page::PageView::from_bytes(&guard.data)?;
            let seg = page.segment(cur.segment_index())?;
            if seg.fits(size) {
                return Ok(Some(cur));
            }
            cur = seg.prev_seg();
        }
        Ok(None)
    }

    /// One insert attempt against the segment at `addr`.
    fn try_insert_at(
        &self,
        addr: SegmentAddress,
        key: &str,
        payload: &[u8],
        has_alias: bool,
    ) -> Result<InsertProbe> {
        let frame = self.fetch_page(addr.page_index())?;
        let mut guard = frame.write();
        let mut page = PageMut::from_bytes(&mut guard.data)?;
        let mut seg = page.segment_mut(addr.segment_index())?;
        match seg.insert(key, payload) {
            Ok(_) => {
                if has_alias {
                    seg.set_alias_flag();
                }
                guard.dirty = true;
                Ok(InsertProbe::Done)
            }
            Err(StoreError::SegmentOverflow) => Ok(InsertProbe::Full {
                next: seg.next_seg(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_at(&self, addr: SegmentAddress, key: &str) -> Result<()> {
        let frame = self.fetch_page(addr.page_index())?;
        let mut guard = frame.write();
        let mut page = PageMut::from_bytes(&mut guard.data)?;
        page.segment_mut(addr.segment_index())?.delete(key)?;
        guard.dirty = true;
        Ok(())
    }

    fn segment_size_at(&self, addr: SegmentAddress) -> Result<usize> {
        let frame = self.fetch_page(addr.page_index())?;
        let guard = frame.read();
        let page = crate::storage::page::PageView::from_bytes(&guard.data)?;
        Ok(page.segment_size(addr.segment_index())?)
    }

    /// Re-points the record of `node_name` (found in the chain starting at
    /// `parent_addr`) at a migrated subtree segment.
    fn update_parental_record(
        &self,
        parent_addr: SegmentAddress,
        node_name: &str,
        new_addr: SegmentAddress,
    ) -> Result<()> {
        let parent_addr = if parent_addr.is_none() {
            SegmentAddress::ROOT
        } else {
            parent_addr
        };
        let holder = self
            .locate_record(parent_addr, node_name)?
            .ok_or_else(|| StoreError::KeyNotFound(node_name.to_string()))?;
        let frame = self.fetch_page(holder.page_index())?;
        let mut guard = frame.write();
        let mut page = PageMut::from_bytes(&mut guard.data)?;
        let mut seg = page.segment_mut(holder.segment_index())?;
        record::patch_subtree_addr(seg.payload_mut(node_name)?, new_addr)?;
        guard.dirty = true;
        Ok(())
    }

    /// Allocates a blank segment of `size` bytes on a cached page with
    /// room, or on a fresh page.
    fn pre_allocate_segment(&self, size: usize) -> Result<SegmentAddress> {
        self.place_segment(size, |page| page.alloc_segment(size))
    }

    /// Runs `alloc` against the first cached page that can take `size`
    /// more bytes, falling back to a freshly allocated page.
    fn place_segment<F>(&self, size: usize, mut alloc: F) -> Result<SegmentAddress>
    where
        F: FnMut(&mut PageMut<'_>) -> StoreResult<u16>,
    {
        for (index, frame) in self.pages.snapshot() {
            let mut guard = frame.write();
            let mut page = match PageMut::from_bytes(&mut guard.data) {
                Ok(p) => p,
                Err(e) => {
                    warn!(page = index, error = %e, "skipping unparsable page during placement");
                    continue;
                }
            };
            if page.has_capacity_for(size) {
                let seg_idx = alloc(&mut page)?;
                guard.dirty = true;
                return Ok(SegmentAddress::new(index, seg_idx));
            }
        }

        let (index, frame) = self.allocate_page()?;
        let mut guard = frame.write();
        let mut page = PageMut::from_bytes(&mut guard.data)?;
        let seg_idx = alloc(&mut page)?;
        guard.dirty = true;
        Ok(SegmentAddress::new(index, seg_idx))
    }

    // ------------------------------------------------------------------
    // diagnostics
    // ------------------------------------------------------------------

    /// Page-by-page dump of the file's segment structure.
    pub fn inspect(&self) -> Result<String> {
        use std::fmt::Write as _;

        let last = self.state.lock().last_page_index;
        let mut out = String::new();
        writeln!(
            &mut out,
            "schema file '{}': root '{}', {} page(s)",
            self.path.display(),
            self.root_name(),
            last + 1
        )?;
        for index in 0..=last {
            let frame = self.fetch_page(index)?;
            let guard = frame.read();
            let page = crate::storage::page::PageView::from_bytes(&guard.data)?;
            writeln!(
                &mut out,
                "  page {index}: {} segment(s), {} bytes free",
                page.segment_count(),
                page.free_space()
            )?;
            for seg_idx in 0..page.segment_count() as u16 {
                let seg = page.segment(seg_idx)?;
                writeln!(
                    &mut out,
                    "    segment {seg_idx}: {} bytes, {} record(s), spare {}{}{}, prev {}, next {}",
                    seg.length(),
                    seg.record_count(),
                    seg.spare_size(),
                    if seg.is_deleted() { ", deleted" } else { "" },
                    if seg.has_alias() { ", alias" } else { "" },
                    seg.prev_seg(),
                    seg.next_seg(),
                )?;
            }
        }
        Ok(out)
    }
}

enum InsertProbe {
    Done,
    Full { next: SegmentAddress },
}

/// Lazy stream of `(name, record)` over a segment chain, one segment's
/// worth at a time. Not restartable: the iterator consumes the chain
/// position.
pub struct ChildrenIter<'a> {
    file: &'a SchemaFile,
    next_addr: SegmentAddress,
    queue: std::collections::VecDeque<(String, NodeRecord)>,
}

impl Iterator for ChildrenIter<'_> {
    type Item = Result<(String, NodeRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.queue.is_empty() {
            if self.next_addr.is_none() {
                return None;
            }
            let addr = self.next_addr;
            let load = (|| -> Result<()> {
                let frame = self.file.fetch_page(addr.page_index())?;
                let guard = frame.read();
                let page = crate::storage::page::PageView::from_bytes(&guard.data)?;
                let seg = page.segment(addr.segment_index())?;
                for entry in seg.entries() {
                    let (key, payload) = entry?;
                    self.queue
                        .push_back((key.to_string(), NodeRecord::decode(payload)?));
                }
                self.next_addr = seg.next_seg();
                Ok(())
            })();
            if let Err(e) = load {
                self.next_addr = SegmentAddress::NONE;
                return Some(Err(e));
            }
        }
        self.queue.pop_front().map(Ok)
    }
}

/// Smallest size class able to hold the estimated encoding of a node's
/// children. Large child counts map straight to a class; small ones are
/// costed exactly.
pub fn estimate_segment_size(hint: &SubtreeHint) -> usize {
    let n = hint.child_count;
    let tiers = SEG_SIZE_CLASSES;
    if n > 300 {
        return tiers[4];
    } else if n > 150 {
        return tiers[3];
    } else if n > 75 {
        return tiers[2];
    } else if n > 40 {
        return tiers[1];
    } else if n > 20 {
        return tiers[0];
    }

    let internal_count = n - hint.measurement_count;
    // per child: offset entry + key prefix + name; payloads costed a bit
    // above their actual encoding
    let total = SEG_HEADER_SIZE
        + hint.name_bytes
        + n * (SEG_OFF_SIZE + 4)
        + hint.measurement_count * (24 + 4)
        + hint.alias_bytes
        + internal_count * 14;
    for class in tiers {
        if total <= class {
            return class;
        }
    }
    tiers[4]
}

/// Next size class above `old_size`; sticks at the maximum.
pub fn re_estimate_seg_size(old_size: usize) -> usize {
    for class in SEG_SIZE_CLASSES {
        if old_size < class {
            return class;
        }
    }
    SEG_MAX_SIZE
}
