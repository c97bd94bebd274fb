//! # Segment: Ordered Key→Record Store
//!
//! A segment is a contiguous byte span inside a page holding an ordered set
//! of child records. Segments come in five size classes (1KB, 2KB, 4KB, 8KB
//! and the page-filling maximum); only maximum-size segments may chain to
//! siblings via their `prev`/`next` addresses.
//!
//! ## Segment Layout
//!
//! ```text
//! Offset        Content
//! ------        -------
//! 0             Segment header (25 bytes)
//! 25            Offset table: record_count u16 offsets, ascending key order
//! ...           Free space
//! free_addr     Record area, written back-to-front as records arrive
//! length        Segment end
//! ```
//!
//! ## Segment Header (25 bytes, big-endian)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  -------------------------------------
//! 0       2     length         Total segment length in bytes
//! 2       2     free_addr      Low end of the record area
//! 4       2     record_count   Number of live records
//! 6       2     pair_length    Offset table length in bytes
//! 8       8     prev_seg       Previous chained segment address
//! 16      8     next_seg       Next chained segment address
//! 24      1     flags          bit 7 deleted, bit 6 has-alias
//! ```
//!
//! ## Ordering
//!
//! Records are written wherever space frees up, back-to-front; the offset
//! table is the only ordered structure. It is kept sorted by the referenced
//! record's key (byte-lexicographic on UTF-8) through binary insertion.
//! Lookup binary-searches the table, dereferencing candidates to compare
//! full keys. A missing key is an ordinary negative answer, never an error.
//!
//! ## Record Form
//!
//! `(u32 key_len, key_bytes, payload)`. The payload length is derived from
//! the payload's kind tag (see [`super::record`]); nothing else delimits a
//! record.
//!
//! ## Split
//!
//! [`SegmentMut::split_into`] partitions the records (plus an optional
//! incoming insert) between `self` and an empty same-capacity buffer, left
//! side keeping the smaller keys. When the caller passes `incline` and the
//! last three inserted keys run monotonic, the pivot is biased so that the
//! growing side retains more free space. The leading key never migrates.

use zerocopy::big_endian::{I16, I64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{SEG_HEADER_SIZE, SEG_MAX_SIZE, SEG_OFF_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::storage::{record, SegmentAddress};

pub const SEG_FLAG_DELETED: u8 = 0x80;
pub const SEG_FLAG_ALIAS: u8 = 0x40;

/// Byte width of a record's key-length prefix.
const KEY_PREFIX_SIZE: usize = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SegmentHeader {
    length: I16,
    free_addr: I16,
    record_count: I16,
    pair_length: I16,
    prev_seg: I64,
    next_seg: I64,
    flags: u8,
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == SEG_HEADER_SIZE);

fn header(data: &[u8]) -> &SegmentHeader {
    SegmentHeader::ref_from_bytes(&data[..SEG_HEADER_SIZE]).expect("segment header")
}

fn header_mut(data: &mut [u8]) -> &mut SegmentHeader {
    SegmentHeader::mut_from_bytes(&mut data[..SEG_HEADER_SIZE]).expect("segment header")
}

fn validate(data: &[u8]) -> StoreResult<()> {
    if data.len() < SEG_HEADER_SIZE {
        return Err(StoreError::corrupt(format!(
            "segment span too small: {} bytes",
            data.len()
        )));
    }
    let h = header(data);
    let length = h.length.get() as usize;
    let free_addr = h.free_addr.get();
    let count = h.record_count.get();
    let pair = h.pair_length.get() as usize;

    if length != data.len() {
        return Err(StoreError::corrupt(format!(
            "segment length {} does not match span {}",
            length,
            data.len()
        )));
    }
    if count < 0 || free_addr < 0 {
        return Err(StoreError::corrupt("negative segment counter"));
    }
    if pair != count as usize * SEG_OFF_SIZE {
        return Err(StoreError::corrupt(format!(
            "offset table length {} inconsistent with record count {}",
            pair, count
        )));
    }
    if (free_addr as usize) < SEG_HEADER_SIZE + pair || free_addr as usize > length {
        return Err(StoreError::corrupt(format!(
            "free_addr {} out of bounds (table ends {}, length {})",
            free_addr,
            SEG_HEADER_SIZE + pair,
            length
        )));
    }
    Ok(())
}

/// Read-only view of a segment backed by a shared byte span.
#[derive(Debug, Clone, Copy)]
pub struct SegmentView<'a> {
    data: &'a [u8],
}

impl<'a> SegmentView<'a> {
    pub fn from_bytes(data: &'a [u8]) -> StoreResult<Self> {
        validate(data)?;
        Ok(Self { data })
    }

    pub fn raw(&self) -> &'a [u8] {
        self.data
    }

    pub fn length(&self) -> usize {
        header(self.data).length.get() as usize
    }

    pub fn record_count(&self) -> usize {
        header(self.data).record_count.get() as usize
    }

    fn free_addr(&self) -> usize {
        header(self.data).free_addr.get() as usize
    }

    fn pair_length(&self) -> usize {
        header(self.data).pair_length.get() as usize
    }

    /// Bytes still available for one more record plus its table entry.
    pub fn spare_size(&self) -> usize {
        self.free_addr() - self.pair_length() - SEG_HEADER_SIZE
    }

    /// Whether a record of `record_size` bytes (key prefix + key + payload)
    /// still fits, table entry included.
    pub fn fits(&self, record_size: usize) -> bool {
        self.spare_size() >= record_size + SEG_OFF_SIZE
    }

    pub fn prev_seg(&self) -> SegmentAddress {
        SegmentAddress::from_raw(header(self.data).prev_seg.get())
    }

    pub fn next_seg(&self) -> SegmentAddress {
        SegmentAddress::from_raw(header(self.data).next_seg.get())
    }

    pub fn is_deleted(&self) -> bool {
        header(self.data).flags & SEG_FLAG_DELETED != 0
    }

    pub fn has_alias(&self) -> bool {
        header(self.data).flags & SEG_FLAG_ALIAS != 0
    }

    fn offset_at(&self, index: usize) -> usize {
        let pos = SEG_HEADER_SIZE + index * SEG_OFF_SIZE;
        u16::from_be_bytes([self.data[pos], self.data[pos + 1]]) as usize
    }

    /// Key of the record at table slot `index`.
    pub fn key_at(&self, index: usize) -> StoreResult<&'a str> {
        key_at_offset(self.data, self.offset_at(index))
    }

    /// Payload of the record at table slot `index`.
    pub fn payload_at(&self, index: usize) -> StoreResult<&'a [u8]> {
        payload_at_offset(self.data, self.offset_at(index))
    }

    /// Binary search on the offset table. `None` when the key is absent.
    pub fn search(&self, key: &str) -> StoreResult<Option<usize>> {
        let mut head = 0isize;
        let mut tail = self.record_count() as isize - 1;
        while head <= tail {
            let pivot = (head + tail) / 2;
            match key.cmp(self.key_at(pivot as usize)?) {
                std::cmp::Ordering::Equal => return Ok(Some(pivot as usize)),
                std::cmp::Ordering::Less => tail = pivot - 1,
                std::cmp::Ordering::Greater => head = pivot + 1,
            }
        }
        Ok(None)
    }

    /// Table slot where `key` would be inserted; [`StoreError::DuplicateKey`]
    /// if it already exists.
    pub fn search_insert_slot(&self, key: &str) -> StoreResult<usize> {
        let mut head = 0isize;
        let mut tail = self.record_count() as isize - 1;
        while head <= tail {
            let pivot = (head + tail) / 2;
            match key.cmp(self.key_at(pivot as usize)?) {
                std::cmp::Ordering::Equal => {
                    return Err(StoreError::DuplicateKey(key.to_string()))
                }
                std::cmp::Ordering::Less => tail = pivot - 1,
                std::cmp::Ordering::Greater => head = pivot + 1,
            }
        }
        Ok(head as usize)
    }

    pub fn lookup(&self, key: &str) -> StoreResult<Option<&'a [u8]>> {
        match self.search(key)? {
            Some(idx) => Ok(Some(self.payload_at(idx)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.search(key)?.is_some())
    }

    /// Iterator over `(key, payload)` in key order.
    pub fn entries(&self) -> SegmentEntries<'a> {
        SegmentEntries {
            view: *self,
            index: 0,
        }
    }

    /// Copies this segment into a larger span, shifting record offsets by
    /// the capacity delta so they stay anchored to the new end.
    pub fn extend_into(&self, target: &mut [u8]) -> StoreResult<()> {
        let src_len = self.length();
        if target.len() < src_len {
            return Err(StoreError::corrupt(format!(
                "segment cannot extend into a smaller span: {} < {}",
                target.len(),
                src_len
            )));
        }
        let gap = target.len() - src_len;
        target[..SEG_HEADER_SIZE].copy_from_slice(&self.data[..SEG_HEADER_SIZE]);

        let free = self.free_addr();
        let count = self.record_count();

        {
            let target_len = target.len();
            let h = header_mut(target);
            h.length = I16::new(target_len as i16);
            h.free_addr = I16::new((free + gap) as i16);
        }
        for i in 0..count {
            let off = self.offset_at(i) + gap;
            let entry = SEG_HEADER_SIZE + i * SEG_OFF_SIZE;
            target[entry..entry + SEG_OFF_SIZE].copy_from_slice(&(off as u16).to_be_bytes());
        }
        target[free + gap..].copy_from_slice(&self.data[free..src_len]);
        Ok(())
    }
}

/// Iterator over a segment's records in key order.
pub struct SegmentEntries<'a> {
    view: SegmentView<'a>,
    index: usize,
}

impl<'a> Iterator for SegmentEntries<'a> {
    type Item = StoreResult<(&'a str, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.view.record_count() {
            return None;
        }
        let i = self.index;
        self.index += 1;
        let key = match self.view.key_at(i) {
            Ok(k) => k,
            Err(e) => return Some(Err(e)),
        };
        let payload = match self.view.payload_at(i) {
            Ok(p) => p,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok((key, payload)))
    }
}

fn key_at_offset(data: &[u8], offset: usize) -> StoreResult<&str> {
    if offset + KEY_PREFIX_SIZE > data.len() {
        return Err(StoreError::corrupt(format!(
            "record offset {offset} out of range"
        )));
    }
    let len = u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]) as usize;
    let start = offset + KEY_PREFIX_SIZE;
    if start + len > data.len() {
        return Err(StoreError::corrupt(format!(
            "record key at {offset} extends past segment end"
        )));
    }
    std::str::from_utf8(&data[start..start + len])
        .map_err(|e| StoreError::corrupt(format!("invalid UTF-8 in record key: {e}")))
}

fn payload_at_offset(data: &[u8], offset: usize) -> StoreResult<&[u8]> {
    let key = key_at_offset(data, offset)?;
    let start = offset + KEY_PREFIX_SIZE + key.len();
    let len = record::payload_len(&data[start..])?;
    Ok(&data[start..start + len])
}

/// Mutable view of a segment.
///
/// Carries the monotonic-insert hint (the last two inserted keys) that
/// drives the incline split policy; the hint lives only as long as the
/// view does.
#[derive(Debug)]
pub struct SegmentMut<'a> {
    data: &'a mut [u8],
    penu_key: Option<String>,
    last_key: Option<String>,
}

impl<'a> SegmentMut<'a> {
    /// Formats `data` as a blank segment spanning the whole slice.
    pub fn init(data: &'a mut [u8]) -> StoreResult<Self> {
        if data.len() < SEG_HEADER_SIZE || data.len() > SEG_MAX_SIZE {
            return Err(StoreError::corrupt(format!(
                "invalid segment size: {}",
                data.len()
            )));
        }
        let len = data.len();
        let h = header_mut(data);
        h.length = I16::new(len as i16);
        h.free_addr = I16::new(len as i16);
        h.record_count = I16::new(0);
        h.pair_length = I16::new(0);
        h.prev_seg = I64::new(SegmentAddress::NONE.raw());
        h.next_seg = I64::new(SegmentAddress::NONE.raw());
        h.flags = 0;
        Ok(Self {
            data,
            penu_key: None,
            last_key: None,
        })
    }

    /// Opens an existing segment, validating its header against the span.
    pub fn from_bytes(data: &'a mut [u8]) -> StoreResult<Self> {
        validate(data)?;
        Ok(Self {
            data,
            penu_key: None,
            last_key: None,
        })
    }

    pub fn as_view(&self) -> SegmentView<'_> {
        SegmentView { data: self.data }
    }

    pub fn length(&self) -> usize {
        self.as_view().length()
    }

    pub fn record_count(&self) -> usize {
        self.as_view().record_count()
    }

    pub fn spare_size(&self) -> usize {
        self.as_view().spare_size()
    }

    pub fn next_seg(&self) -> SegmentAddress {
        self.as_view().next_seg()
    }

    pub fn prev_seg(&self) -> SegmentAddress {
        self.as_view().prev_seg()
    }

    pub fn set_next_seg(&mut self, addr: SegmentAddress) {
        header_mut(self.data).next_seg = I64::new(addr.raw());
    }

    pub fn set_prev_seg(&mut self, addr: SegmentAddress) {
        header_mut(self.data).prev_seg = I64::new(addr.raw());
    }

    /// Sets the deleted bit. It never transitions back.
    pub fn mark_deleted(&mut self) {
        header_mut(self.data).flags |= SEG_FLAG_DELETED;
    }

    pub fn set_alias_flag(&mut self) {
        header_mut(self.data).flags |= SEG_FLAG_ALIAS;
    }

    pub fn lookup(&self, key: &str) -> StoreResult<Option<&[u8]>> {
        match self.as_view().search(key)? {
            Some(idx) => {
                let off = self.as_view().offset_at(idx);
                payload_at_offset(self.data, off).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Mutable slice of the payload stored under `key`, for fixed-width
    /// in-place patches such as re-pointing a child's subtree address.
    pub fn payload_mut(&mut self, key: &str) -> StoreResult<&mut [u8]> {
        let idx = self
            .as_view()
            .search(key)?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        let offset = self.as_view().offset_at(idx);
        let len = payload_at_offset(self.data, offset)?.len();
        let start = offset + KEY_PREFIX_SIZE + key.len();
        Ok(&mut self.data[start..start + len])
    }

    /// Inserts a new record, keeping the offset table sorted.
    ///
    /// Returns the byte offset the record was stored at. Fails with
    /// [`StoreError::DuplicateKey`] if the key exists and
    /// [`StoreError::SegmentOverflow`] if the free span cannot take the
    /// record plus one table entry.
    pub fn insert(&mut self, key: &str, payload: &[u8]) -> StoreResult<usize> {
        let slot = self.as_view().search_insert_slot(key)?;
        let record_size = KEY_PREFIX_SIZE + key.len() + payload.len();

        let view = self.as_view();
        if view.free_addr() < SEG_HEADER_SIZE + view.pair_length() + SEG_OFF_SIZE + record_size {
            return Err(StoreError::SegmentOverflow);
        }

        let new_free = view.free_addr() - record_size;
        self.write_record_at(new_free, key, payload);

        let count = self.record_count();
        let table_base = SEG_HEADER_SIZE;
        // shift table entries [slot, count) one slot right
        for i in (slot..count).rev() {
            let src = table_base + i * SEG_OFF_SIZE;
            let dst = src + SEG_OFF_SIZE;
            self.data.copy_within(src..src + SEG_OFF_SIZE, dst);
        }
        let entry = table_base + slot * SEG_OFF_SIZE;
        self.data[entry..entry + SEG_OFF_SIZE].copy_from_slice(&(new_free as u16).to_be_bytes());

        let h = header_mut(self.data);
        h.record_count = I16::new(count as i16 + 1);
        h.pair_length = I16::new((count as i16 + 1) * SEG_OFF_SIZE as i16);
        h.free_addr = I16::new(new_free as i16);

        self.penu_key = self.last_key.take();
        self.last_key = Some(key.to_string());
        Ok(new_free)
    }

    /// Replaces the record under `key`.
    ///
    /// Overwrites in place when the new payload is no larger than the old
    /// one; otherwise the record is rewritten into fresh space. Fails with
    /// [`StoreError::SegmentOverflow`] when neither fits.
    pub fn update(&mut self, key: &str, payload: &[u8]) -> StoreResult<usize> {
        let idx = self
            .as_view()
            .search(key)?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        let offset = self.as_view().offset_at(idx);
        let old_len = payload_at_offset(self.data, offset)?.len();
        let body = offset + KEY_PREFIX_SIZE + key.len();

        if payload.len() <= old_len {
            self.data[body..body + payload.len()].copy_from_slice(payload);
            return Ok(offset);
        }

        let record_size = KEY_PREFIX_SIZE + key.len() + payload.len();
        let view = self.as_view();
        if view.free_addr() < SEG_HEADER_SIZE + view.pair_length() + record_size {
            return Err(StoreError::SegmentOverflow);
        }
        let new_free = view.free_addr() - record_size;
        self.write_record_at(new_free, key, payload);

        let entry = SEG_HEADER_SIZE + idx * SEG_OFF_SIZE;
        self.data[entry..entry + SEG_OFF_SIZE].copy_from_slice(&(new_free as u16).to_be_bytes());
        header_mut(self.data).free_addr = I16::new(new_free as i16);
        Ok(new_free)
    }

    /// Removes the record under `key`. The record bytes become garbage
    /// until the next [`SegmentMut::compact`].
    pub fn delete(&mut self, key: &str) -> StoreResult<()> {
        let idx = self
            .as_view()
            .search(key)?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        let count = self.record_count();
        let table_base = SEG_HEADER_SIZE;
        for i in idx..count - 1 {
            let src = table_base + (i + 1) * SEG_OFF_SIZE;
            let dst = table_base + i * SEG_OFF_SIZE;
            self.data.copy_within(src..src + SEG_OFF_SIZE, dst);
        }
        let h = header_mut(self.data);
        h.record_count = I16::new(count as i16 - 1);
        h.pair_length = I16::new((count as i16 - 1) * SEG_OFF_SIZE as i16);
        Ok(())
    }

    /// Rewrites all live records contiguously against the segment end,
    /// in current key order, and refreshes the offset table.
    pub fn compact(&mut self) -> StoreResult<()> {
        let count = self.record_count();
        let length = self.length();
        if count == 0 {
            header_mut(self.data).free_addr = I16::new(length as i16);
            return Ok(());
        }

        let mut total = 0usize;
        let mut spans: Vec<(usize, usize)> = Vec::with_capacity(count);
        for i in 0..count {
            let off = self.as_view().offset_at(i);
            let key = key_at_offset(self.data, off)?;
            let payload = payload_at_offset(self.data, off)?;
            let len = KEY_PREFIX_SIZE + key.len() + payload.len();
            spans.push((off, len));
            total += len;
        }

        // mirror the final tail layout in a scratch buffer, then copy back
        let mut scratch = vec![0u8; total];
        let mut acc = 0usize;
        let mut new_offsets: Vec<u16> = Vec::with_capacity(count);
        for &(off, len) in &spans {
            acc += len;
            let dst = total - acc;
            scratch[dst..dst + len].copy_from_slice(&self.data[off..off + len]);
            new_offsets.push((length - acc) as u16);
        }

        let free = length - total;
        self.data[free..length].copy_from_slice(&scratch);
        for (i, off) in new_offsets.iter().enumerate() {
            let entry = SEG_HEADER_SIZE + i * SEG_OFF_SIZE;
            self.data[entry..entry + SEG_OFF_SIZE].copy_from_slice(&off.to_be_bytes());
        }
        header_mut(self.data).free_addr = I16::new(free as i16);
        Ok(())
    }

    /// Copies this segment into a larger span, shifting record offsets by
    /// the capacity delta so they stay anchored to the new end.
    pub fn extend_into(&self, target: &mut [u8]) -> StoreResult<()> {
        self.as_view().extend_into(target)
    }

    /// Partitions this segment's records (plus an optional incoming insert)
    /// between `self` and the empty same-capacity `target`.
    ///
    /// Records at the virtual split index and beyond move to `target`; the
    /// leading key never migrates. Returns the smallest key that moved.
    /// With `incline` set and the last three inserted keys monotonic, the
    /// pivot is biased so the growing side keeps more free space.
    ///
    /// The target inherits this segment's alias flag and prev/next
    /// addresses; its delete flag starts cleared. The caller re-links the
    /// chain afterwards.
    pub fn split_into(
        &mut self,
        key: Option<&str>,
        payload: Option<&[u8]>,
        target: &mut [u8],
        incline: bool,
    ) -> StoreResult<String> {
        let n = self.record_count();
        if target.len() != self.length() {
            return Err(StoreError::corrupt(
                "segments only split into a same-capacity span",
            ));
        }
        if n == 0 {
            return Err(StoreError::corrupt("cannot split a segment with no records"));
        }
        if key.is_none() && n == 1 {
            return Err(StoreError::corrupt(
                "cannot split a single-record segment without an insert",
            ));
        }

        let monotonic = incline
            && match (key, self.last_key.as_deref(), self.penu_key.as_deref()) {
                (Some(k), Some(last), Some(penu)) => {
                    let a = k.cmp(last);
                    let b = last.cmp(penu);
                    a == b && a != std::cmp::Ordering::Equal
                }
                _ => false,
            };

        // actual index of the key just smaller than the insert; -2 for none
        let pos: isize = match key {
            Some(k) => self.as_view().search_insert_slot(k)? as isize - 1,
            None => -2,
        };

        let half = (n / 2) as isize;
        let mut sp = if monotonic {
            let k = key.expect("monotonic implies an incoming key");
            if k > self.last_key.as_deref().expect("monotonic implies a last key") {
                (pos + 1).max(half)
            } else {
                (pos + 2).min(half)
            }
        } else {
            half
        };
        if sp < 1 {
            sp = 1;
        }

        // virtual upper index: the incoming record occupies one slot
        let upper = if key.is_none() { n as isize - 1 } else { n as isize };

        let mut t_free = target.len();
        let mut t_count = 0usize;
        let mut first_moved: Option<String> = None;
        let mut left = n;

        for ix in sp..=upper {
            let (mkey, mpayload): (&str, &[u8]) = if ix == pos + 1 && key.is_some() {
                (key.unwrap(), payload.unwrap_or(&[]))
            } else {
                let aix = if ix > pos && pos != -2 { ix - 1 } else { ix } as usize;
                let off = self.as_view().offset_at(aix);
                let k = key_at_offset(self.data, off)?;
                let p = payload_at_offset(self.data, off)?;
                left -= 1;
                (k, p)
            };

            if first_moved.is_none() {
                first_moved = Some(mkey.to_string());
            }

            let record_size = KEY_PREFIX_SIZE + mkey.len() + mpayload.len();
            t_free -= record_size;
            write_record(target, t_free, mkey, mpayload);
            let entry = SEG_HEADER_SIZE + t_count * SEG_OFF_SIZE;
            target[entry..entry + SEG_OFF_SIZE].copy_from_slice(&(t_free as u16).to_be_bytes());
            t_count += 1;
        }

        // the moved records occupied the table tail; truncating the count
        // drops them, and compaction reclaims their bytes
        {
            let h = header_mut(self.data);
            h.record_count = I16::new(left as i16);
            h.pair_length = I16::new((left * SEG_OFF_SIZE) as i16);
        }
        self.compact()?;

        if sp > pos + 1 {
            if let (Some(k), Some(p)) = (key, payload) {
                // the incoming record stays on the retained side
                match self.insert(k, p) {
                    Ok(_) => {}
                    Err(StoreError::SegmentOverflow) => {
                        return Err(StoreError::ColossalRecord {
                            key: k.to_string(),
                            size: p.len(),
                        })
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let src_flags = header(self.data).flags;
        let src_prev = self.prev_seg();
        let src_next = self.next_seg();
        {
            let target_len = target.len();
            let h = header_mut(target);
            h.length = I16::new(target_len as i16);
            h.free_addr = I16::new(t_free as i16);
            h.record_count = I16::new(t_count as i16);
            h.pair_length = I16::new((t_count * SEG_OFF_SIZE) as i16);
            h.prev_seg = I64::new(src_prev.raw());
            h.next_seg = I64::new(src_next.raw());
            // alias flag carries over; the delete flag starts cleared
            h.flags = src_flags & SEG_FLAG_ALIAS;
        }

        self.penu_key = None;
        self.last_key = None;
        Ok(first_moved.expect("split always moves at least one record"))
    }

    fn write_record_at(&mut self, offset: usize, key: &str, payload: &[u8]) {
        write_record(self.data, offset, key, payload);
    }
}

fn write_record(data: &mut [u8], offset: usize, key: &str, payload: &[u8]) {
    let mut pos = offset;
    data[pos..pos + KEY_PREFIX_SIZE].copy_from_slice(&(key.len() as u32).to_be_bytes());
    pos += KEY_PREFIX_SIZE;
    data[pos..pos + key.len()].copy_from_slice(key.as_bytes());
    pos += key.len();
    data[pos..pos + payload.len()].copy_from_slice(payload);
}
