//! # Page: 16KB Segment Container
//!
//! Every page is a 16KB slab beginning with a 16-byte header. The rest of
//! the page hosts one or more segments, located through a segment table of
//! 2-byte offsets that grows upward from the header while segment bodies
//! are bump-allocated downward from the page end:
//!
//! ```text
//! +---------------------+
//! | Page header (16 B)  |
//! +---------------------+
//! | Segment table       |  <- 2-byte offsets, grows downward from 16
//! +---------------------+
//! | Free space          |
//! +---------------------+
//! | Segment bodies      |  <- bump-allocated upward from the page end
//! +---------------------+
//! ```
//!
//! A page can host many small segments or exactly one maximum-size
//! segment. Deleting a segment sets its deleted flag; the space is not
//! reused (pages are rewritten wholesale when their content migrates).
//!
//! ## Page Header Layout (16 bytes, big-endian)
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  ---------------------------------
//! 0       4     page_index      Index of this page within the file
//! 4       2     segment_count   Number of allocated segments
//! 6       2     seg_area_start  Lowest allocated segment offset
//! 8       1     flags           Page flags (reserved)
//! 9       7     reserved        Zero padding
//! ```

use zerocopy::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE, SEG_HEADER_SIZE, SEG_OFF_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::storage::segment::{SegmentMut, SegmentView};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PageHeader {
    page_index: U32,
    segment_count: U16,
    seg_area_start: U16,
    flags: u8,
    reserved: [u8; 7],
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

fn header(data: &[u8]) -> &PageHeader {
    PageHeader::ref_from_bytes(&data[..PAGE_HEADER_SIZE]).expect("page header")
}

fn header_mut(data: &mut [u8]) -> &mut PageHeader {
    PageHeader::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE]).expect("page header")
}

fn validate(data: &[u8]) -> StoreResult<()> {
    if data.len() != PAGE_SIZE {
        return Err(StoreError::corrupt(format!(
            "invalid page size: {} != {PAGE_SIZE}",
            data.len()
        )));
    }
    let h = header(data);
    let count = h.segment_count.get() as usize;
    let area = h.seg_area_start.get() as usize;
    let table_end = PAGE_HEADER_SIZE + count * SEG_OFF_SIZE;
    if area > PAGE_SIZE || area < table_end {
        return Err(StoreError::corrupt(format!(
            "segment area start {area} out of range (table ends {table_end})"
        )));
    }
    Ok(())
}

/// Read-only view of one page.
#[derive(Debug, Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
}

impl<'a> PageView<'a> {
    pub fn from_bytes(data: &'a [u8]) -> StoreResult<Self> {
        validate(data)?;
        Ok(Self { data })
    }

    pub fn page_index(&self) -> u32 {
        header(self.data).page_index.get()
    }

    pub fn segment_count(&self) -> usize {
        header(self.data).segment_count.get() as usize
    }

    fn seg_area_start(&self) -> usize {
        header(self.data).seg_area_start.get() as usize
    }

    /// Contiguous free bytes between the segment table and segment area.
    pub fn free_space(&self) -> usize {
        self.seg_area_start() - PAGE_HEADER_SIZE - self.segment_count() * SEG_OFF_SIZE
    }

    /// Whether a fresh segment of `size` bytes (plus its table entry) fits.
    pub fn has_capacity_for(&self, size: usize) -> bool {
        self.free_space() >= size + SEG_OFF_SIZE
    }

    fn segment_offset(&self, index: u16) -> StoreResult<usize> {
        if index as usize >= self.segment_count() {
            return Err(StoreError::corrupt(format!(
                "segment index {index} out of range (page {} holds {})",
                self.page_index(),
                self.segment_count()
            )));
        }
        let pos = PAGE_HEADER_SIZE + index as usize * SEG_OFF_SIZE;
        Ok(u16::from_be_bytes([self.data[pos], self.data[pos + 1]]) as usize)
    }

    fn segment_span(&self, index: u16) -> StoreResult<&'a [u8]> {
        let offset = self.segment_offset(index)?;
        if offset + SEG_HEADER_SIZE > PAGE_SIZE {
            return Err(StoreError::corrupt(format!(
                "segment offset {offset} out of range"
            )));
        }
        let len = i16::from_be_bytes([self.data[offset], self.data[offset + 1]]);
        if len < SEG_HEADER_SIZE as i16 || offset + len as usize > PAGE_SIZE {
            return Err(StoreError::corrupt(format!(
                "segment length {len} at offset {offset} out of range"
            )));
        }
        Ok(&self.data[offset..offset + len as usize])
    }

    pub fn segment(&self, index: u16) -> StoreResult<SegmentView<'a>> {
        SegmentView::from_bytes(self.segment_span(index)?)
    }

    pub fn segment_size(&self, index: u16) -> StoreResult<usize> {
        Ok(self.segment_span(index)?.len())
    }
}

/// Mutable view of one page.
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    /// Formats `data` as an empty page.
    pub fn init(data: &'a mut [u8], page_index: u32) -> StoreResult<Self> {
        if data.len() != PAGE_SIZE {
            return Err(StoreError::corrupt(format!(
                "invalid page size: {} != {PAGE_SIZE}",
                data.len()
            )));
        }
        data.fill(0);
        let h = header_mut(data);
        h.page_index = U32::new(page_index);
        h.segment_count = U16::new(0);
        h.seg_area_start = U16::new(PAGE_SIZE as u16);
        h.flags = 0;
        Ok(Self { data })
    }

    pub fn from_bytes(data: &'a mut [u8]) -> StoreResult<Self> {
        validate(data)?;
        Ok(Self { data })
    }

    pub fn as_view(&self) -> PageView<'_> {
        PageView { data: self.data }
    }

    pub fn page_index(&self) -> u32 {
        self.as_view().page_index()
    }

    pub fn segment_count(&self) -> usize {
        self.as_view().segment_count()
    }

    pub fn free_space(&self) -> usize {
        self.as_view().free_space()
    }

    pub fn has_capacity_for(&self, size: usize) -> bool {
        self.as_view().has_capacity_for(size)
    }

    /// Allocates a blank segment of `size` bytes.
    ///
    /// Returns the new intra-page segment index, or
    /// [`StoreError::PageOverflow`] when the contiguous free span cannot
    /// take the segment plus its table entry.
    pub fn alloc_segment(&mut self, size: usize) -> StoreResult<u16> {
        if !self.has_capacity_for(size) {
            return Err(StoreError::PageOverflow {
                requested: size,
                available: self.free_space(),
            });
        }
        let count = self.segment_count();
        let new_start = self.as_view().seg_area_start() - size;

        SegmentMut::init(&mut self.data[new_start..new_start + size])?;

        let entry = PAGE_HEADER_SIZE + count * SEG_OFF_SIZE;
        self.data[entry..entry + SEG_OFF_SIZE].copy_from_slice(&(new_start as u16).to_be_bytes());
        let h = header_mut(self.data);
        h.segment_count = U16::new(count as u16 + 1);
        h.seg_area_start = U16::new(new_start as u16);
        Ok(count as u16)
    }

    fn segment_span_mut(&mut self, index: u16) -> StoreResult<&mut [u8]> {
        let offset = self.as_view().segment_offset(index)?;
        let len = i16::from_be_bytes([self.data[offset], self.data[offset + 1]]);
        if len < SEG_HEADER_SIZE as i16 || offset + len as usize > PAGE_SIZE {
            return Err(StoreError::corrupt(format!(
                "segment length {len} at offset {offset} out of range"
            )));
        }
        Ok(&mut self.data[offset..offset + len as usize])
    }

    pub fn segment(&self, index: u16) -> StoreResult<SegmentView<'_>> {
        self.as_view().segment(index)
    }

    pub fn segment_mut(&mut self, index: u16) -> StoreResult<SegmentMut<'_>> {
        SegmentMut::from_bytes(self.segment_span_mut(index)?)
    }

    /// Marks a segment deleted. Its table entry remains; the bytes are
    /// reclaimed only when the page is rewritten.
    pub fn delete_segment(&mut self, index: u16) -> StoreResult<()> {
        self.segment_mut(index)?.mark_deleted();
        Ok(())
    }

    /// Copies all records of a staged segment image into a freshly
    /// allocated segment of `new_size` bytes on this page. Returns the new
    /// segment index.
    ///
    /// `src` is the raw byte image of the source segment; staging it
    /// outside the page lets a transplant target any page, including the
    /// source's own.
    pub fn transplant_segment(&mut self, src: &[u8], new_size: usize) -> StoreResult<u16> {
        let index = self.alloc_segment(new_size)?;
        let span = self.segment_span_mut(index)?;
        SegmentView::from_bytes(src)?.extend_into(span)?;
        Ok(index)
    }
}
