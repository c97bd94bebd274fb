//! # Engine Configuration Constants
//!
//! This module centralizes all layout and sizing constants for the schema
//! file engine. Constants that depend on each other are co-located and the
//! relationships are enforced through compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (16384 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (16 bytes, fixed)
//!       │
//!       ├─> SEG_MAX_SIZE (16320 bytes)
//!       │     A page must fit its header, one segment table entry and one
//!       │     maximum-size segment: 16 + 2 + 16320 <= 16384.
//!       │
//!       └─> SEG_SIZE_CLASSES (1024, 2048, 4096, 8192, SEG_MAX_SIZE)
//!             Segment growth ladder. Below the top class a segment grows by
//!             transplant; at the top class it grows by chaining.
//!
//! FILE_HEADER_SIZE (256 bytes)
//!       │
//!       └─> Page 0 starts at this file offset; page N at
//!           FILE_HEADER_SIZE + N * PAGE_SIZE.
//!
//! SEG_HEADER_SIZE (25 bytes)
//!       │
//!       └─> Offset table begins here; record area high watermark
//!           (free_addr) must never cross below header + table.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `PAGE_HEADER_SIZE + SEG_OFF_SIZE + SEG_MAX_SIZE <= PAGE_SIZE`
//! 2. `SEG_SIZE_CLASSES` is strictly ascending and ends at `SEG_MAX_SIZE`
//! 3. `SEG_MAX_SIZE` fits in an `i16` (segment-internal offsets are `i16`)

// ============================================================================
// PAGE LAYOUT CONSTANTS
// ============================================================================

/// Size of each file page in bytes (16KB).
/// This is the fundamental unit of I/O and page caching.
pub const PAGE_SIZE: usize = 16384;

/// Size of the page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of the file header in bytes. Pages start after it.
pub const FILE_HEADER_SIZE: usize = 256;

/// Current on-disk format version, stored in the file header.
pub const FORMAT_VERSION: u8 = 1;

// ============================================================================
// SEGMENT LAYOUT CONSTANTS
// ============================================================================

/// Size of the segment header in bytes.
pub const SEG_HEADER_SIZE: usize = 25;

/// Byte width of one offset table entry (u16 offset into the segment).
pub const SEG_OFF_SIZE: usize = 2;

/// Maximum segment size. A page hosts at most one segment of this size.
pub const SEG_MAX_SIZE: usize = 16320;

/// Segment growth ladder. Overflow below the top class grows by transplant
/// into the next class; at the top class growth is by chaining.
pub const SEG_SIZE_CLASSES: [usize; 5] = [1024, 2048, 4096, 8192, SEG_MAX_SIZE];

const _: () = assert!(
    PAGE_HEADER_SIZE + SEG_OFF_SIZE + SEG_MAX_SIZE <= PAGE_SIZE,
    "a page must fit its header, one table entry and one max-size segment"
);

const _: () = assert!(
    SEG_MAX_SIZE <= i16::MAX as usize,
    "segment-internal offsets are i16"
);

const _: () = assert!(
    SEG_SIZE_CLASSES[0] < SEG_SIZE_CLASSES[1]
        && SEG_SIZE_CLASSES[1] < SEG_SIZE_CLASSES[2]
        && SEG_SIZE_CLASSES[2] < SEG_SIZE_CLASSES[3]
        && SEG_SIZE_CLASSES[3] < SEG_SIZE_CLASSES[4],
    "size classes must be strictly ascending"
);

const _: () = assert!(
    SEG_SIZE_CLASSES[4] == SEG_MAX_SIZE,
    "the growth ladder must end at SEG_MAX_SIZE"
);

// ============================================================================
// CACHE AND POOL SIZING
// ============================================================================

/// Default number of 16KB page frames held by the page cache.
pub const DEFAULT_PAGE_CACHE_CAPACITY: usize = 48;

/// Default number of resident tree nodes before eviction kicks in.
pub const DEFAULT_NODE_CACHE_CAPACITY: usize = 10_000;

/// Number of shards in the cold (evictable) node set.
/// Sharding by node-id hash keeps recency updates off a single lock.
pub const COLD_SHARD_COUNT: usize = 1000;

/// Number of shards in the node lock table.
pub const LOCK_SHARD_COUNT: usize = 64;

/// Default number of idle node locks kept for reuse.
pub const DEFAULT_LOCK_POOL_CAPACITY: usize = 400;
