//! # Child Record Codec
//!
//! The on-segment byte form of one child entry. A record stored in a
//! segment is `(u32 key_len, key_bytes, payload)`; this module owns the
//! payload half. Payloads are kind-tagged by their first byte so their
//! length can be derived without a stored length field:
//!
//! ```text
//! Database / Internal (10 bytes):
//! +-----+-------+---------------------+
//! | tag | flags | subtree_addr (i64)  |
//! +-----+-------+---------------------+
//!
//! Device (10 bytes, flags bit 0 = aligned):
//! +-----+-------+---------------------+
//! | tag | flags | subtree_addr (i64)  |
//! +-----+-------+---------------------+
//!
//! Measurement (8 bytes + alias):
//! +-----+-----------+----------+------------+---------------------+
//! | tag | data_type | encoding | compressor | alias (opt string)  |
//! +-----+-----------+----------+------------+---------------------+
//! ```
//!
//! All integers are big-endian. The subtree address sits at a fixed offset
//! (2) in every non-measurement payload, so a parental record can be
//! re-pointed at a transplanted segment by patching eight bytes in place.

use smallvec::SmallVec;

use crate::encoding::{opt_string_len, ByteReader, ByteWriter, STR_PREFIX_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::node::NodeKind;
use crate::storage::SegmentAddress;

const TAG_DATABASE: u8 = 0x00;
const TAG_INTERNAL: u8 = 0x01;
const TAG_DEVICE: u8 = 0x02;
const TAG_MEASUREMENT: u8 = 0x03;

const DEVICE_ALIGNED_FLAG: u8 = 0x01;

/// Byte length of a non-measurement payload.
pub const INTERNAL_PAYLOAD_LEN: usize = 10;

/// Byte offset of the subtree address within a non-measurement payload.
pub const SUBTREE_ADDR_OFFSET: usize = 2;

/// Fixed prefix of a measurement payload, before the alias.
const MEASUREMENT_FIXED_LEN: usize = 4;

/// Decoded form of one child record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRecord {
    Database {
        subtree_addr: SegmentAddress,
    },
    Internal {
        subtree_addr: SegmentAddress,
    },
    Device {
        subtree_addr: SegmentAddress,
        aligned: bool,
    },
    Measurement {
        alias: Option<String>,
        data_type: u8,
        encoding: u8,
        compressor: u8,
    },
}

impl NodeRecord {
    /// Builds the record for a node of the given kind.
    pub fn from_node(kind: &NodeKind, subtree_addr: SegmentAddress) -> Self {
        match kind {
            NodeKind::Database => NodeRecord::Database { subtree_addr },
            NodeKind::Internal => NodeRecord::Internal { subtree_addr },
            NodeKind::Device { aligned } => NodeRecord::Device {
                subtree_addr,
                aligned: *aligned,
            },
            NodeKind::Measurement {
                alias,
                data_type,
                encoding,
                compressor,
            } => NodeRecord::Measurement {
                alias: alias.clone(),
                data_type: *data_type,
                encoding: *encoding,
                compressor: *compressor,
            },
        }
    }

    /// The node kind this record materializes as.
    pub fn to_kind(&self) -> NodeKind {
        match self {
            NodeRecord::Database { .. } => NodeKind::Database,
            NodeRecord::Internal { .. } => NodeKind::Internal,
            NodeRecord::Device { aligned, .. } => NodeKind::Device { aligned: *aligned },
            NodeRecord::Measurement {
                alias,
                data_type,
                encoding,
                compressor,
            } => NodeKind::Measurement {
                alias: alias.clone(),
                data_type: *data_type,
                encoding: *encoding,
                compressor: *compressor,
            },
        }
    }

    pub fn is_measurement(&self) -> bool {
        matches!(self, NodeRecord::Measurement { .. })
    }

    pub fn has_alias(&self) -> bool {
        matches!(self, NodeRecord::Measurement { alias: Some(_), .. })
    }

    /// The child's subtree segment address; `NONE` for measurements.
    pub fn subtree_addr(&self) -> SegmentAddress {
        match self {
            NodeRecord::Database { subtree_addr }
            | NodeRecord::Internal { subtree_addr }
            | NodeRecord::Device { subtree_addr, .. } => *subtree_addr,
            NodeRecord::Measurement { .. } => SegmentAddress::NONE,
        }
    }

    pub fn set_subtree_addr(&mut self, addr: SegmentAddress) {
        match self {
            NodeRecord::Database { subtree_addr }
            | NodeRecord::Internal { subtree_addr }
            | NodeRecord::Device { subtree_addr, .. } => *subtree_addr = addr,
            NodeRecord::Measurement { .. } => {}
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            NodeRecord::Database { .. }
            | NodeRecord::Internal { .. }
            | NodeRecord::Device { .. } => INTERNAL_PAYLOAD_LEN,
            NodeRecord::Measurement { alias, .. } => {
                MEASUREMENT_FIXED_LEN + opt_string_len(alias.as_deref())
            }
        }
    }

    pub fn encode(&self) -> SmallVec<[u8; 32]> {
        let mut buf: SmallVec<[u8; 32]> = SmallVec::new();
        buf.resize(self.encoded_len(), 0);
        let mut w = ByteWriter::new(&mut buf);
        // writes below cannot overflow: the buffer was sized by encoded_len
        match self {
            NodeRecord::Database { subtree_addr } => {
                w.write_u8(TAG_DATABASE).unwrap();
                w.write_u8(0).unwrap();
                w.write_i64(subtree_addr.raw()).unwrap();
            }
            NodeRecord::Internal { subtree_addr } => {
                w.write_u8(TAG_INTERNAL).unwrap();
                w.write_u8(0).unwrap();
                w.write_i64(subtree_addr.raw()).unwrap();
            }
            NodeRecord::Device {
                subtree_addr,
                aligned,
            } => {
                w.write_u8(TAG_DEVICE).unwrap();
                w.write_u8(if *aligned { DEVICE_ALIGNED_FLAG } else { 0 })
                    .unwrap();
                w.write_i64(subtree_addr.raw()).unwrap();
            }
            NodeRecord::Measurement {
                alias,
                data_type,
                encoding,
                compressor,
            } => {
                w.write_u8(TAG_MEASUREMENT).unwrap();
                w.write_u8(*data_type).unwrap();
                w.write_u8(*encoding).unwrap();
                w.write_u8(*compressor).unwrap();
                w.write_opt_string(alias.as_deref()).unwrap();
            }
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> StoreResult<Self> {
        let mut r = ByteReader::new(payload);
        let tag = r.read_u8()?;
        match tag {
            TAG_DATABASE => {
                let _flags = r.read_u8()?;
                let addr = SegmentAddress::from_raw(r.read_i64()?);
                Ok(NodeRecord::Database { subtree_addr: addr })
            }
            TAG_INTERNAL => {
                let _flags = r.read_u8()?;
                let addr = SegmentAddress::from_raw(r.read_i64()?);
                Ok(NodeRecord::Internal { subtree_addr: addr })
            }
            TAG_DEVICE => {
                let flags = r.read_u8()?;
                let addr = SegmentAddress::from_raw(r.read_i64()?);
                Ok(NodeRecord::Device {
                    subtree_addr: addr,
                    aligned: flags & DEVICE_ALIGNED_FLAG != 0,
                })
            }
            TAG_MEASUREMENT => {
                let data_type = r.read_u8()?;
                let encoding = r.read_u8()?;
                let compressor = r.read_u8()?;
                let alias = r.read_opt_string()?;
                Ok(NodeRecord::Measurement {
                    alias,
                    data_type,
                    encoding,
                    compressor,
                })
            }
            other => Err(StoreError::corrupt(format!(
                "unknown record tag: {other:#04x}"
            ))),
        }
    }
}

/// Derives the payload length from its leading bytes without full decoding.
///
/// Used by the segment layer to delimit records, whose stored form carries
/// no explicit payload length.
pub fn payload_len(payload: &[u8]) -> StoreResult<usize> {
    let mut r = ByteReader::new(payload);
    let tag = r.read_u8()?;
    match tag {
        TAG_DATABASE | TAG_INTERNAL | TAG_DEVICE => Ok(INTERNAL_PAYLOAD_LEN),
        TAG_MEASUREMENT => {
            if payload.len() < MEASUREMENT_FIXED_LEN + STR_PREFIX_SIZE {
                return Err(StoreError::corrupt("truncated measurement payload"));
            }
            let prefix = u32::from_be_bytes([
                payload[MEASUREMENT_FIXED_LEN],
                payload[MEASUREMENT_FIXED_LEN + 1],
                payload[MEASUREMENT_FIXED_LEN + 2],
                payload[MEASUREMENT_FIXED_LEN + 3],
            ]);
            let alias_len = if prefix == u32::MAX { 0 } else { prefix as usize };
            Ok(MEASUREMENT_FIXED_LEN + STR_PREFIX_SIZE + alias_len)
        }
        other => Err(StoreError::corrupt(format!(
            "unknown record tag: {other:#04x}"
        ))),
    }
}

/// Re-points a non-measurement payload at a new subtree segment in place.
pub fn patch_subtree_addr(payload: &mut [u8], addr: SegmentAddress) -> StoreResult<()> {
    if payload.len() < INTERNAL_PAYLOAD_LEN {
        return Err(StoreError::corrupt("payload too short to patch"));
    }
    if payload[0] == TAG_MEASUREMENT {
        return Err(StoreError::corrupt(
            "measurement records hold no subtree address",
        ));
    }
    payload[SUBTREE_ADDR_OFFSET..SUBTREE_ADDR_OFFSET + 8]
        .copy_from_slice(&addr.raw().to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_record_round_trip() {
        let rec = NodeRecord::Internal {
            subtree_addr: SegmentAddress::new(3, 1),
        };
        let bytes = rec.encode();
        assert_eq!(bytes.len(), INTERNAL_PAYLOAD_LEN);
        assert_eq!(NodeRecord::decode(&bytes).unwrap(), rec);
        assert_eq!(payload_len(&bytes).unwrap(), bytes.len());
    }

    #[test]
    fn device_record_preserves_aligned_flag() {
        let rec = NodeRecord::Device {
            subtree_addr: SegmentAddress::new(1, 0),
            aligned: true,
        };
        let decoded = NodeRecord::decode(&rec.encode()).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn measurement_record_with_alias_round_trip() {
        let rec = NodeRecord::Measurement {
            alias: Some("temperature".to_string()),
            data_type: 3,
            encoding: 1,
            compressor: 2,
        };
        let bytes = rec.encode();
        assert_eq!(NodeRecord::decode(&bytes).unwrap(), rec);
        assert_eq!(payload_len(&bytes).unwrap(), bytes.len());
        assert!(rec.has_alias());
    }

    #[test]
    fn measurement_record_without_alias() {
        let rec = NodeRecord::Measurement {
            alias: None,
            data_type: 0,
            encoding: 0,
            compressor: 0,
        };
        let bytes = rec.encode();
        assert_eq!(bytes.len(), MEASUREMENT_FIXED_LEN + STR_PREFIX_SIZE);
        assert_eq!(NodeRecord::decode(&bytes).unwrap(), rec);
        assert_eq!(payload_len(&bytes).unwrap(), bytes.len());
        assert!(!rec.has_alias());
    }

    #[test]
    fn measurement_subtree_addr_is_none() {
        let rec = NodeRecord::Measurement {
            alias: None,
            data_type: 0,
            encoding: 0,
            compressor: 0,
        };
        assert!(rec.subtree_addr().is_none());
    }

    #[test]
    fn patch_subtree_addr_rewrites_in_place() {
        let rec = NodeRecord::Internal {
            subtree_addr: SegmentAddress::NONE,
        };
        let mut bytes = rec.encode();
        patch_subtree_addr(&mut bytes, SegmentAddress::new(9, 2)).unwrap();

        let decoded = NodeRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.subtree_addr(), SegmentAddress::new(9, 2));
    }

    #[test]
    fn patch_rejects_measurement_payload() {
        let rec = NodeRecord::Measurement {
            alias: Some("a".to_string()),
            data_type: 0,
            encoding: 0,
            compressor: 0,
        };
        let mut bytes = rec.encode();
        assert!(patch_subtree_addr(&mut bytes, SegmentAddress::ROOT).is_err());
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        let bytes = [0x7F, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            NodeRecord::decode(&bytes).unwrap_err(),
            StoreError::Corrupt(_)
        ));
        assert!(payload_len(&bytes).is_err());
    }

    #[test]
    fn record_from_node_kind() {
        let kind = NodeKind::Device { aligned: true };
        let rec = NodeRecord::from_node(&kind, SegmentAddress::new(2, 0));
        assert_eq!(rec.subtree_addr(), SegmentAddress::new(2, 0));
        assert_eq!(rec.to_kind(), kind);
    }
}
