//! On-disk header and tail layouts.
//!
//! All multi-byte integers are little-endian. Every structure carries its
//! own size in a `structure_size` prefix field so future versions can append
//! fields; readers accept any declared size between the canonical size and
//! [`MAX_HEADER_SIZE`] and skip the bytes they do not understand.
//!
//! Endianness conversion is centralized here in the `to_disk`/`from_disk`
//! pairs; no other module byte-swaps.

use crate::integrity::is_aligned;

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Hard cap on any negotiated header size, to bound reads on corruption.
pub const MAX_HEADER_SIZE: u32 = 4096;

/// Hard cap on a single operation record payload, to bound allocation when
/// a corrupt record declares a bogus size.
pub const MAX_OPSIZE: u32 = 16 * 1024 * 1024;

/// Validate a header's self-declared size against its canonical size.
///
/// Returns the negotiated total header size, or `None` when the declared
/// size is smaller than the canonical size, exceeds [`MAX_HEADER_SIZE`], or
/// is not 8-byte aligned.
pub fn negotiated_header_size(declared: u32, canonical: usize) -> Option<usize> {
    let size = declared as usize;
    (size >= canonical && declared <= MAX_HEADER_SIZE && is_aligned(declared as u64))
        .then_some(size)
}

fn get_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn get_u64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes([
        b[off],
        b[off + 1],
        b[off + 2],
        b[off + 3],
        b[off + 4],
        b[off + 5],
        b[off + 6],
        b[off + 7],
    ])
}

fn put_u32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(b: &mut [u8], off: usize, v: u64) {
    b[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

// ---------------------------------------------------------------------------
// FileHeader
// ---------------------------------------------------------------------------

/// Header of both checkpoint and segment files, written right after the
/// storage magic and the user magic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    /// Self-declared size of this header; canonical value is [`FileHeader::SIZE`].
    pub structure_size: u32,
    /// Format version of the file.
    pub format_version: u32,
    /// Generation at the moment the file was created; 8-byte aligned.
    pub generation: u64,
    /// Checkpoint: id of the first segment after this checkpoint.
    /// Segment: id of the next segment (this segment's id + 1).
    pub nextseg_id: u64,
    /// Random per-file identifier.
    pub uid: u64,
}

impl FileHeader {
    /// Canonical serialized size.
    pub const SIZE: usize = 32;

    /// Build a current-version header.
    pub fn new(generation: u64, nextseg_id: u64, uid: u64) -> Self {
        Self {
            structure_size: Self::SIZE as u32,
            format_version: FORMAT_VERSION,
            generation,
            nextseg_id,
            uid,
        }
    }

    /// Serialize to disk byte order.
    pub fn to_disk(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        put_u32(&mut b, 0, self.structure_size);
        put_u32(&mut b, 4, self.format_version);
        put_u64(&mut b, 8, self.generation);
        put_u64(&mut b, 16, self.nextseg_id);
        put_u64(&mut b, 24, self.uid);
        b
    }

    /// Deserialize the canonical part from disk byte order.
    pub fn from_disk(b: &[u8; Self::SIZE]) -> Self {
        Self {
            structure_size: get_u32(b, 0),
            format_version: get_u32(b, 4),
            generation: get_u64(b, 8),
            nextseg_id: get_u64(b, 16),
            uid: get_u64(b, 24),
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointTail
// ---------------------------------------------------------------------------

/// Tail record of a checkpoint file, written after the tail magic.
///
/// Serialized as [`CheckpointTail::SIZE`] bytes with a zero reserved word
/// before the crc field, so the crc occupies the last 4 bytes of the file
/// and the file size stays 8-byte aligned. The whole-file CRC32 covers
/// every file byte except those final 4.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointTail {
    /// Must equal the file header's generation.
    pub generation: u64,
    /// Payload bytes between header end and tail start, before padding.
    pub data_size: u64,
    /// Must equal the file header's format version.
    pub format_version: u32,
    /// Must be zero.
    pub flags: u32,
    /// CRC32 over file bytes `[0, filesize - 4)`.
    pub crc32: u32,
}

impl CheckpointTail {
    /// Serialized size, including the reserved word.
    pub const SIZE: usize = 32;

    /// Offset of the crc field within the serialized tail.
    pub const CRC_OFFSET: usize = 28;

    /// Serialize to disk byte order.
    pub fn to_disk(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        put_u64(&mut b, 0, self.generation);
        put_u64(&mut b, 8, self.data_size);
        put_u32(&mut b, 16, self.format_version);
        put_u32(&mut b, 20, self.flags);
        // bytes 24..28 reserved, zero
        put_u32(&mut b, Self::CRC_OFFSET, self.crc32);
        b
    }

    /// Deserialize from disk byte order.
    pub fn from_disk(b: &[u8; Self::SIZE]) -> Self {
        Self {
            generation: get_u64(b, 0),
            data_size: get_u64(b, 8),
            format_version: get_u32(b, 16),
            flags: get_u32(b, 20),
            crc32: get_u32(b, Self::CRC_OFFSET),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationHeader / OperationTail
// ---------------------------------------------------------------------------

/// Header of an operation record, written after the operation magic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationHeader {
    /// Self-declared size; canonical value is [`OperationHeader::SIZE`].
    pub structure_size: u32,
    /// Application-defined operation code.
    pub opcode: u32,
    /// Application-defined operation version.
    pub opversion: u32,
    /// Payload size in bytes, before padding.
    pub data_size: u32,
}

impl OperationHeader {
    /// Canonical serialized size.
    pub const SIZE: usize = 16;

    /// Build a current-format header.
    pub fn new(opcode: u32, opversion: u32, data_size: u32) -> Self {
        Self {
            structure_size: Self::SIZE as u32,
            opcode,
            opversion,
            data_size,
        }
    }

    /// Serialize to disk byte order.
    pub fn to_disk(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        put_u32(&mut b, 0, self.structure_size);
        put_u32(&mut b, 4, self.opcode);
        put_u32(&mut b, 8, self.opversion);
        put_u32(&mut b, 12, self.data_size);
        b
    }

    /// Deserialize the canonical part from disk byte order.
    pub fn from_disk(b: &[u8; Self::SIZE]) -> Self {
        Self {
            structure_size: get_u32(b, 0),
            opcode: get_u32(b, 4),
            opversion: get_u32(b, 8),
            data_size: get_u32(b, 12),
        }
    }
}

/// Tail of an operation record.
///
/// The crc covers the operation header (extension bytes included), the
/// padded payload, and the `data_size` echo field; the operation magic is
/// not covered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationTail {
    /// Must echo the header's `data_size`.
    pub data_size: u32,
    /// Per-record CRC32.
    pub crc32: u32,
}

impl OperationTail {
    /// Serialized size.
    pub const SIZE: usize = 8;

    /// Offset of the crc field within the serialized tail.
    pub const CRC_OFFSET: usize = 4;

    /// Serialize to disk byte order.
    pub fn to_disk(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        put_u32(&mut b, 0, self.data_size);
        put_u32(&mut b, Self::CRC_OFFSET, self.crc32);
        b
    }

    /// Deserialize from disk byte order.
    pub fn from_disk(b: &[u8; Self::SIZE]) -> Self {
        Self {
            data_size: get_u32(b, 0),
            crc32: get_u32(b, Self::CRC_OFFSET),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_roundtrip() {
        let header = FileHeader::new(4096, 17, 0xdead_beef_cafe_f00d);
        let decoded = FileHeader::from_disk(&header.to_disk());
        assert_eq!(header, decoded);
        assert_eq!(decoded.structure_size, FileHeader::SIZE as u32);
        assert_eq!(decoded.format_version, FORMAT_VERSION);
    }

    #[test]
    fn file_header_is_little_endian() {
        let header = FileHeader::new(0x0102_0304_0506_0708, 0, 1);
        let bytes = header.to_disk();
        assert_eq!(&bytes[8..16], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn checkpoint_tail_crc_is_last() {
        let tail = CheckpointTail {
            generation: 8,
            data_size: 3,
            format_version: FORMAT_VERSION,
            flags: 0,
            crc32: 0xa1b2_c3d4,
        };
        let bytes = tail.to_disk();
        assert_eq!(bytes.len(), CheckpointTail::SIZE);
        assert_eq!(&bytes[CheckpointTail::CRC_OFFSET..], &0xa1b2_c3d4u32.to_le_bytes());
        assert_eq!(&bytes[24..28], &[0, 0, 0, 0]);
        assert_eq!(CheckpointTail::from_disk(&bytes), tail);
    }

    #[test]
    fn operation_structs_roundtrip() {
        let header = OperationHeader::new(7, 2, 1000);
        assert_eq!(OperationHeader::from_disk(&header.to_disk()), header);
        let tail = OperationTail {
            data_size: 1000,
            crc32: 42,
        };
        assert_eq!(OperationTail::from_disk(&tail.to_disk()), tail);
    }

    #[test]
    fn header_size_negotiation() {
        assert_eq!(negotiated_header_size(32, FileHeader::SIZE), Some(32));
        assert_eq!(negotiated_header_size(48, FileHeader::SIZE), Some(48));
        // Smaller than canonical, unaligned, or over the cap.
        assert_eq!(negotiated_header_size(24, FileHeader::SIZE), None);
        assert_eq!(negotiated_header_size(33, FileHeader::SIZE), None);
        assert_eq!(negotiated_header_size(MAX_HEADER_SIZE + 8, FileHeader::SIZE), None);
        assert_eq!(negotiated_header_size(MAX_HEADER_SIZE, FileHeader::SIZE), Some(4096));
    }
}
