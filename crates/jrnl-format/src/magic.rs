//! Eight-byte magic numbers marking journal files and records.

use std::fmt;

/// An 8-byte magic number.
///
/// Every journal file starts with a storage magic followed by the
/// application-supplied user magic; every operation record and every tail
/// record starts with a magic of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Magic(pub [u8; 8]);

/// Marks the first 8 bytes of every checkpoint file.
pub const STORAGE_CHECKPOINT_MAGIC: Magic = Magic(*b"JRNLCKPT");

/// Marks the first 8 bytes of every segment file.
pub const STORAGE_SEGMENT_MAGIC: Magic = Magic(*b"JRNLSEGM");

/// Marks the start of every operation record inside a segment.
pub const STORAGE_OPERATION_MAGIC: Magic = Magic(*b"JRNLOPER");

impl Magic {
    /// Size of a magic on disk.
    pub const SIZE: usize = 8;

    /// The all-zero magic (placeholder before a user magic is known).
    pub const ZERO: Magic = Magic([0; 8]);

    /// Create a magic from raw bytes.
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// The tail magic derived from this head magic: the bytes reversed.
    ///
    /// Tail records (checkpoint tails) are introduced by the tail magic of
    /// the file's storage magic.
    pub const fn tail(&self) -> Magic {
        let b = self.0;
        Magic([b[7], b[6], b[5], b[4], b[3], b[2], b[1], b[0]])
    }

    /// Raw bytes of the magic.
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
