//! On-disk format primitives for the jrnl journal storage engine.
//!
//! Pure, I/O-free building blocks shared by readers and writers:
//!
//! - **integrity**: CRC32 continuation and 8-byte alignment helpers
//! - **magic**: the 8-byte storage magics and tail-magic derivation
//! - **layout**: little-endian header/tail structures with size negotiation
//! - **names**: the journal name grammar and component filenames
//!
//! Everything here is bit-exact: a conforming implementation built on this
//! crate can read journals written by any other conforming implementation.

pub mod integrity;
pub mod layout;
pub mod magic;
pub mod names;

pub use integrity::{aligned_size, crc32_update, crc32_update_vectored, is_aligned, padding_for, ALIGNMENT};
pub use layout::{
    negotiated_header_size, CheckpointTail, FileHeader, OperationHeader, OperationTail,
    FORMAT_VERSION, MAX_HEADER_SIZE, MAX_OPSIZE,
};
pub use magic::{
    Magic, STORAGE_CHECKPOINT_MAGIC, STORAGE_OPERATION_MAGIC, STORAGE_SEGMENT_MAGIC,
};
pub use names::{
    build_filename, is_valid_name, parse_filename, FilenameKind, ParsedFilename,
};
