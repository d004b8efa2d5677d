use std::fmt;
use std::io;
use std::path::PathBuf;

/// What exactly is wrong with a corrupt checkpoint, segment, or record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptKind {
    /// Structural damage: missing tail, unaligned size, nonzero flags.
    BadHeader,
    /// A magic number does not match its expected value.
    MagicMismatch,
    /// A generation field disagrees with its header.
    GenMismatch,
    /// The format version is not supported.
    VersionMismatch,
    /// A declared size disagrees with the measured one.
    SizeMismatch,
    /// A stored CRC32 disagrees with the computed one.
    CrcMismatch,
}

impl fmt::Display for CorruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadHeader => "bad header",
            Self::MagicMismatch => "magic mismatch",
            Self::GenMismatch => "generation mismatch",
            Self::VersionMismatch => "version mismatch",
            Self::SizeMismatch => "size mismatch",
            Self::CrcMismatch => "crc mismatch",
        };
        f.write_str(s)
    }
}

/// Errors produced by the journal storage layer.
///
/// Corruption found while replaying operation records is *not* reported
/// through this type: the replay loop treats it as the end of valid data
/// and stops cleanly.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The file is not a journal file at all (wrong or truncated magic).
    #[error("not a journal file")]
    NotAJournal,

    /// A segment file was opened where a checkpoint was expected.
    #[error("not a checkpoint file")]
    NotACheckpoint,

    /// A checkpoint file was opened where a segment was expected.
    #[error("not a segment file")]
    NotASegment,

    /// The checkpoint file failed validation on open.
    #[error("corrupt checkpoint: {0}")]
    CheckpointCorrupt(CorruptKind),

    /// The segment file header failed validation on open.
    #[error("corrupt segment: {0}")]
    SegmentCorrupt(CorruptKind),

    /// An operation record is malformed (writer-side size violations).
    #[error("corrupt operation record: {0}")]
    OperationCorrupt(CorruptKind),

    /// Exclusive creation collided with an existing journal.
    #[error("journal already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// An underlying syscall failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A malformed path, name, or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not permitted in the current storage or file state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Convenience alias used throughout the storage crate.
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_kind_display() {
        assert_eq!(
            StorageError::CheckpointCorrupt(CorruptKind::CrcMismatch).to_string(),
            "corrupt checkpoint: crc mismatch"
        );
        assert_eq!(
            StorageError::OperationCorrupt(CorruptKind::SizeMismatch).to_string(),
            "corrupt operation record: size mismatch"
        );
    }
}
