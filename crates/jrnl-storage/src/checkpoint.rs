//! Checkpoint files: consolidated snapshots with a whole-file CRC32.
//!
//! A writable checkpoint accumulates a CRC32 over every byte it writes; the
//! commit pads the payload to 8 bytes, folds the tail magic and the tail
//! record into the accumulator, and writes the tail so that the crc is the
//! last 4 bytes of the file.
//!
//! A readable checkpoint is verified up front: the whole-file CRC is
//! recomputed (memory-mapped when possible, streamed otherwise) and every
//! tail field is cross-checked against the header before any payload is
//! exposed.

use std::fs::File;
use std::io::{self, IoSlice, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use memmap2::Mmap;
use tracing::{debug, warn};

use jrnl_format::{
    crc32_update, is_aligned, aligned_size, padding_for, CheckpointTail, Magic, FORMAT_VERSION,
};

use crate::error::{CorruptKind, Result, StorageError};
use crate::recfile::{FileKind, FileState, RecordFile};

/// Chunk size of the streamed CRC fallback.
const CRC_CHUNK: usize = 64 * 1024;

/// A checkpoint file, writable or readable.
#[derive(Debug)]
pub struct CheckpointFile {
    rec: RecordFile,
    data_end: u64,
}

impl CheckpointFile {
    /// Create an empty writable checkpoint in exclusive mode.
    ///
    /// `nextseg_id` is the id of the first segment that will logically
    /// follow this checkpoint. CRC accumulation is on from the start.
    pub fn create(path: &Path, nextseg_id: u64, generation: u64) -> Result<Self> {
        let mut rec = RecordFile::create(path, FileKind::Checkpoint, nextseg_id, generation)?;
        // The whole file is checksummed, headers included.
        rec.set_crc_mode(true);
        Ok(Self { rec, data_end: 0 })
    }

    /// Open and fully verify a checkpoint from an already-open handle.
    ///
    /// Leaves the file positioned at the start of the payload.
    pub fn open(file: File) -> Result<Self> {
        let mut rec = RecordFile::open_readable(file, FileKind::Checkpoint)?;

        let tail_span = (Magic::SIZE + CheckpointTail::SIZE) as u64;
        let filesize = rec.filesize()?;

        // The file size must be aligned and leave room for the tail record.
        if !is_aligned(filesize) {
            return Err(StorageError::CheckpointCorrupt(CorruptKind::BadHeader));
        }
        let Some(enddata) = filesize
            .checked_sub(tail_span)
            .filter(|&end| end >= rec.data_begin())
        else {
            warn!(filesize, "checkpoint has no room for a tail record, not properly closed");
            return Err(StorageError::CheckpointCorrupt(CorruptKind::BadHeader));
        };

        // The stored crc must match the crc of everything before it.
        let computed = file_crc32(rec.file_handle()?, filesize - 4)?;

        let mut tail_area = [0u8; Magic::SIZE + CheckpointTail::SIZE];
        rec.file_handle()?.read_exact_at(&mut tail_area, enddata)?;
        let tail = {
            let mut bytes = [0u8; CheckpointTail::SIZE];
            bytes.copy_from_slice(&tail_area[Magic::SIZE..]);
            CheckpointTail::from_disk(&bytes)
        };

        if computed != tail.crc32 {
            warn!(stored = tail.crc32, actual = computed, "checkpoint crc32 mismatch");
            return Err(StorageError::CheckpointCorrupt(CorruptKind::CrcMismatch));
        }
        rec.set_crc(computed);

        if tail_area[..Magic::SIZE] != *rec.storage_magic().tail().as_bytes() {
            return Err(StorageError::CheckpointCorrupt(CorruptKind::MagicMismatch));
        }
        if tail.generation != rec.generation() {
            return Err(StorageError::CheckpointCorrupt(CorruptKind::GenMismatch));
        }
        if tail.format_version != FORMAT_VERSION {
            return Err(StorageError::CheckpointCorrupt(CorruptKind::VersionMismatch));
        }
        if tail.flags != 0 {
            return Err(StorageError::CheckpointCorrupt(CorruptKind::BadHeader));
        }
        if aligned_size(tail.data_size) != enddata - rec.data_begin() {
            return Err(StorageError::CheckpointCorrupt(CorruptKind::SizeMismatch));
        }

        let data_end = rec.data_begin() + tail.data_size;
        rec.seek_to(rec.data_begin())?;

        debug!(
            generation = rec.generation(),
            nextseg = rec.nextseg_id(),
            data_size = tail.data_size,
            "checkpoint verified"
        );

        Ok(Self { rec, data_end })
    }

    /// Write the checkpoint header. CREATED → WRITABLE.
    pub fn init(&mut self, user_magic: Magic) -> Result<()> {
        self.rec.init(user_magic)
    }

    /// Append payload bytes; the CRC accumulator follows along.
    pub fn write_payload(&mut self, buf: &[u8]) -> Result<u64> {
        self.rec.writev(&[IoSlice::new(buf)])
    }

    /// Pad, write the tail record, fsync, and close.
    ///
    /// Returns `false` when the file was already closed.
    pub fn commit(&mut self) -> Result<bool> {
        if self.rec.state() == FileState::Closed {
            return Ok(false);
        }
        if self.rec.state() != FileState::Writable {
            return Err(StorageError::InvalidState("checkpoint file is not writable"));
        }

        // Everything written so far is payload.
        let end = self.rec.filesize()?;
        self.data_end = end;

        let tail = CheckpointTail {
            generation: self.rec.generation(),
            data_size: self.datasize(),
            format_version: FORMAT_VERSION,
            flags: 0,
            crc32: 0,
        };

        if !is_aligned(end) {
            self.rec.writev(&[IoSlice::new(padding_for(end))])?;
        }

        let mut tail_bytes = tail.to_disk();
        let tail_magic = self.rec.storage_magic().tail();

        if self.rec.crc_mode() {
            // The final crc covers the disk image of everything before the
            // crc field itself.
            let crc = crc32_update(self.rec.crc(), tail_magic.as_bytes());
            let crc = crc32_update(crc, &tail_bytes[..CheckpointTail::CRC_OFFSET]);
            tail_bytes[CheckpointTail::CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
            self.rec.set_crc(crc);
        }
        self.rec.set_crc_mode(false);

        self.rec.commit(Some(&tail_bytes))
    }

    /// Close without committing a tail (readable mode, or abandonment).
    pub fn close(&mut self) -> Result<bool> {
        self.rec.commit(None)
    }

    /// A reader over the payload range, positioned at the first byte.
    pub fn payload_reader(&mut self) -> Result<impl Read + '_> {
        if self.rec.state() != FileState::Readable {
            return Err(StorageError::InvalidState("checkpoint file is not readable"));
        }
        self.rec.seek_to(self.rec.data_begin())?;
        let len = self.datasize();
        Ok(self.rec.file_handle()?.take(len))
    }

    pub fn generation(&self) -> u64 {
        self.rec.generation()
    }

    /// Id of the first segment that logically follows this checkpoint.
    pub fn next_segment(&self) -> u64 {
        self.rec.nextseg_id()
    }

    pub fn user_magic(&self) -> Magic {
        self.rec.user_magic()
    }

    pub fn state(&self) -> FileState {
        self.rec.state()
    }

    pub fn data_begin(&self) -> u64 {
        self.rec.data_begin()
    }

    pub fn data_end(&self) -> u64 {
        self.data_end
    }

    /// Payload bytes, excluding padding.
    pub fn datasize(&self) -> u64 {
        self.data_end.saturating_sub(self.rec.data_begin())
    }

    /// Current file size.
    pub fn filesize(&self) -> Result<u64> {
        self.rec.filesize()
    }
}

impl Write for CheckpointFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_payload(buf)
            .map(|n| n as usize)
            .map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// CRC32 over the first `len` bytes of `file`.
///
/// Memory-maps the file when possible; otherwise streams it in
/// [`CRC_CHUNK`]-sized positioned reads. Both paths leave the file offset
/// untouched.
fn file_crc32(file: &File, len: u64) -> Result<u32> {
    if len > 0 {
        if let Ok(map) = unsafe { Mmap::map(file) } {
            if map.len() as u64 >= len {
                return Ok(crc32_update(0, &map[..len as usize]));
            }
        }
    }

    let mut crc = 0u32;
    let mut buf = vec![0u8; CRC_CHUNK];
    let mut pos = 0u64;
    while pos < len {
        let n = ((len - pos) as usize).min(CRC_CHUNK);
        file.read_exact_at(&mut buf[..n], pos)?;
        crc = crc32_update(crc, &buf[..n]);
        pos += n as u64;
    }
    Ok(crc)
}
