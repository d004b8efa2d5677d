//! The record file: shared base of checkpoint and segment files.
//!
//! A record file owns its file handle, tracks its lifecycle state, and
//! maintains a CRC32 accumulator plus an operation counter. Checkpoint and
//! segment files differ only in which storage magic they carry, whether the
//! CRC accumulator is enabled (whole-file CRC for checkpoints, per-record
//! CRC for segments), and whether closing writes a tail record.
//!
//! State transitions:
//! - created for writing: CREATED → WRITABLE → CLOSED
//! - opened for reading: READABLE → CLOSED
//!
//! The transient TRANSIT state is held while the header or tail is being
//! written, so an abort mid-write is distinguishable.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, IoSliceMut, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::debug;

use jrnl_format::{
    crc32_update, is_aligned, negotiated_header_size, FileHeader, Magic,
    STORAGE_CHECKPOINT_MAGIC, STORAGE_SEGMENT_MAGIC,
};

use crate::error::{Result, StorageError};

/// Kinds of journal files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Unknown,
    Segment,
    Checkpoint,
}

/// States of a record file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileState {
    /// A header or tail write is in flight.
    Transit,
    /// The file is closed; no further I/O is possible.
    Closed,
    /// The file is open for reading and passed sanity checks.
    Readable,
    /// The file was just created and has no headers yet.
    Created,
    /// The file is initialized and accepts appends.
    Writable,
}

/// Result of probing a file's magic and header.
pub(crate) struct ProbeInfo {
    pub kind: FileKind,
    pub user_magic: Magic,
    pub header: FileHeader,
    pub header_size: u64,
}

/// Shared base of [`crate::CheckpointFile`] and [`crate::SegmentFile`].
#[derive(Debug)]
pub struct RecordFile {
    file: Option<File>,
    kind: FileKind,
    state: FileState,
    crc_mode: bool,
    crc: u32,
    opcount: u64,
    generation: u64,
    uid: u64,
    nextseg_id: u64,
    user_magic: Magic,
    data_begin: u64,
}

impl RecordFile {
    /// Create an empty writable record file in exclusive mode.
    ///
    /// Fails with [`StorageError::AlreadyExists`] when the path is occupied,
    /// which signals a concurrent or leftover journal instance.
    pub fn create(path: &Path, kind: FileKind, nextseg_id: u64, generation: u64) -> Result<Self> {
        debug_assert!(kind != FileKind::Unknown);
        debug_assert!(is_aligned(generation));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    StorageError::AlreadyExists(path.to_path_buf())
                } else {
                    StorageError::Io(e)
                }
            })?;

        debug!(path = %path.display(), ?kind, generation, nextseg_id, "created record file");

        Ok(Self {
            file: Some(file),
            kind,
            state: FileState::Created,
            crc_mode: false,
            crc: 0,
            opcount: 0,
            generation,
            uid: rand::random(),
            nextseg_id,
            user_magic: Magic::ZERO,
            data_begin: 0,
        })
    }

    /// Open a record file for reading from an already-open handle.
    ///
    /// Reads and validates the storage magic and file header, fills in the
    /// generation, next-segment id, uid and user magic, and positions the
    /// file at the start of the data area.
    pub fn open_readable(mut file: File, expected: FileKind) -> Result<Self> {
        let probe = Self::probe(&file).ok_or(StorageError::NotAJournal)?;
        if probe.kind != expected {
            return Err(match expected {
                FileKind::Checkpoint => StorageError::NotACheckpoint,
                _ => StorageError::NotASegment,
            });
        }

        let data_begin = (2 * Magic::SIZE) as u64 + probe.header_size;
        file.seek(SeekFrom::Start(data_begin))?;

        debug!(
            kind = ?probe.kind,
            generation = probe.header.generation,
            nextseg = probe.header.nextseg_id,
            uid = probe.header.uid,
            "opened record file for reading"
        );

        Ok(Self {
            file: Some(file),
            kind: probe.kind,
            state: FileState::Readable,
            crc_mode: false,
            crc: 0,
            opcount: 0,
            generation: probe.header.generation,
            uid: probe.header.uid,
            nextseg_id: probe.header.nextseg_id,
            user_magic: probe.user_magic,
            data_begin,
        })
    }

    /// Find out the kind of an open file by reading its magic and header.
    ///
    /// Uses positioned reads, so the file offset is left untouched. Returns
    /// [`FileKind::Unknown`] for anything that is not a well-formed
    /// checkpoint or segment prefix.
    pub fn file_kind(file: &File) -> FileKind {
        Self::probe(file).map_or(FileKind::Unknown, |p| p.kind)
    }

    pub(crate) fn probe(file: &File) -> Option<ProbeInfo> {
        let mut magics = [0u8; 2 * Magic::SIZE];
        let mut head = [0u8; FileHeader::SIZE];
        file.read_exact_at(&mut magics, 0).ok()?;
        file.read_exact_at(&mut head, magics.len() as u64).ok()?;

        let kind = if magics[..Magic::SIZE] == *STORAGE_SEGMENT_MAGIC.as_bytes() {
            FileKind::Segment
        } else if magics[..Magic::SIZE] == *STORAGE_CHECKPOINT_MAGIC.as_bytes() {
            FileKind::Checkpoint
        } else {
            return None;
        };

        let header = FileHeader::from_disk(&head);
        let header_size = negotiated_header_size(header.structure_size, FileHeader::SIZE)?;

        // Extension bytes must actually be present in the file.
        let ext = header_size - FileHeader::SIZE;
        if ext > 0 {
            let mut ext_buf = vec![0u8; ext];
            file.read_exact_at(&mut ext_buf, (magics.len() + FileHeader::SIZE) as u64)
                .ok()?;
        }

        let mut user = [0u8; Magic::SIZE];
        user.copy_from_slice(&magics[Magic::SIZE..]);

        Some(ProbeInfo {
            kind,
            user_magic: Magic::new(user),
            header,
            header_size: header_size as u64,
        })
    }

    /// Write the initial record: storage magic, user magic, and file header
    /// in a single vectored write. CREATED → WRITABLE.
    pub fn init(&mut self, user_magic: Magic) -> Result<()> {
        if self.state != FileState::Created {
            return Err(StorageError::InvalidState("record file is not freshly created"));
        }

        let header = FileHeader::new(self.generation, self.nextseg_id, self.uid);
        let header_bytes = header.to_disk();
        let storage_magic = *self.storage_magic().as_bytes();
        let user = *user_magic.as_bytes();

        self.state = FileState::Transit;
        let written = self.writev(&[
            IoSlice::new(&storage_magic),
            IoSlice::new(&user),
            IoSlice::new(&header_bytes),
        ])?;

        self.data_begin = written;
        self.user_magic = user_magic;
        self.opcount = 0;
        self.state = FileState::Writable;
        Ok(())
    }

    /// Vectored append of the full requested length.
    ///
    /// A short write is treated as an I/O failure. Extends the CRC
    /// accumulator over the written bytes when CRC mode is on, and bumps the
    /// operation counter.
    pub fn writev(&mut self, bufs: &[IoSlice<'_>]) -> Result<u64> {
        if !matches!(self.state, FileState::Writable | FileState::Transit) {
            return Err(StorageError::InvalidState("record file is not writable"));
        }

        let total: u64 = bufs.iter().map(|b| b.len() as u64).sum();
        self.write_all_bufs(bufs)?;

        if self.crc_mode {
            for buf in bufs {
                self.crc = crc32_update(self.crc, buf);
            }
        }
        self.opcount += 1;
        Ok(total)
    }

    fn write_all_bufs(&mut self, bufs: &[IoSlice<'_>]) -> Result<()> {
        let total: u64 = bufs.iter().map(|b| b.len() as u64).sum();
        let mut file = self.file()?;

        let written = file.write_vectored(bufs)? as u64;
        if written == total {
            return Ok(());
        }

        // Short vectored write: finish buffer by buffer.
        let mut skip = written;
        for buf in bufs {
            let len = buf.len() as u64;
            if skip >= len {
                skip -= len;
                continue;
            }
            file.write_all(&buf[skip as usize..])?;
            skip = 0;
        }
        Ok(())
    }

    /// Fill the buffers in order from the current position.
    ///
    /// Returns the number of bytes read; fewer than requested means the end
    /// of the file was reached.
    pub fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> Result<u64> {
        let mut file = self.file()?;
        let mut total = 0u64;
        'bufs: for buf in bufs.iter_mut() {
            let mut filled = 0;
            while filled < buf.len() {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => {
                        total += filled as u64;
                        break 'bufs;
                    }
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if filled == buf.len() {
                total += filled as u64;
            }
        }
        Ok(total)
    }

    /// Close the file, optionally committing a tail record first.
    ///
    /// With `None`, fsyncs (when writable) and closes; with a tail record,
    /// writes the tail magic and the record in one vectored write, fsyncs,
    /// and closes. Returns `false` when the file was already closed.
    pub fn commit(&mut self, tail: Option<&[u8]>) -> Result<bool> {
        match tail {
            None => {
                if self.state == FileState::Closed {
                    return Ok(false);
                }
                debug!(kind = ?self.kind, state = ?self.state, "closing record file");
                if self.state == FileState::Writable {
                    self.file()?.sync_all()?;
                }
                self.file = None;
                self.state = FileState::Closed;
                Ok(true)
            }
            Some(record) => {
                if self.state != FileState::Writable {
                    return Err(StorageError::InvalidState("record file is not writable"));
                }
                debug_assert!(is_aligned(record.len() as u64));

                let tail_magic = *self.storage_magic().tail().as_bytes();
                self.state = FileState::Transit;
                self.writev(&[IoSlice::new(&tail_magic), IoSlice::new(record)])?;
                self.file()?.sync_all()?;
                self.file = None;
                self.state = FileState::Closed;
                debug!(kind = ?self.kind, "committed and closed record file");
                Ok(true)
            }
        }
    }

    /// Seek to an absolute position.
    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        let mut file = self.file()?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Current file size.
    pub fn filesize(&self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    /// Bytes between the data area start and the end of the file.
    pub fn datasize(&self) -> Result<u64> {
        Ok(self.filesize()?.saturating_sub(self.data_begin))
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or(StorageError::InvalidState("record file is closed"))
    }

    pub(crate) fn file_handle(&self) -> Result<&File> {
        self.file()
    }

    /// The storage magic this file carries.
    pub fn storage_magic(&self) -> Magic {
        match self.kind {
            FileKind::Checkpoint => STORAGE_CHECKPOINT_MAGIC,
            _ => STORAGE_SEGMENT_MAGIC,
        }
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Id of the segment that logically follows this file.
    pub fn nextseg_id(&self) -> u64 {
        self.nextseg_id
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn user_magic(&self) -> Magic {
        self.user_magic
    }

    /// Offset of the first data byte (right after the file header).
    pub fn data_begin(&self) -> u64 {
        self.data_begin
    }

    /// Number of vectored writes performed on this file.
    pub fn opcount(&self) -> u64 {
        self.opcount
    }

    /// Whether the CRC accumulator is extended on every write.
    pub fn crc_mode(&self) -> bool {
        self.crc_mode
    }

    /// Enable or disable CRC accumulation; returns the previous mode.
    pub fn set_crc_mode(&mut self, mode: bool) -> bool {
        std::mem::replace(&mut self.crc_mode, mode)
    }

    /// CRC32 accumulated so far.
    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Replace the CRC accumulator; returns the previous value.
    pub fn set_crc(&mut self, crc: u32) -> u32 {
        std::mem::replace(&mut self.crc, crc)
    }
}
