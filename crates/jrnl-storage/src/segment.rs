//! Segment files: the append-only operation log.
//!
//! A segment holds the operation records written after a checkpoint. It has
//! no tail record and no whole-file CRC; each operation record carries its
//! own CRC32. The readable end of a segment is wherever the first record
//! fails validation, which is the ordinary shape of a file torn by a crash.
//!
//! Record layout (everything little-endian, payload zero-padded to 8 bytes):
//!
//! ```text
//! [operation magic (8)]
//! [OperationHeader (16 + extensions)]
//! [payload (data_size, then pad to 8)]
//! [OperationTail (8): data_size echo, crc32]
//! ```
//!
//! The crc covers the header (extensions included), the padded payload, and
//! the data_size echo; a torn or bit-flipped record is caught either by the
//! magic or by the crc.

use std::fs::File;
use std::io::{IoSlice, IoSliceMut};
use std::path::Path;

use tracing::{debug, warn};

use jrnl_format::{
    aligned_size, crc32_update, padding_for, Magic, OperationHeader, OperationTail,
    negotiated_header_size, MAX_OPSIZE, STORAGE_OPERATION_MAGIC,
};

use crate::error::{CorruptKind, Result, StorageError};
use crate::recfile::{FileKind, FileState, RecordFile};

/// Outcome of one [`SegmentFile::read_record`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A record was validated and delivered; carries its total on-disk size.
    Replayed(u64),
    /// The readable end of the segment was reached (clean EOF or a record
    /// that failed validation).
    End,
    /// The handler asked to stop; the record was delivered.
    Stopped,
}

/// An append-only segment file of operation records.
#[derive(Debug)]
pub struct SegmentFile {
    rec: RecordFile,
}

impl SegmentFile {
    /// Create an empty writable segment in exclusive mode.
    pub fn create(path: &Path, seg_id: u64, generation: u64) -> Result<Self> {
        Ok(Self {
            rec: RecordFile::create(path, FileKind::Segment, seg_id + 1, generation)?,
        })
    }

    /// Open a segment for reading from an already-open handle.
    pub fn open(file: File) -> Result<Self> {
        let rec = RecordFile::open_readable(file, FileKind::Segment)?;
        if rec.nextseg_id() == 0 {
            // A segment's nextseg id is its own id + 1, so 0 is impossible.
            return Err(StorageError::SegmentCorrupt(CorruptKind::BadHeader));
        }
        Ok(Self { rec })
    }

    /// Write the segment header. CREATED → WRITABLE.
    pub fn init(&mut self, user_magic: Magic) -> Result<()> {
        self.rec.init(user_magic)
    }

    /// Fsync and close the segment. A closed segment has no tail marker;
    /// reopening always re-scans for truncation.
    pub fn commit(&mut self) -> Result<bool> {
        self.rec.commit(None)
    }

    /// This segment's id.
    pub fn seg_id(&self) -> u64 {
        self.rec.nextseg_id() - 1
    }

    /// Id of the segment that follows this one in the chain.
    pub fn next_segment(&self) -> u64 {
        self.rec.nextseg_id()
    }

    pub fn generation(&self) -> u64 {
        self.rec.generation()
    }

    pub fn user_magic(&self) -> Magic {
        self.rec.user_magic()
    }

    pub fn state(&self) -> FileState {
        self.rec.state()
    }

    pub fn opcount(&self) -> u64 {
        self.rec.opcount()
    }

    /// Bytes of record data currently in the segment.
    pub fn datasize(&self) -> Result<u64> {
        self.rec.datasize()
    }

    /// Append one operation record in a single vectored write.
    ///
    /// No fsync is performed per record; durability comes from the caller's
    /// flush policy or from the segment commit. Returns the total number of
    /// bytes appended.
    pub fn append(&mut self, opcode: u32, opversion: u32, payload: &[&[u8]]) -> Result<u64> {
        let data_size: u64 = payload.iter().map(|b| b.len() as u64).sum();
        if data_size > MAX_OPSIZE as u64 {
            return Err(StorageError::OperationCorrupt(CorruptKind::SizeMismatch));
        }

        let header = OperationHeader::new(opcode, opversion, data_size as u32);
        let header_bytes = header.to_disk();
        let pad = padding_for(data_size);

        let mut crc = crc32_update(0, &header_bytes);
        for buf in payload {
            crc = crc32_update(crc, buf);
        }
        crc = crc32_update(crc, pad);

        let mut tail_bytes = OperationTail {
            data_size: data_size as u32,
            crc32: 0,
        }
        .to_disk();
        crc = crc32_update(crc, &tail_bytes[..OperationTail::CRC_OFFSET]);
        tail_bytes[OperationTail::CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());

        let magic = STORAGE_OPERATION_MAGIC;
        let mut iov = Vec::with_capacity(payload.len() + 4);
        iov.push(IoSlice::new(magic.as_bytes()));
        iov.push(IoSlice::new(&header_bytes));
        for buf in payload {
            iov.push(IoSlice::new(buf));
        }
        if !pad.is_empty() {
            iov.push(IoSlice::new(pad));
        }
        iov.push(IoSlice::new(&tail_bytes));

        self.rec.writev(&iov)
    }

    /// Parse and validate the next operation record, delivering it to the
    /// handler.
    ///
    /// Any of: short read, magic mismatch, oversized or inconsistent header,
    /// truncated body, or crc mismatch means the readable end of the segment
    /// was reached; none of these are errors. Only genuine I/O failures
    /// propagate.
    pub fn read_record(
        &mut self,
        handler: &mut dyn FnMut(u32, u32, &[u8]) -> bool,
    ) -> Result<RecordOutcome> {
        let mut magic = [0u8; Magic::SIZE];
        let mut head = [0u8; OperationHeader::SIZE];

        let head_want = (Magic::SIZE + OperationHeader::SIZE) as u64;
        let head_got = self
            .rec
            .readv(&mut [IoSliceMut::new(&mut magic), IoSliceMut::new(&mut head)])?;

        if head_got == 0 {
            debug!(segment = self.seg_id(), "end of segment");
            return Ok(RecordOutcome::End);
        }
        if head_got < head_want || magic != *STORAGE_OPERATION_MAGIC.as_bytes() {
            // Premature end of file or invalid record framing: the segment
            // was not properly closed.
            warn!(segment = self.seg_id(), "segment tail is truncated or corrupt");
            return Ok(RecordOutcome::End);
        }

        let mut crc = crc32_update(0, &head);
        let header = OperationHeader::from_disk(&head);

        let Some(header_size) = negotiated_header_size(header.structure_size, OperationHeader::SIZE)
        else {
            warn!(segment = self.seg_id(), declared = header.structure_size, "bad operation header size");
            return Ok(RecordOutcome::End);
        };
        if header.data_size > MAX_OPSIZE {
            warn!(segment = self.seg_id(), data_size = header.data_size, "operation data size out of range");
            return Ok(RecordOutcome::End);
        }

        let ext_size = header_size - OperationHeader::SIZE;
        let padded_size = aligned_size(header.data_size as u64) as usize;
        let mut ext = vec![0u8; ext_size];
        let mut data = vec![0u8; padded_size];
        let mut tail_buf = [0u8; OperationTail::SIZE];

        let body_want = (ext_size + padded_size + OperationTail::SIZE) as u64;
        let body_got = self.rec.readv(&mut [
            IoSliceMut::new(&mut ext),
            IoSliceMut::new(&mut data),
            IoSliceMut::new(&mut tail_buf),
        ])?;
        if body_got < body_want {
            warn!(segment = self.seg_id(), "operation record is truncated");
            return Ok(RecordOutcome::End);
        }

        crc = crc32_update(crc, &ext);
        crc = crc32_update(crc, &data);
        crc = crc32_update(crc, &tail_buf[..OperationTail::CRC_OFFSET]);

        let tail = OperationTail::from_disk(&tail_buf);
        if tail.data_size != header.data_size || tail.crc32 != crc {
            warn!(segment = self.seg_id(), "operation crc32 or data size mismatch");
            return Ok(RecordOutcome::End);
        }

        if !handler(header.opcode, header.opversion, &data[..header.data_size as usize]) {
            return Ok(RecordOutcome::Stopped);
        }
        Ok(RecordOutcome::Replayed(head_want + body_want))
    }
}
