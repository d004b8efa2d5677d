//! The journal storage session.
//!
//! A journal is a set of files in one or two directories: a consistent
//! checkpoint (`NAME.pchkp`), at most one checkpoint being taken
//! (`NAME.pchkp.taking`), an optional symlink to the segments directory
//! (`NAME.segments`), and a chain of segment files (`NAME.<id>.pseg`).
//!
//! The session owns all open descriptors and walks the state machine
//! INITIAL → (CREATED | READABLE | READONLY) → WRITABLE → CLOSED. It is a
//! single-writer component: the caller serializes all writer-side calls and
//! never mixes concurrent writers with readers.
//!
//! Writer protocol: `make_writable`, then `append_record` at will;
//! periodically `create_checkpoint`, stream the consolidated state, and
//! commit. The commit closes the active segment, atomically replaces the
//! previous checkpoint (rename + directory fsync), and unlinks segments the
//! new checkpoint made obsolete. A crash anywhere leaves either the old or
//! the new checkpoint consistent; leftover segments are ignored by recovery
//! and collected on the next commit.
//!
//! Reader protocol: `open`, `replay_checkpoint`, then `replay_record` until
//! it reports the end of the chain. Corruption inside segment records ends
//! the chain cleanly and is never an error.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use jrnl_format::{names, Magic};

use crate::checkpoint::CheckpointFile;
use crate::error::{Result, StorageError};
use crate::recfile::{FileKind, RecordFile};
use crate::segment::{RecordOutcome, SegmentFile};

/// Storage lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageState {
    /// Construction has not completed.
    Initial,
    /// Freshly created; nothing committed yet.
    Created,
    /// Open with a valid checkpoint and a readable segment chain.
    Readable,
    /// Open with a valid checkpoint; writing is not possible (explicitly
    /// read-only, or the segments directory is unavailable).
    ReadOnly,
    /// Accepting appends and checkpoints.
    Writable,
    /// Closed; no further transitions.
    Closed,
}

/// How to open an existing journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Replay only; never becomes writable.
    ReadOnly,
    /// Replay, then optionally `make_writable`.
    ReadWrite,
}

/// Open/create options.
#[derive(Clone, Debug)]
pub struct StorageOptions {
    /// Never create or follow the segments-directory symlink; segments live
    /// alongside the checkpoint.
    pub no_segdir: bool,
    /// Overwrite a colliding segment file instead of preserving it under a
    /// `.bak` name.
    pub no_bakseg: bool,
    /// Buffer size for checkpoint payload streams.
    pub cpbuf_size: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            no_segdir: false,
            no_bakseg: false,
            cpbuf_size: 64 * 1024,
        }
    }
}

/// A journal storage session.
#[derive(Debug)]
pub struct Storage {
    name: String,
    cpdir: PathBuf,
    segdir: Option<PathBuf>,
    state: StorageState,
    user_magic: Magic,
    checkpoint: Option<CheckpointFile>,
    segment: Option<SegmentFile>,
    cpstream: Option<BufWriter<CheckpointFile>>,
    /// Readable segments, newest first; replay pops from the back.
    replay: Vec<SegmentFile>,
    /// Id of the oldest segment that may still exist on disk.
    last_id: u64,
    /// Generation of the end of the storage.
    lastgen: u64,
    nosegdir: bool,
    opts: StorageOptions,
}

impl Storage {
    /// Create a new journal in exclusive mode.
    ///
    /// `segdir_path` places the segment files in a separate directory,
    /// recorded as the `NAME.segments` symlink (relative when the segments
    /// directory lies under the journal directory). `None`, an empty path,
    /// or `"."` keep segments next to the checkpoint.
    ///
    /// Fails with [`StorageError::AlreadyExists`] when the journal is
    /// already there.
    pub fn create(
        journal_path: &Path,
        segdir_path: Option<&Path>,
        user_magic: Magic,
        opts: StorageOptions,
    ) -> Result<Self> {
        let (name, cpdir) = resolve_journal_path(journal_path)?;
        let nosegdir = opts.no_segdir
            || segdir_path.map_or(true, |p| p.as_os_str().is_empty() || p == Path::new("."));

        let mut storage = Self {
            name,
            cpdir,
            segdir: None,
            state: StorageState::Initial,
            user_magic,
            checkpoint: None,
            segment: None,
            cpstream: None,
            replay: Vec::new(),
            last_id: 0,
            lastgen: 0,
            nosegdir,
            opts,
        };
        storage.create_storage(segdir_path)?;
        Ok(storage)
    }

    /// Open an existing journal.
    ///
    /// Requires a valid consistent checkpoint; segments are optional. When
    /// the segments directory cannot be opened the storage is forced into
    /// [`StorageState::ReadOnly`].
    pub fn open(journal_path: &Path, mode: AccessMode, opts: StorageOptions) -> Result<Self> {
        let (name, cpdir) = resolve_journal_path(journal_path)?;
        let link = cpdir.join(names::segdir_filename(&name));
        let nosegdir = opts.no_segdir || fs::symlink_metadata(&link).is_err();

        let mut storage = Self {
            name,
            cpdir,
            segdir: None,
            state: StorageState::Initial,
            user_magic: Magic::ZERO,
            checkpoint: None,
            segment: None,
            cpstream: None,
            replay: Vec::new(),
            last_id: 0,
            lastgen: 0,
            nosegdir,
            opts,
        };
        storage.open_storage(mode == AccessMode::ReadOnly)?;
        Ok(storage)
    }

    /// The journal name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The journal (checkpoint) directory.
    pub fn dirname(&self) -> &Path {
        &self.cpdir
    }

    /// The resolved segments directory, when available.
    pub fn segment_dirname(&self) -> Option<&Path> {
        self.segdir.as_deref()
    }

    /// Generation of the current end of the storage.
    pub fn generation(&self) -> u64 {
        self.lastgen
    }

    pub fn state(&self) -> StorageState {
        self.state
    }

    pub fn user_magic(&self) -> Magic {
        self.user_magic
    }

    /// Find out the kind of an open file without moving its offset.
    pub fn file_kind(file: &File) -> FileKind {
        RecordFile::file_kind(file)
    }

    /// Transition into WRITABLE; only valid from CREATED or READABLE.
    ///
    /// From READABLE this creates the next writable segment and discards all
    /// readable segment handles; anything not yet replayed will not be
    /// replayed by this session.
    pub fn make_writable(&mut self) -> Result<()> {
        match self.state {
            StorageState::Created => {
                // The empty checkpoint file is already open for writing; the
                // first segment appears when the first checkpoint commits.
            }
            StorageState::Readable => {
                let new_id = self.last_id;
                let cp_next = match &self.checkpoint {
                    Some(cp) => cp.next_segment(),
                    None => return Err(StorageError::InvalidState("no checkpoint open")),
                };
                debug!(journal = %self.name, segment = new_id, "creating writable segment");
                self.new_segment_file(new_id)?;
                self.last_id = cp_next;
                self.replay.clear();
                if let Some(mut cp) = self.checkpoint.take() {
                    cp.close()?;
                }
            }
            _ => {
                return Err(StorageError::InvalidState(
                    "storage can become writable only from created or readable state",
                ))
            }
        }
        self.state = StorageState::Writable;
        Ok(())
    }

    /// Append one operation record to the active segment.
    ///
    /// Returns the number of bytes appended; the storage generation advances
    /// by the same amount. Durability requires a later checkpoint commit or
    /// segment close.
    pub fn append_record(&mut self, opcode: u32, opversion: u32, payload: &[u8]) -> Result<u64> {
        self.append_record_vectored(opcode, opversion, &[payload])
    }

    /// Vectored variant of [`Storage::append_record`].
    pub fn append_record_vectored(
        &mut self,
        opcode: u32,
        opversion: u32,
        payload: &[&[u8]],
    ) -> Result<u64> {
        if self.state != StorageState::Writable {
            return Err(StorageError::InvalidState("storage is not writable"));
        }
        let segment = self
            .segment
            .as_mut()
            .ok_or(StorageError::InvalidState("no active segment"))?;
        let written = segment.append(opcode, opversion, payload)?;
        self.lastgen += written;
        Ok(written)
    }

    /// Start taking a checkpoint; WRITABLE only, one at a time.
    ///
    /// Rotates the active segment (except for the very first checkpoint of a
    /// just-created journal) and returns a buffered stream for the
    /// consolidated payload. The caller finishes with
    /// [`CheckpointStream::commit`] or [`CheckpointStream::abort`].
    pub fn create_checkpoint(&mut self) -> Result<CheckpointStream<'_>> {
        if self.state != StorageState::Writable {
            return Err(StorageError::InvalidState("storage is not writable"));
        }
        if self.cpstream.is_some() {
            return Err(StorageError::InvalidState("a checkpoint is already being taken"));
        }

        if !self.is_first_checkpoint() {
            let next_id = match &self.segment {
                Some(s) => s.next_segment(),
                None => return Err(StorageError::InvalidState("no active segment")),
            };
            // Swap segments first, then open the new checkpoint referring to
            // the new active segment.
            self.new_segment_file(next_id)?;
            let active_id = match &self.segment {
                Some(s) => s.seg_id(),
                None => return Err(StorageError::InvalidState("no active segment")),
            };
            self.new_checkpoint_file(active_id)?;
        } else if self.checkpoint.is_none() {
            // The first checkpoint was aborted earlier; start over.
            self.new_checkpoint_file(0)?;
        }

        let mut cp = self
            .checkpoint
            .take()
            .ok_or(StorageError::InvalidState("no checkpoint file"))?;
        if let Err(e) = cp.init(self.user_magic) {
            self.checkpoint = Some(cp);
            return Err(e);
        }
        let generation = cp.generation();
        debug!(journal = %self.name, generation, "checkpoint stream open");
        self.cpstream = Some(BufWriter::with_capacity(self.opts.cpbuf_size, cp));
        Ok(CheckpointStream {
            storage: self,
            generation,
        })
    }

    /// Finish the checkpoint being taken.
    ///
    /// With `commit = true` the payload is flushed and committed, the
    /// in-progress file atomically replaces the previous checkpoint, the
    /// checkpoint directory is fsynced, and obsolete segments are unlinked.
    /// With `commit = false` the in-progress file is unlinked and the
    /// previous checkpoint stays authoritative. A failed commit rolls back
    /// like an abort.
    pub fn close_checkpoint(&mut self, commit: bool) -> Result<()> {
        let Some(stream) = self.cpstream.take() else {
            return Err(StorageError::InvalidState("no checkpoint is being taken"));
        };
        if !commit {
            debug!(journal = %self.name, "checkpoint aborted");
            // Dropping the stream closes the in-progress file; whatever it
            // flushes goes into a file that is unlinked right after.
            drop(stream);
            self.remove_uncommitted_checkpoint();
            return Ok(());
        }
        let result = self.commit_checkpoint(stream);
        if result.is_err() {
            self.remove_uncommitted_checkpoint();
        }
        result
    }

    /// Stream the checkpoint payload to the handler.
    ///
    /// The handler receives a bounded buffered reader over the payload range
    /// and the payload size.
    pub fn replay_checkpoint<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Read, u64) -> Result<()>,
    {
        if !matches!(self.state, StorageState::Readable | StorageState::ReadOnly) {
            return Err(StorageError::InvalidState("storage is not readable"));
        }
        let bufsz = self.opts.cpbuf_size;
        let cp = self
            .checkpoint
            .as_mut()
            .ok_or(StorageError::InvalidState("no checkpoint open"))?;
        let size = cp.datasize();
        let reader = cp.payload_reader()?;
        let mut reader = BufReader::with_capacity(bufsz.min(size.max(1) as usize), reader);
        handler(&mut reader, size)
    }

    /// Replay the next operation record.
    ///
    /// Returns `true` when a record was delivered. Returns `false` when the
    /// handler stopped the replay or the chain ended (clean end of the last
    /// segment, or the first record that failed validation).
    pub fn replay_record<F>(&mut self, mut handler: F) -> Result<bool>
    where
        F: FnMut(u32, u32, &[u8]) -> bool,
    {
        if !matches!(self.state, StorageState::Readable | StorageState::ReadOnly) {
            return Err(StorageError::InvalidState("storage is not readable"));
        }
        loop {
            let outcome = match self.replay.last_mut() {
                Some(segment) => segment.read_record(&mut handler)?,
                None => return Ok(false),
            };
            match outcome {
                RecordOutcome::Replayed(size) => {
                    if let Some(segment) = self.replay.last() {
                        self.last_id = segment.next_segment();
                    }
                    self.lastgen += size;
                    return Ok(true);
                }
                RecordOutcome::End => {
                    self.replay.pop();
                }
                RecordOutcome::Stopped => return Ok(false),
            }
        }
    }

    /// Close the storage; idempotent.
    ///
    /// A never-written CREATED journal is removed entirely. A WRITABLE
    /// storage commits (fsyncs) a non-empty active segment, deletes an empty
    /// one, and rolls back any checkpoint that was being taken; rolling back
    /// a first-ever checkpoint removes the journal.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            StorageState::Initial | StorageState::Closed => {}
            StorageState::Created => {
                warn!(journal = %self.name, "storage was never written to, removing its files");
                self.checkpoint = None;
                remove_quiet(&self.checkpoint_path(), "checkpoint file");
                self.remove_segdir_symlink();
                let _ = self.sync_cpdir();
            }
            StorageState::Readable | StorageState::ReadOnly => {
                self.replay.clear();
                if let Some(mut cp) = self.checkpoint.take() {
                    cp.close()?;
                }
            }
            StorageState::Writable => self.close_writable()?,
        }
        self.replay.clear();
        self.segment = None;
        self.checkpoint = None;
        self.cpstream = None;
        self.state = StorageState::Closed;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    fn create_storage(&mut self, segdir_path: Option<&Path>) -> Result<()> {
        debug!(
            journal = %self.name,
            dir = %self.cpdir.display(),
            segdir = ?segdir_path,
            "creating journal storage"
        );

        let symlinked = self.create_segdir_symlink(segdir_path)?;

        let staged: Result<()> = (|| {
            // The zero checkpoint is created exclusively; an existing one
            // means the journal is already there.
            self.new_checkpoint_file(0)?;
            let segdir = self.open_segdir()?;
            self.segdir = Some(segdir);
            Ok(())
        })();

        if let Err(error) = staged {
            warn!(journal = %self.name, %error, "cleaning up after failed journal creation");
            if self.checkpoint.take().is_some() {
                remove_quiet(&self.checkpoint_path(), "checkpoint file");
            }
            if symlinked {
                self.remove_segdir_symlink();
            }
            return Err(error);
        }

        self.lastgen = 0;
        self.state = StorageState::Created;
        Ok(())
    }

    /// Create the symlink to the segments directory, unless segments live in
    /// the journal directory. Returns whether a link was created.
    fn create_segdir_symlink(&self, segdir_path: Option<&Path>) -> Result<bool> {
        if self.nosegdir {
            return Ok(false);
        }
        let Some(segdir) = segdir_path else {
            return Ok(false);
        };

        let link = self.cpdir.join(names::segdir_filename(&self.name));
        let target_abs = if segdir.is_absolute() {
            segdir.to_path_buf()
        } else {
            self.cpdir.join(segdir)
        };
        // Link relatively when the segments directory lies under the journal
        // directory, absolutely otherwise.
        let target = match target_abs.strip_prefix(&self.cpdir) {
            Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("."),
            Ok(rel) => rel.to_path_buf(),
            Err(_) => target_abs,
        };

        debug!(link = %link.display(), target = %target.display(), "creating segments symlink");
        symlink(&target, &link).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                StorageError::AlreadyExists(self.cpdir.join(&self.name))
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(true)
    }

    /// Resolve and check the segments directory.
    fn open_segdir(&self) -> Result<PathBuf> {
        let dir = if self.nosegdir {
            self.cpdir.clone()
        } else {
            let link = self.cpdir.join(names::segdir_filename(&self.name));
            let target = fs::read_link(&link)?;
            if target.is_absolute() {
                target
            } else {
                self.cpdir.join(target)
            }
        };
        if !fs::metadata(&dir)?.is_dir() {
            return Err(StorageError::InvalidArgument(format!(
                "segments path {} is not a directory",
                dir.display()
            )));
        }
        Ok(dir)
    }

    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    fn open_storage(&mut self, rdonly: bool) -> Result<()> {
        debug!(journal = %self.name, dir = %self.cpdir.display(), rdonly, "opening journal storage");

        let file = File::open(self.checkpoint_path())?;
        let checkpoint = CheckpointFile::open(file)?;

        self.user_magic = checkpoint.user_magic();
        self.last_id = checkpoint.next_segment();
        self.lastgen = checkpoint.generation();
        self.checkpoint = Some(checkpoint);

        let segments_ok = self.open_segments();
        self.state = if !segments_ok || rdonly {
            StorageState::ReadOnly
        } else {
            StorageState::Readable
        };
        Ok(())
    }

    /// Open the ordered segment chain anchored by the checkpoint.
    ///
    /// Returns `false` when the segments directory cannot be opened, which
    /// forces the storage into read-only mode.
    fn open_segments(&mut self) -> bool {
        let segdir = match self.open_segdir() {
            Ok(dir) => dir,
            Err(error) => {
                warn!(journal = %self.name, %error, "cannot open segments directory, forcing read-only");
                return false;
            }
        };
        self.segdir = Some(segdir.clone());

        let (mut segid, chain_gen) = match &self.checkpoint {
            Some(cp) => (cp.next_segment(), cp.generation()),
            None => return false,
        };
        let mut first = true;

        loop {
            let path = segdir.join(names::segment_filename(&self.name, segid));
            let file = match File::open(&path) {
                Ok(f) => f,
                // The first missing id terminates the chain.
                Err(_) => break,
            };
            let segment = match SegmentFile::open(file) {
                Ok(s) => s,
                Err(error) => {
                    warn!(path = %path.display(), %error, "invalid or corrupt segment file");
                    break;
                }
            };
            if segment.user_magic() != self.user_magic {
                warn!(path = %path.display(), "segment does not belong to this journal");
                break;
            }
            if segment.seg_id() != segid {
                warn!(path = %path.display(), id = segment.seg_id(), "segment id does not match its filename");
                break;
            }
            if first && segment.generation() != chain_gen {
                warn!(path = %path.display(), "segment generation does not match the checkpoint");
                break;
            }
            first = false;
            segid = segment.next_segment();

            match segment.datasize() {
                Ok(0) => debug!(segment = segment.seg_id(), "skipping empty segment"),
                Ok(_) => self.replay.push(segment),
                Err(error) => {
                    warn!(path = %path.display(), %error, "cannot stat segment file");
                    break;
                }
            }
        }

        debug!(journal = %self.name, segments = self.replay.len(), "segments open for replay");
        // Oldest last, so replay pops from the back.
        self.replay.reverse();
        true
    }

    // -----------------------------------------------------------------------
    // Writer path
    // -----------------------------------------------------------------------

    fn is_first_checkpoint(&self) -> bool {
        self.segment.is_none()
    }

    /// Create a new segment file and make it the active one; the previously
    /// active segment is committed.
    fn new_segment_file(&mut self, id: u64) -> Result<()> {
        let segdir = self
            .segdir
            .clone()
            .ok_or(StorageError::InvalidState("segments directory is unavailable"))?;
        let wanted = names::segment_filename(&self.name, id);

        // Find a free filename: the canonical one, or <name>.<n> while the
        // canonical one is occupied.
        let mut filename = wanted.clone();
        let mut attempt = 0u32;
        let mut segment = loop {
            match SegmentFile::create(&segdir.join(&filename), id, self.lastgen) {
                Ok(s) => break s,
                Err(StorageError::AlreadyExists(_)) => {
                    attempt += 1;
                    filename = format!("{wanted}.{attempt}");
                }
                Err(e) => return Err(e),
            }
        };
        debug!(journal = %self.name, file = %filename, "created segment file");

        let staged: Result<()> = (|| {
            segment.init(self.user_magic)?;

            if filename != wanted {
                // The canonical name is occupied by a leftover segment:
                // optionally keep it under a backup name, then take its
                // place.
                let occupied = segdir.join(&wanted);
                if !self.opts.no_bakseg {
                    let mut n = 0u32;
                    loop {
                        let bak = if n == 0 {
                            format!("{wanted}.bak")
                        } else {
                            format!("{wanted}.{n}.bak")
                        };
                        match fs::hard_link(&occupied, segdir.join(&bak)) {
                            Ok(()) => {
                                debug!(backup = %bak, "kept displaced segment as backup");
                                break;
                            }
                            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                fs::rename(segdir.join(&filename), &occupied)?;
            }
            Ok(())
        })();

        if let Err(error) = staged {
            let _ = fs::remove_file(segdir.join(&filename));
            return Err(error);
        }

        if let Some(mut old) = self.segment.take() {
            old.commit()?;
        }
        self.segment = Some(segment);
        Ok(())
    }

    /// Create a new checkpoint file; the first checkpoint gets the canonical
    /// name, later ones the in-progress suffix.
    fn new_checkpoint_file(&mut self, nextseg_id: u64) -> Result<()> {
        debug_assert!(self.checkpoint.is_none());
        let path = if self.is_first_checkpoint() {
            self.checkpoint_path()
        } else {
            self.taking_path()
        };
        debug!(journal = %self.name, path = %path.display(), nextseg = nextseg_id, "creating checkpoint file");
        self.checkpoint = Some(CheckpointFile::create(&path, nextseg_id, self.lastgen)?);
        Ok(())
    }

    fn commit_checkpoint(&mut self, stream: BufWriter<CheckpointFile>) -> Result<()> {
        let mut cp = stream
            .into_inner()
            .map_err(|e| StorageError::Io(e.into_error()))?;
        cp.commit()?;

        if self.is_first_checkpoint() {
            debug!(journal = %self.name, "first checkpoint committed, creating the first segment");
            self.new_segment_file(0)?;
        } else {
            let canonical = self.checkpoint_path();
            let taking = self.taking_path();
            debug!(from = %taking.display(), to = %canonical.display(), "replacing checkpoint");
            fs::rename(&taking, &canonical)?;
        }
        // The rename (or the first segment) must be durable in the directory
        // before obsolete segments go away.
        self.sync_cpdir()?;

        let active_id = match &self.segment {
            Some(s) => s.seg_id(),
            None => return Err(StorageError::InvalidState("no active segment")),
        };
        self.remove_obsolete_segments(self.last_id, active_id);
        self.last_id = active_id;
        Ok(())
    }

    fn remove_uncommitted_checkpoint(&mut self) {
        let path = if self.is_first_checkpoint() {
            self.checkpoint_path()
        } else {
            self.taking_path()
        };
        remove_quiet(&path, "uncommitted checkpoint");
        if let Err(error) = self.sync_cpdir() {
            warn!(journal = %self.name, %error, "cannot fsync checkpoint directory");
        }
        self.checkpoint = None;
    }

    fn remove_obsolete_segments(&self, begin: u64, end: u64) {
        if begin < end {
            debug!(journal = %self.name, begin, end, "removing obsolete segments");
        }
        for id in begin..end {
            self.remove_segment_file(id);
        }
    }

    fn remove_segment_file(&self, id: u64) {
        if let Some(dir) = &self.segdir {
            remove_quiet(&dir.join(names::segment_filename(&self.name, id)), "segment file");
        }
    }

    fn remove_segdir_symlink(&self) {
        if !self.nosegdir {
            remove_quiet(
                &self.cpdir.join(names::segdir_filename(&self.name)),
                "segments symlink",
            );
        }
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    fn close_writable(&mut self) -> Result<()> {
        if self.cpstream.is_some() || self.checkpoint.is_some() {
            // An uncommitted checkpoint rolls back; a first-ever checkpoint
            // rolls the whole journal back to "not created".
            let first_ever = self.is_first_checkpoint();
            self.cpstream = None;
            self.checkpoint = None;
            self.remove_uncommitted_checkpoint();
            if first_ever {
                if let Some(segment) = self.segment.take() {
                    let id = segment.seg_id();
                    drop(segment);
                    self.remove_segment_file(id);
                }
                self.remove_segdir_symlink();
                let _ = self.sync_cpdir();
            }
            return Ok(());
        }

        if let Some(mut segment) = self.segment.take() {
            if segment.datasize()? == 0 {
                // Nothing was appended since the last rotation; the previous
                // consistent snapshot stays intact without it.
                let id = segment.seg_id();
                drop(segment);
                self.remove_segment_file(id);
            } else {
                segment.commit()?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    fn checkpoint_path(&self) -> PathBuf {
        self.cpdir.join(names::checkpoint_filename(&self.name))
    }

    fn taking_path(&self) -> PathBuf {
        self.cpdir.join(format!(
            "{}{}",
            names::checkpoint_filename(&self.name),
            names::EXT_TAKING
        ))
    }

    fn sync_cpdir(&self) -> Result<()> {
        File::open(&self.cpdir)?.sync_all()?;
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!(journal = %self.name, %error, "error while closing journal storage");
        }
    }
}

/// Buffered payload stream of a checkpoint being taken.
///
/// Obtained from [`Storage::create_checkpoint`]; finished with
/// [`CheckpointStream::commit`] or [`CheckpointStream::abort`]. Dropping the
/// stream leaves the checkpoint in progress; it is rolled back when the
/// storage closes.
pub struct CheckpointStream<'a> {
    storage: &'a mut Storage,
    generation: u64,
}

impl CheckpointStream<'_> {
    /// The generation this checkpoint was started at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Commit the checkpoint; see [`Storage::close_checkpoint`].
    pub fn commit(self) -> Result<()> {
        self.storage.close_checkpoint(true)
    }

    /// Abort the checkpoint; see [`Storage::close_checkpoint`].
    pub fn abort(self) -> Result<()> {
        self.storage.close_checkpoint(false)
    }
}

impl Write for CheckpointStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.storage.cpstream.as_mut() {
            Some(w) => w.write(buf),
            None => Err(io::Error::other("checkpoint stream is closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.storage.cpstream.as_mut() {
            Some(w) => w.flush(),
            None => Err(io::Error::other("checkpoint stream is closed")),
        }
    }
}

fn resolve_journal_path(path: &Path) -> Result<(String, PathBuf)> {
    let name = names::name_from_path(path)
        .ok_or_else(|| {
            StorageError::InvalidArgument(format!("invalid journal path or name {:?}", path))
        })?
        .to_string();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let cpdir = fs::canonicalize(parent)?;
    Ok((name, cpdir))
}

fn remove_quiet(path: &Path, what: &str) {
    debug!(path = %path.display(), "removing {what}");
    if let Err(error) = fs::remove_file(path) {
        warn!(path = %path.display(), %error, "cannot remove {what}");
    }
}
