//! Crash-consistent journal storage.
//!
//! A journal is a durable, append-only log of opaque operation records
//! anchored by periodically taken checkpoints, stored as a small set of
//! files on a conventional filesystem. After an arbitrary crash, replaying
//! the last consistent checkpoint and the surviving record chain
//! reconstructs the application state exactly.
//!
//! # Architecture
//!
//! - **RecordFile**: shared base of the two file types; state machine,
//!   vectored I/O, CRC32 accumulation
//! - **CheckpointFile** (`NAME.pchkp`): one consolidated snapshot, protected
//!   by a whole-file CRC32 in its tail record
//! - **SegmentFile** (`NAME.<id>.pseg`): operation records appended after a
//!   checkpoint, each carrying its own CRC32
//! - **Storage**: the session; open/create, `append_record`, checkpoint
//!   take/commit with atomic rename, and the replay drivers
//!
//! The engine treats operations as opaque byte strings tagged with an
//! `(opcode, opversion)` pair; checkpoint payloads are opaque byte streams.
//! Corruption found while replaying records is never an error: the chain
//! ends at the last valid record, exactly as a crash would have left it.

pub mod checkpoint;
pub mod error;
pub mod recfile;
pub mod segment;
pub mod storage;

pub use checkpoint::CheckpointFile;
pub use error::{CorruptKind, Result, StorageError};
pub use recfile::{FileKind, FileState, RecordFile};
pub use segment::{RecordOutcome, SegmentFile};
pub use storage::{AccessMode, CheckpointStream, Storage, StorageOptions, StorageState};

// The naming layer is part of the public surface: callers use it to
// recognize and build journal filenames without opening anything.
pub use jrnl_format::names::{build_filename, is_valid_name, parse_filename, FilenameKind};
pub use jrnl_format::Magic;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::Path;

    const USER: Magic = Magic([0x42; 8]);

    fn open_journal(path: &Path, mode: AccessMode) -> Storage {
        Storage::open(path, mode, StorageOptions::default()).unwrap()
    }

    /// Replay every record, returning (opcode, opversion, payload) triples.
    fn replay_all(storage: &mut Storage) -> Vec<(u32, u32, Vec<u8>)> {
        let mut records = Vec::new();
        while storage
            .replay_record(|opcode, opversion, data| {
                records.push((opcode, opversion, data.to_vec()));
                true
            })
            .unwrap()
        {}
        records
    }

    fn checkpoint_payload(storage: &mut Storage) -> Vec<u8> {
        let mut payload = Vec::new();
        storage
            .replay_checkpoint(|reader, size| {
                reader.read_to_end(&mut payload)?;
                assert_eq!(payload.len() as u64, size);
                Ok(())
            })
            .unwrap();
        payload
    }

    /// Scenario: create, write, checkpoint, replay. Records appended before
    /// the checkpoint are consolidated into it and never replayed again.
    #[test]
    fn create_write_checkpoint_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bar");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        storage.create_checkpoint().unwrap().commit().unwrap();

        storage.append_record(1, 0, b"a").unwrap();
        storage.append_record(1, 0, b"bb").unwrap();
        storage.append_record(2, 1, b"").unwrap();
        // 40 + 40 + 32 bytes of records.
        assert_eq!(storage.generation(), 112);

        let mut stream = storage.create_checkpoint().unwrap();
        assert_eq!(stream.generation(), 112);
        stream.write_all(b"S").unwrap();
        stream.commit().unwrap();
        storage.close().unwrap();

        let mut storage = open_journal(&path, AccessMode::ReadOnly);
        assert_eq!(storage.name(), "bar");
        assert_eq!(storage.user_magic(), USER);
        assert_eq!(storage.generation(), 112);
        assert_eq!(checkpoint_payload(&mut storage), b"S");
        assert!(replay_all(&mut storage).is_empty());
        assert_eq!(storage.generation(), 112);
    }

    /// Scenario: records appended after the checkpoint replay on reopen.
    #[test]
    fn write_after_checkpoint_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bar");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        storage.create_checkpoint().unwrap().commit().unwrap();
        let mut stream = storage.create_checkpoint().unwrap();
        stream.write_all(b"S").unwrap();
        stream.commit().unwrap();
        storage.close().unwrap();

        let mut storage = open_journal(&path, AccessMode::ReadWrite);
        storage.make_writable().unwrap();
        storage.append_record(3, 0, b"x").unwrap();
        storage.close().unwrap();

        let mut storage = open_journal(&path, AccessMode::ReadOnly);
        assert_eq!(checkpoint_payload(&mut storage), b"S");
        assert_eq!(replay_all(&mut storage), vec![(3, 0, b"x".to_vec())]);
    }

    /// Scenario: a torn tail truncates the chain after the last valid
    /// record; no error reaches the caller.
    #[test]
    fn torn_tail_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        storage.create_checkpoint().unwrap().commit().unwrap();
        storage.append_record(1, 0, b"first").unwrap();
        storage.append_record(2, 0, b"second").unwrap();
        storage.close().unwrap();

        let seg_path = dir.path().join("t.0.pseg");
        let len = std::fs::metadata(&seg_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&seg_path).unwrap();
        file.set_len(len - 1).unwrap();

        let mut storage = open_journal(&path, AccessMode::ReadOnly);
        assert_eq!(replay_all(&mut storage), vec![(1, 0, b"first".to_vec())]);
        // The generation stops right after the surviving record.
        assert_eq!(storage.generation(), 40);
    }

    /// Scenario: a bit flip in the checkpoint payload fails the open.
    #[test]
    fn checkpoint_crc_corruption_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        let mut stream = storage.create_checkpoint().unwrap();
        stream.write_all(b"XYZ").unwrap();
        stream.commit().unwrap();
        storage.close().unwrap();

        let cp_path = dir.path().join("c.pchkp");
        let mut file = OpenOptions::new().read(true).write(true).open(&cp_path).unwrap();
        file.seek(SeekFrom::Start(49)).unwrap(); // second payload byte
        let mut b = [0u8; 1];
        file.read_exact(&mut b).unwrap();
        b[0] ^= 0x10;
        file.seek(SeekFrom::Start(49)).unwrap();
        file.write_all(&b).unwrap();
        file.sync_all().unwrap();

        let err =
            Storage::open(&path, AccessMode::ReadOnly, StorageOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            StorageError::CheckpointCorrupt(CorruptKind::CrcMismatch)
        ));
    }

    /// Scenario: exclusive creation rejects a second creator.
    #[test]
    fn concurrent_create_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        storage.create_checkpoint().unwrap().commit().unwrap();

        // A second creator (stand-in for another process) collides.
        let err =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    /// Scenario: an aborted checkpoint leaves the previous one
    /// authoritative and no `.taking` file behind.
    #[test]
    fn aborted_checkpoint_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        let mut stream = storage.create_checkpoint().unwrap();
        stream.write_all(b"C0").unwrap();
        stream.commit().unwrap();
        storage.close().unwrap();

        let mut storage = open_journal(&path, AccessMode::ReadWrite);
        storage.make_writable().unwrap();
        let mut stream = storage.create_checkpoint().unwrap();
        let chunk = vec![0xa5u8; 64 * 1024];
        for _ in 0..16 {
            stream.write_all(&chunk).unwrap(); // 1 MiB in total
        }
        stream.abort().unwrap();
        storage.close().unwrap();

        assert!(!dir.path().join("r.pchkp.taking").exists());
        let mut storage = open_journal(&path, AccessMode::ReadOnly);
        assert_eq!(checkpoint_payload(&mut storage), b"C0");
    }

    /// A checkpoint commit garbage-collects the segments it made obsolete.
    #[test]
    fn checkpoint_commit_removes_obsolete_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gc");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        storage.create_checkpoint().unwrap().commit().unwrap();
        storage.append_record(1, 0, b"payload").unwrap();
        assert!(dir.path().join("gc.0.pseg").exists());

        let mut stream = storage.create_checkpoint().unwrap();
        stream.write_all(b"consolidated").unwrap();
        stream.commit().unwrap();

        assert!(!dir.path().join("gc.0.pseg").exists());
        assert!(dir.path().join("gc.1.pseg").exists());
        storage.close().unwrap();
    }

    /// Replaying the same read-only journal from two sessions delivers the
    /// identical sequence with the identical termination.
    #[test]
    fn replay_is_idempotent_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idem");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        storage.create_checkpoint().unwrap().commit().unwrap();
        for i in 0..10u32 {
            storage
                .append_record(i, 0, format!("record-{i}").as_bytes())
                .unwrap();
        }
        storage.close().unwrap();

        let mut first = open_journal(&path, AccessMode::ReadOnly);
        let mut second = open_journal(&path, AccessMode::ReadOnly);
        let a = replay_all(&mut first);
        let b = replay_all(&mut second);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert_eq!(first.generation(), second.generation());
    }

    /// The maximum payload size is accepted and round-trips; one byte more
    /// is rejected.
    #[test]
    fn max_payload_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        storage.create_checkpoint().unwrap().commit().unwrap();

        let max = vec![0x5au8; jrnl_format::MAX_OPSIZE as usize];
        storage.append_record(1, 0, &max).unwrap();

        let over = vec![0u8; jrnl_format::MAX_OPSIZE as usize + 1];
        let err = storage.append_record(1, 0, &over).unwrap_err();
        assert!(matches!(
            err,
            StorageError::OperationCorrupt(CorruptKind::SizeMismatch)
        ));
        storage.close().unwrap();

        let mut storage = open_journal(&path, AccessMode::ReadOnly);
        let records = replay_all(&mut storage);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].2.len(), jrnl_format::MAX_OPSIZE as usize);
    }

    /// A segment whose generation does not match the checkpoint is not
    /// chained.
    #[test]
    fn mismatched_generation_segment_is_not_chained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        storage.create_checkpoint().unwrap().commit().unwrap();
        storage.append_record(1, 0, b"kept").unwrap();
        storage.close().unwrap();

        // Replace segment 0 with one written at a bogus generation.
        let seg_path = dir.path().join("m.0.pseg");
        std::fs::remove_file(&seg_path).unwrap();
        let mut seg = SegmentFile::create(&seg_path, 0, 4096).unwrap();
        seg.init(USER).unwrap();
        seg.append(9, 9, &[b"bogus"]).unwrap();
        seg.commit().unwrap();

        let mut storage = open_journal(&path, AccessMode::ReadOnly);
        assert!(replay_all(&mut storage).is_empty());
    }

    /// A segment carrying a foreign user magic is not chained.
    #[test]
    fn foreign_user_magic_segment_is_not_chained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        storage.create_checkpoint().unwrap().commit().unwrap();
        storage.append_record(1, 0, b"kept").unwrap();
        storage.close().unwrap();

        let seg_path = dir.path().join("f.0.pseg");
        std::fs::remove_file(&seg_path).unwrap();
        let mut seg = SegmentFile::create(&seg_path, 0, 0).unwrap();
        seg.init(Magic(*b"FOREIGN!")).unwrap();
        seg.append(9, 9, &[b"bogus"]).unwrap();
        seg.commit().unwrap();

        let mut storage = open_journal(&path, AccessMode::ReadOnly);
        assert!(replay_all(&mut storage).is_empty());
    }

    /// A handler returning false stops the replay without consuming the
    /// remaining records of the session's queue position.
    #[test]
    fn handler_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stop");

        let mut storage =
            Storage::create(&path, None, USER, StorageOptions::default()).unwrap();
        storage.make_writable().unwrap();
        storage.create_checkpoint().unwrap().commit().unwrap();
        storage.append_record(1, 0, b"one").unwrap();
        storage.append_record(2, 0, b"two").unwrap();
        storage.close().unwrap();

        let mut storage = open_journal(&path, AccessMode::ReadOnly);
        let delivered = storage.replay_record(|_, _, _| false).unwrap();
        assert!(!delivered);
    }
}
