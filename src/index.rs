//! Mail index: dense sequence-ordered record array
//!
//! The index is the in-memory view the save and expunge paths operate on: a
//! dense array of fixed-size records ordered by UID, where a record's
//! one-based position is its sequence number. A small binary backing file
//! (8-byte header + 8-byte little-endian records) persists it between
//! processes; `used_file_size` in the header tracks exactly how many bytes
//! of the file are live so expunge can truncate the tail.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::error;

use crate::errors::{StoreError, StoreResult};
use crate::flags::MailFlags;

/// Bytes of the on-disk header (`messages_count`, `used_file_size`)
const HEADER_SIZE: u32 = 8;
/// Bytes of one on-disk record (`uid`, `flags`)
const RECORD_SIZE: u32 = 8;

/// One index record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub uid: u32,
    pub flags: MailFlags,
}

/// Flag-change notification emitted on expunge
///
/// Expunging a record is announced as a transition of its flags to the
/// empty set, so flag observers see the message disappear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagChange {
    pub uid: u32,
    pub old_flags: MailFlags,
    pub new_flags: MailFlags,
}

/// The mailbox index
#[derive(Debug)]
pub struct MailIndex {
    path: PathBuf,
    records: Vec<IndexRecord>,
}

impl MailIndex {
    /// Open the index, loading the backing file if it exists
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let records = if path.exists() {
            load_records(&path)?
        } else {
            Vec::new()
        };
        Ok(Self { path, records })
    }

    /// Re-read the backing file, pulling in external changes
    ///
    /// Called under the uidlist lock at the start of commit so concurrent
    /// appenders that committed earlier are visible before UIDs are
    /// assigned.
    pub fn sync(&mut self) -> StoreResult<()> {
        if self.path.exists() {
            self.records = load_records(&self.path)?;
        }
        Ok(())
    }

    pub fn messages_count(&self) -> u32 {
        self.records.len() as u32
    }

    /// Look up a record by one-based sequence number
    pub fn lookup(&self, seq: u32) -> Option<&IndexRecord> {
        if seq == 0 {
            return None;
        }
        self.records.get(seq as usize - 1)
    }

    /// Record following `seq`, if any
    pub fn next(&self, seq: u32) -> Option<&IndexRecord> {
        self.lookup(seq.checked_add(1)?)
    }

    /// Binary search for the smallest-sequence record with UID in range
    ///
    /// Returns the record and its sequence number, or `None` when no record
    /// has a UID within `[first_uid, last_uid]`.
    pub fn lookup_uid_range(&self, first_uid: u32, last_uid: u32) -> Option<(&IndexRecord, u32)> {
        let idx = self.records.partition_point(|rec| rec.uid < first_uid);
        let rec = self.records.get(idx)?;
        if rec.uid > last_uid {
            return None;
        }
        Some((rec, idx as u32 + 1))
    }

    /// Remove the inclusive sequence range, compacting the tail down
    ///
    /// Emits one `old_flags → 0` notification per expunged record, shifts
    /// surviving records left by the removed count, and truncates the
    /// backing file to the new `used_file_size`.
    ///
    /// # Errors
    ///
    /// `Critical` if the range is not a valid sequence range or the backing
    /// file cannot be rewritten.
    pub fn expunge_range(&mut self, first_seq: u32, last_seq: u32) -> StoreResult<Vec<FlagChange>> {
        if first_seq == 0 || first_seq > last_seq || last_seq > self.messages_count() {
            error!(first_seq, last_seq, count = self.messages_count(), "invalid expunge range");
            return Err(StoreError::Critical);
        }
        let range = (first_seq as usize - 1)..(last_seq as usize);
        let changes: Vec<FlagChange> = self.records[range.clone()]
            .iter()
            .map(|rec| FlagChange {
                uid: rec.uid,
                old_flags: rec.flags,
                new_flags: MailFlags::empty(),
            })
            .collect();
        self.records.drain(range);
        self.persist()?;
        Ok(changes)
    }

    /// Bytes of the backing file currently in use
    fn used_file_size(&self) -> u32 {
        HEADER_SIZE + RECORD_SIZE * self.records.len() as u32
    }

    /// Rewrite header and records in place, truncating the tail
    fn persist(&self) -> StoreResult<()> {
        self.write_file()
            .map_err(|e| StoreError::from_io("write", &self.path, &e))
    }

    fn write_file(&self) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(self.used_file_size() as usize);
        buf.extend_from_slice(&self.messages_count().to_le_bytes());
        buf.extend_from_slice(&self.used_file_size().to_le_bytes());
        for rec in &self.records {
            buf.extend_from_slice(&rec.uid.to_le_bytes());
            buf.extend_from_slice(&rec.flags.bits().to_le_bytes());
        }
        file.write_all(&buf)?;
        file.set_len(u64::from(self.used_file_size()))?;
        file.sync_all()
    }
}

fn load_records(path: &Path) -> StoreResult<Vec<IndexRecord>> {
    read_records(path).map_err(|e| StoreError::from_io("read", path, &e))
}

fn read_records(path: &Path) -> io::Result<Vec<IndexRecord>> {
    let mut raw = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut raw)?;
    if raw.len() < HEADER_SIZE as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "index header truncated"));
    }
    let count = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let needed = HEADER_SIZE as usize + count * RECORD_SIZE as usize;
    if raw.len() < needed {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "index records truncated"));
    }
    let mut records = Vec::with_capacity(count);
    for i in 0..count {
        let off = HEADER_SIZE as usize + i * RECORD_SIZE as usize;
        let uid = u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
        let bits = u32::from_le_bytes([raw[off + 4], raw[off + 5], raw[off + 6], raw[off + 7]]);
        records.push(IndexRecord {
            uid,
            flags: MailFlags::from_bits_truncate(bits),
        });
    }
    Ok(records)
}

/// One queued append awaiting commit
#[derive(Debug, Clone, Copy)]
struct PendingAppend {
    flags: MailFlags,
    uid: u32,
}

/// Append transaction over a [`MailIndex`]
///
/// Saves queue placeholder records here as they are staged; commit assigns
/// the contiguous UID range and folds the records into the array.
#[derive(Debug)]
pub struct IndexTransaction {
    index: MailIndex,
    pending: Vec<PendingAppend>,
}

impl IndexTransaction {
    pub fn new(index: MailIndex) -> Self {
        Self {
            index,
            pending: Vec::new(),
        }
    }

    pub fn index(&self) -> &MailIndex {
        &self.index
    }

    /// Queue a placeholder record, returning its in-memory sequence number
    pub fn append_placeholder(&mut self, flags: MailFlags) -> u32 {
        self.pending.push(PendingAppend { flags, uid: 0 });
        self.index.messages_count() + self.pending.len() as u32
    }

    pub fn pending_count(&self) -> u32 {
        self.pending.len() as u32
    }

    /// Re-read the backing index under the commit lock
    pub fn sync(&mut self) -> StoreResult<()> {
        self.index.sync()
    }

    /// Assign the contiguous UID range `[first_uid, ..]` to the placeholders
    ///
    /// UIDs are handed out in placeholder insertion order. Returns the last
    /// assigned UID.
    pub fn assign_uid_range(&mut self, first_uid: u32) -> u32 {
        let mut uid = first_uid;
        for pending in &mut self.pending {
            pending.uid = uid;
            uid += 1;
        }
        uid - 1
    }

    /// Fold the assigned placeholders into the array and persist
    ///
    /// # Errors
    ///
    /// `Critical` if a pending UID would break strict UID ordering or the
    /// backing file cannot be written.
    pub fn commit(mut self) -> StoreResult<MailIndex> {
        let mut last_uid = self.index.records.last().map_or(0, |rec| rec.uid);
        for pending in self.pending.drain(..) {
            if pending.uid <= last_uid {
                error!(uid = pending.uid, last_uid, "append would break UID ordering");
                return Err(StoreError::Critical);
            }
            last_uid = pending.uid;
            self.index.records.push(IndexRecord {
                uid: pending.uid,
                flags: pending.flags,
            });
        }
        self.index.persist()?;
        Ok(self.index)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{IndexTransaction, MailIndex};
    use crate::flags::MailFlags;

    fn index_with_uids(dir: &TempDir, uids: &[u32]) -> MailIndex {
        let index = MailIndex::open(dir.path().join("index")).expect("open");
        let mut tx = IndexTransaction::new(index);
        for _ in uids {
            tx.append_placeholder(MailFlags::RECENT);
        }
        let mut sorted = uids.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, uids, "test fixture uids must be ascending");
        tx.assign_uid_range(uids[0]);
        // fixture only supports contiguous ranges
        assert_eq!(*uids.last().expect("nonempty"), uids[0] + uids.len() as u32 - 1);
        tx.commit().expect("commit")
    }

    #[test]
    fn sequence_is_one_based_position() {
        let dir = TempDir::new().expect("tempdir");
        let index = index_with_uids(&dir, &[3, 4, 5]);
        assert_eq!(index.lookup(1).expect("seq 1").uid, 3);
        assert_eq!(index.lookup(3).expect("seq 3").uid, 5);
        assert!(index.lookup(0).is_none());
        assert!(index.lookup(4).is_none());
        assert_eq!(index.next(1).expect("seq 2").uid, 4);
        assert!(index.next(3).is_none());
    }

    #[test]
    fn uid_range_lookup_finds_smallest_in_range() {
        let dir = TempDir::new().expect("tempdir");
        let index = index_with_uids(&dir, &[10, 11, 12, 13]);

        let (rec, seq) = index.lookup_uid_range(11, 12).expect("in range");
        assert_eq!((rec.uid, seq), (11, 2));

        // range starting below the first uid still lands on the first record
        let (rec, seq) = index.lookup_uid_range(1, 10).expect("first");
        assert_eq!((rec.uid, seq), (10, 1));

        // undershooting range start snaps to the next record
        let (rec, seq) = index.lookup_uid_range(5, 100).expect("snap");
        assert_eq!((rec.uid, seq), (10, 1));

        assert!(index.lookup_uid_range(14, 20).is_none());
        assert!(index.lookup_uid_range(1, 9).is_none());
    }

    #[test]
    fn expunge_shifts_sequences_down() {
        let dir = TempDir::new().expect("tempdir");
        let mut index = index_with_uids(&dir, &[1, 2, 3, 4, 5]);

        let changes = index.expunge_range(2, 3).expect("expunge");
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].uid, 2);
        assert_eq!(changes[0].old_flags, MailFlags::RECENT);
        assert!(changes[0].new_flags.is_empty());

        assert_eq!(index.messages_count(), 3);
        // the record previously at sequence 4 is now at sequence 2
        assert_eq!(index.lookup(2).expect("seq 2").uid, 4);
        assert_eq!(index.lookup(3).expect("seq 3").uid, 5);
    }

    #[test]
    fn expunge_rejects_invalid_ranges() {
        let dir = TempDir::new().expect("tempdir");
        let mut index = index_with_uids(&dir, &[1, 2]);
        assert!(index.expunge_range(0, 1).is_err());
        assert!(index.expunge_range(2, 1).is_err());
        assert!(index.expunge_range(1, 3).is_err());
    }

    #[test]
    fn records_survive_reopen_and_truncate_on_expunge() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("index");
        {
            let mut index = index_with_uids(&dir, &[1, 2, 3]);
            index.expunge_range(1, 1).expect("expunge");
        }
        let size = std::fs::metadata(&path).expect("meta").len();
        assert_eq!(size, 8 + 2 * 8);

        let index = MailIndex::open(&path).expect("reopen");
        assert_eq!(index.messages_count(), 2);
        assert_eq!(index.lookup(1).expect("seq 1").uid, 2);
    }

    #[test]
    fn commit_rejects_uid_regression() {
        let dir = TempDir::new().expect("tempdir");
        let index = index_with_uids(&dir, &[5, 6]);
        let mut tx = IndexTransaction::new(index);
        tx.append_placeholder(MailFlags::empty());
        tx.assign_uid_range(6);
        assert!(tx.commit().is_err());
    }
}
