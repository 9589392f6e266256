//! UID-list persistence and commit locking
//!
//! The uidlist is the mailbox's durable UID↔filename mapping and the
//! authority on the next free UID. Commits serialize on a dotlock next to
//! the file; updates go through a buffered sync session whose `close`
//! rewrites the file atomically (temp + rename). Abandoning a session
//! leaves the file untouched, which is what makes mid-commit rollback
//! cheap: the uids were never published.
//!
//! On-disk format is line-oriented text: a `<version> <next_uid>` header
//! line followed by one `<uid> <filename>` line per message.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, error};

use crate::errors::{StoreError, StoreResult};

/// Current uidlist file format version
const UIDLIST_VERSION: u32 = 1;
/// Poll interval while waiting on the dotlock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

bitflags! {
    /// Per-record markers passed to a sync session
    ///
    /// These describe how the record entered the mailbox; they are session
    /// metadata, not persisted state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UidListRecFlags: u8 {
        /// The file was published into `new/`
        const NEW_DIR = 1 << 0;
        /// The message counts as recent for the next session
        const RECENT = 1 << 1;
    }
}

/// One uidlist entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidListRecord {
    pub uid: u32,
    pub filename: String,
}

/// Held dotlock on a uidlist file
///
/// Dropping the guard removes the lock file.
#[derive(Debug)]
pub struct UidListLock {
    lock_path: PathBuf,
}

impl UidListLock {
    /// Acquire the dotlock for `uidlist_path`, polling until `timeout`
    ///
    /// # Errors
    ///
    /// `UidlistLockTimeout` when the deadline passes while another holder
    /// keeps the lock; `Critical` for any other failure creating the lock
    /// file.
    pub fn acquire(uidlist_path: &Path, timeout: Duration) -> StoreResult<Self> {
        let lock_path = dotlock_path(uidlist_path);
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => return Ok(Self { lock_path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        debug!(path = %lock_path.display(), "uidlist lock wait timed out");
                        return Err(StoreError::UidlistLockTimeout);
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(StoreError::from_io("open", &lock_path, &e)),
            }
        }
    }
}

impl Drop for UidListLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn dotlock_path(uidlist_path: &Path) -> PathBuf {
    let mut name = uidlist_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// In-memory view of a uidlist file
#[derive(Debug)]
pub struct UidList {
    path: PathBuf,
    next_uid: u32,
    records: Vec<UidListRecord>,
}

impl UidList {
    /// Load the uidlist, defaulting to an empty list with `next_uid` 1
    ///
    /// # Errors
    ///
    /// `Critical` if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                next_uid: 1,
                records: Vec::new(),
            });
        }
        let raw = fs::read_to_string(&path).map_err(|e| StoreError::from_io("read", &path, &e))?;
        match parse(&raw) {
            Some((next_uid, records)) => Ok(Self {
                path,
                next_uid,
                records,
            }),
            None => {
                error!(path = %path.display(), "corrupted uidlist file");
                Err(StoreError::Critical)
            }
        }
    }

    /// Next free UID
    pub fn next_uid(&self) -> u32 {
        self.next_uid
    }

    pub fn records(&self) -> &[UidListRecord] {
        &self.records
    }

    /// Start a buffered sync session
    pub fn sync_begin(&mut self) -> UidListSync<'_> {
        UidListSync {
            list: self,
            appended: Vec::new(),
        }
    }

    fn write_atomic(&self) -> io::Result<()> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        let tmp_path = PathBuf::from(name);
        let mut file = File::create(&tmp_path)?;
        let mut buf = format!("{UIDLIST_VERSION} {}\n", self.next_uid);
        for rec in &self.records {
            buf.push_str(&format!("{} {}\n", rec.uid, rec.filename));
        }
        file.write_all(buf.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)
    }
}

fn parse(raw: &str) -> Option<(u32, Vec<UidListRecord>)> {
    let mut lines = raw.lines();
    let header = lines.next()?;
    let (version, next_uid) = header.split_once(' ')?;
    if version.parse::<u32>().ok()? != UIDLIST_VERSION {
        return None;
    }
    let next_uid = next_uid.parse::<u32>().ok()?;
    let mut records = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (uid, filename) = line.split_once(' ')?;
        records.push(UidListRecord {
            uid: uid.parse().ok()?,
            filename: filename.to_owned(),
        });
    }
    Some((next_uid, records))
}

/// Buffered uidlist update
///
/// Appends accumulate in memory; nothing touches the file until [`close`].
/// Dropping the session without closing rolls the update back.
///
/// [`close`]: UidListSync::close
#[derive(Debug)]
pub struct UidListSync<'a> {
    list: &'a mut UidList,
    appended: Vec<UidListRecord>,
}

impl UidListSync<'_> {
    /// Buffer one published message
    ///
    /// `flags` record how the message entered the mailbox; they are
    /// accepted for contract parity but carry no on-disk representation.
    pub fn append(&mut self, uid: u32, filename: &str, _flags: UidListRecFlags) {
        self.appended.push(UidListRecord {
            uid,
            filename: filename.to_owned(),
        });
    }

    /// Merge the buffered records and rewrite the file atomically
    ///
    /// Bumps `next_uid` past the highest appended UID.
    ///
    /// # Errors
    ///
    /// `Critical` (or `NoSpace`) if the rewrite fails; the original file is
    /// left in place in that case.
    pub fn close(self) -> StoreResult<()> {
        if self.appended.is_empty() {
            return Ok(());
        }
        let highest = self.appended.iter().map(|r| r.uid).max().unwrap_or(0);
        self.list.records.extend(self.appended);
        if highest >= self.list.next_uid {
            self.list.next_uid = highest + 1;
        }
        self.list
            .write_atomic()
            .map_err(|e| StoreError::from_io("rename", &self.list.path, &e))
    }
}
