//! Transactional maildir save engine
//!
//! One [`SaveTransaction`] appends any number of messages to a mailbox with
//! all-or-nothing visibility. Bodies are staged under `tmp/` while the
//! transaction is open; commit serializes on the uidlist lock, assigns a
//! contiguous UID range, and hard-links every staged file into `new/` or
//! `cur/` in insertion order. Any failure, whether mid-body, mid-commit,
//! or a caller rollback, removes every trace of the transaction from
//! disk.
//!
//! Failure handling is sticky: once a save step fails, the recorded error
//! is returned from every later `save_continue`/`save_finish` and from
//! `commit`, which then rolls back instead of publishing.

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use filetime::FileTime;
use tracing::{error, warn};

use crate::config::Config;
use crate::errors::{StoreError, StoreResult};
use crate::flags::MailFlags;
use crate::index::{IndexTransaction, MailIndex};
use crate::maildir::Mailbox;
use crate::tmpfile::{self, MessageWriter};
use crate::uidlist::{UidList, UidListLock, UidListRecFlags};

/// Save tunables captured once at transaction construction
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Normalize bare LF to CRLF while streaming bodies
    pub save_crlf: bool,
    /// Deadline for the commit-time uidlist dotlock
    pub uidlist_lock_timeout: Duration,
}

impl SaveOptions {
    /// Read the save environment
    ///
    /// `MAIL_SAVE_CRLF` set to any non-empty value enables CRLF conversion.
    pub fn from_env() -> Self {
        Self {
            save_crlf: std::env::var("MAIL_SAVE_CRLF").is_ok_and(|v| !v.is_empty()),
            ..Self::default()
        }
    }

    /// Environment plus the process configuration's lock timeout
    pub fn from_config(config: &Config) -> Self {
        Self {
            uidlist_lock_timeout: config.uidlist_lock_timeout(),
            ..Self::from_env()
        }
    }
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            save_crlf: false,
            uidlist_lock_timeout: Duration::from_millis(10_000),
        }
    }
}

/// View of one finished message within the transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedMail {
    /// In-memory sequence number captured at `save_init`
    pub seq: u32,
}

/// UID range assigned by a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedRange {
    pub first_uid: u32,
    pub last_uid: u32,
}

/// One staged message file, immutable after `save_init`
#[derive(Debug)]
struct StagedFile {
    /// Name under `tmp/`
    basename: String,
    /// Name under `cur/` when flags force it there; `None` means `new/`
    destname: Option<String>,
}

/// Per-transaction save state
///
/// `files` keeps insertion order for commit; the last element is always the
/// message currently being written, and failure paths pop it. `output` is
/// `Some` exactly while a body is being streamed.
#[derive(Debug)]
struct SaveContext {
    files: Vec<StagedFile>,
    output: Option<MessageWriter>,
    cur_seq: u32,
    received_date: Option<DateTime<Utc>>,
    save_crlf: bool,
    error: Option<StoreError>,
}

impl SaveContext {
    fn new(save_crlf: bool) -> Self {
        Self {
            files: Vec::new(),
            output: None,
            cur_seq: 0,
            received_date: None,
            save_crlf,
            error: None,
        }
    }
}

/// One append transaction against a mailbox
#[derive(Debug)]
pub struct SaveTransaction {
    mailbox: Arc<Mailbox>,
    index: IndexTransaction,
    options: SaveOptions,
    ctx: Option<SaveContext>,
}

impl SaveTransaction {
    /// Open a transaction against `mailbox`
    pub fn begin(mailbox: Arc<Mailbox>, options: SaveOptions) -> StoreResult<Self> {
        let index = MailIndex::open(mailbox.index_path())?;
        Ok(Self {
            mailbox,
            index: IndexTransaction::new(index),
            options,
            ctx: None,
        })
    }

    /// Current index view (placeholders excluded)
    pub fn index(&self) -> &MailIndex {
        self.index.index()
    }

    /// Start saving one message
    ///
    /// Opens a fresh temp file, records the staged-file entry (flag-encoded
    /// `cur/` destination unless the flags are empty or `RECENT` alone), and
    /// queues an index placeholder, capturing the in-memory sequence.
    ///
    /// # Errors
    ///
    /// `NoSpace`/`Critical` when the temp file cannot be created; only this
    /// failure marks the context failed at init time.
    pub fn save_init(
        &mut self,
        flags: MailFlags,
        received_date: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let save_crlf = self.options.save_crlf;
        let ctx = self.ctx.get_or_insert_with(|| SaveContext::new(save_crlf));
        if ctx.output.is_some() {
            error!("save_init while a message body is still open");
            return Err(StoreError::Critical);
        }

        let tmp_dir = self.mailbox.tmp_dir();
        let (file, basename) = match tmpfile::create_tmp(&tmp_dir) {
            Ok(created) => created,
            Err(e) => {
                let mapped = StoreError::from_io("open", &tmp_dir, &e);
                ctx.error = Some(mapped.clone());
                return Err(mapped);
            }
        };

        let destname = flags
            .needs_cur()
            .then(|| flags.to_maildir_filename(&basename));
        ctx.files.push(StagedFile { basename, destname });
        ctx.output = Some(MessageWriter::new(file, ctx.save_crlf));
        ctx.cur_seq = self.index.append_placeholder(flags);
        ctx.received_date = received_date;
        Ok(())
    }

    /// Stream body bytes from `input` until it is exhausted
    ///
    /// # Errors
    ///
    /// Any read or write failure marks the context failed; the recorded
    /// error is returned here and from every later call.
    pub fn save_continue<R: Read>(&mut self, input: &mut R) -> StoreResult<()> {
        let Some(ctx) = self.ctx.as_mut() else {
            error!("save_continue without save_init");
            return Err(StoreError::Critical);
        };
        if let Some(err) = &ctx.error {
            return Err(err.clone());
        }
        let Some(output) = ctx.output.as_mut() else {
            error!("save_continue without an open message body");
            return Err(StoreError::Critical);
        };
        match io::copy(input, output) {
            Ok(_) => Ok(()),
            Err(e) => {
                let staged = ctx.files.last().map_or(Path::new("?").to_path_buf(), |f| {
                    self.mailbox.tmp_dir().join(&f.basename)
                });
                let mapped = StoreError::from_io("write", &staged, &e);
                ctx.error = Some(mapped.clone());
                Err(mapped)
            }
        }
    }

    /// Close the current message
    ///
    /// On success the staged file is durable under `tmp/` (flushed, synced,
    /// mtime set to the received-date with atime = now) but not yet visible
    /// in `new/` or `cur/`. On failure (including a body failure recorded
    /// earlier) the temp file is unlinked and the staged entry dropped.
    /// The transaction is ready for another `save_init` afterwards.
    pub fn save_finish(&mut self) -> StoreResult<SavedMail> {
        let Some(ctx) = self.ctx.as_mut() else {
            error!("save_finish without save_init");
            return Err(StoreError::Critical);
        };
        let Some(writer) = ctx.output.take() else {
            error!("save_finish without an open message body");
            return Err(StoreError::Critical);
        };
        let Some(staged) = ctx.files.last() else {
            error!("open message body with no staged file record");
            return Err(StoreError::Critical);
        };
        let tmp_path = self.mailbox.tmp_dir().join(&staged.basename);

        if let Some(err) = ctx.error.clone() {
            drop(writer);
            remove_ignore_missing(&tmp_path);
            ctx.files.pop();
            return Err(err);
        }

        let finished = writer
            .finish()
            .and_then(|file| file.sync_all())
            .and_then(|()| apply_received_date(&tmp_path, ctx.received_date));
        match finished {
            Ok(()) => Ok(SavedMail { seq: ctx.cur_seq }),
            Err(e) => {
                let mapped = StoreError::from_io("fsync", &tmp_path, &e);
                ctx.error = Some(mapped.clone());
                remove_ignore_missing(&tmp_path);
                ctx.files.pop();
                Err(mapped)
            }
        }
    }

    /// Abandon the current message
    ///
    /// Marks the context failed and runs the finish failure path: the
    /// current staged file is unlinked and dropped from the list.
    pub fn save_cancel(&mut self) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        if ctx.output.is_none() {
            return;
        }
        ctx.error.get_or_insert(StoreError::Critical);
        let _ = self.save_finish();
    }

    /// Atomically publish every staged message
    ///
    /// The commit sequence: uidlist dotlock, index sync, contiguous UID
    /// assignment from the uidlist's next free UID, per-file link into the
    /// destination directory with a uidlist append, sync-session close, and
    /// a final next-UID consistency check. Any failure rolls the whole
    /// transaction back, including destination files already linked.
    ///
    /// Returns the assigned UID range, or `None` for an empty transaction.
    pub fn commit(self) -> StoreResult<Option<CommittedRange>> {
        let SaveTransaction {
            mailbox,
            mut index,
            options,
            ctx,
        } = self;
        let Some(mut ctx) = ctx else {
            return Ok(None);
        };

        if ctx.output.is_some() {
            error!("commit with an unfinished message body");
            ctx.output = None;
            ctx.error.get_or_insert(StoreError::Critical);
        }
        if let Some(err) = ctx.error {
            rollback_staged(&mailbox, &ctx.files);
            return Err(err);
        }

        let uidlist_path = mailbox.uidlist_path();
        let lock = match UidListLock::acquire(&uidlist_path, options.uidlist_lock_timeout) {
            Ok(lock) => lock,
            Err(e) => {
                rollback_staged(&mailbox, &ctx.files);
                return Err(e);
            }
        };
        if let Err(e) = index.sync() {
            rollback_staged(&mailbox, &ctx.files);
            return Err(e);
        }
        let mut uidlist = match UidList::open(&uidlist_path) {
            Ok(list) => list,
            Err(e) => {
                rollback_staged(&mailbox, &ctx.files);
                return Err(e);
            }
        };

        let first_uid = uidlist.next_uid();
        let last_uid = index.assign_uid_range(first_uid);

        let mut sync = uidlist.sync_begin();
        for (pos, staged) in ctx.files.iter().enumerate() {
            match mailbox.file_move(&staged.basename, staged.destname.as_deref()) {
                Ok(dest) => sync.append(
                    first_uid + pos as u32,
                    &dest,
                    UidListRecFlags::NEW_DIR | UidListRecFlags::RECENT,
                ),
                Err(e) => {
                    drop(sync);
                    rollback_published(&mailbox, &ctx.files, pos);
                    return Err(e);
                }
            }
        }
        if let Err(e) = sync.close() {
            rollback_published(&mailbox, &ctx.files, ctx.files.len());
            return Err(e);
        }

        index.commit()?;

        // a concurrent appender slipping past the lock would have moved this
        if uidlist.next_uid() != last_uid + 1 {
            error!(
                next_uid = uidlist.next_uid(),
                last_uid, "uidlist next-uid moved during commit"
            );
            return Err(StoreError::Critical);
        }
        drop(lock);
        Ok(Some(CommittedRange { first_uid, last_uid }))
    }

    /// Abandon the transaction, removing every staged file
    pub fn rollback(self) {
        let Some(mut ctx) = self.ctx else {
            return;
        };
        // close any open body before unlinking beneath it
        ctx.output = None;
        rollback_staged(&self.mailbox, &ctx.files);
    }
}

/// Set mtime to the received-date, atime to now
fn apply_received_date(path: &Path, received_date: Option<DateTime<Utc>>) -> io::Result<()> {
    let Some(date) = received_date else {
        return Ok(());
    };
    let mtime = FileTime::from_unix_time(date.timestamp(), date.timestamp_subsec_nanos());
    filetime::set_file_times(path, FileTime::now(), mtime)
}

/// Remove every staged `tmp/` entry
fn rollback_staged(mailbox: &Mailbox, files: &[StagedFile]) {
    for staged in files {
        remove_ignore_missing(&mailbox.tmp_dir().join(&staged.basename));
    }
}

/// Undo a partial publication: unlink destinations before `published`, then
/// every `tmp/` straggler
fn rollback_published(mailbox: &Mailbox, files: &[StagedFile], published: usize) {
    for staged in &files[..published] {
        let dest = match &staged.destname {
            Some(name) => mailbox.cur_dir().join(name),
            None => mailbox.new_dir().join(&staged.basename),
        };
        remove_ignore_missing(&dest);
    }
    rollback_staged(mailbox, files);
}

fn remove_ignore_missing(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), %e, "rollback unlink failed");
        }
    }
}
