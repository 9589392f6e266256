//! Maildir mailbox handle
//!
//! A mailbox is the classic three-sibling layout: `tmp/` for staging,
//! `new/` for unseen messages (raw basenames), `cur/` for messages with a
//! flag suffix. Publication out of `tmp/` goes through [`Mailbox::file_move`],
//! which links rather than renames so a concurrent delivery owning the
//! destination name makes the move fail instead of being clobbered.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{StoreError, StoreResult};

/// Uidlist file name under the mailbox root
const UIDLIST_FILE: &str = "uidlist";
/// Index backing file name under the mailbox root
const INDEX_FILE: &str = "index";

/// Handle to one on-disk maildir folder
#[derive(Debug)]
pub struct Mailbox {
    root: PathBuf,
}

impl Mailbox {
    /// Open a mailbox root, creating the maildir layout if missing
    ///
    /// # Errors
    ///
    /// Returns `Critical` if any of `tmp/`, `new/`, `cur/` cannot be
    /// created.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for sub in ["tmp", "new", "cur"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| StoreError::from_io("mkdir", &dir, &e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn new_dir(&self) -> PathBuf {
        self.root.join("new")
    }

    pub fn cur_dir(&self) -> PathBuf {
        self.root.join("cur")
    }

    /// Path of the UID-list file for this mailbox
    pub fn uidlist_path(&self) -> PathBuf {
        self.root.join(UIDLIST_FILE)
    }

    /// Path of the index backing file for this mailbox
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Publish one staged file out of `tmp/`
    ///
    /// Hard-links `tmp/<basename>` to `new/<basename>` (no `destname`) or
    /// `cur/<destname>`, then unlinks the `tmp/` entry regardless of the
    /// link outcome: on success the link created a second name for the
    /// same inode, and on failure the transaction is aborting anyway. A
    /// missing `tmp/` entry at unlink time is ignored.
    ///
    /// Returns the destination filename.
    ///
    /// # Errors
    ///
    /// `NoSpace` when the link fails with `ENOSPC`, `Critical` (logged) for
    /// any other link failure.
    pub fn file_move(&self, basename: &str, destname: Option<&str>) -> StoreResult<String> {
        let tmp_path = self.tmp_dir().join(basename);
        let (dest_dir, dest_name) = match destname {
            Some(name) => (self.cur_dir(), name),
            None => (self.new_dir(), basename),
        };
        let dest_path = dest_dir.join(dest_name);

        let linked = fs::hard_link(&tmp_path, &dest_path)
            .map_err(|e| StoreError::from_io("link", &dest_path, &e));

        if let Err(e) = fs::remove_file(&tmp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %tmp_path.display(), %e, "failed to unlink staged tmp file");
            }
        }

        linked?;
        Ok(dest_name.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::Mailbox;

    #[test]
    fn open_creates_maildir_layout() {
        let dir = TempDir::new().expect("tempdir");
        let mailbox = Mailbox::open(dir.path()).expect("open");
        assert!(mailbox.tmp_dir().is_dir());
        assert!(mailbox.new_dir().is_dir());
        assert!(mailbox.cur_dir().is_dir());
    }

    #[test]
    fn file_move_links_into_new_and_clears_tmp() {
        let dir = TempDir::new().expect("tempdir");
        let mailbox = Mailbox::open(dir.path()).expect("open");
        fs::write(mailbox.tmp_dir().join("msg1"), b"body").expect("stage");

        let dest = mailbox.file_move("msg1", None).expect("move");
        assert_eq!(dest, "msg1");
        assert!(mailbox.new_dir().join("msg1").exists());
        assert!(!mailbox.tmp_dir().join("msg1").exists());
    }

    #[test]
    fn file_move_with_destname_lands_in_cur() {
        let dir = TempDir::new().expect("tempdir");
        let mailbox = Mailbox::open(dir.path()).expect("open");
        fs::write(mailbox.tmp_dir().join("msg1"), b"body").expect("stage");

        let dest = mailbox.file_move("msg1", Some("msg1:2,S")).expect("move");
        assert_eq!(dest, "msg1:2,S");
        assert!(mailbox.cur_dir().join("msg1:2,S").exists());
        assert!(!mailbox.tmp_dir().join("msg1").exists());
    }

    #[test]
    fn file_move_fails_on_destination_collision_and_still_clears_tmp() {
        let dir = TempDir::new().expect("tempdir");
        let mailbox = Mailbox::open(dir.path()).expect("open");
        fs::write(mailbox.tmp_dir().join("msg1"), b"body").expect("stage");
        fs::write(mailbox.new_dir().join("msg1"), b"other").expect("collide");

        assert!(mailbox.file_move("msg1", None).is_err());
        assert!(!mailbox.tmp_dir().join("msg1").exists());
        // the concurrent delivery's file is untouched
        assert_eq!(fs::read(mailbox.new_dir().join("msg1")).expect("read"), b"other");
    }
}
