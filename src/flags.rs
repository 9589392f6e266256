//! Message flags and maildir flag-suffix encoding
//!
//! Flags are a bitset; on disk they become the maildir `:2,` info suffix
//! appended to a message basename in `cur/`. `RECENT` is the one flag with
//! no suffix letter: it means "arrived since last session" and is mutually
//! exclusive with placement in `cur/`.

use bitflags::bitflags;

bitflags! {
    /// IMAP system flags carried by a message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MailFlags: u32 {
        const ANSWERED = 1 << 0;
        const FLAGGED = 1 << 1;
        const DELETED = 1 << 2;
        const SEEN = 1 << 3;
        const DRAFT = 1 << 4;
        const RECENT = 1 << 5;
    }
}

/// Maildir info-suffix separator between basename and flag letters
pub const MAILDIR_INFO_SEP: &str = ":2,";

impl MailFlags {
    /// Whether a message with these flags must be published into `cur/`
    ///
    /// Any flag other than `RECENT` forces `cur/`: external mail readers
    /// only look at the flag suffix there, so publishing a flagged message
    /// into `new/` would show it with stale (empty) flags.
    pub fn needs_cur(self) -> bool {
        !self.difference(Self::RECENT).is_empty()
    }

    /// Append the maildir info suffix for these flags to a basename
    ///
    /// Letters appear in ASCII order (`D`, `F`, `R`, `S`, `T`), the order
    /// maildir-aware readers expect. `RECENT` contributes no letter.
    pub fn to_maildir_filename(self, basename: &str) -> String {
        let mut name = String::with_capacity(basename.len() + MAILDIR_INFO_SEP.len() + 5);
        name.push_str(basename);
        name.push_str(MAILDIR_INFO_SEP);
        if self.contains(Self::DRAFT) {
            name.push('D');
        }
        if self.contains(Self::FLAGGED) {
            name.push('F');
        }
        if self.contains(Self::ANSWERED) {
            name.push('R');
        }
        if self.contains(Self::SEEN) {
            name.push('S');
        }
        if self.contains(Self::DELETED) {
            name.push('T');
        }
        name
    }

    /// Parse the flag letters of a maildir filename
    ///
    /// Returns the flags encoded after the `:2,` separator, or empty flags
    /// when the filename carries no info suffix. Unknown letters are
    /// ignored.
    pub fn from_maildir_filename(filename: &str) -> Self {
        let Some((_, letters)) = filename.split_once(MAILDIR_INFO_SEP) else {
            return Self::empty();
        };
        let mut flags = Self::empty();
        for ch in letters.chars() {
            flags |= match ch {
                'D' => Self::DRAFT,
                'F' => Self::FLAGGED,
                'R' => Self::ANSWERED,
                'S' => Self::SEEN,
                'T' => Self::DELETED,
                _ => Self::empty(),
            };
        }
        flags
    }
}
