//! Temp-file staging under `tmp/`
//!
//! Message bodies are streamed into uniquely-named files under the
//! mailbox's `tmp/` directory and only become visible once commit
//! hard-links them into `new/` or `cur/`. This module owns the exclusive
//! create and the buffered writer, including the optional LF→CRLF
//! normalization applied on the way out.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::filename;

/// Attempts before giving up on basename collisions
const CREATE_RETRIES: u32 = 16;

/// Create a uniquely-named file under `dir`, open for writing
///
/// The file is created with `O_CREAT|O_EXCL` and mode 0600; a collision
/// with a concurrent writer retries with a fresh basename. Returns the open
/// file and its basename. The caller owns the file and must unlink it on
/// every failure path.
pub fn create_tmp(dir: &Path) -> io::Result<(File, String)> {
    let mut last_err = None;
    for _ in 0..CREATE_RETRIES {
        let basename = filename::generate();
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(dir.join(&basename))
        {
            Ok(file) => return Ok((file, basename)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::other("tmp basename collision")))
}

/// Buffered message-body writer with optional CRLF normalization
///
/// Wraps the staged file in a `BufWriter`. With `crlf` enabled, every bare
/// `\n` is rewritten to `\r\n`; a `\n` already preceded by `\r` passes
/// through unchanged, even when the pair is split across two writes.
#[derive(Debug)]
pub struct MessageWriter {
    inner: BufWriter<File>,
    crlf: bool,
    last_was_cr: bool,
}

impl MessageWriter {
    /// Wrap a staged file descriptor
    pub fn new(file: File, crlf: bool) -> Self {
        Self {
            inner: BufWriter::new(file),
            crlf,
            last_was_cr: false,
        }
    }

    /// Flush buffered data and hand back the underlying file
    ///
    /// The caller is expected to `sync_all` the returned file before
    /// considering the staged message durable.
    pub fn finish(self) -> io::Result<File> {
        self.inner
            .into_inner()
            .map_err(io::IntoInnerError::into_error)
    }
}

impl Write for MessageWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.crlf {
            self.inner.write_all(buf)?;
            return Ok(buf.len());
        }
        for &byte in buf {
            if byte == b'\n' && !self.last_was_cr {
                self.inner.write_all(b"\r\n")?;
            } else {
                self.inner.write_all(&[byte])?;
            }
            self.last_was_cr = byte == b'\r';
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use tempfile::TempDir;

    use super::{MessageWriter, create_tmp};

    fn write_through(dir: &TempDir, crlf: bool, chunks: &[&[u8]]) -> Vec<u8> {
        let (file, basename) = create_tmp(dir.path()).expect("create tmp");
        let mut writer = MessageWriter::new(file, crlf);
        for chunk in chunks {
            writer.write_all(chunk).expect("write chunk");
        }
        writer.finish().expect("finish");
        fs::read(dir.path().join(basename)).expect("read back")
    }

    #[test]
    fn create_tmp_yields_distinct_files() {
        let dir = TempDir::new().expect("tempdir");
        let (_f1, name1) = create_tmp(dir.path()).expect("first");
        let (_f2, name2) = create_tmp(dir.path()).expect("second");
        assert_ne!(name1, name2);
        assert!(dir.path().join(&name1).exists());
        assert!(dir.path().join(&name2).exists());
    }

    #[test]
    fn passthrough_without_crlf_conversion() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(write_through(&dir, false, &[b"A\nB\n"]), b"A\nB\n");
    }

    #[test]
    fn bare_lf_becomes_crlf() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(write_through(&dir, true, &[b"A\nB\n"]), b"A\r\nB\r\n");
    }

    #[test]
    fn existing_crlf_is_preserved() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(write_through(&dir, true, &[b"A\r\nB\n"]), b"A\r\nB\r\n");
    }

    #[test]
    fn crlf_pair_split_across_writes_is_preserved() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(write_through(&dir, true, &[b"A\r", b"\nB"]), b"A\r\nB");
    }
}
