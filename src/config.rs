//! Configuration for the store and auth cores
//!
//! All configuration is loaded from environment variables under the
//! `MAIL_STORE_` prefix, with sane defaults for every setting. The one
//! variable outside the prefix is `MAIL_SAVE_CRLF`, which belongs to the
//! save context and is read at context construction (see `save`).

use std::env;
use std::env::VarError;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{StoreError, StoreResult};

/// Process-wide configuration
///
/// Wraps the tunables of both cores. Cloned into the auth registry and save
/// transactions at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory scanned for auth-worker sockets (the chroot cwd by default)
    pub auth_socket_dir: PathBuf,
    /// Interval between reconnect scans of the socket directory
    pub auth_reconnect_interval_ms: u64,
    /// Per-connection pending-request cap; beyond it a worker counts as busy
    pub auth_max_pending: usize,
    /// Deadline for acquiring the uidlist dotlock at commit
    pub uidlist_lock_timeout_ms: u64,
}

impl Config {
    /// Load all configuration from environment variables
    ///
    /// Every setting has a default; only malformed values fail.
    ///
    /// # Errors
    ///
    /// Returns `Critical` (with the offending variable logged) if a variable
    /// is set but cannot be parsed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_STORE_AUTH_SOCKET_DIR=/var/run/auth
    /// MAIL_STORE_AUTH_RECONNECT_INTERVAL_MS=1000
    /// MAIL_STORE_AUTH_MAX_PENDING=1024
    /// MAIL_STORE_UIDLIST_LOCK_TIMEOUT_MS=10000
    /// ```
    pub fn load_from_env() -> StoreResult<Self> {
        Ok(Self {
            auth_socket_dir: path_env("MAIL_STORE_AUTH_SOCKET_DIR", "."),
            auth_reconnect_interval_ms: parse_u64_env("MAIL_STORE_AUTH_RECONNECT_INTERVAL_MS", 1_000)?,
            auth_max_pending: parse_usize_env("MAIL_STORE_AUTH_MAX_PENDING", 1_024)?,
            uidlist_lock_timeout_ms: parse_u64_env("MAIL_STORE_UIDLIST_LOCK_TIMEOUT_MS", 10_000)?,
        })
    }

    /// Reconnect-scan interval as a `Duration`
    pub fn auth_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.auth_reconnect_interval_ms)
    }

    /// Uidlist lock deadline as a `Duration`
    pub fn uidlist_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.uidlist_lock_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_socket_dir: PathBuf::from("."),
            auth_reconnect_interval_ms: 1_000,
            auth_max_pending: 1_024,
            uidlist_lock_timeout_ms: 10_000,
        }
    }
}

/// Read a path environment variable with default fallback
fn path_env(key: &str, default: &str) -> PathBuf {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
        _ => PathBuf::from(default),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `Critical` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> StoreResult<u64> {
    match env::var(key) {
        Ok(v) => v.trim().parse::<u64>().map_err(|_| {
            tracing::error!(key, value = %v, "invalid u64 environment variable");
            StoreError::Critical
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => {
            tracing::error!(key, "environment variable contains non-unicode data");
            Err(StoreError::Critical)
        }
    }
}

/// Parse a `usize` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `Critical` if the variable is set but not a valid `usize`.
fn parse_usize_env(key: &str, default: usize) -> StoreResult<usize> {
    match env::var(key) {
        Ok(v) => v.trim().parse::<usize>().map_err(|_| {
            tracing::error!(key, value = %v, "invalid usize environment variable");
            StoreError::Critical
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => {
            tracing::error!(key, "environment variable contains non-unicode data");
            Err(StoreError::Critical)
        }
    }
}
