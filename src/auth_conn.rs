//! One connection to an auth-worker process
//!
//! An [`AuthConnection`] wraps a connected local socket: the write half for
//! outgoing request frames, a table of in-flight requests keyed by id, and
//! the incremental decoder for the worker's byte stream. The connection is
//! a shared-ownership value: the registry holds one strong count per live
//! worker, and every caller-held request handle holds another, so the
//! object outlives a worker crash until the last caller lets go.
//!
//! Lifecycle: the handshake must arrive first and must be exactly the
//! expected size; afterwards the stream alternates reply headers and
//! payloads. Any framing violation kills the connection, and teardown
//! aborts every pending request with a null reply.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tracing::warn;

use crate::auth_proto::{
    AuthStatus, HANDSHAKE_OUTPUT_SIZE, HandshakeOutput, MAX_REPLY_DATA_SIZE, MechSet, Mechanism,
    REPLY_HEADER_SIZE, decode_handshake_output, decode_reply_header,
};

/// Decoded reply delivered to a request continuation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReply {
    pub id: u32,
    pub status: AuthStatus,
    pub data: Vec<u8>,
}

/// Continuation invoked for every reply to one request
///
/// `None` signals the exchange was aborted by worker death. A `CONTINUE`
/// status leaves the request in flight, so the continuation may run more
/// than once.
pub type ReplyCallback = Box<dyn FnMut(Option<&AuthReply>) + Send>;

struct PendingRequest {
    mech: Mechanism,
    callback: ReplyCallback,
}

/// Live connection to one auth worker
pub struct AuthConnection {
    path: PathBuf,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    requests: Mutex<HashMap<u32, Arc<Mutex<PendingRequest>>>>,
    pid: AtomicU32,
    mechanisms: AtomicU32,
    handshake_received: AtomicBool,
    dead: AtomicBool,
}

impl AuthConnection {
    pub fn new(path: PathBuf, writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Self {
            path,
            writer: tokio::sync::Mutex::new(Some(writer)),
            requests: Mutex::new(HashMap::new()),
            pid: AtomicU32::new(0),
            mechanisms: AtomicU32::new(0),
            handshake_received: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        })
    }

    /// Socket path this connection was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Worker pid learned from the handshake (0 before it arrives)
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    /// Mechanisms advertised by the worker
    pub fn mechanisms(&self) -> MechSet {
        MechSet::from_bits_truncate(self.mechanisms.load(Ordering::Acquire))
    }

    pub fn handshake_received(&self) -> bool {
        self.handshake_received.load(Ordering::Acquire)
    }

    /// Whether this worker can take a request for `mech` right now
    pub fn advertises(&self, mech: Mechanism) -> bool {
        self.handshake_received() && self.mechanisms().contains(mech.bit())
    }

    /// Number of in-flight requests, the measure of output backlog
    pub fn pending_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Insert a request into the table; the id must be fresh
    pub fn register_request(&self, id: u32, mech: Mechanism, callback: ReplyCallback) {
        let previous = self
            .requests
            .lock()
            .insert(id, Arc::new(Mutex::new(PendingRequest { mech, callback })));
        debug_assert!(previous.is_none(), "request id reused while in flight");
    }

    /// Remove a request without notifying anyone; true if it was present
    pub fn remove_request(&self, id: u32) -> bool {
        self.requests.lock().remove(&id).is_some()
    }

    /// Write a frame to the worker, waiting as long as it takes
    ///
    /// The login process depends on its auth workers, so sends are awaited
    /// to completion rather than buffered and shed.
    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w.write_all(frame).await,
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "auth connection closed",
            )),
        }
    }

    /// Drop the write half, closing our direction of the socket
    pub async fn close_writer(&self) {
        self.writer.lock().await.take();
    }

    /// First caller wins the right to run teardown
    pub fn mark_dead(&self) -> bool {
        !self.dead.swap(true, Ordering::AcqRel)
    }

    /// Abort every pending request with a null reply
    pub fn abort_pending(&self) {
        let drained: Vec<Arc<Mutex<PendingRequest>>> = {
            let mut requests = self.requests.lock();
            requests.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let mut request = entry.lock();
            warn!(
                path = %self.path.display(),
                mech = request.mech.name(),
                "aborting auth request: worker connection lost"
            );
            (request.callback)(None);
        }
    }

    /// Feed freshly read bytes through the connection state machine
    ///
    /// Consumes complete frames from `buf`, dispatching replies to their
    /// continuations inline. Returns the decoded handshake the first time
    /// it completes, and `Err` with a reason on any protocol violation
    /// (oversized handshake, unknown result code, payload above the 50 KiB
    /// cap); violations oblige the caller to tear the connection down.
    pub fn handle_input(&self, buf: &mut Vec<u8>) -> Result<Option<HandshakeOutput>, String> {
        if !self.handshake_received() {
            if buf.len() < HANDSHAKE_OUTPUT_SIZE {
                return Ok(None);
            }
            if buf.len() > HANDSHAKE_OUTPUT_SIZE {
                return Err(format!("oversized handshake ({} bytes)", buf.len()));
            }
            let mut raw = [0u8; HANDSHAKE_OUTPUT_SIZE];
            raw.copy_from_slice(buf);
            buf.clear();
            let handshake = decode_handshake_output(&raw);
            self.pid.store(handshake.pid, Ordering::Release);
            self.mechanisms
                .store(handshake.mechanisms.bits(), Ordering::Release);
            self.handshake_received.store(true, Ordering::Release);
            return Ok(Some(handshake));
        }

        while buf.len() >= REPLY_HEADER_SIZE {
            let mut raw = [0u8; REPLY_HEADER_SIZE];
            raw.copy_from_slice(&buf[..REPLY_HEADER_SIZE]);
            let header = decode_reply_header(&raw)
                .map_err(|code| format!("unknown reply result code {code}"))?;
            let data_size = header.data_size as usize;
            if data_size > MAX_REPLY_DATA_SIZE {
                return Err(format!("reply payload of {data_size} bytes exceeds cap"));
            }
            if buf.len() < REPLY_HEADER_SIZE + data_size {
                break;
            }
            let data = buf[REPLY_HEADER_SIZE..REPLY_HEADER_SIZE + data_size].to_vec();
            buf.drain(..REPLY_HEADER_SIZE + data_size);
            self.dispatch_reply(AuthReply {
                id: header.id,
                status: header.status,
                data,
            });
        }
        Ok(None)
    }

    /// Route one reply to its pending request
    ///
    /// An unknown id is a worker bug: logged and ignored, never fatal.
    /// Terminal results retire the request before the continuation runs;
    /// `CONTINUE` leaves it in the table for the next round.
    fn dispatch_reply(&self, reply: AuthReply) {
        let entry = {
            let mut requests = self.requests.lock();
            if reply.status == AuthStatus::Continue {
                requests.get(&reply.id).cloned()
            } else {
                requests.remove(&reply.id)
            }
        };
        let Some(entry) = entry else {
            warn!(
                path = %self.path.display(),
                id = reply.id,
                "reply for unknown request id"
            );
            return;
        };
        (entry.lock().callback)(Some(&reply));
    }
}
