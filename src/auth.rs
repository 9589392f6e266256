//! Auth multiplexer
//!
//! The [`AuthRegistry`] brokers login exchanges between many concurrent
//! client sessions and the pool of auth-worker processes listening on
//! local sockets. It owns what the original design kept in process
//! globals: the connection list, the monotonic request-id counter, the
//! reconnect flag, the count of connections still in handshake, and the
//! union of advertised mechanisms.
//!
//! Workers appear as sockets in one directory (the chroot cwd in
//! production). The registry connects to every socket at startup and a
//! recurring timer reconnects missing workers whenever a reconnect is
//! pending, which happens after a worker death, a failed connect, or a
//! request that found no worker at all.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::auth_conn::{AuthConnection, ReplyCallback};
use crate::auth_proto::{
    HandshakeOutput, MechSet, Mechanism, encode_handshake_input, encode_request_continue,
    encode_request_new,
};
use crate::config::Config;
use crate::errors::{AuthError, AuthResult};

/// Read chunk size for worker streams
const READ_CHUNK_SIZE: usize = 4096;

/// Caller-held handle to one in-flight login exchange
///
/// Holds a strong count on the owning connection for the exchange's
/// lifetime. Dropping the handle without aborting leaves the request in
/// the table until a terminal reply or connection teardown retires it.
pub struct AuthRequestHandle {
    id: u32,
    conn: Arc<AuthConnection>,
}

impl std::fmt::Debug for AuthRequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequestHandle")
            .field("id", &self.id)
            .finish()
    }
}

impl AuthRequestHandle {
    /// Request id, unique among in-flight requests on this connection
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// State shared across all registry operations
struct RegistryInner {
    connections: Vec<Arc<AuthConnection>>,
    request_id_counter: u32,
    auth_reconnect: bool,
    waiting_handshake_count: usize,
    available_mechs: MechSet,
}

impl RegistryInner {
    /// Allocate the next request id, skipping the reserved zero on wrap
    fn allocate_request_id(&mut self) -> u32 {
        self.request_id_counter = self.request_id_counter.wrapping_add(1);
        if self.request_id_counter == 0 {
            self.request_id_counter = 1;
        }
        self.request_id_counter
    }
}

/// Process-wide auth-worker registry
pub struct AuthRegistry {
    socket_dir: PathBuf,
    rescan_interval: Duration,
    max_pending: usize,
    client_pid: u32,
    inner: Mutex<RegistryInner>,
}

impl AuthRegistry {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            socket_dir: config.auth_socket_dir.clone(),
            rescan_interval: config.auth_reconnect_interval(),
            max_pending: config.auth_max_pending,
            client_pid: std::process::id(),
            inner: Mutex::new(RegistryInner {
                connections: Vec::new(),
                request_id_counter: 0,
                auth_reconnect: false,
                waiting_handshake_count: 0,
                available_mechs: MechSet::empty(),
            }),
        })
    }

    /// Connect to every worker socket and start the rescan timer
    pub async fn init(self: &Arc<Self>) {
        self.scan_sockets().await;
        self.spawn_rescan_timer();
    }

    /// True when no reconnect is pending and no handshake is outstanding
    pub fn is_connected(&self) -> bool {
        let inner = self.inner.lock();
        !inner.auth_reconnect && inner.waiting_handshake_count == 0
    }

    /// Union of mechanisms advertised across all ready workers
    pub fn available_mechs(&self) -> MechSet {
        self.inner.lock().available_mechs
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Start a login exchange
    ///
    /// Routes to the first connection that advertises `mech` and still has
    /// headroom for another in-flight request, allocates a request id, and
    /// sends the `NEW` frame. The continuation receives every reply for
    /// this id; a send failure tears the connection down, which aborts the
    /// request through the continuation's null-reply path.
    ///
    /// # Errors
    ///
    /// - `NoConnectedWorker` when no worker is connected (schedules a
    ///   reconnect scan)
    /// - `UnsupportedMechanism` when no connected worker advertises `mech`
    /// - `AllWorkersBusy` when every advertiser is saturated
    pub async fn init_request(
        self: &Arc<Self>,
        mech: Mechanism,
        protocol: u8,
        callback: ReplyCallback,
    ) -> AuthResult<AuthRequestHandle> {
        if self.inner.lock().auth_reconnect {
            self.scan_sockets().await;
        }

        let (conn, id) = {
            let mut inner = self.inner.lock();
            if inner.connections.is_empty() {
                inner.auth_reconnect = true;
                return Err(AuthError::NoConnectedWorker);
            }
            let mut advertiser_seen = false;
            let mut picked = None;
            for conn in &inner.connections {
                if !conn.advertises(mech) {
                    continue;
                }
                advertiser_seen = true;
                if conn.pending_count() < self.max_pending {
                    picked = Some(Arc::clone(conn));
                    break;
                }
            }
            let Some(conn) = picked else {
                return Err(if advertiser_seen {
                    AuthError::AllWorkersBusy
                } else {
                    AuthError::UnsupportedMechanism
                });
            };
            let id = inner.allocate_request_id();
            (conn, id)
        };

        conn.register_request(id, mech, callback);
        if let Err(e) = conn.send(&encode_request_new(id, protocol, mech)).await {
            warn!(path = %conn.path().display(), %e, "NEW frame send failed");
            self.teardown(&conn).await;
        }
        Ok(AuthRequestHandle { id, conn })
    }

    /// Feed client input to an in-flight exchange
    ///
    /// A send failure tears down the whole connection, aborting every
    /// pending request on it (this one included).
    pub async fn continue_request(self: &Arc<Self>, handle: &AuthRequestHandle, data: &[u8]) {
        let frame = encode_request_continue(handle.id, data);
        if let Err(e) = handle.conn.send(&frame).await {
            warn!(path = %handle.conn.path().display(), %e, "CONTINUE frame send failed");
            self.teardown(&handle.conn).await;
        }
    }

    /// Abandon an exchange the caller no longer cares about
    ///
    /// Removes the request from its connection's table; the worker is not
    /// told and will log its next reply for this id as an unknown id.
    pub fn abort_request(&self, handle: AuthRequestHandle) {
        handle.conn.remove_request(handle.id);
    }

    /// Scan the socket directory and connect to unrepresented workers
    ///
    /// Clears the reconnect flag up front; any failure along the way sets
    /// it again so the timer retries.
    pub async fn scan_sockets(self: &Arc<Self>) {
        self.inner.lock().auth_reconnect = false;
        let entries = match std::fs::read_dir(&self.socket_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.socket_dir.display(), %e, "cannot scan auth socket directory");
                self.inner.lock().auth_reconnect = true;
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_socket(&path) || self.has_connection(&path) {
                continue;
            }
            self.connect(path).await;
        }
    }

    fn has_connection(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .connections
            .iter()
            .any(|conn| conn.path() == path)
    }

    async fn connect(self: &Arc<Self>, path: PathBuf) {
        let stream = match UnixStream::connect(&path).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(path = %path.display(), %e, "cannot connect to auth worker");
                self.inner.lock().auth_reconnect = true;
                return;
            }
        };
        let (read_half, write_half) = stream.into_split();
        let conn = AuthConnection::new(path.clone(), write_half);

        // the handshake goes out before the connection counts as live
        if let Err(e) = conn.send(&encode_handshake_input(self.client_pid)).await {
            warn!(path = %path.display(), %e, "handshake send failed");
            self.inner.lock().auth_reconnect = true;
            return;
        }

        {
            let mut inner = self.inner.lock();
            inner.connections.push(Arc::clone(&conn));
            inner.waiting_handshake_count += 1;
        }
        debug!(path = %path.display(), "auth worker connection opened");
        tokio::spawn(run_connection(Arc::clone(self), conn, read_half));
    }

    fn spawn_rescan_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.rescan_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately; the scan already ran
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                if registry.inner.lock().auth_reconnect {
                    registry.scan_sockets().await;
                }
            }
        });
    }

    fn on_handshake(&self, conn: &Arc<AuthConnection>, handshake: HandshakeOutput) {
        let mut inner = self.inner.lock();
        inner.waiting_handshake_count = inner.waiting_handshake_count.saturating_sub(1);
        inner.available_mechs |= handshake.mechanisms;
        info!(
            path = %conn.path().display(),
            pid = handshake.pid,
            mechs = ?handshake.mechanisms,
            "auth worker ready"
        );
    }

    /// Destroy a connection and abort everything in flight on it
    ///
    /// Idempotent: only the first caller runs the teardown. Detaches the
    /// connection from the registry (dropping the registry's strong
    /// count), recomputes the mechanism union, schedules a reconnect, and
    /// invokes every pending continuation with a null reply. Caller-held
    /// request handles keep the object alive until they are released.
    pub(crate) async fn teardown(&self, conn: &Arc<AuthConnection>) {
        if !conn.mark_dead() {
            return;
        }
        conn.close_writer().await;
        {
            let mut inner = self.inner.lock();
            inner.connections.retain(|c| !Arc::ptr_eq(c, conn));
            if !conn.handshake_received() {
                inner.waiting_handshake_count = inner.waiting_handshake_count.saturating_sub(1);
            }
            inner.available_mechs = inner
                .connections
                .iter()
                .filter(|c| c.handshake_received())
                .fold(MechSet::empty(), |acc, c| acc | c.mechanisms());
            inner.auth_reconnect = true;
        }
        conn.abort_pending();
    }
}

fn is_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path).is_ok_and(|meta| meta.file_type().is_socket())
}

/// Per-connection reader: pump the worker stream into the state machine
async fn run_connection(
    registry: Arc<AuthRegistry>,
    conn: Arc<AuthConnection>,
    mut read_half: OwnedReadHalf,
) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match read_half.read(&mut chunk).await {
            Ok(0) => {
                debug!(path = %conn.path().display(), "auth worker disconnected");
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                match conn.handle_input(&mut pending) {
                    Ok(Some(handshake)) => registry.on_handshake(&conn, handshake),
                    Ok(None) => {}
                    Err(reason) => {
                        warn!(path = %conn.path().display(), %reason, "auth worker protocol violation");
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(path = %conn.path().display(), %e, "auth worker read failed");
                break;
            }
        }
    }
    registry.teardown(&conn).await;
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::mpsc;

    use super::AuthRegistry;
    use crate::auth_conn::{AuthReply, ReplyCallback};
    use crate::auth_proto::{
        AuthStatus, MechSet, Mechanism, PROTOCOL_IMAP, REQUEST_TYPE_CONTINUE, REQUEST_TYPE_NEW,
        encode_handshake_output, encode_reply,
    };
    use crate::config::Config;
    use crate::errors::AuthError;

    fn test_config(dir: &Path) -> Config {
        Config {
            auth_socket_dir: dir.to_path_buf(),
            auth_reconnect_interval_ms: 50,
            ..Config::default()
        }
    }

    fn reply_channel() -> (ReplyCallback, mpsc::UnboundedReceiver<Option<AuthReply>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: ReplyCallback = Box::new(move |reply| {
            let _ = tx.send(reply.cloned());
        });
        (callback, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Option<AuthReply>>) -> Option<AuthReply> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("callback within deadline")
            .expect("channel open")
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    /// Accept one connection and complete the worker side of the handshake
    async fn accept_and_handshake(listener: &UnixListener, mechs: MechSet) -> UnixStream {
        let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("accept within deadline")
            .expect("accept");
        let mut client_hello = [0u8; 4];
        stream
            .read_exact(&mut client_hello)
            .await
            .expect("client handshake");
        assert_eq!(u32::from_le_bytes(client_hello), std::process::id());
        stream
            .write_all(&encode_handshake_output(4242, mechs))
            .await
            .expect("worker handshake");
        stream
    }

    /// Read a NEW frame and return its request id
    async fn read_new_frame(stream: &mut UnixStream) -> u32 {
        let mut frame = [0u8; 10];
        stream.read_exact(&mut frame).await.expect("NEW frame");
        assert_eq!(frame[0], REQUEST_TYPE_NEW);
        assert_eq!(frame[5], PROTOCOL_IMAP);
        u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]])
    }

    #[tokio::test]
    async fn plain_login_flow_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let listener = UnixListener::bind(dir.path().join("auth-worker")).expect("bind");

        let registry = AuthRegistry::new(&test_config(dir.path()));
        let scan = registry.init();
        let (mut worker, ()) = tokio::join!(accept_and_handshake(&listener, MechSet::PLAIN), scan);
        wait_until(|| registry.is_connected()).await;
        assert_eq!(registry.available_mechs(), MechSet::PLAIN);

        let (callback, mut rx) = reply_channel();
        let handle = registry
            .init_request(Mechanism::Plain, PROTOCOL_IMAP, callback)
            .await
            .expect("init_request");
        assert_ne!(handle.id(), 0);

        let id = read_new_frame(&mut worker).await;
        assert_eq!(id, handle.id());
        worker
            .write_all(&encode_reply(id, AuthStatus::Ok, b"user=test"))
            .await
            .expect("reply");

        let reply = recv(&mut rx).await.expect("terminal reply");
        assert_eq!(reply.status, AuthStatus::Ok);
        assert_eq!(reply.data, b"user=test");
        wait_until(|| handle.conn.pending_count() == 0).await;

        // a mechanism nobody advertises is rejected up front
        let (callback, _rx) = reply_channel();
        let err = registry
            .init_request(Mechanism::CramMd5, PROTOCOL_IMAP, callback)
            .await
            .expect_err("unsupported mechanism");
        assert_eq!(err, AuthError::UnsupportedMechanism);
    }

    #[tokio::test]
    async fn continue_round_trip_keeps_request_alive() {
        let dir = TempDir::new().expect("tempdir");
        let listener = UnixListener::bind(dir.path().join("auth-worker")).expect("bind");

        let registry = AuthRegistry::new(&test_config(dir.path()));
        let (mut worker, ()) =
            tokio::join!(accept_and_handshake(&listener, MechSet::PLAIN), registry.init());
        wait_until(|| registry.is_connected()).await;

        let (callback, mut rx) = reply_channel();
        let handle = registry
            .init_request(Mechanism::Plain, PROTOCOL_IMAP, callback)
            .await
            .expect("init_request");
        let id = read_new_frame(&mut worker).await;

        worker
            .write_all(&encode_reply(id, AuthStatus::Continue, b"challenge"))
            .await
            .expect("challenge");
        let reply = recv(&mut rx).await.expect("continue reply");
        assert_eq!(reply.status, AuthStatus::Continue);
        assert_eq!(handle.conn.pending_count(), 1);

        registry.continue_request(&handle, b"response").await;
        let mut header = [0u8; 9];
        worker.read_exact(&mut header).await.expect("CONTINUE frame");
        assert_eq!(header[0], REQUEST_TYPE_CONTINUE);
        assert_eq!(u32::from_le_bytes([header[1], header[2], header[3], header[4]]), id);
        let len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
        let mut payload = vec![0u8; len];
        worker.read_exact(&mut payload).await.expect("payload");
        assert_eq!(payload, b"response");

        worker
            .write_all(&encode_reply(id, AuthStatus::Ok, b""))
            .await
            .expect("final reply");
        let reply = recv(&mut rx).await.expect("terminal reply");
        assert_eq!(reply.status, AuthStatus::Ok);
        wait_until(|| handle.conn.pending_count() == 0).await;
    }

    #[tokio::test]
    async fn worker_death_aborts_pending_requests_with_null_reply() {
        let dir = TempDir::new().expect("tempdir");
        let listener = UnixListener::bind(dir.path().join("auth-worker")).expect("bind");

        let registry = AuthRegistry::new(&test_config(dir.path()));
        let (mut worker, ()) =
            tokio::join!(accept_and_handshake(&listener, MechSet::PLAIN), registry.init());
        wait_until(|| registry.is_connected()).await;

        let (callback, mut rx) = reply_channel();
        let handle = registry
            .init_request(Mechanism::Plain, PROTOCOL_IMAP, callback)
            .await
            .expect("init_request");
        read_new_frame(&mut worker).await;

        drop(worker);
        assert_eq!(recv(&mut rx).await, None);
        wait_until(|| registry.connection_count() == 0).await;
        assert!(!registry.is_connected());

        // every auth object is freed once the caller lets go
        let conn_ref = std::sync::Arc::downgrade(&handle.conn);
        drop(handle);
        wait_until(move || conn_ref.upgrade().is_none()).await;
    }

    #[tokio::test]
    async fn saturated_workers_report_busy() {
        let dir = TempDir::new().expect("tempdir");
        let listener = UnixListener::bind(dir.path().join("auth-worker")).expect("bind");

        let mut config = test_config(dir.path());
        config.auth_max_pending = 1;
        let registry = AuthRegistry::new(&config);
        let (_worker, ()) =
            tokio::join!(accept_and_handshake(&listener, MechSet::PLAIN), registry.init());
        wait_until(|| registry.is_connected()).await;

        let (callback, _rx1) = reply_channel();
        let first = registry
            .init_request(Mechanism::Plain, PROTOCOL_IMAP, callback)
            .await
            .expect("first request");

        let (callback, _rx2) = reply_channel();
        let err = registry
            .init_request(Mechanism::Plain, PROTOCOL_IMAP, callback)
            .await
            .expect_err("saturated");
        assert_eq!(err, AuthError::AllWorkersBusy);

        // aborting frees the slot for the next request
        registry.abort_request(first);
        let (callback, _rx3) = reply_channel();
        registry
            .init_request(Mechanism::Plain, PROTOCOL_IMAP, callback)
            .await
            .expect("slot freed");
    }

    #[tokio::test]
    async fn no_worker_at_all_schedules_reconnect() {
        let dir = TempDir::new().expect("tempdir");
        let registry = AuthRegistry::new(&test_config(dir.path()));
        registry.init().await;

        let (callback, _rx) = reply_channel();
        let err = registry
            .init_request(Mechanism::Plain, PROTOCOL_IMAP, callback)
            .await
            .expect_err("no workers");
        assert_eq!(err, AuthError::NoConnectedWorker);
        assert!(!registry.is_connected());

        // a worker socket appearing later is picked up by the rescan timer
        let listener = UnixListener::bind(dir.path().join("late-worker")).expect("bind");
        let (_worker, ()) = tokio::join!(accept_and_handshake(&listener, MechSet::PLAIN), async {
            wait_until(|| registry.connection_count() == 1).await;
        });
        wait_until(|| registry.is_connected()).await;
        assert_eq!(registry.available_mechs(), MechSet::PLAIN);
    }

    #[tokio::test]
    async fn oversized_handshake_kills_the_connection() {
        let dir = TempDir::new().expect("tempdir");
        let listener = UnixListener::bind(dir.path().join("auth-worker")).expect("bind");

        let registry = AuthRegistry::new(&test_config(dir.path()));
        let accept = async {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut client_hello = [0u8; 4];
            stream.read_exact(&mut client_hello).await.expect("hello");
            stream
                .write_all(&[0u8; 12])
                .await
                .expect("oversized handshake");
            stream
        };
        let (_worker, ()) = tokio::join!(accept, registry.init());

        wait_until(|| registry.connection_count() == 0).await;
        assert!(!registry.is_connected());
    }

    #[tokio::test]
    async fn request_ids_are_unique_and_never_zero() {
        let dir = TempDir::new().expect("tempdir");
        let listener = UnixListener::bind(dir.path().join("auth-worker")).expect("bind");

        let registry = AuthRegistry::new(&test_config(dir.path()));
        let (_worker, ()) =
            tokio::join!(accept_and_handshake(&listener, MechSet::PLAIN), registry.init());
        wait_until(|| registry.is_connected()).await;

        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let (callback, _rx) = reply_channel();
            let handle = registry
                .init_request(Mechanism::Plain, PROTOCOL_IMAP, callback)
                .await
                .expect("request");
            assert_ne!(handle.id(), 0);
            assert!(seen.insert(handle.id()), "duplicate id {}", handle.id());
            registry.abort_request(handle);
        }
    }

    #[test]
    fn id_counter_skips_zero_on_wrap() {
        let mut inner = super::RegistryInner {
            connections: Vec::new(),
            request_id_counter: u32::MAX,
            auth_reconnect: false,
            waiting_handshake_count: 0,
            available_mechs: MechSet::empty(),
        };
        assert_eq!(inner.allocate_request_id(), 1);
        assert_eq!(inner.allocate_request_id(), 2);
    }

    #[tokio::test]
    async fn connection_in_handshake_is_not_connected_yet() {
        let dir = TempDir::new().expect("tempdir");
        let listener = UnixListener::bind(dir.path().join("auth-worker")).expect("bind");

        let registry = AuthRegistry::new(&test_config(dir.path()));
        let accept = async {
            let (stream, _) = listener.accept().await.expect("accept");
            stream // accepted but silent: no worker handshake
        };
        let (_worker, ()) = tokio::join!(accept, registry.init());

        assert_eq!(registry.connection_count(), 1);
        assert!(!registry.is_connected());

        // the silent worker advertises nothing either
        let (callback, _rx) = reply_channel();
        let err = registry
            .init_request(Mechanism::Plain, PROTOCOL_IMAP, callback)
            .await
            .expect_err("not ready");
        assert_eq!(err, AuthError::UnsupportedMechanism);
    }
}
