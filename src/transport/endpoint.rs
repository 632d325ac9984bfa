//! Managed TCP endpoints
//!
//! An [`Endpoint`] owns one TCP connection and everything that moves it
//! through its life: the authentication state machine, the socket itself,
//! and (once authenticated) the send/receive worker pair. The transport
//! keeps endpoints on exactly one of two lists at any instant; the record
//! transfers between them under the transport's endpoint-list mutex, never
//! here.
//!
//! Ownership is a strict tree. The record owns the socket and the worker
//! handles; workers hold an `Arc` of the record and drop it on exit. The
//! socket is closed in exactly one place: wherever the record (or the auth
//! worker that took the stream out of it) is dropped.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::common::ListenSpec;
use crate::error::{Error, Result};
use crate::wire::{self, Message};

use super::auth;
use super::TransportInner;

/// TCP keepalive probe schedule backing the link timeout.
pub const LINK_TIMEOUT_PROBE_ATTEMPTS: u32 = 1;
pub const LINK_TIMEOUT_PROBE_RESPONSE_DELAY: u32 = 10;
pub const LINK_TIMEOUT_MIN: u32 = 40;

/// Outbound messages queued per endpoint before senders are backpressured.
const SEND_QUEUE_DEPTH: usize = 64;

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Authentication progress of an endpoint.
///
/// Written only by the endpoint's own auth worker (or, for outbound, the
/// connecting caller); read by the accept loop without the list mutex. A
/// stale read merely defers reaping by one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthState {
    Initialized = 0,
    Authenticating = 1,
    Failed = 2,
    Succeeded = 3,
}

struct AtomicAuthState(AtomicU8);

impl AtomicAuthState {
    fn new(state: AuthState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> AuthState {
        match self.0.load(Ordering::SeqCst) {
            0 => AuthState::Initialized,
            1 => AuthState::Authenticating,
            2 => AuthState::Failed,
            _ => AuthState::Succeeded,
        }
    }

    fn store(&self, state: AuthState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// One managed TCP connection.
pub struct Endpoint {
    id: u64,
    direction: Direction,
    peer_addr: IpAddr,
    peer_port: u16,
    connect_spec: String,
    auth_state: AtomicAuthState,
    start_time: Instant,
    sudden_disconnect: AtomicBool,

    /// Abort signal for the auth worker. `notify_one` stores a permit, so
    /// an abort delivered before the worker reaches its select is not lost.
    abort: Notify,

    /// Stop signal for the send/receive pair. Flag first, then broadcast;
    /// workers check the flag after subscribing so the order closes the
    /// subscribe/send race.
    stopped: AtomicBool,
    shutdown: broadcast::Sender<()>,

    stream: Mutex<Option<TcpStream>>,
    auth_task: Mutex<Option<JoinHandle<()>>>,
    tx_queue: Mutex<Option<mpsc::Sender<Message>>>,
    link_timeout: Mutex<Option<Duration>>,
}

impl Endpoint {
    pub(crate) fn new_inbound(id: u64, stream: TcpStream, peer_addr: IpAddr, peer_port: u16) -> Arc<Self> {
        Self::new(id, Direction::Inbound, stream, peer_addr, peer_port)
    }

    pub(crate) fn new_outbound(id: u64, stream: TcpStream, spec: &ListenSpec) -> Arc<Self> {
        Self::new(id, Direction::Outbound, stream, spec.addr(), spec.port())
    }

    fn new(id: u64, direction: Direction, stream: TcpStream, peer_addr: IpAddr, peer_port: u16) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(4);
        Arc::new(Self {
            id,
            direction,
            peer_addr,
            peer_port,
            connect_spec: ListenSpec::for_peer(peer_addr, peer_port).canonical(),
            auth_state: AtomicAuthState::new(AuthState::Initialized),
            start_time: Instant::now(),
            // Any exit of an outbound endpoint is surprising until a local
            // Disconnect says otherwise. Inbound starts quiet and is raised
            // by the receive worker on an unexpected drop.
            sudden_disconnect: AtomicBool::new(direction == Direction::Outbound),
            abort: Notify::new(),
            stopped: AtomicBool::new(false),
            shutdown,
            stream: Mutex::new(Some(stream)),
            auth_task: Mutex::new(None),
            tx_queue: Mutex::new(None),
            link_timeout: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer_addr(&self) -> IpAddr {
        self.peer_addr
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    /// Canonical spec string of the far side.
    pub fn connect_spec(&self) -> &str {
        &self.connect_spec
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth_state.load()
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.auth_state.load() == AuthState::Failed
    }

    pub(crate) fn start_time(&self) -> Instant {
        self.start_time
    }

    /// True while the auth worker might still touch this record. Reaping is
    /// only safe once this goes false.
    pub(crate) fn auth_worker_running(&self) -> bool {
        self.auth_task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub(crate) fn is_sudden_disconnect(&self) -> bool {
        self.sudden_disconnect.load(Ordering::SeqCst)
    }

    pub(crate) fn set_sudden_disconnect(&self, value: bool) {
        self.sudden_disconnect.store(value, Ordering::SeqCst);
    }

    /// Ask a running auth worker to give up. The worker observes this as a
    /// failed handshake and exits with `Failed`; the accept loop reaps it
    /// on a later pass. Harmless if the worker is about to succeed.
    pub(crate) fn abort(&self) {
        self.abort.notify_one();
    }

    /// Ask the send/receive pair to wind down. Signals only; the exit
    /// callback fires from the last worker to go.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Install the link timeout. A positive request is clamped to the
    /// minimum, reduced by the probe margin, and applied as the TCP
    /// keepalive time; the returned value is the effective timeout with the
    /// probe margin added back. Zero disables keepalive probing.
    pub fn set_link_timeout(&self, requested_secs: u32) -> Result<u32> {
        let margin = LINK_TIMEOUT_PROBE_RESPONSE_DELAY * LINK_TIMEOUT_PROBE_ATTEMPTS;
        if requested_secs == 0 {
            *self.link_timeout.lock() = None;
            return Ok(0);
        }
        let effective = requested_secs.max(LINK_TIMEOUT_MIN) - margin;
        let keepalive = Duration::from_secs(effective as u64);
        *self.link_timeout.lock() = Some(keepalive);
        if let Some(stream) = self.stream.lock().as_ref() {
            apply_keepalive(stream, keepalive)?;
        }
        Ok(effective + margin)
    }

    /// Queue a message for transmission.
    pub async fn send(&self, msg: Message) -> Result<()> {
        let sender = self
            .tx_queue
            .lock()
            .clone()
            .ok_or(Error::ConnectionClosed)?;
        sender.send(msg).await.map_err(|_| Error::ConnectionClosed)
    }

    pub(crate) fn take_stream(&self) -> Option<TcpStream> {
        self.stream.lock().take()
    }

    pub(crate) fn put_stream(&self, stream: TcpStream) {
        *self.stream.lock() = Some(stream);
    }

    pub(crate) fn set_auth_state(&self, state: AuthState) {
        self.auth_state.store(state);
    }

    /// Spawn the authentication worker for an inbound endpoint. The worker
    /// owns the socket until it fails (socket dropped with it) or succeeds
    /// (socket handed back for the send/receive pair).
    pub(crate) fn start_authenticator(self: &Arc<Self>, inner: Arc<TransportInner>) {
        let ep = self.clone();
        let handle = tokio::spawn(async move {
            ep.auth_state.store(AuthState::Authenticating);

            let mut stream = match ep.take_stream() {
                Some(stream) => stream,
                None => {
                    ep.auth_state.store(AuthState::Failed);
                    return;
                }
            };

            let handshake = async {
                // The parent wire protocol requires every connection to
                // open with a single zero byte; consume and verify it.
                let mut first = [0u8; 1];
                stream.read_exact(&mut first).await?;
                if first[0] != 0 {
                    return Err(Error::AuthFail(format!(
                        "bad leading byte 0x{:02x}",
                        first[0]
                    )));
                }
                auth::establish_inbound(&mut stream, inner.guid()).await
            };

            let result = tokio::select! {
                _ = ep.abort.notified() => {
                    Err(Error::AuthFail("authentication aborted".to_string()))
                }
                result = handshake => result,
            };

            match result {
                Ok(()) => {
                    ep.put_stream(stream);
                    ep.auth_state.store(AuthState::Succeeded);
                    inner.authenticated(ep.clone());
                }
                Err(e) => {
                    debug!(endpoint = ep.id, peer = %ep.connect_spec, "Authentication failed: {}", e);
                    // Dropping the stream closes the socket; the accept
                    // loop reaps the record once this task is gone.
                    ep.auth_state.store(AuthState::Failed);
                }
            }
        });
        *self.auth_task.lock() = Some(handle);
    }

    /// Start the send/receive worker pair. Called with the record already
    /// on the active list; on error the caller removes it again.
    pub(crate) fn start(self: &Arc<Self>, inner: Arc<TransportInner>) -> Result<()> {
        let stream = self.take_stream().ok_or(Error::ConnectionClosed)?;
        if let Some(keepalive) = *self.link_timeout.lock() {
            apply_keepalive(&stream, keepalive)?;
        }

        let (reader, writer) = stream.into_split();
        let (sender, queue) = mpsc::channel(SEND_QUEUE_DEPTH);
        *self.tx_queue.lock() = Some(sender);

        let ep = self.clone();
        tokio::spawn(async move {
            ep.run_workers(reader, writer, queue, inner).await;
        });
        Ok(())
    }

    async fn run_workers(
        self: Arc<Self>,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        queue: mpsc::Receiver<Message>,
        inner: Arc<TransportInner>,
    ) {
        trace!(endpoint = self.id, peer = %self.connect_spec, "Endpoint workers starting");

        let receive = tokio::spawn(self.clone().receive_worker(reader, inner.clone()));
        let send = tokio::spawn(self.clone().send_worker(writer, queue));

        let _ = receive.await;
        let _ = send.await;

        trace!(endpoint = self.id, peer = %self.connect_spec, "Endpoint workers exited");
        inner.endpoint_exit(self);
    }

    async fn receive_worker(self: Arc<Self>, mut reader: OwnedReadHalf, inner: Arc<TransportInner>) {
        let mut shutdown = self.shutdown.subscribe();
        if self.stop_requested() {
            return;
        }
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                frame = wire::read_frame(&mut reader) => {
                    match frame {
                        Ok(Some(msg)) => {
                            inner.router().push_message(&self.connect_spec, msg).await;
                        }
                        Ok(None) => {
                            if !self.stop_requested() {
                                debug!(endpoint = self.id, peer = %self.connect_spec, "Peer closed connection");
                                self.set_sudden_disconnect(true);
                            }
                            break;
                        }
                        Err(e) => {
                            if !self.stop_requested() {
                                warn!(endpoint = self.id, peer = %self.connect_spec, "Receive error: {}", e);
                                self.set_sudden_disconnect(true);
                            }
                            break;
                        }
                    }
                }
            }
        }
        // Wind down the sibling worker too.
        self.stop();
    }

    async fn send_worker(self: Arc<Self>, mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Message>) {
        let mut shutdown = self.shutdown.subscribe();
        if !self.stop_requested() {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    msg = queue.recv() => {
                        match msg {
                            Some(msg) => {
                                if let Err(e) = wire::write_frame(&mut writer, &msg).await {
                                    if !self.stop_requested() {
                                        warn!(endpoint = self.id, peer = %self.connect_spec, "Send error: {}", e);
                                        self.set_sudden_disconnect(true);
                                    }
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        }
        let _ = writer.shutdown().await;
        self.stop();
    }
}

/// Install a keepalive schedule on the raw socket.
fn apply_keepalive(stream: &TcpStream, time: Duration) -> Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(time)
        .with_interval(Duration::from_secs(LINK_TIMEOUT_PROBE_RESPONSE_DELAY as u64));
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_link_timeout_clamped_and_margined() {
        let (client, _server) = connected_pair().await;
        let ep = Endpoint::new_inbound(1, client, "127.0.0.1".parse().unwrap(), 1234);

        // Below the minimum: clamped to 40, minus margin 10, plus margin back.
        assert_eq!(ep.set_link_timeout(5).unwrap(), 40);
        // Above the minimum: passes through unchanged.
        assert_eq!(ep.set_link_timeout(120).unwrap(), 120);
        // Zero disables.
        assert_eq!(ep.set_link_timeout(0).unwrap(), 0);
        assert!(ep.link_timeout.lock().is_none());
    }

    #[tokio::test]
    async fn test_abort_before_worker_subscribes_is_not_lost() {
        let (client, mut server) = connected_pair().await;
        let ep = Endpoint::new_inbound(2, client, "127.0.0.1".parse().unwrap(), 1234);

        // Abort first, then wait on the stored permit the way the worker does.
        ep.abort();
        ep.abort.notified().await;

        // Keep the far side alive until the assertion ran.
        let _ = server.shutdown().await;
    }

    #[tokio::test]
    async fn test_sudden_disconnect_defaults() {
        let (client, _server) = connected_pair().await;
        let inbound = Endpoint::new_inbound(3, client, "127.0.0.1".parse().unwrap(), 1);
        assert!(!inbound.is_sudden_disconnect());

        let (client, _server) = connected_pair().await;
        let spec = ListenSpec::parse_connect("tcp:addr=127.0.0.1,port=9955").unwrap();
        let outbound = Endpoint::new_outbound(4, client, &spec);
        assert!(outbound.is_sudden_disconnect());
    }
}
