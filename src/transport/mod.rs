//! TCP transport of the bus daemon
//!
//! A daemon both accepts inbound connections from peer daemons and
//! initiates outbound connections to them, so this transport is client and
//! server at once. It owns every TCP endpoint from raw acceptance, through
//! the authentication handshake, into a running send/receive pair, and
//! finally teardown, and it drives the companion name service that makes
//! the daemon discoverable.
//!
//! # Lifecycle
//!
//! ```text
//! Start ──► accept loop task ──► admit ──► auth worker ──► active endpoint
//!   │                                         │                  │
//! Stop  (signals everything, never blocks)    │ Failed           │ exit
//! Join  (waits for the loop, then both lists) ▼                  ▼
//!                                        reaped lazily    endpoint_exit
//! ```
//!
//! Three kinds of tasks coexist: exactly one accept loop while running,
//! one short-lived auth worker per inbound endpoint during its handshake,
//! and a send/receive worker pair per active endpoint. Stop signals; Join
//! waits. The endpoint-list mutex guards both endpoint lists, and a record
//! lives on exactly one of them at any instant.

mod accept;
mod auth;
mod endpoint;

pub use auth::{establish_inbound, establish_outbound, AUTH_MECHANISM};
pub use endpoint::{
    AuthState, Direction, Endpoint, LINK_TIMEOUT_MIN, LINK_TIMEOUT_PROBE_ATTEMPTS,
    LINK_TIMEOUT_PROBE_RESPONSE_DELAY,
};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::{local_interfaces, netif, ListenSpec};
use crate::config::Config;
use crate::discovery::{MulticastNameService, NameService, PeerFound};
use crate::error::{Error, Result};
use crate::router::{
    MessageRouter, SessionOpts, Traffic, TransportListener, TRANSPORT_LAN, TRANSPORT_WLAN,
    TRANSPORT_WWAN,
};

use accept::ListenRequest;

/// Everything the transport reads from configuration.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// How long an inbound connection may authenticate before it is
    /// treated as a denial-of-service attempt.
    pub auth_timeout: Duration,
    /// Cap on concurrently authenticating inbound connections.
    pub max_auth: usize,
    /// Cap on total connections held by this transport.
    pub max_conn: usize,
    /// Name-service interface list (comma separated, `*` wildcard).
    pub interfaces: String,
    pub disable_broadcast: bool,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    /// Globally unique id of this daemon.
    pub guid: String,
}

impl TransportOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            auth_timeout: config.limits.auth_timeout(),
            max_auth: config.limits.max_incomplete_connections_tcp,
            max_conn: config.limits.max_completed_connections_tcp,
            interfaces: config.name_service.interfaces.clone(),
            disable_broadcast: config.name_service.disable_broadcast,
            enable_ipv4: config.name_service.enable_ipv4,
            enable_ipv6: config.name_service.enable_ipv6,
            guid: config
                .guid
                .unwrap_or_else(uuid::Uuid::new_v4)
                .to_string(),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_config(&Config::default_daemon())
    }
}

/// Builds the name service each time the transport starts; Join destroys
/// the instance, so a restart gets a fresh one.
pub type NameServiceFactory = Box<dyn Fn(&TransportOptions) -> Arc<dyn NameService> + Send + Sync>;

/// The TCP transport facade.
///
/// All public operations other than `start`/`stop`/`join` require a running
/// accept loop that has not been asked to stop, and fail with
/// [`Error::TransportNotStarted`] otherwise.
pub struct TcpTransport {
    inner: Arc<TransportInner>,
    ns_factory: NameServiceFactory,
}

pub(crate) struct EndpointLists {
    pub(crate) authenticating: Vec<Arc<Endpoint>>,
    pub(crate) active: Vec<Arc<Endpoint>>,
}

pub(crate) struct TransportInner {
    options: TransportOptions,
    router: Arc<dyn MessageRouter>,

    stopping: AtomicBool,
    wake: Notify,
    accept_task: Mutex<Option<JoinHandle<()>>>,

    /// Guards both endpoint lists; a record moves between them atomically.
    endpoints: Mutex<EndpointLists>,

    /// Listen specs requested and not yet un-requested. Consulted for
    /// duplicate StartListen calls; not necessarily what is bound yet.
    requested_specs: Mutex<Vec<ListenSpec>>,

    /// Queued listener mutations, drained only by the accept loop.
    listen_requests: Mutex<VecDeque<ListenRequest>>,

    /// Specs actually bound right now, mirrored by the accept loop for the
    /// self-connect check. The sockets themselves live in the accept task.
    bound_specs: Mutex<Vec<ListenSpec>>,

    name_service: Mutex<Option<Arc<dyn NameService>>>,
    listener: Mutex<Option<Arc<dyn TransportListener>>>,

    next_endpoint_id: AtomicU64,
}

impl TcpTransport {
    pub fn new(options: TransportOptions, router: Arc<dyn MessageRouter>) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                options,
                router,
                stopping: AtomicBool::new(false),
                wake: Notify::new(),
                accept_task: Mutex::new(None),
                endpoints: Mutex::new(EndpointLists {
                    authenticating: Vec::new(),
                    active: Vec::new(),
                }),
                requested_specs: Mutex::new(Vec::new()),
                listen_requests: Mutex::new(VecDeque::new()),
                bound_specs: Mutex::new(Vec::new()),
                name_service: Mutex::new(None),
                listener: Mutex::new(None),
                next_endpoint_id: AtomicU64::new(1),
            }),
            ns_factory: Box::new(|options| {
                Arc::new(MulticastNameService::new(
                    options.guid.clone(),
                    options.enable_ipv4,
                    options.enable_ipv6,
                    options.disable_broadcast,
                ))
            }),
        }
    }

    /// Substitute the name-service implementation (tests, embedded use).
    pub fn with_name_service(mut self, factory: NameServiceFactory) -> Self {
        self.ns_factory = factory;
        self
    }

    /// Install the upper-layer listener receiving discovery and
    /// connection-lost events.
    pub fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.inner.listener.lock() = Some(listener);
    }

    /// Is the accept loop alive (possibly still winding down)?
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Current `(authenticating, active)` endpoint counts.
    pub fn endpoint_counts(&self) -> (usize, usize) {
        let lists = self.inner.endpoints.lock();
        (lists.authenticating.len(), lists.active.len())
    }

    /// Bring the transport up: create and start the name service, wire its
    /// peer-found callback back to us, then spawn the accept loop.
    pub async fn start(&self) -> Result<()> {
        if self.inner.is_running() {
            warn!("Transport already started");
            return Err(Error::AlreadyStarted);
        }
        // A Join may still be tearing down the previous name service on
        // another task; its presence means start is premature.
        if self.inner.name_service.lock().is_some() {
            warn!("Name service already present");
            return Err(Error::AlreadyStarted);
        }

        self.inner.stopping.store(false, Ordering::SeqCst);

        let ns = (self.ns_factory)(&self.inner.options);
        let weak = Arc::downgrade(&self.inner);
        ns.set_callback(Some(Arc::new(move |found: PeerFound| {
            if let Some(inner) = weak.upgrade() {
                inner.peer_found(found);
            }
        })));
        ns.start().await?;
        *self.inner.name_service.lock() = Some(ns);

        let handle = tokio::spawn(accept::run(self.inner.clone()));
        *self.inner.accept_task.lock() = Some(handle);
        info!("TCP transport started");
        Ok(())
    }

    /// Ask everything to stop. Signals only, never blocks, and is safe to
    /// call any number of times; follow with [`TcpTransport::join`].
    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);

        if let Some(ns) = self.inner.name_service() {
            ns.set_callback(None);
        }

        // Wake the accept loop so it observes the stopping flag.
        self.inner.wake.notify_one();

        {
            let lists = self.inner.endpoints.lock();
            for ep in &lists.authenticating {
                ep.abort();
            }
            for ep in &lists.active {
                // Shutdown we asked for is not sudden.
                ep.set_sudden_disconnect(false);
                ep.stop();
            }
        }

        if let Some(ns) = self.inner.name_service() {
            ns.stop();
        }
    }

    /// Wait until every task the transport owns is gone and both endpoint
    /// lists are empty, then drop the name service.
    pub async fn join(&self) {
        let handle = self.inner.accept_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // An auth worker may still be racing its record from the
        // authenticating list to the active list; that transition must
        // finish before the active list below means anything. The accept
        // loop is gone, so failed records are reaped here instead.
        loop {
            {
                let mut lists = self.inner.endpoints.lock();
                lists
                    .authenticating
                    .retain(|ep| !(ep.is_failed() && !ep.auth_worker_running()));
                if lists.authenticating.is_empty() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Every active endpoint removes itself through the exit callback.
        loop {
            if self.inner.endpoints.lock().active.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Any listen spec never explicitly stopped is cleaned up with the
        // listeners the accept loop just closed, so a restart begins blank.
        self.inner.requested_specs.lock().clear();
        self.inner.listen_requests.lock().clear();

        *self.inner.name_service.lock() = None;
        self.inner.stopping.store(false, Ordering::SeqCst);
        info!("TCP transport joined");
    }

    /// Connect to a remote daemon and authenticate in the calling task.
    ///
    /// Outbound endpoints never visit the authenticating list: the record
    /// goes straight onto the active list before the handshake so a
    /// handshake failure flows through the same removal path an endpoint
    /// error would.
    pub async fn connect(&self, connect_spec: &str) -> Result<Arc<Endpoint>> {
        self.inner.check_started()?;
        let spec = ListenSpec::parse_connect(connect_spec)?;

        self.check_self_connect(&spec)?;

        let stream = TcpStream::connect(spec.socket_addr()).await?;
        stream.set_nodelay(true)?;

        // Every connection opens with a single zero byte on the wire.
        let mut stream = stream;
        stream.write_all(&[0u8]).await?;

        let ep = Endpoint::new_outbound(self.inner.next_id(), stream, &spec);
        {
            let mut lists = self.inner.endpoints.lock();
            if lists.authenticating.len() + lists.active.len() >= self.inner.options.max_conn {
                warn!("AuthFail: connection limit reached, refusing connect to {}", spec);
                return Err(Error::AuthFail("connection limit reached".to_string()));
            }
            lists.active.push(ep.clone());
        }

        ep.set_auth_state(AuthState::Authenticating);
        let handshake = async {
            let mut stream = ep.take_stream().ok_or(Error::ConnectionClosed)?;
            let guid = auth::establish_outbound(&mut stream).await?;
            ep.put_stream(stream);
            Ok::<_, Error>(guid)
        }
        .await;

        match handshake {
            Ok(guid) => {
                ep.set_auth_state(AuthState::Succeeded);
                debug!("Authenticated to remote daemon {} at {}", guid, spec);
                if let Err(e) = ep.start(self.inner.clone()) {
                    self.inner.remove_active(&ep);
                    return Err(e);
                }
                // A Stop since the gate at the top missed this record; take
                // it down so Join is not left waiting on it.
                if self.inner.is_stopping() {
                    ep.set_sudden_disconnect(false);
                    ep.stop();
                }
                Ok(ep)
            }
            Err(e) => {
                ep.set_auth_state(AuthState::Failed);
                self.inner.remove_active(&ep);
                Err(e)
            }
        }
    }

    /// An attempt to connect to an address this daemon is itself listening
    /// on cannot succeed; catch it before a socket is created. Not
    /// failsafe (other processes race us), just a short circuit for the
    /// common cases.
    fn check_self_connect(&self, spec: &ListenSpec) -> Result<()> {
        let any = ListenSpec::any(spec.family(), spec.port());
        let mut wildcard_hit = false;
        {
            let bound = self.inner.bound_specs.lock();
            for entry in bound.iter() {
                if entry == spec {
                    info!("Explicit connection to self on {}", spec);
                    return Err(Error::AlreadyListening);
                }
                if *entry == any {
                    wildcard_hit = true;
                }
            }
        }
        if wildcard_hit {
            // Listening on the any-address and the right port: connecting
            // to any address a local interface carries is a self-connect.
            for nif in local_interfaces() {
                if nif.addr == spec.addr() {
                    info!("Implicit connection to self via {} on {}", nif.name, spec);
                    return Err(Error::AlreadyListening);
                }
            }
        }
        Ok(())
    }

    /// Orderly teardown of the endpoint connected per `connect_spec`.
    pub fn disconnect(&self, connect_spec: &str) -> Result<()> {
        self.inner.check_started()?;
        let spec = ListenSpec::parse_connect(connect_spec)?;

        let found = {
            let lists = self.inner.endpoints.lock();
            lists
                .active
                .iter()
                .find(|ep| ep.peer_addr() == spec.addr() && ep.peer_port() == spec.port())
                .cloned()
        };

        match found {
            Some(ep) => {
                // The endpoint is being taken down on purpose; its exit
                // must not be reported as a lost connection. After stop()
                // the record belongs to the exit path.
                ep.set_sudden_disconnect(false);
                ep.stop();
                Ok(())
            }
            None => Err(Error::BadTransportArgs(format!(
                "no connection matching {}",
                spec
            ))),
        }
    }

    /// Request a new listener. The accept loop enacts it asynchronously.
    pub fn start_listen(&self, listen_spec: &str) -> Result<()> {
        self.inner.check_started()?;
        let spec = ListenSpec::parse(listen_spec)?;

        {
            let mut requested = self.inner.requested_specs.lock();
            if requested.contains(&spec) {
                return Err(Error::AlreadyListening);
            }
            requested.push(spec.clone());
        }

        debug!("Queueing listen request for {}", spec);
        self.inner.queue_listen_request(ListenRequest::Add(spec));
        Ok(())
    }

    /// Request a listener teardown. Stopping a listen that was never
    /// started is not an error; the goal state is already met.
    pub fn stop_listen(&self, listen_spec: &str) -> Result<()> {
        self.inner.check_started()?;
        let spec = ListenSpec::parse(listen_spec)?;

        let was_requested = {
            let mut requested = self.inner.requested_specs.lock();
            match requested.iter().position(|s| s == &spec) {
                Some(pos) => {
                    requested.remove(pos);
                    true
                }
                None => false,
            }
        };

        if was_requested {
            self.inner.queue_listen_request(ListenRequest::Remove(spec));
        }
        Ok(())
    }

    /// Start discovery for names under `name_prefix`. The wildcard is
    /// appended here so callers pass the bare prefix.
    pub async fn enable_discovery(&self, name_prefix: &str) -> Result<()> {
        self.inner.check_started()?;
        let ns = self.inner.name_service().ok_or(Error::TransportNotStarted)?;
        ns.locate(&format!("{}*", name_prefix)).await
    }

    /// Advertise a well-known name as reachable through this daemon.
    pub async fn enable_advertisement(&self, name: &str) -> Result<()> {
        self.inner.check_started()?;
        let ns = self.inner.name_service().ok_or(Error::TransportNotStarted)?;
        ns.advertise(name).await
    }

    /// Retract a well-known name advertisement.
    pub async fn disable_advertisement(&self, name: &str, _name_list_empty: bool) -> Result<()> {
        self.inner.check_started()?;
        let ns = self.inner.name_service().ok_or(Error::TransportNotStarted)?;
        ns.cancel(name).await
    }

    /// The bus addresses a session of the given options could reach us on:
    /// one spec per advertised family per matching UP, non-loopback
    /// interface. Empty when the options don't fit TCP or no listener has
    /// announced a port yet.
    pub fn get_listen_addresses(&self, opts: &SessionOpts) -> Result<Vec<String>> {
        // TCP carries reliable traffic only; no match is not an error, we
        // just have nothing to offer.
        if opts.traffic != Traffic::Messages && opts.traffic != Traffic::RawReliable {
            return Ok(Vec::new());
        }
        if opts.transports & (TRANSPORT_WLAN | TRANSPORT_WWAN | TRANSPORT_LAN) == 0 {
            return Ok(Vec::new());
        }

        let ns = self.inner.name_service().ok_or(Error::TransportNotStarted)?;
        let endpoints = ns.get_endpoints();
        // Port zero means StartListen never announced; no listener, no
        // addresses.
        if endpoints.port == 0 {
            return Ok(Vec::new());
        }

        let entries = self.inner.interface_entries();
        let mut bus_addrs = Vec::new();
        for nif in local_interfaces() {
            if nif.is_loopback {
                continue;
            }
            if !entries.iter().any(|entry| netif::if_matches(entry, &nif)) {
                continue;
            }
            let advertised = match nif.addr {
                std::net::IpAddr::V4(_) => endpoints.ipv4.is_some(),
                std::net::IpAddr::V6(_) => endpoints.ipv6.is_some(),
            };
            if advertised {
                bus_addrs.push(ListenSpec::for_peer(nif.addr, endpoints.port).canonical());
            }
        }
        Ok(bus_addrs)
    }
}

impl TransportInner {
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.accept_task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn check_started(&self) -> Result<()> {
        if !self.is_running() || self.is_stopping() {
            return Err(Error::TransportNotStarted);
        }
        Ok(())
    }

    pub(crate) fn guid(&self) -> &str {
        &self.options.guid
    }

    pub(crate) fn router(&self) -> &Arc<dyn MessageRouter> {
        &self.router
    }

    pub(crate) fn auth_timeout(&self) -> Duration {
        self.options.auth_timeout
    }

    pub(crate) fn wake_notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    pub(crate) fn name_service(&self) -> Option<Arc<dyn NameService>> {
        self.name_service.lock().clone()
    }

    fn next_id(&self) -> u64 {
        self.next_endpoint_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The configured name-service interface list, with any wildcard
    /// collapsing the whole list to `*`.
    pub(crate) fn interface_entries(&self) -> Vec<String> {
        let configured = &self.options.interfaces;
        if configured.trim().is_empty() || configured.contains('*') {
            return vec!["*".to_string()];
        }
        configured
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub(crate) fn queue_listen_request(&self, request: ListenRequest) {
        self.listen_requests.lock().push_back(request);
        self.wake.notify_one();
    }

    pub(crate) fn pop_listen_request(&self) -> Option<ListenRequest> {
        self.listen_requests.lock().pop_front()
    }

    pub(crate) fn add_bound_spec(&self, spec: ListenSpec) {
        self.bound_specs.lock().push(spec);
    }

    pub(crate) fn remove_bound_spec(&self, spec: &ListenSpec) {
        self.bound_specs.lock().retain(|s| s != spec);
    }

    pub(crate) fn clear_bound_specs(&self) {
        self.bound_specs.lock().clear();
    }

    pub(crate) fn has_authenticating(&self) -> bool {
        !self.endpoints.lock().authenticating.is_empty()
    }

    /// Admit one accepted connection, first scavenging the authenticating
    /// list, then checking the caps. Runs on the accept task.
    pub(crate) fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!("Accepting connection from {}", peer);
        let now = Instant::now();
        let mut lists = self.endpoints.lock();

        self.scavenge_locked(&mut lists, now);

        let authenticating = lists.authenticating.len();
        let total = authenticating + lists.active.len();
        if authenticating < self.options.max_auth && total < self.options.max_conn {
            let _ = stream.set_nodelay(true);
            let ep = Endpoint::new_inbound(self.next_id(), stream, peer.ip(), peer.port());
            lists.authenticating.push(ep.clone());
            // Responsibility for the connection now rests with the auth
            // worker until it fails (reaped later) or succeeds (moved to
            // the active list).
            ep.start_authenticator(self.clone());
        } else {
            // Dropping the stream shuts the socket down; the peer sees EOF.
            warn!("AuthFail: no slot for connection from {}", peer);
        }
    }

    /// Periodic scavenging entry used when no connection arrives to
    /// trigger admission.
    pub(crate) fn scavenge_authenticators(self: &Arc<Self>) {
        let now = Instant::now();
        let mut lists = self.endpoints.lock();
        self.scavenge_locked(&mut lists, now);
    }

    fn scavenge_locked(&self, lists: &mut EndpointLists, now: Instant) {
        // Failed authenticators whose worker is gone can be reaped; this
        // lazy pass is how auth workers get cleaned up without the accept
        // loop ever blocking on one.
        lists.authenticating.retain(|ep| {
            if ep.is_failed() && !ep.auth_worker_running() {
                debug!("Scavenging failed authenticator from {}", ep.connect_spec());
                false
            } else {
                true
            }
        });

        // Anyone still authenticating past the deadline is assumed to be a
        // denial-of-service attempt. Abort asks the worker to give up; the
        // record is reaped on a later pass once the worker has exited. If
        // the worker happens to win the race and finishes, that is just a
        // normal success.
        for ep in &lists.authenticating {
            if ep.start_time() + self.options.auth_timeout < now {
                debug!("Scavenging slow authenticator from {}", ep.connect_spec());
                ep.abort();
            }
        }
    }

    /// Called by an auth worker whose handshake succeeded: move the record
    /// to the active list and start its worker pair.
    pub(crate) fn authenticated(self: &Arc<Self>, ep: Arc<Endpoint>) {
        let mut lists = self.endpoints.lock();

        match lists
            .authenticating
            .iter()
            .position(|entry| Arc::ptr_eq(entry, &ep))
        {
            Some(pos) => {
                lists.authenticating.remove(pos);
            }
            None => {
                // Only the failed-start path, the worker itself, and this
                // function remove records from the authenticating list, so
                // a running worker must find itself here.
                error!("Authenticated endpoint missing from authenticating list");
                return;
            }
        }
        lists.active.push(ep.clone());

        if let Err(e) = ep.start(self.clone()) {
            error!("Failed to start endpoint workers: {}", e);
            if let Some(pos) = lists.active.iter().position(|entry| Arc::ptr_eq(entry, &ep)) {
                lists.active.remove(pos);
            }
            return;
        }

        // Stop may have swept both lists while this worker was winning the
        // race against its own Abort; the fresh endpoint missed the sweep,
        // so take it down here or Join would wait on it forever.
        if self.is_stopping() {
            ep.set_sudden_disconnect(false);
            ep.stop();
        }
    }

    /// Exit callback fired by the last worker of an endpoint. Removes the
    /// record and reports upward when the disconnect was not ours.
    pub(crate) fn endpoint_exit(&self, ep: Arc<Endpoint>) {
        debug!("Endpoint {} exited", ep.connect_spec());
        self.remove_active(&ep);

        if ep.is_sudden_disconnect() {
            if let Some(listener) = self.listener.lock().clone() {
                listener.bus_connection_lost(ep.connect_spec());
            }
        }
    }

    fn remove_active(&self, ep: &Arc<Endpoint>) {
        let mut lists = self.endpoints.lock();
        if let Some(pos) = lists.active.iter().position(|entry| Arc::ptr_eq(entry, ep)) {
            lists.active.remove(pos);
        }
    }

    /// Peer advertisement from the name service, forwarded upward tagged
    /// with this transport's mask.
    fn peer_found(&self, found: PeerFound) {
        if let Some(listener) = self.listener.lock().clone() {
            listener.found_names(
                &found.bus_addr,
                &found.guid,
                TRANSPORT_WLAN,
                &found.names,
                found.timer,
            );
        }
    }
}
