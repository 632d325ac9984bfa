//! Server accept loop
//!
//! One task multiplexes every listening socket plus a wake signal. All
//! listener mutation happens here, driven by the queued requests the public
//! StartListen/StopListen calls leave behind, so wait-set construction never
//! races a socket teardown. The loop never blocks on any individual
//! endpoint's I/O; that is what auth workers and endpoint worker pairs are
//! for.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::common::ListenSpec;

use super::TransportInner;

/// Backlog for new listeners.
const LISTEN_BACKLOG: i32 = 1024;

/// Queued listener mutation, drained by the accept loop.
#[derive(Debug)]
pub(crate) enum ListenRequest {
    Add(ListenSpec),
    Remove(ListenSpec),
}

/// One listening socket. `key` is the spec as requested (and as a later
/// Remove will name it); `bound` carries the actual port after a port-0
/// bind and is what the self-connect check compares against.
struct ListenerEntry {
    key: ListenSpec,
    bound: ListenSpec,
    socket: TcpListener,
}

enum Event {
    /// Woken to drain requests or to observe the stopping flag.
    Wake,
    /// Periodic pass over the authenticating list while it is non-empty,
    /// so slow authenticators are scavenged even without fresh traffic.
    Tick,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
}

/// The accept task body. Owns the listening sockets for its whole life and
/// closes them on the way out; nothing else ever closes a listener.
pub(crate) async fn run(inner: Arc<TransportInner>) {
    debug!("Accept loop starting");

    let mut listeners: Vec<ListenerEntry> = Vec::new();

    while !inner.is_stopping() {
        let event = wait_for_event(&inner, &listeners).await;

        match event {
            Event::Wake => {}
            Event::Tick => inner.scavenge_authenticators(),
            Event::Accepted(Ok((stream, peer))) => inner.admit(stream, peer),
            Event::Accepted(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
            Event::Accepted(Err(e)) => {
                warn!("Error accepting new connection, ignoring: {}", e);
            }
        }

        // Requests are drained after the wait so a Remove enacted here can
        // never pull a socket out from under the wait-set above.
        while let Some(request) = inner.pop_listen_request() {
            match request {
                ListenRequest::Add(spec) => do_start_listen(&inner, &mut listeners, spec).await,
                ListenRequest::Remove(spec) => do_stop_listen(&inner, &mut listeners, &spec),
            }
        }
    }

    // Orderly shutdown closes every listening socket exactly here.
    for entry in listeners.drain(..) {
        debug!("Closing listener {}", entry.bound);
    }
    inner.clear_bound_specs();
    debug!("Accept loop exiting");
}

async fn wait_for_event(inner: &Arc<TransportInner>, listeners: &[ListenerEntry]) -> Event {
    let accept_any = std::future::poll_fn(|cx| {
        for entry in listeners {
            if let Poll::Ready(result) = entry.socket.poll_accept(cx) {
                return Poll::Ready(result);
            }
        }
        Poll::Pending
    });

    let scavenge_due = inner.has_authenticating();
    let tick = inner.auth_timeout() / 4;

    tokio::select! {
        _ = inner.wake_notified() => Event::Wake,
        result = accept_any, if !listeners.is_empty() => Event::Accepted(result),
        _ = tokio::time::sleep(tick), if scavenge_due => Event::Tick,
    }
}

/// Enact one StartListen request. Failures are logged and leave the
/// listener set unchanged; the accept loop itself never dies over them.
async fn do_start_listen(
    inner: &Arc<TransportInner>,
    listeners: &mut Vec<ListenerEntry>,
    spec: ListenSpec,
) {
    if listeners.iter().any(|entry| entry.key == spec) {
        warn!("Already listening on {}", spec);
        return;
    }

    // Discovery runs over the configured interfaces; open them before the
    // socket exists so advertisements can flow as soon as we listen.
    if let Some(ns) = inner.name_service() {
        for entry in inner.interface_entries() {
            if let Err(e) = ns.open_interface(&entry).await {
                warn!("OpenInterface failed for {}: {}", entry, e);
            }
        }
    }

    let socket = match bind_listener(&spec) {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Failed to listen on {}: {}", spec, e);
            return;
        }
    };

    // The spec may have asked for port 0; advertise what the OS picked.
    let port = socket
        .local_addr()
        .map(|addr| addr.port())
        .unwrap_or_else(|_| spec.port());
    let bound = spec.with_port(port);

    info!("Listening on {}", bound);
    inner.add_bound_spec(bound.clone());
    listeners.push(ListenerEntry {
        key: spec,
        bound,
        socket,
    });

    if let Some(ns) = inner.name_service() {
        ns.set_endpoints(None, None, port);
    }
}

/// Enact one StopListen request. Asking to stop a listen that never
/// happened is not an error.
fn do_stop_listen(
    inner: &Arc<TransportInner>,
    listeners: &mut Vec<ListenerEntry>,
    spec: &ListenSpec,
) {
    if let Some(pos) = listeners.iter().position(|entry| entry.key == *spec) {
        let entry = listeners.remove(pos);
        inner.remove_bound_spec(&entry.bound);
        drop(entry.socket);
        info!("Stopped listening on {}", entry.bound);
    }
}

fn bind_listener(spec: &ListenSpec) -> io::Result<TcpListener> {
    let domain = match spec.family() {
        crate::common::Family::Ipv4 => socket2::Domain::IPV4,
        crate::common::Family::Ipv6 => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    // SO_REUSEADDR so a crashed daemon can rebind without waiting out
    // TIME_WAIT.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&spec.socket_addr().into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
