//! UDP multicast name service
//!
//! Announcements are small JSON datagrams on a well-known multicast group:
//! `who_has` asks for names matching a prefix, `is_at` answers (and is also
//! sent unsolicited on advertise/cancel and on a periodic refresh tick).
//! The service keeps no cache of remote names; it forwards everything to
//! the registered callback.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::common::spec::ListenSpec;
use crate::common::{local_interfaces, netif};
use crate::error::{Error, Result};

use super::{NameService, NsEndpoints, PeerFound, PeerFoundCallback};

/// Multicast group and port the name service talks on.
const NS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 37, 41);
const NS_PORT: u16 = 9956;

/// Advertised names are refreshed on this period; receivers treat them as
/// valid for `NS_TTL_SECS`.
const NS_REFRESH: Duration = Duration::from_secs(40);
const NS_TTL_SECS: u8 = 120;

/// Largest announcement datagram we will parse.
const NS_MAX_PACKET: usize = 8 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NsPacket {
    WhoHas {
        guid: String,
        prefixes: Vec<String>,
    },
    IsAt {
        guid: String,
        port: u16,
        names: Vec<String>,
        ttl: u8,
    },
}

struct NsState {
    callback: Option<PeerFoundCallback>,
    advertised: BTreeSet<String>,
    port: u16,
    ipv4_override: Option<IpAddr>,
    ipv6_override: Option<IpAddr>,
    interfaces: BTreeSet<String>,
}

struct NsInner {
    guid: String,
    enable_ipv4: bool,
    enable_ipv6: bool,
    disable_broadcast: bool,
    state: Mutex<NsState>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    stopping: AtomicBool,
    stop: Notify,
}

/// The default [`NameService`] implementation.
pub struct MulticastNameService {
    inner: Arc<NsInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MulticastNameService {
    pub fn new(guid: String, enable_ipv4: bool, enable_ipv6: bool, disable_broadcast: bool) -> Self {
        Self {
            inner: Arc::new(NsInner {
                guid,
                enable_ipv4,
                enable_ipv6,
                disable_broadcast,
                state: Mutex::new(NsState {
                    callback: None,
                    advertised: BTreeSet::new(),
                    port: 0,
                    ipv4_override: None,
                    ipv6_override: None,
                    interfaces: BTreeSet::new(),
                }),
                socket: Mutex::new(None),
                stopping: AtomicBool::new(false),
                stop: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }
}

impl NsInner {
    fn send_socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .clone()
            .ok_or_else(|| Error::Discovery("name service not started".to_string()))
    }

    async fn send_packet(&self, packet: &NsPacket) -> Result<()> {
        let socket = self.send_socket()?;
        let body = serde_json::to_vec(packet)
            .map_err(|e| Error::Discovery(format!("encode announcement: {}", e)))?;

        let group = SocketAddr::V4(SocketAddrV4::new(NS_GROUP_V4, NS_PORT));
        socket.send_to(&body, group).await?;

        if self.enable_ipv4 && !self.disable_broadcast {
            let bcast = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, NS_PORT));
            if let Err(e) = socket.send_to(&body, bcast).await {
                trace!("Broadcast announcement failed: {}", e);
            }
        }
        Ok(())
    }

    async fn send_is_at(&self, names: Vec<String>, ttl: u8, to: Option<SocketAddr>) -> Result<()> {
        let port = self.state.lock().port;
        let packet = NsPacket::IsAt {
            guid: self.guid.clone(),
            port,
            names,
            ttl,
        };
        match to {
            Some(dest) => {
                let body = serde_json::to_vec(&packet)
                    .map_err(|e| Error::Discovery(format!("encode announcement: {}", e)))?;
                self.send_socket()?.send_to(&body, dest).await?;
                Ok(())
            }
            None => self.send_packet(&packet).await,
        }
    }

    async fn run(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; NS_MAX_PACKET];
        let mut refresh = tokio::time::interval(NS_REFRESH);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.stopping.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.stop.notified() => {}
                _ = refresh.tick() => {
                    let names: Vec<String> = self.state.lock().advertised.iter().cloned().collect();
                    if !names.is_empty() {
                        if let Err(e) = self.send_is_at(names, NS_TTL_SECS, None).await {
                            debug!("Periodic advertisement failed: {}", e);
                        }
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => self.handle_packet(&buf[..len], src).await,
                        Err(e) => {
                            warn!("Name service receive error: {}", e);
                        }
                    }
                }
            }
        }
        *self.socket.lock() = None;
        debug!("Name service receive loop exiting");
    }

    async fn handle_packet(&self, body: &[u8], src: SocketAddr) {
        let packet: NsPacket = match serde_json::from_slice(body) {
            Ok(p) => p,
            Err(e) => {
                trace!("Ignoring malformed announcement from {}: {}", src, e);
                return;
            }
        };

        match packet {
            NsPacket::WhoHas { guid, prefixes } => {
                if guid == self.guid {
                    return;
                }
                let matching: Vec<String> = {
                    let state = self.state.lock();
                    state
                        .advertised
                        .iter()
                        .filter(|name| {
                            prefixes
                                .iter()
                                .any(|p| name.starts_with(p.trim_end_matches('*')))
                        })
                        .cloned()
                        .collect()
                };
                if !matching.is_empty() {
                    if let Err(e) = self.send_is_at(matching, NS_TTL_SECS, Some(src)).await {
                        debug!("who_has response to {} failed: {}", src, e);
                    }
                }
            }
            NsPacket::IsAt {
                guid,
                port,
                names,
                ttl,
            } => {
                if guid == self.guid {
                    return;
                }
                let callback = self.state.lock().callback.clone();
                if let Some(callback) = callback {
                    let bus_addr = ListenSpec::for_peer(src.ip(), port).canonical();
                    callback(PeerFound {
                        bus_addr,
                        guid,
                        names,
                        timer: ttl,
                    });
                }
            }
        }
    }

    /// First non-loopback address of the requested family on an opened
    /// interface, for advertising when no explicit endpoint was set.
    fn discovered_addr(&self, want_v4: bool) -> Option<IpAddr> {
        let interfaces = {
            let state = self.state.lock();
            if state.interfaces.is_empty() {
                BTreeSet::from(["*".to_string()])
            } else {
                state.interfaces.clone()
            }
        };
        local_interfaces()
            .into_iter()
            .filter(|nif| !nif.is_loopback)
            .filter(|nif| nif.addr.is_ipv4() == want_v4)
            .find(|nif| interfaces.iter().any(|entry| netif::if_matches(entry, nif)))
            .map(|nif| nif.addr)
    }
}

#[async_trait]
impl NameService for MulticastNameService {
    async fn start(&self) -> Result<()> {
        {
            let task_slot = self.task.lock();
            let running = task_slot
                .as_ref()
                .map(|handle| !handle.is_finished())
                .unwrap_or(false);
            if running {
                return Err(Error::AlreadyStarted);
            }
        }
        self.inner.stopping.store(false, Ordering::SeqCst);

        // SO_REUSEADDR so several daemons on one host can share the
        // announcement port.
        let raw = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        raw.set_reuse_address(true)?;
        raw.set_nonblocking(true)?;
        raw.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, NS_PORT)).into())?;
        let socket = UdpSocket::from_std(raw.into())?;
        socket.join_multicast_v4(NS_GROUP_V4, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_broadcast(!self.inner.disable_broadcast)?;

        let socket = Arc::new(socket);
        *self.inner.socket.lock() = Some(socket.clone());

        let handle = tokio::spawn(self.inner.clone().run(socket));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a stop landing between loop
        // iterations still wakes the next wait.
        self.inner.stop.notify_one();
    }

    fn set_callback(&self, callback: Option<PeerFoundCallback>) {
        self.inner.state.lock().callback = callback;
    }

    async fn open_interface(&self, name_or_addr: &str) -> Result<()> {
        self.inner
            .state
            .lock()
            .interfaces
            .insert(name_or_addr.to_string());
        debug!("Name service running over interface {}", name_or_addr);
        Ok(())
    }

    fn set_endpoints(&self, ipv4: Option<IpAddr>, ipv6: Option<IpAddr>, port: u16) {
        let mut state = self.inner.state.lock();
        state.ipv4_override = ipv4;
        state.ipv6_override = ipv6;
        state.port = port;
    }

    fn get_endpoints(&self) -> NsEndpoints {
        let (ipv4_override, ipv6_override, port) = {
            let state = self.inner.state.lock();
            (state.ipv4_override, state.ipv6_override, state.port)
        };
        NsEndpoints {
            ipv4: ipv4_override.or_else(|| {
                self.inner
                    .enable_ipv4
                    .then(|| self.inner.discovered_addr(true))
                    .flatten()
            }),
            ipv6: ipv6_override.or_else(|| {
                self.inner
                    .enable_ipv6
                    .then(|| self.inner.discovered_addr(false))
                    .flatten()
            }),
            port,
        }
    }

    async fn advertise(&self, name: &str) -> Result<()> {
        self.inner.state.lock().advertised.insert(name.to_string());
        self.inner
            .send_is_at(vec![name.to_string()], NS_TTL_SECS, None)
            .await
    }

    async fn cancel(&self, name: &str) -> Result<()> {
        self.inner.state.lock().advertised.remove(name);
        self.inner.send_is_at(vec![name.to_string()], 0, None).await
    }

    async fn locate(&self, prefix: &str) -> Result<()> {
        self.inner
            .send_packet(&NsPacket::WhoHas {
                guid: self.inner.guid.clone(),
                prefixes: vec![prefix.to_string()],
            })
            .await
    }
}
