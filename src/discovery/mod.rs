//! Discovery layer
//!
//! The transport advertises this daemon's reachable endpoints and locates
//! remote peers through a name service. The transport only depends on the
//! [`NameService`] trait; [`MulticastNameService`] is the default
//! implementation, and tests substitute their own.

mod multicast;

pub use multicast::MulticastNameService;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// A peer advertisement received from the network.
///
/// `timer` is the number of seconds the names can be considered valid;
/// zero means the names are gone and should be evicted.
#[derive(Debug, Clone)]
pub struct PeerFound {
    pub bus_addr: String,
    pub guid: String,
    pub names: Vec<String>,
    pub timer: u8,
}

/// Callback fired for every peer advertisement. The name service keeps no
/// name cache of its own; caching and expiry belong to the daemon above.
pub type PeerFoundCallback = Arc<dyn Fn(PeerFound) + Send + Sync>;

/// The endpoints a name service is currently advertising. At most one port
/// per transport instance; the last `set_endpoints` call wins.
#[derive(Debug, Clone, Default)]
pub struct NsEndpoints {
    pub ipv4: Option<IpAddr>,
    pub ipv6: Option<IpAddr>,
    pub port: u16,
}

/// Contract between the TCP transport and its companion name service.
#[async_trait]
pub trait NameService: Send + Sync {
    /// Bring up the service's network activity.
    async fn start(&self) -> Result<()>;

    /// Ask the service to stop. Signals only; never blocks.
    fn stop(&self);

    /// Install or clear the peer-found callback.
    fn set_callback(&self, callback: Option<PeerFoundCallback>);

    /// Run discovery over the named interface (an interface name or an IP
    /// literal).
    async fn open_interface(&self, name_or_addr: &str) -> Result<()>;

    /// Set the advertised endpoints. `None` addresses mean "use whatever
    /// addresses the opened interfaces carry". Only the port of the last
    /// call is advertised.
    fn set_endpoints(&self, ipv4: Option<IpAddr>, ipv6: Option<IpAddr>, port: u16);

    /// What is currently being advertised.
    fn get_endpoints(&self) -> NsEndpoints;

    /// Start advertising a well-known name.
    async fn advertise(&self, name: &str) -> Result<()>;

    /// Retract a well-known name advertisement.
    async fn cancel(&self, name: &str) -> Result<()>;

    /// Ask the network who has names matching `prefix` (`*` wildcard
    /// already appended by the caller).
    async fn locate(&self, prefix: &str) -> Result<()>;
}
