//! Upper-layer seams: message router and transport listener
//!
//! The transport does not interpret bus messages and does not cache peer
//! names. Decoded frames are pushed into a [`MessageRouter`]; lifecycle and
//! discovery events are reported to a [`TransportListener`]. Both are
//! consumed as trait objects so the daemon core can be swapped out in tests.

use async_trait::async_trait;

use crate::wire::Message;

/// Transport identification bits carried on discovery events.
pub const TRANSPORT_LOCAL: u16 = 0x0001;
pub const TRANSPORT_BLUETOOTH: u16 = 0x0002;
pub const TRANSPORT_WLAN: u16 = 0x0004;
pub const TRANSPORT_WWAN: u16 = 0x0008;
pub const TRANSPORT_LAN: u16 = 0x0010;
pub const TRANSPORT_ANY: u16 = 0xffff;

/// Traffic class requested by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traffic {
    Messages,
    RawUnreliable,
    RawReliable,
}

/// The subset of session options the transport filters on when asked for
/// its listen addresses.
#[derive(Debug, Clone, Copy)]
pub struct SessionOpts {
    pub traffic: Traffic,
    pub transports: u16,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            traffic: Traffic::Messages,
            transports: TRANSPORT_ANY,
        }
    }
}

/// Consumer of decoded messages arriving on active endpoints.
#[async_trait]
pub trait MessageRouter: Send + Sync {
    /// Deliver one inbound message. `endpoint` is the canonical spec string
    /// of the far side.
    async fn push_message(&self, endpoint: &str, msg: Message);
}

/// Receiver of transport lifecycle and discovery events.
pub trait TransportListener: Send + Sync {
    /// A remote daemon advertised (timer > 0) or retracted (timer == 0)
    /// well-known names reachable at `bus_addr`.
    fn found_names(&self, bus_addr: &str, guid: &str, transport: u16, names: &[String], timer: u8);

    /// An active endpoint went away without a local Disconnect.
    fn bus_connection_lost(&self, connect_spec: &str);
}

/// A router that discards everything. Stands in when the daemon core is not
/// wired up, and in tests that only exercise the transport.
pub struct NullRouter;

#[async_trait]
impl MessageRouter for NullRouter {
    async fn push_message(&self, _endpoint: &str, _msg: Message) {}
}
