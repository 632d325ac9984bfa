//! Nexbus - a federated peer-to-peer message bus daemon
//!
//! # Architecture
//!
//! ```text
//! Transport (TCP accept loop, endpoint lifecycle)
//! → Authentication (per-connection handshake)
//! → Wire (framed messages)
//! → Router (daemon core, consumed as a trait)
//!     ↑
//! Discovery (name service: advertise / locate peers)
//! ```
//!
//! ## Core Principles
//!
//! - The transport owns every socket it creates, from accept to teardown
//! - Upper layers are reached only through traits (MessageRouter,
//!   TransportListener, NameService)
//! - Stop signals, Join waits; no teardown path ever blocks another
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: ListenSpec, interface enumeration
//! ├── wire.rs          # Framed message codec
//! ├── transport/       # TCP transport: accept loop, endpoints, auth
//! ├── discovery/       # Name service trait + multicast implementation
//! └── router.rs        # Upper-layer seams (router, transport listener)
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod discovery;
pub mod router;
pub mod transport;
pub mod wire;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Family, ListenSpec};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use discovery::{MulticastNameService, NameService};
pub use router::{MessageRouter, SessionOpts, Traffic, TransportListener};
pub use transport::{AuthState, Direction, Endpoint, TcpTransport, TransportOptions};
pub use wire::Message;
