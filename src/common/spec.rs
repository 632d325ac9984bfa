//! Listen/connect spec parsing and normalization
//!
//! A spec is the textual form `tcp:addr=A,port=P,family=F` used by the bus
//! to name a TCP listening or connecting endpoint. Normalization produces a
//! canonical string (key order: addr, family, port) that is byte-compared
//! for equality everywhere in the transport.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

/// Default listen address when the spec omits `addr` (IPv4).
const ADDR4_DEFAULT: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Default listen address when the spec omits `addr` (IPv6).
const ADDR6_DEFAULT: Ipv6Addr = Ipv6Addr::UNSPECIFIED;

/// Default port for listen specs that omit `port`.
pub const PORT_DEFAULT: u16 = 9955;

/// Address family of a spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Ipv4 => "ipv4",
            Family::Ipv6 => "ipv6",
        }
    }

    fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        }
    }

    fn wildcard(&self) -> IpAddr {
        match self {
            Family::Ipv4 => IpAddr::V4(ADDR4_DEFAULT),
            Family::Ipv6 => IpAddr::V6(ADDR6_DEFAULT),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized listen spec.
///
/// Equality is structural, which coincides with byte-equality of the
/// canonical string form. A connect spec is a listen spec whose address is
/// not the wildcard and whose port is non-zero; use [`ListenSpec::parse_connect`]
/// to enforce that.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenSpec {
    addr: IpAddr,
    port: u16,
    family: Family,
}

impl ListenSpec {
    /// Parse and normalize a listen spec.
    ///
    /// `family` is derived from the address literal when absent; `addr`
    /// defaults to the wildcard of the family; `port` defaults to
    /// [`PORT_DEFAULT`]. Port 0 is accepted and means "OS assigns".
    /// Unrecognized keys are parsed and ignored.
    pub fn parse(input: &str) -> Result<Self> {
        Self::parse_inner(input, true)
    }

    /// Parse and normalize a connect spec.
    ///
    /// Identical to [`ListenSpec::parse`] except that the wildcard address
    /// and port 0 are rejected: there is nothing to connect to there.
    pub fn parse_connect(input: &str) -> Result<Self> {
        let spec = Self::parse_inner(input, false)?;
        if spec.addr.is_unspecified() {
            return Err(Error::BadTransportArgs(format!(
                "connect spec must name a concrete address: {}",
                input
            )));
        }
        Ok(spec)
    }

    fn parse_inner(input: &str, listen: bool) -> Result<Self> {
        let rest = input
            .strip_prefix("tcp:")
            .ok_or_else(|| Error::BadTransportArgs(format!("spec must start with tcp: {}", input)))?;

        let mut addr_arg: Option<&str> = None;
        let mut port_arg: Option<&str> = None;
        let mut family_arg: Option<&str> = None;

        for pair in rest.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::BadTransportArgs(format!("expected key=value, got \"{}\"", pair))
            })?;
            match key {
                "addr" => addr_arg = Some(value),
                "port" => port_arg = Some(value),
                "family" => family_arg = Some(value),
                // Unknown keys are tolerated and carry no meaning here.
                _ => {}
            }
        }

        let family_arg = match family_arg {
            Some("ipv4") => Some(Family::Ipv4),
            Some("ipv6") => Some(Family::Ipv6),
            Some(other) => {
                return Err(Error::BadTransportArgs(format!(
                    "unknown address family \"{}\"",
                    other
                )));
            }
            None => None,
        };

        let (addr, family) = match addr_arg {
            Some(literal) => {
                let addr: IpAddr = literal.parse().map_err(|_| {
                    Error::BadTransportArgs(format!("malformed address \"{}\"", literal))
                })?;
                let derived = Family::of(&addr);
                if let Some(requested) = family_arg {
                    if requested != derived {
                        return Err(Error::BadTransportArgs(format!(
                            "family {} contradicts address \"{}\"",
                            requested, literal
                        )));
                    }
                }
                (addr, derived)
            }
            None => {
                let family = family_arg.unwrap_or(Family::Ipv4);
                (family.wildcard(), family)
            }
        };

        let port = match port_arg {
            Some(text) => {
                let port: u32 = text.parse().map_err(|_| {
                    Error::BadTransportArgs(format!("malformed port \"{}\"", text))
                })?;
                if port > u16::MAX as u32 || (!listen && port == 0) {
                    return Err(Error::BadTransportArgs(format!("port {} out of range", port)));
                }
                port as u16
            }
            None => PORT_DEFAULT,
        };

        Ok(Self { addr, port, family })
    }

    /// The wildcard listen spec for a family and port. Used by the connect
    /// path to probe for an implicit self-connect.
    pub fn any(family: Family, port: u16) -> Self {
        Self {
            addr: family.wildcard(),
            port,
            family,
        }
    }

    /// Rebuild this spec with a different port (the port-0 rebind path).
    pub fn with_port(&self, port: u16) -> Self {
        Self { port, ..self.clone() }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    pub fn is_wildcard(&self) -> bool {
        self.addr.is_unspecified()
    }

    /// The canonical string form, `tcp:addr=A,family=F,port=P`.
    pub fn canonical(&self) -> String {
        format!("tcp:addr={},family={},port={}", self.addr, self.family, self.port)
    }

    /// Canonical spec string for a connected peer, used to report the far
    /// side of an endpoint upward.
    pub fn for_peer(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            family: Family::of(&addr),
        }
    }
}

// Display is the canonical form so logging a spec and comparing specs can
// never disagree.
impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults() {
        let spec = ListenSpec::parse("tcp:").unwrap();
        assert_eq!(spec.canonical(), "tcp:addr=0.0.0.0,family=ipv4,port=9955");

        let spec = ListenSpec::parse("tcp:family=ipv6").unwrap();
        assert_eq!(spec.canonical(), "tcp:addr=::,family=ipv6,port=9955");
    }

    #[test]
    fn test_family_derived_from_address() {
        let spec = ListenSpec::parse("tcp:addr=0::0,port=9955").unwrap();
        assert_eq!(spec.family(), Family::Ipv6);

        let spec = ListenSpec::parse("tcp:addr=192.0.2.5").unwrap();
        assert_eq!(spec.family(), Family::Ipv4);
    }

    #[test]
    fn test_family_contradiction_rejected() {
        assert!(ListenSpec::parse("tcp:addr=192.0.2.5,family=ipv6").is_err());
        assert!(ListenSpec::parse("tcp:addr=0::0,family=ipv4").is_err());
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        assert!(ListenSpec::parse("udp:addr=192.0.2.5").is_err());
        assert!(ListenSpec::parse("tcp:addr=not-an-address").is_err());
        assert!(ListenSpec::parse("tcp:port=70000").is_err());
        assert!(ListenSpec::parse("tcp:port=x").is_err());
        assert!(ListenSpec::parse("tcp:garbage").is_err());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let a = ListenSpec::parse("tcp:addr=192.0.2.5,port=80").unwrap();
        let b = ListenSpec::parse("tcp:addr=192.0.2.5,port=80,flavor=mild").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_connect_spec_rejects_wildcard_and_port_zero() {
        assert!(ListenSpec::parse_connect("tcp:addr=0.0.0.0,port=9955").is_err());
        assert!(ListenSpec::parse_connect("tcp:addr=0::0,port=9955").is_err());
        assert!(ListenSpec::parse_connect("tcp:addr=192.0.2.5,port=0").is_err());
        assert!(ListenSpec::parse_connect("tcp:addr=192.0.2.5,port=9955").is_ok());
        // Listen specs are happy with both.
        assert!(ListenSpec::parse("tcp:addr=0.0.0.0,port=0").is_ok());
    }

    #[test]
    fn test_lexically_distinct_specs_normalize_equal() {
        let a = ListenSpec::parse("tcp:port=9955,addr=0::0").unwrap();
        let b = ListenSpec::parse("tcp:family=ipv6").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
    }

    proptest! {
        #[test]
        fn prop_normalize_idempotent(a in any::<IpAddr>(), port in 0u16..=u16::MAX) {
            let spec = ListenSpec::for_peer(a, port);
            let reparsed = ListenSpec::parse(&spec.canonical()).unwrap();
            prop_assert_eq!(&spec, &reparsed);
            prop_assert_eq!(spec.canonical(), reparsed.canonical());
        }

        #[test]
        fn prop_equality_total_on_canonical(a in any::<IpAddr>(), b in any::<IpAddr>(), port in 1u16..=u16::MAX) {
            let x = ListenSpec::for_peer(a, port);
            let y = ListenSpec::for_peer(b, port);
            prop_assert_eq!(x == y, x.canonical() == y.canonical());
        }
    }
}
