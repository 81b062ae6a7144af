//! IPv4 endpoint addresses: resolution, ordering, and target formatting.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

/// An IPv4 address and port pair, stored in host byte order.
///
/// Ordering and equality are lexicographic on (address, port), so addresses
/// can key ordered maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Address {
    /// Host address.
    pub address: Ipv4Addr,
    /// Port, host byte order.
    pub port: u16,
}

impl Ipv4Address {
    /// Build from numeric parts.
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    /// Resolve a host name to an address.
    ///
    /// Numeric dotted form is parsed without touching the resolver. A name
    /// that fails to resolve yields the "any" sentinel (`0.0.0.0`) rather
    /// than an error, so callers decide how hard an unreachable host fails.
    pub fn resolve(name: &str, port: u16) -> Self {
        if let Ok(address) = name.parse::<Ipv4Addr>() {
            return Self::new(address, port);
        }
        let address = dns_lookup::lookup_host(name)
            .ok()
            .and_then(|addrs| {
                addrs.into_iter().find_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
            })
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        Self::new(address, port)
    }

    /// The host name of this address, falling back to dotted notation when
    /// reverse resolution fails.
    pub fn hostname(&self) -> String {
        dns_lookup::lookup_addr(&IpAddr::V4(self.address))
            .unwrap_or_else(|_| self.address.to_string())
    }

    /// Render as a connectable target, `tcp:host=<name-or-dotted>;port=<n>`.
    ///
    /// With `resolve_name`, a reverse lookup is attempted for the host part.
    pub fn format(&self, resolve_name: bool) -> String {
        let host = if resolve_name {
            self.hostname()
        } else {
            self.address.to_string()
        };
        format!("tcp:host={host};port={}", self.port)
    }

    /// The std socket address form, for OS calls.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl From<SocketAddrV4> for Ipv4Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_resolution_skips_the_resolver() {
        let addr = Ipv4Address::resolve("192.168.1.7", 4242);
        assert_eq!(addr.address, Ipv4Addr::new(192, 168, 1, 7));
        assert_eq!(addr.port, 4242);
    }

    #[test]
    fn format_without_resolution_round_trips() {
        let addr = Ipv4Address::new(Ipv4Addr::new(10, 0, 0, 1), 31337);
        let formatted = addr.format(false);
        assert_eq!(formatted, "tcp:host=10.0.0.1;port=31337");

        // Parse the rendered form back through the public surface.
        let rest = formatted.strip_prefix("tcp:host=").unwrap();
        let (host, port) = rest.split_once(";port=").unwrap();
        let parsed = Ipv4Address::resolve(host, port.parse().unwrap());
        assert_eq!(parsed, addr);
    }

    #[test]
    fn ordering_is_lexicographic_on_address_then_port() {
        let low = Ipv4Address::new(Ipv4Addr::new(10, 0, 0, 1), 9999);
        let high = Ipv4Address::new(Ipv4Addr::new(10, 0, 0, 2), 1);
        assert!(low < high);
        assert!(
            Ipv4Address::new(Ipv4Addr::new(10, 0, 0, 1), 1)
                < Ipv4Address::new(Ipv4Addr::new(10, 0, 0, 1), 2)
        );
    }
}
