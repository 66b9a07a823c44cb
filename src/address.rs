//! Endpoint resolution and address arithmetic.
//!
//! Resolution goes through the platform resolver (`getaddrinfo` underneath
//! `ToSocketAddrs`); interface enumeration through `getifaddrs`. Endpoints
//! are `std::net::SocketAddr` values; conversion to and from the
//! wire-ordered `sockaddr` forms the kernel consumes lives here so the
//! socket and hook layers never touch byte order themselves.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};

use log::debug;

/// Resolve `host:port` (or `[v6]:port`) to all matching endpoints.
pub fn lookup(host_port: &str) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = host_port.to_socket_addrs()?.collect();
    debug!("lookup {}: {} results", host_port, addrs.len());
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {}", host_port),
        ));
    }
    Ok(addrs)
}

/// Resolve and keep the first result.
pub fn lookup_any(host_port: &str) -> io::Result<SocketAddr> {
    Ok(lookup(host_port)?.remove(0))
}

/// Resolve, preferring an IPv4 result.
pub fn lookup_any_v4(host_port: &str) -> io::Result<SocketAddr> {
    let addrs = lookup(host_port)?;
    Ok(addrs
        .iter()
        .find(|a| a.is_ipv4())
        .copied()
        .unwrap_or(addrs[0]))
}

/// One local interface address with its prefix length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub addr: IpAddr,
    pub prefix_len: u32,
}

/// Enumerate local interface addresses, optionally filtered to one family.
pub fn interface_addresses(v4_only: bool) -> io::Result<Vec<InterfaceAddr>> {
    let mut out = Vec::new();
    for ifa in nix::ifaddrs::getifaddrs().map_err(io::Error::from)? {
        let Some(storage) = ifa.address else { continue };
        if let Some(sin) = storage.as_sockaddr_in() {
            let addr = Ipv4Addr::from(sin.ip());
            let prefix_len = ifa
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|m| {
                    Ipv4Addr::from(m.ip())
                        .octets()
                        .iter()
                        .map(|b| b.count_ones())
                        .sum()
                })
                .unwrap_or(0);
            out.push(InterfaceAddr {
                name: ifa.interface_name.clone(),
                addr: IpAddr::V4(addr),
                prefix_len,
            });
        } else if !v4_only {
            if let Some(sin6) = storage.as_sockaddr_in6() {
                let prefix_len = ifa
                    .netmask
                    .as_ref()
                    .and_then(|m| m.as_sockaddr_in6())
                    .map(|m| {
                        m.ip()
                            .octets()
                            .iter()
                            .map(|b| b.count_ones())
                            .sum()
                    })
                    .unwrap_or(0);
                out.push(InterfaceAddr {
                    name: ifa.interface_name.clone(),
                    addr: IpAddr::V6(sin6.ip()),
                    prefix_len,
                });
            }
        }
    }
    Ok(out)
}

/// Host-order mask with `prefix_len` leading ones.
fn v4_mask(prefix_len: u32) -> u32 {
    match prefix_len {
        0 => 0,
        len if len >= 32 => u32::MAX,
        len => u32::MAX << (32 - len),
    }
}

/// Highest address of the `prefix_len` network containing `addr`.
pub fn broadcast_address(addr: Ipv4Addr, prefix_len: u32) -> Option<Ipv4Addr> {
    if prefix_len > 32 {
        return None;
    }
    Some(Ipv4Addr::from(u32::from(addr) | !v4_mask(prefix_len)))
}

/// Network address of the `prefix_len` network containing `addr`.
pub fn network_address(addr: Ipv4Addr, prefix_len: u32) -> Option<Ipv4Addr> {
    if prefix_len > 32 {
        return None;
    }
    Some(Ipv4Addr::from(u32::from(addr) & v4_mask(prefix_len)))
}

/// Netmask for a prefix length.
pub fn subnet_mask(prefix_len: u32) -> Ipv4Addr {
    Ipv4Addr::from(v4_mask(prefix_len.min(32)))
}

/// Fill a wire-ordered `sockaddr_storage` from an endpoint.
pub(crate) fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                // Octets are already network order.
                (*sin).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Read an endpoint back out of a wire-ordered `sockaddr_storage`.
pub(crate) fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_resolves_loopback() {
        let addrs = lookup("127.0.0.1:8080").unwrap();
        assert_eq!(addrs[0], "127.0.0.1:8080".parse().unwrap());
        assert_eq!(lookup_any("127.0.0.1:80").unwrap().port(), 80);
    }

    #[test]
    fn lookup_parses_bracketed_v6() {
        let addr = lookup_any("[::1]:9000").unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.168.1.20:4242".parse().unwrap();
        let (storage, len) = to_sockaddr(&addr);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        assert_eq!(from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let (storage, _) = to_sockaddr(&addr);
        assert_eq!(from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_port_is_network_order() {
        let addr: SocketAddr = "10.0.0.1:4660".parse().unwrap();
        let (storage, _) = to_sockaddr(&addr);
        let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
        assert_eq!(sin.sin_port, 4660u16.to_be());
    }

    #[test]
    fn subnet_arithmetic() {
        let addr = Ipv4Addr::new(192, 168, 1, 37);
        assert_eq!(
            network_address(addr, 24),
            Some(Ipv4Addr::new(192, 168, 1, 0))
        );
        assert_eq!(
            broadcast_address(addr, 24),
            Some(Ipv4Addr::new(192, 168, 1, 255))
        );
        assert_eq!(subnet_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(subnet_mask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(subnet_mask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(broadcast_address(addr, 33), None);
    }

    #[test]
    fn interfaces_include_loopback() {
        let Ok(ifs) = interface_addresses(true) else {
            return; // restricted environments may refuse getifaddrs
        };
        if !ifs.is_empty() {
            assert!(ifs.iter().any(|i| i.addr.is_loopback() || !i.name.is_empty()));
        }
    }
}
