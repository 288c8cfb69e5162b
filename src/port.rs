//! Local Port Allocator (design.md §4.2).
//!
//! Returns a `NetworkAddress` whose port the operating system will not hand
//! out again in the short term, so the Supervisor can safely pass it to the
//! SSH client as a `-L` local port.
//!
//! We ask the kernel to assign an ephemeral port *for a connection to this
//! specific hop*: the kernel also considers that port usable for routing
//! toward the hop, which avoids surprises on multi-interface hosts. No
//! retry is performed here if the chosen port gets raced away before the
//! SSH client binds it — that race is accepted (design.md §4.2, §5).

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrStorage};

use crate::error::{Error, Result};
use crate::net::NetworkAddress;

/// Probe `hop` and return the local endpoint the kernel picked for a
/// connection to it. The probing socket is closed before returning;
/// nothing is kept open.
pub fn allocate(hop: &NetworkAddress) -> Result<NetworkAddress> {
    let target = resolve_target(hop)?;

    let fd = connect_with_reuse(target).map_err(|e| Error::HopUnreachable {
        hop: hop.to_string(),
        source: e,
    })?;
    // Wrapping in TcpStream means the socket closes on drop, matching the
    // "close the socket" step once we've read its local address.
    let stream = TcpStream::from(fd);
    let local = stream.local_addr().map_err(|e| Error::HopUnreachable {
        hop: hop.to_string(),
        source: e,
    })?;

    to_network_address(hop, local)
}

fn resolve_target(hop: &NetworkAddress) -> Result<SocketAddr> {
    let dial = format!("{}:{}", hop.host(), hop.port());
    dial.to_socket_addrs()
        .map_err(|e| Error::HopUnreachable {
            hop: hop.to_string(),
            source: e,
        })?
        .next()
        .ok_or_else(|| Error::HopUnreachable {
            hop: hop.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "hop did not resolve to an address"),
        })
}

fn connect_with_reuse(target: SocketAddr) -> io::Result<OwnedFd> {
    let family = if target.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };

    let fd = socket::socket(family, SockType::Stream, SockFlag::empty(), None)
        .map_err(to_io_error)?;
    socket::setsockopt(&fd, socket::sockopt::ReuseAddr, &true).map_err(to_io_error)?;

    let addr = SockaddrStorage::from(target);
    socket::connect(fd.as_raw_fd(), &addr).map_err(to_io_error)?;

    Ok(fd)
}

fn to_io_error(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn to_network_address(hop: &NetworkAddress, local: SocketAddr) -> Result<NetworkAddress> {
    match local {
        SocketAddr::V4(v4) => NetworkAddress::new(v4.ip().to_string(), v4.port())
            .ok_or_else(|| Error::WrongAddressFamily { hop: hop.to_string() }),
        SocketAddr::V6(v6) => NetworkAddress::new(v6.ip().to_string(), v6.port())
            .ok_or_else(|| Error::WrongAddressFamily { hop: hop.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn allocates_a_free_local_port_for_a_reachable_hop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let hop_port = listener.local_addr().unwrap().port();
        let hop = NetworkAddress::new("127.0.0.1", hop_port).unwrap();

        let allocated = allocate(&hop).expect("loopback hop should be reachable");
        assert_eq!(allocated.host(), "127.0.0.1");
        assert_ne!(allocated.port(), 0);
    }

    #[test]
    fn unreachable_hop_fails() {
        // Bind then immediately drop a listener to get a loopback port with
        // nothing behind it: connect() fails fast with ECONNREFUSED rather
        // than needing a multi-minute black-hole timeout.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let hop = NetworkAddress::new("127.0.0.1", dead_port).unwrap();
        let result = allocate(&hop);
        assert!(result.is_err());
    }
}
