use std::{
    io::{self, Read},
    net::{Shutdown, SocketAddr},
    os::fd::FromRawFd,
    time::Duration,
};

use tracing::debug;

/// Set kernel SO_REUSEADDR on a raw fd.
fn set_reuseaddr(fd: libc::c_int) -> io::Result<()> {
    let val: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&raw const val).cast::<libc::c_void>(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Set IPV6_V6ONLY so the v4 and v6 discovery sockets coexist on one port.
fn set_ipv6_only(fd: libc::c_int) -> io::Result<()> {
    let val: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            (&raw const val).cast::<libc::c_void>(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Binds a UDP socket with SO_REUSEADDR set before bind (and IPV6_V6ONLY for
/// v6 addresses), which std cannot express.
pub fn bind_udp_reuse(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // from_raw_fd before any fallible call so the fd is owned and closed on error
    let socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
    set_reuseaddr(fd)?;

    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from(*v4.ip()).to_be() },
                sin_zero: [0; 8],
            };
            let ret = unsafe {
                libc::bind(
                    fd,
                    (&raw const sin).cast::<libc::sockaddr>(),
                    core::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if ret == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        SocketAddr::V6(v6) => {
            set_ipv6_only(fd)?;
            let mut sin6: libc::sockaddr_in6 = unsafe { core::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr = libc::in6_addr { s6_addr: v6.ip().octets() };
            let ret = unsafe {
                libc::bind(
                    fd,
                    (&raw const sin6).cast::<libc::sockaddr>(),
                    core::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            };
            if ret == -1 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(socket)
}

/// Shuts down the send side, drains whatever the peer still has in flight
/// for a few milliseconds, then fully closes. Keeps the peer from seeing a
/// reset mid-frame.
pub fn graceful_close(mut stream: mio::net::TcpStream) {
    let _ = stream.shutdown(Shutdown::Write);
    let deadline = std::time::Instant::now() + Duration::from_millis(5);
    let mut scratch = [0u8; 1024];
    while std::time::Instant::now() < deadline {
        match stream.read(&mut scratch) {
            Ok(0) => break,
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => {
                debug!(?err, "drain during close");
                break;
            }
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn binds_v4_with_reuseaddr() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let socket = bind_udp_reuse(addr).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn binds_v6_only() {
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0);
        let socket = bind_udp_reuse(addr).unwrap();
        assert!(socket.local_addr().unwrap().is_ipv6());
    }
}
