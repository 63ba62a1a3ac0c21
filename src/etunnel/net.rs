use std::{
    borrow::Cow,
    io,
    net::{IpAddr, Shutdown, SocketAddr, ToSocketAddrs},
};

use tokio::net::TcpStream;

/// Normalize a bind/listen address.
///
/// The shorthand `":PORT"` means "bind on all interfaces". Rust's `SocketAddr`
/// parsing does not accept it, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Splits `host:port` (or `[v6]:port`) into its parts.
///
/// Returns `None` when the port is missing or not a valid `u16`.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.trim().rsplit_once(':')?;
    if host.is_empty() || port.is_empty() {
        return None;
    }
    // A bare IPv6 literal ("::1") has colons but no port.
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host, port))
}

/// Resolves an `address:port` endpoint to the first socket address it names.
pub fn resolve_endpoint(addr: &str) -> io::Result<SocketAddr> {
    let addr = normalize_bind_addr(addr);
    if split_host_port(&addr).is_none() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("expected address:port, got {addr:?}"),
        ));
    }
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{addr} did not resolve to any address"),
        )
    })
}

/// Parses the outbound bind address (`-b`). Brackets around IPv6 are accepted.
pub fn parse_bind_ip(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    let addr = addr
        .strip_prefix('[')
        .and_then(|a| a.strip_suffix(']'))
        .unwrap_or(addr);
    addr.parse().ok()
}

/// Shuts down both directions of a stream. The descriptor itself is released
/// when the last owner drops it.
pub fn close_stream(stream: &TcpStream) {
    // ENOTCONN after a peer reset is expected here.
    let _ = socket2::SockRef::from(stream).shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn split_host_port_requires_port() {
        assert_eq!(split_host_port("127.0.0.1:9000"), Some(("127.0.0.1", 9000)));
        assert_eq!(split_host_port("[::1]:22"), Some(("[::1]", 22)));
        assert_eq!(split_host_port("127.0.0.1"), None);
        assert_eq!(split_host_port("127.0.0.1:"), None);
        assert_eq!(split_host_port("127.0.0.1:http"), None);
        assert_eq!(split_host_port("127.0.0.1:70000"), None);
        assert_eq!(split_host_port("::1"), None);
    }

    #[test]
    fn resolve_endpoint_literal_and_shorthand() {
        let a = resolve_endpoint("127.0.0.1:9001").unwrap();
        assert_eq!(a, "127.0.0.1:9001".parse::<SocketAddr>().unwrap());

        let b = resolve_endpoint(":9000").unwrap();
        assert_eq!(b, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());

        let err = resolve_endpoint("127.0.0.1").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn parse_bind_ip_variants() {
        assert_eq!(parse_bind_ip("10.0.0.1"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(parse_bind_ip("[::1]"), Some("::1".parse().unwrap()));
        assert_eq!(parse_bind_ip("not-an-ip"), None);
    }
}
