//! TCP port checks.

use std::net::TcpListener;
use std::time::Duration;

use tokio::net::TcpStream;

/// A listener on `0.0.0.0:port` cannot be bound.
pub fn port_in_use(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => false,
        Err(e) => e.kind() == std::io::ErrorKind::AddrInUse,
    }
}

/// A TCP connect to `hostport` succeeds within `timeout`.
///
/// Distinguishes "process up but RPC not yet bound" from a down node
/// without issuing an HTTP request.
pub async fn is_rpc_listening(hostport: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(hostport)).await,
        Ok(Ok(_))
    )
}

/// `host:port` from an RPC URL such as `http://127.0.0.1:26657`.
pub fn hostport_from_url(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    if authority.contains(':') {
        authority.to_string()
    } else if url.starts_with("https://") {
        format!("{authority}:443")
    } else {
        format!("{authority}:80")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_port_is_in_use() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).expect("bind ephemeral");
        let port = listener.local_addr().expect("local addr").port();
        assert!(port_in_use(port));
        drop(listener);
        assert!(!port_in_use(port));
    }

    #[tokio::test]
    async fn listening_check_follows_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        assert!(is_rpc_listening(&addr, Duration::from_secs(1)).await);
        drop(listener);
        assert!(!is_rpc_listening(&addr, Duration::from_millis(300)).await);
    }

    #[test]
    fn hostport_parsing() {
        assert_eq!(hostport_from_url("http://127.0.0.1:26657"), "127.0.0.1:26657");
        assert_eq!(hostport_from_url("https://rpc.example.org/x"), "rpc.example.org:443");
        assert_eq!(hostport_from_url("localhost:1"), "localhost:1");
    }
}
