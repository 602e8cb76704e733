//! External collaborators consumed by the engine.
//!
//! These are deliberately thin traits: DNS resolution, the block-verify
//! cache, and the host policy predicates live in the embedding process (the
//! session layer, argument parsing, config loading and the listening socket
//! acceptor all live there too) and are injected here as trait objects.

use async_trait::async_trait;
use smol::net::TcpStream;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

/// Resolves `host:port` strings to a dialable address and remembers
/// addresses that recently failed to connect.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, hostport: &str) -> Option<SocketAddr>;

    /// Called after a final dial failure so the embedding process's
    /// block-verify cache can short-circuit later attempts to the same
    /// address. A no-op default is provided for resolvers that don't keep
    /// one.
    fn mark_unreachable(&self, _addr: SocketAddr) {}
}

/// Opens outbound connections, either directly or through a SOCKS proxy.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_direct(&self, addr: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream>;

    /// `proxy` is the SOCKS descriptor's `target_url` (scheme `socks4` or
    /// `socks5`, optional userinfo); `target` is the final `host:port`.
    async fn dial_socks(&self, proxy: &Url, target: &str) -> std::io::Result<TcpStream>;
}

/// Pure host-keyed policy predicates, owned by the embedding process.
pub trait HostPolicy: Send + Sync {
    /// Whether a bare CRLF should be written before requests to this host as
    /// a middlebox evasion. Never applied when forwarding via another HTTP
    /// proxy.
    fn inject_crlf(&self, host: &str) -> bool;

    /// Whether responses from this host should be split into a range-prefetch
    /// pipeline.
    fn inject_range(&self, host: &str) -> bool;
}
