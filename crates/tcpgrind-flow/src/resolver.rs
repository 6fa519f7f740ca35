//! Address resolution and the per-candidate socket loop.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use socket2::{SockAddr, Socket};
use tracing::{debug, warn};

use crate::error::{FlowError, Result};
use crate::socket::{BufferRequest, SocketFactory};

/// Turns a host/port pair into candidate socket addresses, in preference order.
pub trait NameResolver: Send + Sync + fmt::Debug {
    /// Resolves `host:port`. An empty list is treated as a resolution failure.
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system's `getaddrinfo`, any address family.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl NameResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok((host, port).to_socket_addrs()?.collect())
    }
}

/// Resolver answering every query with a fixed candidate list.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    addrs: Vec<SocketAddr>,
}

impl StaticResolver {
    /// Creates a resolver that always yields `addrs`, in order.
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }
}

impl NameResolver for StaticResolver {
    fn resolve(&self, _host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(self.addrs.clone())
    }
}

/// Outcome of a successful candidate walk.
#[derive(Debug)]
pub struct ResolvedSocket {
    /// Socket for the chosen candidate.
    pub socket: Socket,
    /// Chosen candidate.
    pub peer_addr: SocketAddr,
    /// Chosen candidate in `sockaddr` form (carries its length).
    pub peer: SockAddr,
    /// Numeric rendering of the candidate's IP.
    pub resolved_host: String,
    /// Effective `SO_SNDBUF`.
    pub send_buffer_size: usize,
    /// Effective `SO_RCVBUF`.
    pub read_buffer_size: usize,
    /// Whether the socket was connected during the walk.
    pub connected: bool,
}

/// Walks resolver candidates until a socket can be created (and optionally connected).
#[derive(Debug, Clone)]
pub struct AddressResolver {
    resolver: std::sync::Arc<dyn NameResolver>,
    factory: SocketFactory,
    connect_timeout: Option<Duration>,
}

impl AddressResolver {
    /// Creates an address resolver on top of `resolver`.
    pub fn new(resolver: std::sync::Arc<dyn NameResolver>) -> Self {
        Self {
            resolver,
            factory: SocketFactory::new(),
            connect_timeout: None,
        }
    }

    /// Bounds each connect attempt made by [`connect_first`](Self::connect_first).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Resolves `host:port` and returns a tuned socket for the first candidate
    /// that can be created, or connected when `do_connect` is set.
    ///
    /// Buffer sizes are negotiated on every candidate before its connect.
    /// Failed candidates are closed and logged; the walk continues.
    pub fn name_to_socket(
        &self,
        host: &str,
        port: u16,
        do_connect: bool,
        buffers: BufferRequest,
    ) -> Result<ResolvedSocket> {
        let candidates = match self.resolver.resolve(host, port) {
            Ok(c) if !c.is_empty() => c,
            Ok(_) => {
                return Err(FlowError::ResolutionError {
                    host: host.to_string(),
                    port,
                    reason: "no address associated with hostname".to_string(),
                })
            }
            Err(e) => {
                return Err(FlowError::ResolutionError {
                    host: host.to_string(),
                    port,
                    reason: e.to_string(),
                })
            }
        };
        debug!(host, port, candidates = candidates.len(), "resolved destination");

        let mut attempts = Vec::with_capacity(candidates.len());
        let mut last_error = None;

        for addr in candidates {
            let negotiated = match self.factory.create(&addr, buffers) {
                Ok(n) => n,
                Err(e) => {
                    warn!(%addr, error = %e, "failed to create socket for candidate");
                    attempts.push(addr);
                    last_error = Some(e);
                    continue;
                }
            };

            let peer = SockAddr::from(addr);
            if do_connect {
                attempts.push(addr);
                let connected = match self.connect_timeout {
                    Some(timeout) => negotiated.socket.connect_timeout(&peer, timeout),
                    None => negotiated.socket.connect(&peer),
                };
                if let Err(e) = connected {
                    warn!(host, port, %addr, error = %e, "Failed to connect");
                    last_error = Some(e);
                    // Dropping `negotiated` closes the candidate socket.
                    continue;
                }
            }

            return Ok(ResolvedSocket {
                socket: negotiated.socket,
                peer_addr: addr,
                peer,
                resolved_host: addr.ip().to_string(),
                send_buffer_size: negotiated.send_buffer_size,
                read_buffer_size: negotiated.read_buffer_size,
                connected: do_connect,
            });
        }

        Err(FlowError::ConnectError {
            host: host.to_string(),
            port,
            attempts,
            source: last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected)),
        })
    }

    /// Resolves `host:port` and connects to the first candidate that accepts.
    pub fn connect_first(&self, host: &str, port: u16, buffers: BufferRequest) -> Result<ResolvedSocket> {
        self.name_to_socket(host, port, true, buffers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;

    fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn test_system_resolver_numeric() {
        let addrs = SystemResolver.resolve("127.0.0.1", 5999).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:5999".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_unresolvable_host() {
        let resolver = AddressResolver::new(Arc::new(SystemResolver));
        let err = resolver
            .name_to_socket("host.invalid", 5999, false, BufferRequest::default())
            .unwrap_err();
        assert!(matches!(err, FlowError::ResolutionError { .. }));
    }

    #[test]
    fn test_empty_candidate_list_is_resolution_error() {
        let resolver = AddressResolver::new(Arc::new(StaticResolver::default()));
        let err = resolver
            .name_to_socket("anything", 1, false, BufferRequest::default())
            .unwrap_err();
        assert!(matches!(err, FlowError::ResolutionError { .. }));
    }

    #[test]
    fn test_unconnected_uses_first_candidate() {
        let first = closed_port();
        let second = closed_port();
        let resolver = AddressResolver::new(Arc::new(StaticResolver::new(vec![first, second])));
        let resolved = resolver
            .name_to_socket("dest", first.port(), false, BufferRequest::default())
            .unwrap();
        assert_eq!(resolved.peer_addr, first);
        assert_eq!(resolved.resolved_host, "127.0.0.1");
        assert!(!resolved.connected);
        assert_eq!(resolved.peer.as_socket(), Some(first));
    }

    #[test]
    fn test_connect_skips_refusing_candidates() {
        let refused = closed_port();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let open = listener.local_addr().unwrap();
        let resolver = AddressResolver::new(Arc::new(StaticResolver::new(vec![refused, open])))
            .with_connect_timeout(Duration::from_secs(2));

        let resolved = resolver
            .connect_first("localhost", open.port(), BufferRequest::default())
            .unwrap();
        assert!(resolved.connected);
        assert_eq!(resolved.peer_addr, open);
        assert_eq!(resolved.resolved_host, "127.0.0.1");
    }

    #[test]
    fn test_connect_exhaustion_reports_all_attempts() {
        let candidates = vec![closed_port(), closed_port(), closed_port()];
        let resolver = AddressResolver::new(Arc::new(StaticResolver::new(candidates.clone())));

        match resolver.connect_first("dest", 1, BufferRequest::default()) {
            Err(FlowError::ConnectError { attempts, source, .. }) => {
                assert_eq!(attempts, candidates);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("expected ConnectError, got {:?}", other),
        }
    }
}
