//! TCP option tuning and connect timing.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockAddr, Socket};
use tracing::{debug, warn};

use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowId, FlowState};
use crate::platform::{setsockopt_int, CapabilitySet, PlatformCapabilities};
use crate::settings::{FlowSettings, SourceSettings};

/// When the TCP handshake happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectTiming {
    /// Connect synchronously during admission.
    Immediate,
    /// Leave the socket unconnected until the transfer phase.
    Late,
}

impl From<&SourceSettings> for ConnectTiming {
    fn from(settings: &SourceSettings) -> Self {
        if settings.late_connect {
            ConnectTiming::Late
        } else {
            ConnectTiming::Immediate
        }
    }
}

fn is_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

/// Applies per-flow socket options and issues connects.
#[derive(Debug, Clone)]
pub struct TcpOptionTuner {
    caps: Arc<dyn PlatformCapabilities>,
    connect_timeout: Duration,
    nonblocking: bool,
}

impl TcpOptionTuner {
    /// Creates a tuner using `caps` for platform-specific options.
    pub fn new(caps: Arc<dyn PlatformCapabilities>, connect_timeout: Duration) -> Self {
        Self {
            caps,
            connect_timeout,
            nonblocking: true,
        }
    }

    /// Whether sockets are non-blocking by the time late connects are issued.
    pub fn with_nonblocking_handoff(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    /// Platform capabilities in use.
    pub fn platform(&self) -> &Arc<dyn PlatformCapabilities> {
        &self.caps
    }

    /// Feature set of the platform.
    pub fn capabilities(&self) -> CapabilitySet {
        self.caps.capabilities()
    }

    /// Applies every option requested in `settings`, in a fixed order.
    ///
    /// Options that were not requested are never touched, so a platform
    /// lacking a feature only fails flows that ask for it.
    pub fn apply(&self, socket: &Socket, settings: &FlowSettings, ipv6: bool) -> Result<()> {
        let fd = socket.as_raw_fd();

        if !settings.cc_alg.is_empty() {
            self.caps
                .set_congestion_control(socket, &settings.cc_alg)
                .map_err(|e| FlowError::option(&format!("TCP_CONGESTION \"{}\"", settings.cc_alg), &e))?;
        }
        if settings.cork {
            self.caps
                .set_cork(socket, true)
                .map_err(|e| FlowError::option("TCP_CORK", &e))?;
        }
        if settings.so_debug {
            setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_DEBUG, 1)
                .map_err(|e| FlowError::option("SO_DEBUG", &e))?;
        }
        if settings.nonagle {
            socket
                .set_nodelay(true)
                .map_err(|e| FlowError::option("TCP_NODELAY", &e))?;
        }
        if settings.dscp != 0 {
            let tos = libc::c_int::from(settings.dscp) << 2;
            let applied = if ipv6 {
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, tos)
            } else {
                setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_TOS, tos)
            };
            applied.map_err(|e| FlowError::option("DSCP", &e))?;
        }
        if settings.ipmtudiscover {
            self.caps
                .set_pmtu_discovery(socket, ipv6)
                .map_err(|e| FlowError::option("IP_MTU_DISCOVER", &e))?;
        }
        for extra in &settings.extra_socket_options {
            setsockopt_int(fd, extra.level.as_raw(), extra.name, extra.value).map_err(|e| {
                FlowError::option(&format!("socket option {:?}/{}", extra.level, extra.name), &e)
            })?;
        }

        Ok(())
    }

    /// Reads back the congestion control algorithm in effect.
    ///
    /// Returns `None` where the platform cannot report it.
    pub fn active_congestion_control(&self, socket: &Socket) -> Result<Option<String>> {
        if !self.caps.capabilities().congestion_control {
            return Ok(None);
        }
        match self.caps.congestion_control(socket) {
            Ok(alg) => Ok(Some(alg)),
            Err(e) => Err(FlowError::OptionApplicationError {
                option: "TCP_CONGESTION".to_string(),
                reason: format!("failed to determine actual congestion control algorithm: {}", e),
            }),
        }
    }

    fn path_mtu(&self, socket: &Socket, ipv6: bool) -> Option<u32> {
        match self.caps.path_mtu(socket, ipv6) {
            Ok(mtu) => Some(mtu),
            Err(e) => {
                debug!(error = %e, "path MTU unavailable");
                None
            }
        }
    }

    /// Connects `flow` synchronously, bounded by the configured timeout, and
    /// records the discovered path MTU.
    pub fn connect_eager(&self, flow: &mut Flow) -> Result<()> {
        let (socket, peer) = match (flow.socket(), flow.peer()) {
            (Some(socket), Some(peer)) => (socket, peer),
            _ => return Err(io::Error::from(io::ErrorKind::NotConnected).into()),
        };
        let addr = flow
            .peer_addr()
            .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?;

        debug!(flow_id = %flow.id(), %addr, "(early) connecting test socket");
        socket
            .connect_timeout(peer, self.connect_timeout)
            .map_err(|source| FlowError::EagerConnectError { addr, source })?;

        let pmtu = self.path_mtu(socket, addr.is_ipv6());
        flow.mark_connect_issued(pmtu);
        Ok(())
    }

    /// Claims the deferred connect of a late-connect flow.
    ///
    /// Runs under the registry lock, so it only copies out what the connect
    /// needs and marks the connect as issued. Returns `None` if a connect was
    /// already issued.
    pub fn begin_late_connect(&self, flow: &mut Flow) -> Result<Option<PendingConnect>> {
        if flow.connect_called() {
            return Ok(None);
        }
        if flow.state() != FlowState::ConnectPending {
            return Err(FlowError::InvalidSettings {
                reason: format!("flow {} is {}, not connect-pending", flow.id(), flow.state()),
            });
        }
        let (socket, peer) = match (flow.socket(), flow.peer()) {
            (Some(socket), Some(peer)) => (socket.try_clone()?, peer.clone()),
            _ => return Err(io::Error::from(io::ErrorKind::NotConnected).into()),
        };
        let addr = peer
            .as_socket()
            .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?;

        flow.mark_connect_started();
        Ok(Some(PendingConnect {
            flow_id: flow.id(),
            host: flow.source_settings().destination_host.clone(),
            port: flow.source_settings().destination_port,
            socket,
            peer,
            addr,
        }))
    }

    /// Issues a claimed late connect. Must be called without the registry
    /// lock held.
    ///
    /// A non-blocking socket counts an in-progress connect as issued; a
    /// blocking one is bounded by the connect timeout. Returns the path MTU
    /// if it could be read.
    pub fn issue_late_connect(&self, pending: &PendingConnect) -> Result<Option<u32>> {
        let PendingConnect {
            flow_id,
            socket,
            peer,
            addr,
            ..
        } = pending;

        let connected = if self.nonblocking {
            match socket.connect(peer) {
                Err(e) if is_in_progress(&e) => Ok(()),
                other => other,
            }
        } else {
            socket.connect_timeout(peer, self.connect_timeout)
        };

        if let Err(source) = connected {
            warn!(%flow_id, %addr, error = %source, "late connect failed");
            return Err(FlowError::ConnectError {
                host: pending.host.clone(),
                port: pending.port,
                attempts: vec![*addr],
                source,
            });
        }

        let pmtu = self.path_mtu(socket, addr.is_ipv6());
        debug!(%flow_id, %addr, ?pmtu, "late connect issued");
        Ok(pmtu)
    }
}

/// A late connect claimed under the registry lock and issued outside it.
#[derive(Debug)]
pub struct PendingConnect {
    flow_id: FlowId,
    host: String,
    port: u16,
    socket: Socket,
    peer: SockAddr,
    addr: SocketAddr,
}

impl PendingConnect {
    /// Flow the connect belongs to.
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Destination address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}
