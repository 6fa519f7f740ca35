//! The flow record: socket, transfer blocks and lifecycle state.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use socket2::{SockAddr, Socket};
use tracing::{debug, trace};

use crate::error::{FlowError, Result};
use crate::platform::{PlatformCapabilities, TcpInfoSnapshot};
use crate::resolver::ResolvedSocket;
use crate::settings::{FlowSettings, SourceSettings};

/// Identifier handed to the control plane. Assigned from a monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(u32);

impl FlowId {
    /// Wraps a raw identifier.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw identifier.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a flow while the admission core is responsible for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowState {
    /// Slot reserved, nothing set up.
    Uninitialized,
    /// Settings copied, socket being built.
    AwaitingConnect,
    /// Socket ready, handshake deferred to the transfer phase.
    ConnectPending,
    /// Connect issued.
    Connected,
    /// A setup step failed.
    Failed,
    /// Resources released.
    Destroyed,
}

impl FlowState {
    /// Whether `self -> next` is a legal step.
    pub fn can_transition_to(self, next: FlowState) -> bool {
        use FlowState::*;
        match (self, next) {
            (Uninitialized, AwaitingConnect) => true,
            (AwaitingConnect, ConnectPending) | (AwaitingConnect, Connected) => true,
            (ConnectPending, Connected) => true,
            (Destroyed, _) => false,
            (_, Failed) | (_, Destroyed) => true,
            _ => false,
        }
    }

    /// Whether the flow is fully set up and may be handed to the transfer loop.
    pub fn is_established(self) -> bool {
        matches!(self, FlowState::ConnectPending | FlowState::Connected)
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowState::Uninitialized => "uninitialized",
            FlowState::AwaitingConnect => "awaiting-connect",
            FlowState::ConnectPending => "connect-pending",
            FlowState::Connected => "connected",
            FlowState::Failed => "failed",
            FlowState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Allocates a zeroed block of exactly `size` bytes, reporting exhaustion instead of aborting.
fn allocate_block(size: usize) -> Result<Vec<u8>> {
    let mut block = Vec::new();
    block
        .try_reserve_exact(size)
        .map_err(|e| FlowError::BufferAllocationError {
            size,
            reason: e.to_string(),
        })?;
    block.resize(size, 0);
    Ok(block)
}

/// Writes the repeating 0..=255 pattern used to verify byte ordering.
pub fn fill_byte_counting(block: &mut [u8]) {
    for (i, byte) in block.iter_mut().enumerate() {
        *byte = (i & 0xff) as u8;
    }
}

/// One test flow.
///
/// Owns its socket, both transfer blocks and the resolved peer address. Each
/// is optional until the matching setup step has run, so a flow can be torn
/// down from any point of construction.
pub struct Flow {
    id: FlowId,
    state: FlowState,
    settings: FlowSettings,
    source_settings: SourceSettings,
    socket: Option<Socket>,
    write_block: Option<Box<[u8]>>,
    read_block: Option<Box<[u8]>>,
    peer: Option<SockAddr>,
    resolved_host: Option<String>,
    real_send_buffer_size: usize,
    real_read_buffer_size: usize,
    cc_alg: Option<String>,
    pmtu: Option<u32>,
    connect_called: bool,
    error: Option<String>,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("peer", &self.peer_addr())
            .field("connect_called", &self.connect_called)
            .field("pmtu", &self.pmtu)
            .field("error", &self.error)
            .finish()
    }
}

impl Flow {
    pub(crate) fn new(id: FlowId, settings: FlowSettings, source_settings: SourceSettings) -> Self {
        Self {
            id,
            state: FlowState::Uninitialized,
            settings,
            source_settings,
            socket: None,
            write_block: None,
            read_block: None,
            peer: None,
            resolved_host: None,
            real_send_buffer_size: 0,
            real_read_buffer_size: 0,
            cc_alg: None,
            pmtu: None,
            connect_called: false,
            error: None,
        }
    }

    pub(crate) fn set_state(&mut self, next: FlowState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal flow transition {} -> {}",
            self.state,
            next
        );
        trace!(flow_id = %self.id, from = %self.state, to = %next, "flow state change");
        self.state = next;
    }

    /// Allocates both blocks at `maximum_block_size`, pre-filling the write
    /// block when byte counting is on. On failure nothing is kept.
    pub(crate) fn allocate_buffers(&mut self) -> Result<()> {
        let size = self.settings.maximum_block_size;
        let mut write_block = allocate_block(size)?;
        let read_block = allocate_block(size)?;
        if self.settings.byte_counting {
            fill_byte_counting(&mut write_block);
        }
        self.write_block = Some(write_block.into_boxed_slice());
        self.read_block = Some(read_block.into_boxed_slice());
        Ok(())
    }

    pub(crate) fn attach_socket(&mut self, resolved: ResolvedSocket) {
        self.real_send_buffer_size = resolved.send_buffer_size;
        self.real_read_buffer_size = resolved.read_buffer_size;
        self.resolved_host = Some(resolved.resolved_host);
        self.peer = Some(resolved.peer);
        self.socket = Some(resolved.socket);
    }

    pub(crate) fn set_cc_alg(&mut self, alg: Option<String>) {
        self.cc_alg = alg;
    }

    pub(crate) fn mark_connect_started(&mut self) {
        self.connect_called = true;
    }

    pub(crate) fn mark_connect_issued(&mut self, pmtu: Option<u32>) {
        self.connect_called = true;
        self.pmtu = pmtu;
        self.set_state(FlowState::Connected);
    }

    /// Records `err` on the flow and moves it to [`FlowState::Failed`].
    pub(crate) fn fail(&mut self, err: &FlowError) {
        self.error = Some(err.to_string());
        self.set_state(FlowState::Failed);
    }

    /// Closes the socket and frees every buffer. Safe from any state.
    pub fn destroy(mut self) {
        self.set_state(FlowState::Destroyed);
        let had_socket = self.socket.take().is_some();
        self.write_block = None;
        self.read_block = None;
        self.peer = None;
        debug!(flow_id = %self.id, had_socket, "flow destroyed");
    }

    /// Flow identifier.
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Transfer settings.
    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    /// Source role settings.
    pub fn source_settings(&self) -> &SourceSettings {
        &self.source_settings
    }

    /// Data socket, once created.
    pub fn socket(&self) -> Option<&Socket> {
        self.socket.as_ref()
    }

    /// Block written by the transfer loop.
    pub fn write_block(&self) -> &[u8] {
        self.write_block.as_deref().unwrap_or(&[])
    }

    /// Mutable view of the write block. Its length never changes.
    pub fn write_block_mut(&mut self) -> &mut [u8] {
        self.write_block.as_deref_mut().unwrap_or(&mut [])
    }

    /// Block read into by the transfer loop.
    pub fn read_block(&self) -> &[u8] {
        self.read_block.as_deref().unwrap_or(&[])
    }

    /// Mutable view of the read block. Its length never changes.
    pub fn read_block_mut(&mut self) -> &mut [u8] {
        self.read_block.as_deref_mut().unwrap_or(&mut [])
    }

    /// Resolved peer in `sockaddr` form.
    pub fn peer(&self) -> Option<&SockAddr> {
        self.peer.as_ref()
    }

    /// Resolved peer address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.as_ref().and_then(|p| p.as_socket())
    }

    /// Length of the resolved `sockaddr`.
    pub fn peer_addr_len(&self) -> Option<u32> {
        self.peer.as_ref().map(|p| p.len())
    }

    pub(crate) fn is_ipv6(&self) -> bool {
        self.peer_addr().map(|a| a.is_ipv6()).unwrap_or(false)
    }

    /// Numeric form of the destination that was used.
    pub fn resolved_host(&self) -> Option<&str> {
        self.resolved_host.as_deref()
    }

    /// Effective `SO_SNDBUF`.
    pub fn real_send_buffer_size(&self) -> usize {
        self.real_send_buffer_size
    }

    /// Effective `SO_RCVBUF`.
    pub fn real_read_buffer_size(&self) -> usize {
        self.real_read_buffer_size
    }

    /// Congestion control algorithm in effect, if the platform reports it.
    pub fn cc_alg(&self) -> Option<&str> {
        self.cc_alg.as_deref()
    }

    /// Path MTU recorded when the connect was issued.
    pub fn pmtu(&self) -> Option<u32> {
        self.pmtu
    }

    /// Whether a connect has been issued on the socket.
    pub fn connect_called(&self) -> bool {
        self.connect_called
    }

    /// Last error recorded on the flow.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Current `TCP_INFO` snapshot for the reporting subsystem.
    pub fn tcp_info(&self, caps: &dyn PlatformCapabilities) -> std::io::Result<TcpInfoSnapshot> {
        match &self.socket {
            Some(socket) => caps.tcp_info(socket),
            None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(settings: FlowSettings) -> Flow {
        Flow::new(FlowId::new(7), settings, SourceSettings::new("127.0.0.1", 5999))
    }

    #[test]
    fn test_new_flow_is_empty() {
        let f = flow(FlowSettings::default());
        assert_eq!(f.state(), FlowState::Uninitialized);
        assert!(f.socket().is_none());
        assert!(f.write_block().is_empty());
        assert!(f.peer_addr().is_none());
        assert!(!f.connect_called());
    }

    #[test]
    fn test_byte_counting_pattern() {
        let settings = FlowSettings {
            maximum_block_size: 1000,
            byte_counting: true,
            ..Default::default()
        };
        let mut f = flow(settings);
        f.allocate_buffers().unwrap();
        let block = f.write_block();
        assert_eq!(block.len(), 1000);
        assert_eq!(&block[..3], &[0, 1, 2]);
        assert_eq!(block[255], 255);
        assert_eq!(block[256], 0);
        assert_eq!(block[999], (999 % 256) as u8);
        assert!(f.read_block().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_without_byte_counting_blocks_are_zeroed() {
        let mut f = flow(FlowSettings {
            maximum_block_size: 64,
            ..Default::default()
        });
        f.allocate_buffers().unwrap();
        assert!(f.write_block().iter().all(|&b| b == 0));
        assert_eq!(f.read_block().len(), 64);
    }

    #[test]
    fn test_allocation_failure_keeps_flow_empty() {
        let mut f = flow(FlowSettings {
            maximum_block_size: usize::MAX,
            ..Default::default()
        });
        let err = f.allocate_buffers().unwrap_err();
        assert!(matches!(err, FlowError::BufferAllocationError { .. }));
        assert!(f.write_block().is_empty());
        assert!(f.read_block().is_empty());
    }

    #[test]
    fn test_block_views_keep_length() {
        let mut f = flow(FlowSettings {
            maximum_block_size: 16,
            ..Default::default()
        });
        f.allocate_buffers().unwrap();
        f.read_block_mut()[0] = 9;
        assert_eq!(f.read_block()[0], 9);
        assert_eq!(f.read_block_mut().len(), 16);
    }

    #[test]
    fn test_transitions() {
        use FlowState::*;
        assert!(Uninitialized.can_transition_to(AwaitingConnect));
        assert!(AwaitingConnect.can_transition_to(ConnectPending));
        assert!(AwaitingConnect.can_transition_to(Connected));
        assert!(ConnectPending.can_transition_to(Connected));
        assert!(AwaitingConnect.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Destroyed));
        assert!(!Uninitialized.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(ConnectPending));
        assert!(!Destroyed.can_transition_to(Failed));
        assert!(Connected.is_established());
        assert!(!Failed.is_established());
    }

    #[test]
    fn test_fail_records_error() {
        let mut f = flow(FlowSettings::default());
        f.set_state(FlowState::AwaitingConnect);
        f.fail(&FlowError::InvalidSettings {
            reason: "x".to_string(),
        });
        assert_eq!(f.state(), FlowState::Failed);
        assert!(f.error().unwrap().contains("invalid flow settings"));
        f.destroy();
    }

    #[test]
    fn test_tcp_info_without_socket() {
        let f = flow(FlowSettings::default());
        let caps = crate::platform::NoCapabilities;
        assert!(f.tcp_info(&caps).is_err());
    }
}
