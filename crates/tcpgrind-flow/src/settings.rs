//! Per-flow settings and the add-flow request/reply exchanged with the control plane.

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::flow::FlowId;

/// Socket option level for raw extra options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionLevel {
    /// `SOL_SOCKET`
    Socket,
    /// `IPPROTO_IP`
    Ip,
    /// `IPPROTO_IPV6`
    Ipv6,
    /// `IPPROTO_TCP`
    Tcp,
}

impl OptionLevel {
    pub(crate) fn as_raw(self) -> libc::c_int {
        match self {
            OptionLevel::Socket => libc::SOL_SOCKET,
            OptionLevel::Ip => libc::IPPROTO_IP,
            OptionLevel::Ipv6 => libc::IPPROTO_IPV6,
            OptionLevel::Tcp => libc::IPPROTO_TCP,
        }
    }
}

/// An integer socket option applied verbatim before connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraSocketOption {
    /// Protocol level.
    pub level: OptionLevel,
    /// Raw option name (platform specific).
    pub name: i32,
    /// Integer value.
    pub value: i32,
}

/// General transfer settings copied into each flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    /// Size of the read and write blocks in bytes.
    pub maximum_block_size: usize,
    /// Requested `SO_RCVBUF`; 0 keeps the kernel default.
    pub requested_read_buffer_size: usize,
    /// Requested `SO_SNDBUF`; 0 keeps the kernel default.
    pub requested_send_buffer_size: usize,
    /// Fill the write block with a 0..=255 counting pattern.
    pub byte_counting: bool,
    /// Congestion control algorithm to select; empty keeps the system default.
    pub cc_alg: String,
    /// Enable `TCP_CORK`.
    pub cork: bool,
    /// Enable `SO_DEBUG`.
    pub so_debug: bool,
    /// Disable Nagle's algorithm (`TCP_NODELAY`).
    pub nonagle: bool,
    /// Differentiated services code point, 0..=63.
    pub dscp: u8,
    /// Force path-MTU discovery (do not fragment).
    pub ipmtudiscover: bool,
    /// Start packet capture for this flow when a capture hook is installed.
    pub traffic_dump: bool,
    /// Raw options applied after the named ones.
    pub extra_socket_options: Vec<ExtraSocketOption>,
    /// Seconds between interim reports (consumed by the transfer loop).
    pub reporting_interval: f64,
    /// Seconds to wait before sending starts (consumed by the transfer loop).
    pub delay: f64,
    /// Seconds to send for (consumed by the transfer loop).
    pub duration: f64,
    /// Target write rate in blocks per second, 0 for unlimited.
    pub write_rate: u64,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            maximum_block_size: 8192,
            requested_read_buffer_size: 0,
            requested_send_buffer_size: 0,
            byte_counting: false,
            cc_alg: String::new(),
            cork: false,
            so_debug: false,
            nonagle: false,
            dscp: 0,
            ipmtudiscover: false,
            traffic_dump: false,
            extra_socket_options: Vec::new(),
            reporting_interval: 0.05,
            delay: 0.0,
            duration: 10.0,
            write_rate: 0,
        }
    }
}

/// Settings specific to the sending side of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Host name or numeric address of the destination daemon's data socket.
    pub destination_host: String,
    /// Destination data port.
    pub destination_port: u16,
    /// Defer the TCP handshake until the transfer phase.
    pub late_connect: bool,
}

impl SourceSettings {
    /// Settings for an eager connect to `host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            destination_host: host.to_string(),
            destination_port: port,
            late_connect: false,
        }
    }
}

/// An "add flow source" request as delivered by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddFlowSourceRequest {
    /// Transfer settings.
    pub settings: FlowSettings,
    /// Source role settings.
    pub source_settings: SourceSettings,
}

impl AddFlowSourceRequest {
    /// Creates a request.
    pub fn new(settings: FlowSettings, source_settings: SourceSettings) -> Self {
        Self {
            settings,
            source_settings,
        }
    }

    /// Rejects requests that cannot produce a flow, before any resource is acquired.
    pub fn validate(&self) -> Result<()> {
        if self.settings.maximum_block_size == 0 {
            return Err(FlowError::InvalidSettings {
                reason: "maximum_block_size must be non-zero".to_string(),
            });
        }
        if self.settings.dscp > 63 {
            return Err(FlowError::InvalidSettings {
                reason: format!("dscp {} exceeds 63", self.settings.dscp),
            });
        }
        if self.source_settings.destination_host.is_empty() {
            return Err(FlowError::InvalidSettings {
                reason: "destination_host is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// What the core reports back for a successfully admitted flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddFlowSourceReply {
    /// Identifier of the new flow.
    pub flow_id: FlowId,
    /// `SO_RCVBUF` actually granted by the kernel.
    pub real_read_buffer_size: usize,
    /// `SO_SNDBUF` actually granted by the kernel.
    pub real_send_buffer_size: usize,
    /// Congestion control algorithm in effect, where the platform reports it.
    pub cc_alg: Option<String>,
    /// Numeric form of the destination address that was used.
    pub resolved_host: String,
    /// Path MTU discovered by an eager connect.
    pub pmtu: Option<u32>,
}
