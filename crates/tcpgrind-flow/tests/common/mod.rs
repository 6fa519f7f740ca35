//! Shared fixtures for flow admission integration tests.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};

use tcpgrind_flow::{AddFlowSourceRequest, FlowAdmission, FlowEngineConfig, FlowSettings, SourceSettings};

/// Admission controller with a small registry and a short connect timeout.
pub fn admission(max_flows: usize) -> FlowAdmission {
    let config = FlowEngineConfig {
        max_flows,
        connect_timeout_ms: 2000,
        ..Default::default()
    };
    FlowAdmission::new(config).expect("valid test config")
}

/// Admission controller that keeps sockets blocking after admission, so late
/// connects are bounded by `connect_timeout_ms`.
pub fn blocking_admission(max_flows: usize, connect_timeout_ms: u64) -> FlowAdmission {
    let config = FlowEngineConfig {
        max_flows,
        connect_timeout_ms,
        nonblocking_handoff: false,
        ..Default::default()
    };
    FlowAdmission::new(config).expect("valid test config")
}

/// A loopback listener accepting connections in the kernel backlog.
pub fn listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

/// A loopback address nobody listens on.
pub fn closed_addr() -> SocketAddr {
    let (listener, addr) = listener();
    drop(listener);
    addr
}

/// Eager-connect request to `addr`.
pub fn request(addr: SocketAddr, settings: FlowSettings) -> AddFlowSourceRequest {
    AddFlowSourceRequest::new(settings, SourceSettings::new(&addr.ip().to_string(), addr.port()))
}

/// Late-connect request to `addr`.
pub fn late_request(addr: SocketAddr, settings: FlowSettings) -> AddFlowSourceRequest {
    let mut req = request(addr, settings);
    req.source_settings.late_connect = true;
    req
}
