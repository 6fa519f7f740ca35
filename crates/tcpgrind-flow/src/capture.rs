//! Packet capture start hook.
//!
//! Admission only signals that capture should begin; it never waits for the
//! capture subsystem nor sees its failures.

use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::debug;

use crate::flow::FlowId;

/// What the capture subsystem needs to start dumping a flow's traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Flow being captured.
    pub flow_id: FlowId,
    /// Destination of the flow.
    pub peer: SocketAddr,
}

/// Fire-and-forget capture starter.
pub trait CaptureStarter: Send + Sync + fmt::Debug {
    /// Signals that capture for `request.flow_id` should start.
    fn start_capture(&self, request: CaptureRequest);
}

/// Capture disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCapture;

impl CaptureStarter for NoCapture {
    fn start_capture(&self, _request: CaptureRequest) {}
}

/// Hands capture requests to a capture task over a channel.
#[derive(Debug, Clone)]
pub struct ChannelCapture {
    tx: mpsc::UnboundedSender<CaptureRequest>,
}

impl ChannelCapture {
    /// Creates the starter and the receiving end for the capture task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CaptureRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CaptureStarter for ChannelCapture {
    fn start_capture(&self, request: CaptureRequest) {
        let flow_id = request.flow_id;
        if self.tx.send(request).is_err() {
            debug!(%flow_id, "capture task gone, not capturing flow");
        }
    }
}
