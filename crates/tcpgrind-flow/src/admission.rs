//! Flow admission: turns an add-flow-source request into a registered flow.
//!
//! Admission is all-or-nothing. Every resource acquired on the way (slot,
//! blocks, socket, peer address) is owned by a local value until the final
//! commit, so any early return drops them and frees the slot.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::capture::{CaptureRequest, CaptureStarter, NoCapture};
use crate::config::FlowEngineConfig;
use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowId, FlowState};
use crate::platform::{self, PlatformCapabilities};
use crate::registry::FlowRegistry;
use crate::resolver::{AddressResolver, NameResolver, SystemResolver};
use crate::settings::{AddFlowSourceReply, AddFlowSourceRequest};
use crate::socket::BufferRequest;
use crate::tuner::{ConnectTiming, TcpOptionTuner};

/// Entry point for "add flow source" requests.
#[derive(Debug)]
pub struct FlowAdmission {
    config: FlowEngineConfig,
    registry: Arc<FlowRegistry>,
    resolver: AddressResolver,
    tuner: TcpOptionTuner,
    capture: Arc<dyn CaptureStarter>,
}

impl FlowAdmission {
    /// Creates an admission controller with the system resolver, detected
    /// platform capabilities and capture disabled.
    pub fn new(config: FlowEngineConfig) -> Result<Self> {
        config.validate()?;
        let caps = platform::detect(config.probe_capabilities);
        info!(
            platform = caps.name(),
            capabilities = ?caps.capabilities(),
            max_flows = config.max_flows,
            "flow admission ready"
        );
        Ok(Self {
            registry: Arc::new(FlowRegistry::new(config.max_flows)),
            resolver: AddressResolver::new(Arc::new(SystemResolver)),
            tuner: TcpOptionTuner::new(caps, config.connect_timeout())
                .with_nonblocking_handoff(config.nonblocking_handoff),
            capture: Arc::new(NoCapture),
            config,
        })
    }

    /// Replaces the name resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = AddressResolver::new(resolver);
        self
    }

    /// Replaces the platform capability implementation.
    pub fn with_capabilities(mut self, caps: Arc<dyn PlatformCapabilities>) -> Self {
        self.tuner = TcpOptionTuner::new(caps, self.config.connect_timeout())
            .with_nonblocking_handoff(self.config.nonblocking_handoff);
        self
    }

    /// Installs a packet capture starter.
    pub fn with_capture(mut self, capture: Arc<dyn CaptureStarter>) -> Self {
        self.capture = capture;
        self
    }

    /// Flow table shared with the transfer subsystem.
    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    /// Option tuner, used by the transfer phase for late connects.
    pub fn tuner(&self) -> &TcpOptionTuner {
        &self.tuner
    }

    /// Engine configuration.
    pub fn config(&self) -> &FlowEngineConfig {
        &self.config
    }

    /// Admits one source flow.
    ///
    /// On success the flow is live in the registry and the reply carries the
    /// kernel-granted buffer sizes. On failure nothing of the flow remains.
    pub fn add_flow_source(&self, request: &AddFlowSourceRequest) -> Result<AddFlowSourceReply> {
        // A full registry refuses before the request is even looked at.
        // `reserve` below stays the authoritative check.
        if self.registry.is_full() {
            let e = FlowError::CapacityExceeded {
                max: self.registry.capacity(),
            };
            warn!("{}", e);
            return Err(e);
        }
        request.validate()?;

        let reservation = self.registry.reserve().map_err(|e| {
            warn!("{}", e);
            e
        })?;

        let mut flow = reservation.new_flow(request.settings.clone(), request.source_settings.clone());
        flow.set_state(FlowState::AwaitingConnect);

        if let Err(e) = flow.allocate_buffers() {
            error!(flow_id = %flow.id(), error = %e, "could not allocate memory for read/write blocks");
            return Err(abort(flow, e));
        }

        let host = &request.source_settings.destination_host;
        let port = request.source_settings.destination_port;
        let buffers = BufferRequest {
            send: request.settings.requested_send_buffer_size,
            receive: request.settings.requested_read_buffer_size,
        };
        match self.resolver.name_to_socket(host, port, false, buffers) {
            Ok(resolved) => flow.attach_socket(resolved),
            Err(e) => {
                error!(flow_id = %flow.id(), error = %e, "Could not create data socket");
                return Err(abort(flow, e));
            }
        }

        if let Err(e) = self.tune(&mut flow) {
            error!(flow_id = %flow.id(), error = %e, "failed to apply TCP options");
            return Err(abort(flow, e));
        }

        if flow.settings().traffic_dump {
            if let Some(peer) = flow.peer_addr() {
                self.capture.start_capture(CaptureRequest {
                    flow_id: flow.id(),
                    peer,
                });
            }
        }

        match ConnectTiming::from(flow.source_settings()) {
            ConnectTiming::Immediate => {
                if let Err(e) = self.tuner.connect_eager(&mut flow) {
                    error!(flow_id = %flow.id(), error = %e, "early connect failed");
                    return Err(abort(flow, e));
                }
            }
            ConnectTiming::Late => flow.set_state(FlowState::ConnectPending),
        }

        if self.config.nonblocking_handoff {
            let switched = match flow.socket() {
                Some(socket) => socket.set_nonblocking(true),
                None => Ok(()),
            };
            if let Err(e) = switched {
                return Err(abort(flow, FlowError::option("O_NONBLOCK", &e)));
            }
        }

        let reply = AddFlowSourceReply {
            flow_id: flow.id(),
            real_read_buffer_size: flow.real_read_buffer_size(),
            real_send_buffer_size: flow.real_send_buffer_size(),
            cc_alg: flow.cc_alg().map(str::to_string),
            resolved_host: flow.resolved_host().unwrap_or(host).to_string(),
            pmtu: flow.pmtu(),
        };
        let flow_id = reservation.commit(flow);
        debug!(
            %flow_id,
            host = %reply.resolved_host,
            port,
            state = ?self.registry.with_flow(flow_id, |f| f.state()),
            "admitted source flow"
        );
        Ok(reply)
    }

    fn tune(&self, flow: &mut Flow) -> Result<()> {
        let ipv6 = flow.is_ipv6();
        let cc_alg = match flow.socket() {
            Some(socket) => {
                self.tuner.apply(socket, flow.settings(), ipv6)?;
                self.tuner.active_congestion_control(socket)?
            }
            None => None,
        };
        flow.set_cc_alg(cc_alg);
        Ok(())
    }

    /// Admits a flow on tokio's blocking pool so resolution and connect do
    /// not stall the runtime.
    pub async fn add_flow_source_async(
        self: &Arc<Self>,
        request: AddFlowSourceRequest,
    ) -> Result<AddFlowSourceReply> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.add_flow_source(&request))
            .await
            .map_err(|e| FlowError::IoError(std::io::Error::other(e.to_string())))?
    }

    /// Issues the deferred connect of a late-connect flow.
    ///
    /// The registry lock is held only to claim the connect and to record the
    /// outcome; the connect itself runs unlocked so other admissions proceed.
    /// On failure the flow is left `Failed` with the error message attached,
    /// for the transfer phase to tear down. Returns `false` if a connect was
    /// already issued.
    pub fn connect_late(&self, id: FlowId) -> Result<bool> {
        let pending = self
            .registry
            .with_flow_mut(id, |flow| self.tuner.begin_late_connect(flow))
            .ok_or(FlowError::UnknownFlow { id })??;
        let pending = match pending {
            Some(pending) => pending,
            None => return Ok(false),
        };

        let outcome = self.tuner.issue_late_connect(&pending);
        let recorded = self.registry.with_flow_mut(id, |flow| match &outcome {
            Ok(pmtu) => flow.mark_connect_issued(*pmtu),
            Err(e) => flow.fail(e),
        });
        if recorded.is_none() {
            debug!(flow_id = %id, "flow removed while its late connect was in flight");
        }
        outcome.map(|_| true)
    }

    /// Tears a flow down and frees its slot. Returns whether it existed.
    pub fn remove_flow(&self, id: FlowId) -> bool {
        self.registry.destroy(id)
    }
}

/// Marks `flow` failed, releases everything it owns and hands the error back.
/// The caller's reservation is dropped right after, freeing the slot.
fn abort(mut flow: Flow, err: FlowError) -> FlowError {
    flow.fail(&err);
    flow.destroy();
    err
}
