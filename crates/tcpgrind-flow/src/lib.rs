#![warn(missing_docs)]

//! tcpgrind flow subsystem: flow admission, socket negotiation and TCP option tuning
//!
//! This crate brings a test flow from an "add flow source" request to a
//! registered, tuned TCP socket: it resolves the destination, creates the
//! socket with the requested buffer sizes, applies per-flow TCP options,
//! optionally connects right away and records what the kernel actually
//! granted so the controller can report it.

pub mod admission;
pub mod capture;
pub mod config;
pub mod error;
pub mod flow;
pub mod platform;
pub mod registry;
pub mod resolver;
pub mod settings;
pub mod socket;
pub mod tuner;

pub use admission::FlowAdmission;
pub use capture::{CaptureRequest, CaptureStarter, ChannelCapture, NoCapture};
pub use config::{FlowEngineConfig, DEFAULT_MAX_FLOWS};
pub use error::{FlowError, FlowErrorKind, Result};
pub use flow::{fill_byte_counting, Flow, FlowId, FlowState};
pub use platform::{detect, CapabilitySet, NoCapabilities, PlatformCapabilities, TcpInfoSnapshot};
pub use registry::{FlowRegistry, RegistrySnapshot, Reservation};
pub use resolver::{AddressResolver, NameResolver, ResolvedSocket, StaticResolver, SystemResolver};
pub use settings::{
    AddFlowSourceReply, AddFlowSourceRequest, ExtraSocketOption, FlowSettings, OptionLevel,
    SourceSettings,
};
pub use socket::{set_window_size_directed, BufferDirection, BufferRequest, NegotiatedSocket, SocketFactory};
pub use tuner::{ConnectTiming, PendingConnect, TcpOptionTuner};

#[cfg(target_os = "linux")]
pub use platform::LinuxCapabilities;
