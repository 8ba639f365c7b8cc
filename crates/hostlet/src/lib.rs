//! hostlet: IPC engine connecting a test front-end to an embedded test host.
//!
//! The front-end ("launcher") spawns the heavyweight test host as a child
//! process and talks to it over a pair of unidirectional pipes: typed,
//! length-free framed messages, concurrent out-of-order handling, graceful
//! two-phase shutdown, mid-stream cancellation and severity-filtered log
//! relay. Test discovery and execution themselves are injected behind the
//! [`InboundHandler`] seam.

pub mod bridge;
mod communicator;
mod launcher;
mod log_layer;
mod session;
mod testhost;

pub use bridge::codec::{Frame, FrameCodec};
pub use bridge::protocol::{
    AboutToStop, DiscoveredTests, DiscoveryRequest, ExecutionRequest, LogEntry, LogLevel,
    Parameters, Stop, TestCaseCount, TestCaseInfo, TestOutcome, TestResultBatch, TestResultInfo,
    TestSelection, WorkRequest, standard_registry,
};
pub use bridge::registry::{Inbound, Message, MessageRegistry, ProtocolError};
pub use bridge::transport::{BootstrapTokens, ChannelEndpoint, PipeListener, TokenError};

pub use communicator::{
    Communicator, HandlerContext, InboundHandler, LogSink, MessageSender, ShutdownState,
    tracing_log_sink,
};
pub use launcher::{
    HostProcess, Launcher, LauncherConfig, ProcessSpawner, SpawnError, StartError, TestHostSpawner,
};
pub use log_layer::RelayLayer;
pub use session::{DiscoveryTracker, ExecutionTracker, OutcomeTally};
pub use testhost::{AttachError, TestHost, TestHostConfig};
