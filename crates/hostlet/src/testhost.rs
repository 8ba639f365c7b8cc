//! TestHost - the child side of a connection.
//!
//! The test host attaches to the pipes named by the three bootstrap tokens
//! it received as process arguments, routes control messages internally, and
//! forwards every application message to the injected handler. Handlers may
//! stream partial results back at any time through the context sender (or
//! the standalone [`TestHost::sender`] handle for unsolicited pushes).
//!
//! Discovery and execution themselves live behind the handler: this layer
//! neither knows what a test is nor how a device runs one.

use std::io;
use std::sync::Arc;

use crate::bridge::protocol::LogLevel;
use crate::bridge::registry::{Message, MessageRegistry, ProtocolError};
use crate::bridge::transport::{self, BootstrapTokens, TokenError};
use crate::communicator::{
    Communicator, InboundHandler, LogSink, MessageSender, ShutdownState, tracing_log_sink,
};

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("bad bootstrap arguments: {0}")]
    Tokens(#[from] TokenError),
    #[error("failed to connect to launcher pipes: {0}")]
    Connect(#[from] io::Error),
}

pub struct TestHostConfig {
    registry: MessageRegistry,
    log_sink: LogSink,
}

impl TestHostConfig {
    pub fn new(registry: MessageRegistry) -> Self {
        Self {
            registry,
            log_sink: tracing_log_sink(),
        }
    }

    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = sink;
        self
    }
}

/// The child role: attaches to the launcher's pipes and serves requests
/// until the launcher stops the connection.
pub struct TestHost {
    comm: Communicator,
}

impl std::fmt::Debug for TestHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHost").finish_non_exhaustive()
    }
}

impl TestHost {
    /// Connect to the pipes named by the bootstrap tokens and start serving.
    pub async fn attach(
        tokens: BootstrapTokens,
        config: TestHostConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, AttachError> {
        let endpoint = transport::connect(&tokens).await?;
        let comm = Communicator::start(
            endpoint,
            tokens.separator,
            Arc::new(config.registry),
            handler,
            config.log_sink,
        );
        tracing::info!("test host attached");
        Ok(Self { comm })
    }

    /// Parse the three bootstrap tokens from process arguments (for example
    /// `std::env::args().skip(1)`) and attach.
    pub async fn attach_from_args<I>(
        args: I,
        config: TestHostConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, AttachError>
    where
        I: IntoIterator<Item = String>,
    {
        let tokens = BootstrapTokens::from_args(args)?;
        Self::attach(tokens, config, handler).await
    }

    pub fn state(&self) -> ShutdownState {
        self.comm.state()
    }

    /// Handle for pushing unsolicited messages to the parent, usable from
    /// anywhere in the host (device monitors, progress reporters).
    pub fn sender(&self) -> MessageSender {
        self.comm.sender()
    }

    /// Push an unsolicited message to the parent.
    pub async fn push<M: Message>(&self, message: &M) -> Result<(), ProtocolError> {
        self.comm.send(message).await
    }

    /// Relay a diagnostic to the parent, honoring the parent-set threshold.
    pub async fn log(&self, level: LogLevel, text: &str) {
        self.comm.log(level, text).await;
    }

    /// Wait until the launcher has stopped the connection and all in-flight
    /// handlers have finished, then release the pipes.
    pub async fn wait_until_processing_is_completed(&self) {
        self.comm.wait_for_shutdown().await;
    }

    pub fn communicator(&self) -> &Communicator {
        &self.comm
    }
}
