//! Launcher - the parent side of a test-host connection.
//!
//! Flow:
//! 1. Generate a fresh separator token and bind the pipe pair
//! 2. Hand the three bootstrap tokens to the spawner
//! 3. Accept the test host's connections (bounded by the accept timeout)
//! 4. Run the read loop; issue requests; cancel or stop when done

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::bridge::registry::{Message, MessageRegistry, ProtocolError};
use crate::bridge::transport::{BootstrapTokens, PipeListener};
use crate::communicator::{
    Communicator, InboundHandler, LogSink, MessageSender, ShutdownState, tracing_log_sink,
};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// What the spawner started: a real OS process, or something managed
/// elsewhere (an in-process test host, a debugger-attached child).
pub enum HostProcess {
    Process(Child),
    Detached,
}

impl HostProcess {
    /// Wait for a real child process to exit. Detached hosts return at once.
    pub async fn wait(&mut self) -> std::io::Result<()> {
        if let HostProcess::Process(child) = self {
            child.wait().await?;
        }
        Ok(())
    }
}

/// Extension point for different test-host spawn strategies.
pub trait TestHostSpawner: Send + Sync {
    fn spawn(&self, tokens: &BootstrapTokens) -> Result<HostProcess, SpawnError>;
}

/// Spawner that launches a test-host executable with the three bootstrap
/// tokens appended to its arguments.
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl TestHostSpawner for ProcessSpawner {
    fn spawn(&self, tokens: &BootstrapTokens) -> Result<HostProcess, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .args(tokens.to_args())
            .spawn()?;
        Ok(HostProcess::Process(child))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to start test host: {0}")]
    Spawn(#[from] SpawnError),
    #[error("test host did not connect within {0:?}")]
    AcceptTimeout(Duration),
    #[error("pipe transport error: {0}")]
    Transport(#[from] std::io::Error),
}

pub struct LauncherConfig {
    registry: MessageRegistry,
    spawner: Arc<dyn TestHostSpawner>,
    accept_timeout: Duration,
    log_sink: LogSink,
}

impl LauncherConfig {
    pub fn new(registry: MessageRegistry, spawner: Arc<dyn TestHostSpawner>) -> Self {
        Self {
            registry,
            spawner,
            accept_timeout: Duration::from_secs(10),
            log_sink: tracing_log_sink(),
        }
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Callback for relayed test-host diagnostics, invoked in arrival order.
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = sink;
        self
    }
}

/// The parent role: owns the spawned test host and the parent end of the
/// channel.
pub struct Launcher {
    comm: Communicator,
    host: StdMutex<Option<HostProcess>>,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher").finish_non_exhaustive()
    }
}

impl Launcher {
    /// Bind the pipes, spawn the test host, accept its connections and start
    /// the read loop. A spawner failure surfaces here synchronously; the
    /// pipes are cleaned up and no read loop is started.
    pub async fn start(
        config: LauncherConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, StartError> {
        let separator = uuid::Uuid::new_v4().simple().to_string();
        let (listener, tokens) = PipeListener::bind(&separator)?;

        tracing::info!("spawning test host");
        let host = config.spawner.spawn(&tokens)?;

        tracing::debug!("waiting for test host to connect");
        let endpoint = tokio::time::timeout(config.accept_timeout, listener.accept())
            .await
            .map_err(|_| StartError::AcceptTimeout(config.accept_timeout))??;

        let comm = Communicator::start(
            endpoint,
            separator,
            Arc::new(config.registry),
            handler,
            config.log_sink,
        );
        Ok(Self {
            comm,
            host: StdMutex::new(Some(host)),
        })
    }

    pub fn state(&self) -> ShutdownState {
        self.comm.state()
    }

    pub fn sender(&self) -> MessageSender {
        self.comm.sender()
    }

    pub async fn send<M: Message>(&self, message: &M) -> Result<(), ProtocolError> {
        self.comm.send(message).await
    }

    /// Request cooperative abort of everything in flight on the test host.
    /// Does not wait for acknowledgement; results already produced are still
    /// delivered.
    pub async fn cancel(&self) {
        self.comm.send_abort().await;
    }

    /// Announce that no more requests are coming, then wait for the test
    /// host to drain its in-flight work and release the pipes.
    pub async fn wait_until_processing_is_completed(&self) {
        self.comm.initiate_stop_and_wait().await;
    }

    /// Take ownership of the spawned host handle (for waiting on process
    /// exit, or killing it as a last resort after a grace period).
    pub fn take_host(&self) -> Option<HostProcess> {
        match self.host.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn communicator(&self) -> &Communicator {
        &self.comm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::standard_registry;
    use crate::communicator::{HandlerContext, InboundHandler};
    use crate::bridge::registry::Inbound;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl InboundHandler for NoopHandler {
        async fn handle(&self, _message: Inbound, _ctx: HandlerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailingSpawner;

    impl TestHostSpawner for FailingSpawner {
        fn spawn(&self, _tokens: &BootstrapTokens) -> Result<HostProcess, SpawnError> {
            Err(SpawnError::Other("no such test host".to_string()))
        }
    }

    /// Records the tokens but never connects.
    struct AbsentSpawner {
        tokens: Arc<StdMutex<Option<BootstrapTokens>>>,
    }

    impl TestHostSpawner for AbsentSpawner {
        fn spawn(&self, tokens: &BootstrapTokens) -> Result<HostProcess, SpawnError> {
            *self.tokens.lock().unwrap() = Some(tokens.clone());
            Ok(HostProcess::Detached)
        }
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_and_cleans_up() {
        let config = LauncherConfig::new(standard_registry(), Arc::new(FailingSpawner));
        let err = Launcher::start(config, Arc::new(NoopHandler))
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::Spawn(_)));
    }

    #[tokio::test]
    async fn absent_host_times_out_and_cleans_up() {
        let tokens = Arc::new(StdMutex::new(None));
        let config = LauncherConfig::new(
            standard_registry(),
            Arc::new(AbsentSpawner {
                tokens: Arc::clone(&tokens),
            }),
        )
        .with_accept_timeout(Duration::from_millis(100));

        let err = Launcher::start(config, Arc::new(NoopHandler))
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::AcceptTimeout(_)));

        // The listener (and its directory guard) went away with the error.
        let tokens = tokens.lock().unwrap().clone().unwrap();
        let dir = std::path::Path::new(&tokens.output_token).parent().unwrap();
        assert!(!dir.exists());
    }
}
