//! Pipe transport between launcher and test host.
//!
//! The parent creates two unidirectional pipes (named Unix sockets in a
//! per-connection temp directory), spawns the child with three string tokens
//! — separator, output pipe, input pipe — and then accepts the child's
//! connections. The child connects back using nothing but those tokens.
//!
//! In-process endpoints backed by memory pipes are available for tests and
//! for embedding the test host in the launcher process.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};

use tokio::net::{UnixListener, UnixStream};

pub(crate) type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

const IN_PROCESS_PIPE_BYTES: usize = 64 * 1024;

/// The three whitespace-joined string arguments passed to the child process.
///
/// `output_token` names the pipe the parent writes (the child's input);
/// `input_token` names the pipe the parent reads (the child's output). Both
/// are opaque to the child beyond connecting to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapTokens {
    pub separator: String,
    pub output_token: String,
    pub input_token: String,
}

impl BootstrapTokens {
    pub fn to_args(&self) -> [String; 3] {
        [
            self.separator.clone(),
            self.output_token.clone(),
            self.input_token.clone(),
        ]
    }

    /// Parse the three bootstrap arguments, in order, from an argument list
    /// (for example `std::env::args().skip(1)`).
    pub fn from_args<I>(args: I) -> Result<Self, TokenError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let separator = args.next().ok_or(TokenError::Missing("separator"))?;
        let output_token = args.next().ok_or(TokenError::Missing("output pipe"))?;
        let input_token = args.next().ok_or(TokenError::Missing("input pipe"))?;
        Ok(Self {
            separator,
            output_token,
            input_token,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("missing bootstrap argument: {0}")]
    Missing(&'static str),
}

/// Removes the pipe directory when the owning endpoint goes away.
#[derive(Debug)]
pub(crate) struct PipeDirGuard {
    dir: PathBuf,
}

impl Drop for PipeDirGuard {
    fn drop(&mut self) {
        if self.dir.exists() {
            tracing::debug!(dir = %self.dir.display(), "cleaning up pipe directory");
            if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                tracing::warn!(error = %e, "failed to clean up pipe directory");
            }
        }
    }
}

/// An owned (input, output) pair of unidirectional byte streams.
pub struct ChannelEndpoint {
    pub(crate) input: BoxRead,
    pub(crate) output: BoxWrite,
    pub(crate) cleanup: Option<PipeDirGuard>,
}

impl ChannelEndpoint {
    pub fn from_parts(input: BoxRead, output: BoxWrite) -> Self {
        Self {
            input,
            output,
            cleanup: None,
        }
    }

    /// A connected pair of in-process endpoints backed by two memory pipes,
    /// one per direction.
    pub fn in_process_pair() -> (ChannelEndpoint, ChannelEndpoint) {
        let (down_read, down_write) = tokio::io::simplex(IN_PROCESS_PIPE_BYTES);
        let (up_read, up_write) = tokio::io::simplex(IN_PROCESS_PIPE_BYTES);
        (
            ChannelEndpoint::from_parts(Box::new(up_read), Box::new(down_write)),
            ChannelEndpoint::from_parts(Box::new(down_read), Box::new(up_write)),
        )
    }
}

impl std::fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

/// Parent-side listeners for the two pipes, bound before the child is
/// spawned so the tokens are valid the moment the child starts.
pub struct PipeListener {
    down: UnixListener,
    up: UnixListener,
    guard: PipeDirGuard,
}

impl PipeListener {
    /// Bind both pipes in a fresh directory under the system temp dir.
    pub fn bind(separator: &str) -> io::Result<(Self, BootstrapTokens)> {
        let dir = std::env::temp_dir().join(format!("hostlet-{}-{}", std::process::id(), separator));
        Self::bind_in(&dir, separator)
    }

    /// Bind both pipes inside `dir` (created if absent).
    pub fn bind_in(dir: &Path, separator: &str) -> io::Result<(Self, BootstrapTokens)> {
        std::fs::create_dir_all(dir)?;
        tracing::debug!(dir = %dir.display(), "creating pipe pair");

        let down_path = dir.join("down.sock");
        let up_path = dir.join("up.sock");
        let down = UnixListener::bind(&down_path)?;
        let up = UnixListener::bind(&up_path)?;

        let tokens = BootstrapTokens {
            separator: separator.to_string(),
            output_token: down_path.to_string_lossy().into_owned(),
            input_token: up_path.to_string_lossy().into_owned(),
        };
        let listener = Self {
            down,
            up,
            guard: PipeDirGuard {
                dir: dir.to_path_buf(),
            },
        };
        Ok((listener, tokens))
    }

    /// Accept the child's connection on both pipes and assemble the parent's
    /// endpoint. Directory cleanup moves into the returned endpoint.
    pub async fn accept(self) -> io::Result<ChannelEndpoint> {
        tracing::trace!("waiting for test host to connect");
        let (down_stream, _) = self.down.accept().await?;
        let (up_stream, _) = self.up.accept().await?;
        tracing::trace!("test host connected on both pipes");

        let (_, down_write) = down_stream.into_split();
        let (up_read, _) = up_stream.into_split();
        Ok(ChannelEndpoint {
            input: Box::new(up_read),
            output: Box::new(down_write),
            cleanup: Some(self.guard),
        })
    }
}

/// Child-side connect using the bootstrap tokens.
pub async fn connect(tokens: &BootstrapTokens) -> io::Result<ChannelEndpoint> {
    tracing::trace!(
        output = %tokens.output_token,
        input = %tokens.input_token,
        "connecting to launcher pipes"
    );
    let down_stream = UnixStream::connect(&tokens.output_token).await?;
    let up_stream = UnixStream::connect(&tokens.input_token).await?;

    let (down_read, _) = down_stream.into_split();
    let (_, up_write) = up_stream.into_split();
    Ok(ChannelEndpoint {
        input: Box::new(down_read),
        output: Box::new(up_write),
        cleanup: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn tokens_roundtrip_through_args() {
        let tokens = BootstrapTokens {
            separator: "abc123".to_string(),
            output_token: "/tmp/x/down.sock".to_string(),
            input_token: "/tmp/x/up.sock".to_string(),
        };
        let parsed = BootstrapTokens::from_args(tokens.to_args()).unwrap();
        assert_eq!(parsed, tokens);
    }

    #[test]
    fn missing_token_is_an_error() {
        let err = BootstrapTokens::from_args(vec!["sep".to_string()]).unwrap_err();
        assert!(err.to_string().contains("output pipe"));
    }

    #[tokio::test]
    async fn in_process_pair_carries_bytes_both_ways() {
        let (mut parent, mut child) = ChannelEndpoint::in_process_pair();

        parent.output.write_all(b"down\n").await.unwrap();
        parent.output.flush().await.unwrap();
        let mut buf = [0u8; 5];
        child.input.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"down\n");

        child.output.write_all(b"up!\n").await.unwrap();
        child.output.flush().await.unwrap();
        let mut buf = [0u8; 4];
        parent.input.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"up!\n");
    }

    #[tokio::test]
    async fn pipe_pair_connects_and_carries_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, tokens) = PipeListener::bind_in(dir.path(), "sep").unwrap();

        let connector = tokio::spawn(async move { connect(&tokens).await.unwrap() });
        let mut parent = listener.accept().await.unwrap();
        let mut child = connector.await.unwrap();

        parent.output.write_all(b"ping").await.unwrap();
        parent.output.flush().await.unwrap();
        let mut buf = [0u8; 4];
        child.input.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        child.output.write_all(b"pong").await.unwrap();
        child.output.flush().await.unwrap();
        parent.input.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn endpoint_drop_cleans_pipe_directory() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("pipes");
        let (listener, tokens) = PipeListener::bind_in(&dir, "sep").unwrap();
        assert!(dir.exists());

        let connector = tokio::spawn(async move { connect(&tokens).await.unwrap() });
        let parent = listener.accept().await.unwrap();
        let _child = connector.await.unwrap();

        drop(parent);
        assert!(!dir.exists());
    }
}
