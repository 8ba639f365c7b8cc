//! Tracing layer that relays test-host diagnostics to the launcher.
//!
//! Ships `tracing` events over the channel as log-relay messages at the
//! mapped severity. Events are queued on an unbounded channel and forwarded
//! by a dedicated task; the channel applies the parent-set threshold at send
//! time, so suppressed levels never touch the pipe.
//!
//! Events from this crate's own channel internals are excluded — encoding a
//! relayed log must not produce another relayed log.

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use tokio::sync::mpsc;

use crate::bridge::protocol::LogLevel;
use crate::communicator::MessageSender;

pub struct RelayLayer {
    tx: mpsc::UnboundedSender<(LogLevel, String)>,
}

impl RelayLayer {
    /// Build the layer and spawn the forwarder that pushes queued events
    /// through `sender`.
    pub fn new(sender: MessageSender) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(rx, sender));
        Self { tx }
    }

    fn map_level(level: &Level) -> LogLevel {
        match *level {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warning,
            Level::INFO => LogLevel::Informational,
            Level::DEBUG => LogLevel::Detailed,
            Level::TRACE => LogLevel::Verbose,
        }
    }
}

async fn forward_events(
    mut rx: mpsc::UnboundedReceiver<(LogLevel, String)>,
    sender: MessageSender,
) {
    while let Some((level, text)) = rx.recv().await {
        sender.log(level, &text).await;
    }
    tracing::trace!("relay forwarder exiting");
}

impl<S> Layer<S> for RelayLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with("hostlet") {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if visitor.message.is_empty() {
            return;
        }

        let level = Self::map_level(metadata.level());
        let _ = self.tx.send((level, visitor.message));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}
