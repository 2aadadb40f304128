//! Outbound transport seam.
//!
//! The sandbox never touches the physical channel to its supervisor.  It
//! hands every [`OutboundMessage`] to a [`Transport`]; the host decides how
//! the message actually travels.  [`ChannelTransport`] forwards into a tokio
//! mpsc channel and is what tests and in-process hosts use.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::OutboundMessage;

/// Sink for outbound messages.
///
/// Sends are fire-and-forget.  Implementations must not emit `tracing`
/// events from `send`: the log forwarding layer writes through the same
/// transport.
pub trait Transport: Send + Sync {
    fn send(&self, message: OutboundMessage);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, message: OutboundMessage) {
        (**self).send(message);
    }
}

/// Transport backed by an unbounded tokio mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelTransport {
    /// Create a transport and the receiver that observes its traffic.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: OutboundMessage) {
        // A closed receiver means the supervisor is gone; drop the message.
        let _ = self.tx.send(message);
    }
}
