//! Outbound handles for accepted connections.
//!
//! Every accepted connection gets a [`ConnectionId`] and an unbounded queue.
//! The transport side owns the receiver and writes whatever arrives to the
//! socket; everything else talks to the connection through a [`PeerHandle`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchboard_protocol::{codec, Envelope, ProtocolError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Counter backing [`ConnectionId::generate`].
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Errors from sending to a peer.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The transport side has gone away.
    #[error("Connection closed")]
    Closed,

    /// The envelope could not be encoded.
    #[error("Encoding failed: {0}")]
    Encode(#[from] ProtocolError),
}

/// Receiving half of a peer's outbound queue.
pub type Outbound = mpsc::UnboundedReceiver<Arc<str>>;

/// Sending side of one connection's outbound queue.
///
/// Sends never block and carry no delivery confirmation. The queue is
/// unbounded; a slow socket grows it until the transport gives up on the
/// connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Arc<str>>,
}

impl PeerHandle {
    /// Create a handle with a fresh connection ID and its outbound receiver.
    #[must_use]
    pub fn open() -> (Self, Outbound) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            id: ConnectionId::generate(),
            sender,
        };
        (handle, receiver)
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Check if the transport side is still reading the queue.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queue pre-encoded text.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Closed`] if the receiver has been dropped.
    pub fn send_text(&self, text: impl Into<Arc<str>>) -> Result<(), PeerError> {
        self.sender.send(text.into()).map_err(|_| PeerError::Closed)
    }

    /// Encode and queue an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the connection is closed.
    pub fn send(&self, envelope: &Envelope) -> Result<(), PeerError> {
        let text = codec::encode(envelope)?;
        trace!(connection = %self.id, kind = %envelope.kind(), "Queued envelope");
        self.send_text(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn test_send_and_close() {
        let (peer, mut rx) = PeerHandle::open();
        assert!(peer.is_open());

        peer.send(&Envelope::ping()).unwrap();
        assert_eq!(&*rx.try_recv().unwrap(), r#"{"type":"ping"}"#);

        drop(rx);
        assert!(!peer.is_open());
        assert!(matches!(peer.send_text("late"), Err(PeerError::Closed)));
    }

    #[test]
    fn test_clones_share_queue() {
        let (peer, mut rx) = PeerHandle::open();
        let other = peer.clone();
        assert_eq!(peer.id(), other.id());

        other.send_text("one").unwrap();
        peer.send_text("two").unwrap();
        assert_eq!(&*rx.try_recv().unwrap(), "one");
        assert_eq!(&*rx.try_recv().unwrap(), "two");
    }
}
