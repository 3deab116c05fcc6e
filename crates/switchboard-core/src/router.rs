//! Envelope router for Switchboard.
//!
//! Decodes inbound envelopes and dispatches them: registrations go to the
//! registry, messages and signaling payloads are forwarded to the connection
//! registered under the destination identity. Nothing is queued for identities
//! that are not connected.

use crate::peer::{ConnectionId, PeerHandle};
use crate::registry::{Registry, RegistryError};
use std::sync::Arc;
use switchboard_protocol::{Envelope, EnvelopeCodec, EnvelopeKind, ProtocolError};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Router errors. None of them are fatal to the connection.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The envelope could not be decoded.
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] ProtocolError),

    /// The envelope kind is not accepted from clients.
    #[error("Unrecognized envelope type: {0}")]
    Unrecognized(EnvelopeKind),

    /// Registration was refused.
    #[error(transparent)]
    Rejected(#[from] RegistryError),

    /// No live connection for the destination.
    #[error("No live connection for {to:?}, dropping {kind} envelope")]
    Unroutable {
        /// Kind of the dropped envelope.
        kind: EnvelopeKind,
        /// Destination identity.
        to: String,
    },
}

impl RouteError {
    /// Short label for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            RouteError::Malformed(_) => "malformed",
            RouteError::Unrecognized(_) => "unrecognized",
            RouteError::Rejected(RegistryError::DuplicateIdentity(_)) => "duplicate_identity",
            RouteError::Unroutable { .. } => "unroutable",
        }
    }
}

/// Result of a successfully handled envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// The connection is now registered.
    Registered {
        /// Identity bound to the connection.
        identity: String,
        /// Normalized auxiliary address.
        aux_address: String,
    },
    /// The envelope was queued to the destination.
    Delivered {
        /// Kind of the forwarded envelope.
        kind: EnvelopeKind,
        /// Destination identity.
        to: String,
    },
}

/// Why a connection is being torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close or end of stream.
    Closed,
    /// Transport-level error.
    Fault(String),
}

/// Router-side state of one connection.
#[derive(Debug)]
pub struct Session {
    peer: PeerHandle,
    identity: Option<String>,
}

impl Session {
    /// Create an unregistered session for `peer`.
    #[must_use]
    pub fn new(peer: PeerHandle) -> Self {
        Self {
            peer,
            identity: None,
        }
    }

    /// Connection ID of this session.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.peer.id()
    }

    /// Identity this session is registered under, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Handle for replies to this connection.
    #[must_use]
    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Largest accepted envelope in bytes.
    pub max_envelope_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_envelope_size: switchboard_protocol::codec::MAX_ENVELOPE_SIZE,
        }
    }
}

/// The envelope router.
///
/// Every handler runs to completion without awaiting, touching the registry
/// through at most one lookup or mutation per step.
pub struct Router {
    registry: Arc<Registry>,
    codec: EnvelopeCodec,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<Registry>, config: RouterConfig) -> Self {
        Self {
            registry,
            codec: EnvelopeCodec::with_max_size(config.max_envelope_size),
        }
    }

    /// Get the registry this router resolves destinations against.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one inbound text envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`RouteError`] describing why the envelope was dropped or
    /// rejected. The error has already been logged and, for rejected
    /// registrations, reported to the requester.
    pub fn handle_text(&self, session: &mut Session, text: &str) -> Result<Routed, RouteError> {
        let envelope = self.codec.decode(text).map_err(|e| {
            warn!(connection = %session.connection_id(), error = %e, "Dropping malformed envelope");
            RouteError::Malformed(e)
        })?;
        self.dispatch(session, envelope)
    }

    /// Handle one inbound envelope delivered as a binary frame.
    ///
    /// # Errors
    ///
    /// Same as [`handle_text`](Self::handle_text).
    pub fn handle_bytes(&self, session: &mut Session, data: &[u8]) -> Result<Routed, RouteError> {
        let envelope = self.codec.decode_bytes(data).map_err(|e| {
            warn!(connection = %session.connection_id(), error = %e, "Dropping malformed envelope");
            RouteError::Malformed(e)
        })?;
        self.dispatch(session, envelope)
    }

    /// Dispatch a decoded envelope.
    ///
    /// # Errors
    ///
    /// See [`handle_text`](Self::handle_text).
    pub fn dispatch(&self, session: &mut Session, envelope: Envelope) -> Result<Routed, RouteError> {
        trace!(connection = %session.connection_id(), kind = %envelope.kind(), "Dispatching");

        match envelope {
            Envelope::Register {
                user_id,
                tailscale_ip,
            } => self.register(session, &user_id, tailscale_ip.as_ref()),

            forward @ (Envelope::Message { .. } | Envelope::WebrtcSignal { .. }) => {
                self.forward(session, forward)
            }

            other @ (Envelope::Registered { .. }
            | Envelope::Error { .. }
            | Envelope::Ping
            | Envelope::Unknown) => {
                let kind = other.kind();
                warn!(connection = %session.connection_id(), kind = %kind, "Ignoring unrecognized envelope");
                Err(RouteError::Unrecognized(kind))
            }
        }
    }

    fn register(
        &self,
        session: &mut Session,
        identity: &str,
        aux_address: Option<&serde_json::Value>,
    ) -> Result<Routed, RouteError> {
        let connection = session.connection_id();

        match self
            .registry
            .register(identity, session.peer.clone(), aux_address)
        {
            Ok(record) => {
                // One record per connection: drop the identity it held before.
                if let Some(previous) = session.identity.replace(record.identity.clone()) {
                    if previous != record.identity {
                        self.registry.remove(&previous, connection);
                        info!(connection = %connection, from = %previous, to = %record.identity, "Connection re-registered");
                    }
                }
                reply(
                    session,
                    &Envelope::registered(&record.identity, &record.aux_address),
                );
                Ok(Routed::Registered {
                    identity: record.identity,
                    aux_address: record.aux_address,
                })
            }
            Err(e) => {
                warn!(connection = %connection, identity = %identity, error = %e, "Registration rejected");
                reply(session, &Envelope::error(e.to_string()));
                Err(RouteError::Rejected(e))
            }
        }
    }

    fn forward(&self, session: &Session, envelope: Envelope) -> Result<Routed, RouteError> {
        let kind = envelope.kind();
        let Some(to) = envelope.destination().map(str::to_string) else {
            return Err(RouteError::Unrecognized(kind));
        };

        let delivered = match self.registry.lookup(&to) {
            Some(record) if record.is_live() => match record.peer.send(&envelope) {
                Ok(()) => true,
                Err(e) => {
                    debug!(connection = %session.connection_id(), to = %to, error = %e, "Forward failed");
                    false
                }
            },
            _ => false,
        };

        if delivered {
            debug!(connection = %session.connection_id(), kind = %kind, to = %to, "Forwarded");
            Ok(Routed::Delivered { kind, to })
        } else {
            info!(connection = %session.connection_id(), kind = %kind, to = %to, "Destination not connected, dropping");
            Err(RouteError::Unroutable { kind, to })
        }
    }

    /// Tear down a connection's registration.
    ///
    /// Removes the record only if it still belongs to this connection, so a
    /// newer registration under the same identity survives. Safe to call more
    /// than once.
    pub fn handle_close(&self, session: &mut Session, reason: CloseReason) {
        let connection = session.connection_id();
        match &reason {
            CloseReason::Closed => debug!(connection = %connection, "Connection closed"),
            CloseReason::Fault(e) => warn!(connection = %connection, error = %e, "Connection fault"),
        }

        if let Some(identity) = session.identity.take() {
            if self.registry.remove(&identity, connection).is_some() {
                info!(connection = %connection, identity = %identity, "Unregistered");
            } else {
                debug!(connection = %connection, identity = %identity, "Registration already superseded");
            }
        }
    }
}

/// Send a reply to the requesting connection. A failure means the connection
/// is closing; its own close event cleans up.
fn reply(session: &Session, envelope: &Envelope) {
    if let Err(e) = session.peer.send(envelope) {
        debug!(connection = %session.connection_id(), error = %e, "Reply not sent");
    }
}
