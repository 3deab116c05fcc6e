//! Envelope types for the Switchboard protocol.
//!
//! An envelope is one JSON object carried in a single WebSocket text frame.
//! The `type` field selects the variant; every other field is variant-specific.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Envelope kind identifiers, one per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Register,
    Registered,
    Error,
    Message,
    WebrtcSignal,
    Ping,
    Unknown,
}

impl EnvelopeKind {
    /// The wire name carried in the `type` field.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Register => "register",
            EnvelopeKind::Registered => "registered",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Message => "message",
            EnvelopeKind::WebrtcSignal => "webrtc-signal",
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol envelope.
///
/// The same type is used in both directions. Relayed payloads (`message`,
/// `timestamp`, `data`) are kept as raw JSON values so they are forwarded
/// exactly as the sender wrote them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Bind the sending connection to an identity.
    #[serde(rename = "register")]
    Register {
        /// Requested identity.
        #[serde(rename = "userId")]
        user_id: String,
        /// Optional auxiliary address. Kept loose so a malformed value does
        /// not make the whole envelope undecodable.
        #[serde(
            rename = "tailscaleIP",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        tailscale_ip: Option<Value>,
    },

    /// Registration confirmation.
    #[serde(rename = "registered")]
    Registered {
        /// The identity now bound to the connection.
        #[serde(rename = "userId")]
        user_id: String,
        /// Normalized auxiliary address.
        #[serde(rename = "tailscaleIp")]
        tailscale_ip: String,
    },

    /// Error reply to the requesting connection.
    #[serde(rename = "error")]
    Error {
        /// Human-readable description.
        message: String,
    },

    /// Application message routed by destination identity.
    #[serde(rename = "message")]
    Message {
        to: String,
        from: String,
        message: Value,
        timestamp: Value,
    },

    /// Call-setup payload relayed between two identities.
    #[serde(rename = "webrtc-signal")]
    WebrtcSignal {
        from: String,
        to: String,
        /// Signaling payload, opaque to the relay.
        data: Value,
    },

    /// Server keepalive. No reply is expected.
    #[serde(rename = "ping")]
    Ping,

    /// Any `type` this server does not know.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// Get the envelope kind.
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Register { .. } => EnvelopeKind::Register,
            Envelope::Registered { .. } => EnvelopeKind::Registered,
            Envelope::Error { .. } => EnvelopeKind::Error,
            Envelope::Message { .. } => EnvelopeKind::Message,
            Envelope::WebrtcSignal { .. } => EnvelopeKind::WebrtcSignal,
            Envelope::Ping => EnvelopeKind::Ping,
            Envelope::Unknown => EnvelopeKind::Unknown,
        }
    }

    /// Create a new Register envelope.
    #[must_use]
    pub fn register(user_id: impl Into<String>, tailscale_ip: Option<String>) -> Self {
        Envelope::Register {
            user_id: user_id.into(),
            tailscale_ip: tailscale_ip.map(Value::String),
        }
    }

    /// Create a new Registered envelope.
    #[must_use]
    pub fn registered(user_id: impl Into<String>, tailscale_ip: impl Into<String>) -> Self {
        Envelope::Registered {
            user_id: user_id.into(),
            tailscale_ip: tailscale_ip.into(),
        }
    }

    /// Create a new Error envelope.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error {
            message: message.into(),
        }
    }

    /// Create a new Message envelope.
    #[must_use]
    pub fn message(
        from: impl Into<String>,
        to: impl Into<String>,
        message: impl Into<Value>,
        timestamp: impl Into<Value>,
    ) -> Self {
        Envelope::Message {
            to: to.into(),
            from: from.into(),
            message: message.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Create a new WebRTC signaling envelope.
    #[must_use]
    pub fn signal(from: impl Into<String>, to: impl Into<String>, data: Value) -> Self {
        Envelope::WebrtcSignal {
            from: from.into(),
            to: to.into(),
            data,
        }
    }

    /// Create a new Ping envelope.
    #[must_use]
    pub fn ping() -> Self {
        Envelope::Ping
    }

    /// Destination identity for routed kinds.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        match self {
            Envelope::Message { to, .. } | Envelope::WebrtcSignal { to, .. } => Some(to),
            _ => None,
        }
    }
}
