//! # switchboard-protocol
//!
//! Wire protocol definitions for the Switchboard relay.
//!
//! Clients and the server exchange JSON envelopes over a WebSocket, one
//! envelope per text frame, discriminated by a `type` field.
//!
//! ## Envelope Types
//!
//! - `register` / `registered` - Bind a connection to an identity
//! - `message` - Application payload routed by destination identity
//! - `webrtc-signal` - Call-setup payload relayed between peers
//! - `error` - Error reply to the requester
//! - `ping` - Server keepalive
//!
//! ## Example
//!
//! ```rust
//! use switchboard_protocol::{codec, Envelope};
//!
//! let env = codec::decode(r#"{"type":"register","userId":"alice"}"#).unwrap();
//! assert_eq!(env, Envelope::register("alice", None));
//!
//! let text = codec::encode(&Envelope::ping()).unwrap();
//! assert_eq!(text, r#"{"type":"ping"}"#);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, EnvelopeCodec, ProtocolError};
pub use envelope::{Envelope, EnvelopeKind};
