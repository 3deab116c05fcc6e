//! # switchboard-core
//!
//! Connection registry and envelope routing for the Switchboard relay.
//!
//! - **Peer** - Connection IDs and non-blocking outbound handles
//! - **Registry** - Identity to live connection mapping
//! - **Liveness** - Per-registration keepalive probes
//! - **Router** - Envelope classification and forwarding
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └────────────│ PeerHandle  │◀────│  Liveness   │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod liveness;
pub mod peer;
pub mod registry;
pub mod router;

pub use liveness::{LivenessProbe, LivenessState};
pub use peer::{ConnectionId, Outbound, PeerError, PeerHandle};
pub use registry::{
    ConnectionRecord, Registry, RegistryConfig, RegistryEntry, RegistryError, RegistryStats,
};
pub use router::{CloseReason, RouteError, Routed, Router, RouterConfig, Session};
