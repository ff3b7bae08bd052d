//! # trailcast-core
//!
//! Core types and message routing for the Trailcast live-tracking relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Message** - Position update schema and validation
//! - **Registry** - Live viewer connections keyed by (trail, athlete filter)
//! - **Presence** - Last-seen tracking of runners with TTL expiry
//! - **Router** - Parses broker payloads and fans them out to viewers
//! - **Metrics** - The interface the router reports through
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Broker    │────▶│   Router    │────▶│  Registry   │────▶ viewers
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Presence   │────▶│   Metrics   │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod message;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod router;

pub use message::{Gender, Location, Message, MessageError, PositionUpdate};
pub use metrics::{InMemoryMetrics, NoopMetrics, ProcessStatus, RelayMetrics};
pub use presence::{PresenceSnapshot, PresenceTracker, DEFAULT_PRESENCE_TTL};
pub use registry::{ConnectionId, DeliveryError, Registry, SubscriptionKey, Viewer, ALL_ATHLETES};
pub use router::{Fanout, MessageRouter, RouteError};
