//! Realtime WebSocket relay.
//!
//! - [`types`] — connection identity and the event sink boundary
//! - [`rooms`] — per-user rooms over live connections
//! - [`events`] — the wire protocol event shapes
//! - [`relay`] — the authorization and delivery pipeline

pub mod events;
pub mod relay;
pub mod rooms;
pub mod types;

pub use events::{ClientEvent, ServerEvent};
pub use relay::{PayloadCaps, RelayService};
pub use rooms::RoomRegistry;
pub use types::{Connection, ConnectionId, ConnectionMetadata, EventSink};
