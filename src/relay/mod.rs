pub mod client;
pub mod payload;

pub use client::{CoreClient, EventSink, RelayError};
pub use payload::OutboundEventPayload;
