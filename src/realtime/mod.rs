//! Realtime event channel gated on the session

pub mod channel;
pub mod endpoint;
pub mod transport;

pub use channel::{ChannelHandle, RealtimeChannel};
pub use endpoint::{derive_endpoint, FALLBACK_ENDPOINT};
pub use transport::{ChannelEvent, ReconnectPolicy, Transport, WebSocketTransport};
