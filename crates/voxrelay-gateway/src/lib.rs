//! Speech relay gateway.
//!
//! Hosts the duplex WebSocket session (`/ws/gateway`): callers stream raw PCM,
//! flush to get it recognized, and receive the synthesized reply as PCM
//! chunks. A one-shot HTTP relay and a health endpoint sit next to it.

pub mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod relay;
pub mod server;
pub mod session;
pub mod state;

pub use server::{router, start_gateway};
pub use session::{AudioBuffer, DuplexSession, SessionState};
pub use state::GatewayState;
