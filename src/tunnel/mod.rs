//! Reverse HTTP tunnel between the public relay and the developer-side agent.
//!
//! One persistent WebSocket carries all traffic for an agent. Logical
//! messages are the binary frames of [`frame`]; the WebSocket layer
//! reassembles transport fragments, so each received message is one whole
//! frame.
//!
//! - **Relay** ([`relay`]): accepts agent channels at `/tunnel`, proxies
//!   public HTTP requests to the owning agent, and demultiplexes streamed
//!   responses by request id.
//! - **Client** ([`client`]): connects outbound to a relay, assembles
//!   incoming requests, runs each through the interception pipeline, and
//!   streams the response back.

pub mod client;
pub mod frame;
pub mod relay;

/// Preferred body chunk size in both directions (16 KiB).
pub const BODY_CHUNK_SIZE: usize = 16 * 1024;

/// Bound on each per-request response chunk queue on the relay. A full queue
/// stalls the agent channel's read loop rather than dropping bytes.
pub const MAX_QUEUED_CHUNKS: usize = 256;
