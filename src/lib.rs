#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! burrow library: exposes the tunnel core for embedding and testing.
//!
//! Key building blocks:
//! - `tunnel` — frame codec, relay (public front + demux), agent client
//! - `pipeline` — mock/chaos/route/forward request interception
//! - `rules` — concurrent rule collections edited by the admin REST surface
//! - `request_log` — bounded FIFO of completed requests
//! - `routes` — the agent's admin REST surface
//! - `config` — TOML + env-var configuration

pub mod config;
pub mod matcher;
pub mod pipeline;
pub mod request_log;
pub mod routes;
pub mod rules;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use request_log::{RequestLog, RequestLogEntry};
pub use rules::RuleStore;
pub use state::AgentState;
pub use tunnel::relay::RelayState;
