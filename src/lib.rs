//! StreamGate - Authenticated WebSocket gateway for streaming LLM task progress
//!
//! StreamGate delivers asynchronous task progress from a background worker
//! to exactly the client that requested it, over a persistent WebSocket,
//! while preventing any other party from reading, injecting, or hijacking
//! the stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      StreamGate Gateway                      │
//! │                                                              │
//! │  upgrade ──► Gateway Session ──► Token Verifier (JWT)        │
//! │  request          │                                          │
//! │                   ├──► Connection Registry (cap, sweep)      │
//! │                   │                                          │
//! │                   └──► Channel Router (topic subscriptions)  │
//! │                              ▲                               │
//! │                              │ publish                       │
//! │                     Publisher Interface                      │
//! └──────────────────────────────┼───────────────────────────────┘
//!                                │
//!                     background task executor
//! ```
//!
//! The streaming leg is producer-only: after the handshake, the gateway
//! accepts nothing but `ping`/`heartbeat` from the peer. Application
//! commands travel over a separate request-intake service, which removes
//! an entire class of injection attack surface from this channel.
//!
//! ## Modules
//!
//! - [`gateway`]: server lifecycle, HTTP surface, and the upgrade route
//! - [`session`]: per-connection state machine and socket loop
//! - [`registry`]: per-identity connection table with cap and sweep
//! - [`router`]: topic-keyed publish/subscribe fan-out
//! - [`publisher`]: the narrow API the task executor calls
//! - [`auth`]: JWT credential verification
//! - [`protocol`]: wire types and closure codes
//! - [`config`]: configuration management

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod publisher;
pub mod registry;
pub mod router;
pub mod session;

pub use config::StreamGateConfig;
pub use error::{Error, Result};
