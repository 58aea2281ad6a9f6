//! Gateway server and HTTP surface
//!
//! The gateway owns the shared collaborators (verifier, registry, router),
//! serves the WebSocket upgrade route, and runs the periodic sweep.

pub mod handler;
pub mod server;

pub use handler::ApiHandler;
pub use server::{Gateway, GatewayBuilder, GatewayState};
