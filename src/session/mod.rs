//! Gateway sessions
//!
//! One session owns one accepted connection. The state machine lives in
//! [`machine`] as plain transition functions with no I/O; [`stream`] binds
//! it to the real handshake and socket loop.

pub mod machine;
pub mod stream;

pub use machine::{InboundDisposition, LivenessAck, SessionMachine, SessionState};
pub use stream::UpgradeParams;
