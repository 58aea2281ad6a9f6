//! Session state machine
//!
//! Explicit transition functions for the per-connection lifecycle:
//!
//! ```text
//! Connecting -> Authenticating -> Authorized -> Streaming -> Closing -> Closed
//! ```
//!
//! Every rejection path jumps straight to `Closing` with the closure code
//! the peer will see. The machine is deliberately free of I/O and of any
//! scheduling primitive so the whole transition table is testable in
//! isolation; the socket loop in [`super::stream`] merely executes what the
//! machine decides.

use crate::error::{Error, Result};
use crate::protocol::{CloseReason, FrameError, Identity, InboundFrame};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upgrade request received
    Connecting,
    /// Credential being verified
    Authenticating,
    /// Identity verified and matched against the path claim
    Authorized,
    /// Registered, subscribed, accepting the inbound whitelist
    Streaming,
    /// Teardown in progress
    Closing,
    /// Terminal; the session accepts no further operations
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Authorized => write!(f, "authorized"),
            Self::Streaming => write!(f, "streaming"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Liveness acknowledgment owed to the peer for a whitelisted frame
#[derive(Debug, Clone, PartialEq)]
pub enum LivenessAck {
    /// Reply to `ping`, echoing any client timestamp
    Pong {
        client_timestamp: Option<serde_json::Value>,
    },
    /// Reply to `heartbeat`
    Alive,
}

/// What the socket loop must do with an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundDisposition {
    /// Whitelisted frame: acknowledge and refresh activity
    Ack(LivenessAck),
    /// Protocol violation: close the session
    Close(CloseReason),
}

/// Per-session state machine
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    close_reason: Option<CloseReason>,
}

impl SessionMachine {
    /// New machine for a just-received upgrade
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            close_reason: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Closure code chosen during teardown, if any
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Unconditional `Connecting -> Authenticating`
    pub fn begin_authentication(&mut self) -> Result<()> {
        self.expect(SessionState::Connecting)?;
        self.state = SessionState::Authenticating;
        Ok(())
    }

    /// `Authenticating -> Authorized` when the verified identity equals the
    /// path-addressed claim; a mismatch closes `forbidden`, which is
    /// deliberately distinct from an invalid credential.
    pub fn authorize(
        &mut self,
        verified: &Identity,
        claimed: &str,
    ) -> std::result::Result<(), CloseReason> {
        if self.state != SessionState::Authenticating {
            return Err(self.reject(CloseReason::BadRequest));
        }
        if verified.as_str() != claimed {
            tracing::warn!(
                verified = %verified,
                claimed = %claimed,
                "Authorization failed: identity mismatch"
            );
            return Err(self.reject(CloseReason::Forbidden));
        }

        self.state = SessionState::Authorized;
        Ok(())
    }

    /// `Authorized -> Streaming` once the registry admitted the connection
    pub fn enter_streaming(&mut self) -> Result<()> {
        self.expect(SessionState::Authorized)?;
        self.state = SessionState::Streaming;
        Ok(())
    }

    /// Decide what to do with an inbound frame while streaming
    ///
    /// Exactly `ping` and `heartbeat` are acknowledged; everything else,
    /// including unparseable frames, is a protocol violation and moves the
    /// machine to `Closing`.
    pub fn handle_inbound(
        &mut self,
        parsed: std::result::Result<InboundFrame, FrameError>,
    ) -> InboundDisposition {
        if self.state != SessionState::Streaming {
            return InboundDisposition::Close(self.reject(CloseReason::PolicyViolation));
        }

        match parsed {
            Ok(InboundFrame::Ping { timestamp }) => InboundDisposition::Ack(LivenessAck::Pong {
                client_timestamp: timestamp,
            }),
            Ok(InboundFrame::Heartbeat) => InboundDisposition::Ack(LivenessAck::Alive),
            Err(violation) => {
                tracing::warn!(state = %self.state, %violation, "Protocol violation");
                InboundDisposition::Close(self.reject(CloseReason::PolicyViolation))
            }
        }
    }

    /// Move to `Closing` with the given closure code, from any live state.
    /// Returns the code so rejection sites read as one expression.
    pub fn reject(&mut self, reason: CloseReason) -> CloseReason {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closing;
            self.close_reason.get_or_insert(reason);
        }
        reason
    }

    /// `Closing -> Closed`; terminal
    pub fn finish_close(&mut self) {
        if self.state != SessionState::Closing {
            self.reject(CloseReason::Normal);
        }
        self.state = SessionState::Closed;
    }

    fn expect(&self, state: SessionState) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::Session(format!(
                "invalid transition from {}",
                self.state
            )))
        }
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_machine() -> SessionMachine {
        let mut machine = SessionMachine::new();
        machine.begin_authentication().unwrap();
        machine
            .authorize(&Identity::new("user-1"), "user-1")
            .unwrap();
        machine.enter_streaming().unwrap();
        machine
    }

    #[test]
    fn test_happy_path() {
        let mut machine = SessionMachine::new();
        assert_eq!(machine.state(), SessionState::Connecting);

        machine.begin_authentication().unwrap();
        assert_eq!(machine.state(), SessionState::Authenticating);

        machine
            .authorize(&Identity::new("user-1"), "user-1")
            .unwrap();
        assert_eq!(machine.state(), SessionState::Authorized);

        machine.enter_streaming().unwrap();
        assert_eq!(machine.state(), SessionState::Streaming);

        machine.reject(CloseReason::Normal);
        machine.finish_close();
        assert_eq!(machine.state(), SessionState::Closed);
    }

    #[test]
    fn test_identity_mismatch_is_forbidden_not_unauthorized() {
        let mut machine = SessionMachine::new();
        machine.begin_authentication().unwrap();

        let reason = machine
            .authorize(&Identity::new("user-2"), "user-1")
            .unwrap_err();
        assert_eq!(reason, CloseReason::Forbidden);
        assert_ne!(reason, CloseReason::Unauthorized);
        assert_eq!(machine.state(), SessionState::Closing);
    }

    #[test]
    fn test_rejected_session_never_streams() {
        let mut machine = SessionMachine::new();
        machine.begin_authentication().unwrap();
        machine.reject(CloseReason::RateLimited);

        assert!(machine.enter_streaming().is_err());
        assert_eq!(machine.close_reason(), Some(CloseReason::RateLimited));
    }

    #[test]
    fn test_whitelisted_frames_acknowledged() {
        let mut machine = streaming_machine();

        let ping = InboundFrame::parse(r#"{"type":"ping","timestamp":17}"#, 512);
        match machine.handle_inbound(ping) {
            InboundDisposition::Ack(LivenessAck::Pong { client_timestamp }) => {
                assert_eq!(client_timestamp, Some(serde_json::json!(17)));
            }
            other => panic!("expected pong, got {:?}", other),
        }

        let heartbeat = InboundFrame::parse(r#"{"type":"heartbeat"}"#, 512);
        assert_eq!(
            machine.handle_inbound(heartbeat),
            InboundDisposition::Ack(LivenessAck::Alive)
        );

        // Still streaming: liveness traffic never closes the session
        assert_eq!(machine.state(), SessionState::Streaming);
    }

    #[test]
    fn test_non_whitelisted_discriminant_closes() {
        let mut machine = streaming_machine();

        let frame = InboundFrame::parse(r#"{"type":"subscribe","topics":["x"]}"#, 512);
        assert_eq!(
            machine.handle_inbound(frame),
            InboundDisposition::Close(CloseReason::PolicyViolation)
        );
        assert_eq!(machine.state(), SessionState::Closing);
    }

    #[test]
    fn test_malformed_frame_closes() {
        let mut machine = streaming_machine();

        let frame = InboundFrame::parse("{", 512);
        assert_eq!(
            machine.handle_inbound(frame),
            InboundDisposition::Close(CloseReason::PolicyViolation)
        );
    }

    #[test]
    fn test_first_close_reason_wins() {
        let mut machine = SessionMachine::new();
        machine.begin_authentication().unwrap();
        machine.reject(CloseReason::Unauthorized);
        machine.reject(CloseReason::Normal);

        assert_eq!(machine.close_reason(), Some(CloseReason::Unauthorized));
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut machine = streaming_machine();
        machine.reject(CloseReason::Normal);
        machine.finish_close();

        assert!(machine.begin_authentication().is_err());
        assert!(machine.enter_streaming().is_err());
        machine.reject(CloseReason::Forbidden);
        assert_eq!(machine.state(), SessionState::Closed);
        assert_eq!(machine.close_reason(), Some(CloseReason::Normal));
    }
}
