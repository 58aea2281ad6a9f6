//! Session establishment and socket loop
//!
//! [`establish`] runs the whole setup sequence (parameter validation,
//! origin check, credential verification, authorization, admission,
//! registration, subscription) against injected collaborators and no
//! socket, so every rejection path is testable without I/O. [`run`] then
//! binds an established session to the real WebSocket: it drains the
//! handle's outbound queue, enforces the inbound whitelist, and watches the
//! cancellation token for sweep eviction or server shutdown.
//!
//! Teardown order matters: unsubscribe from the router before releasing
//! the registry slot, so no publish can target a handle mid-teardown.

use crate::auth::TokenVerifier;
use crate::protocol::{CloseReason, Event, InboundFrame, Topic};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::router::ChannelRouter;
use crate::session::machine::{InboundDisposition, LivenessAck, SessionMachine};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything extracted from the upgrade request
#[derive(Debug, Clone, Default)]
pub struct UpgradeParams {
    /// Identity claimed in the path
    pub claimed_identity: String,
    /// Conversation addressed by the `conversation` query parameter
    pub conversation: Option<String>,
    /// Bearer credential from query parameter or Authorization header
    pub credential: Option<String>,
    /// Origin header, if the client sent one
    pub origin: Option<String>,
}

/// A session that reached `Streaming`
#[derive(Debug)]
pub(crate) struct EstablishedSession {
    pub machine: SessionMachine,
    pub handle: Arc<ConnectionHandle>,
    pub outbound: mpsc::UnboundedReceiver<String>,
}

/// Run the setup sequence up to `Streaming`
///
/// On any failure the reservation (if taken) is returned by its drop guard
/// and the caller only has a closure code to report; nothing of the failure
/// detail reaches the peer.
pub(crate) async fn establish(
    params: UpgradeParams,
    verifier: &TokenVerifier,
    registry: &ConnectionRegistry,
    router: &ChannelRouter,
    allowed_origins: &[String],
) -> std::result::Result<EstablishedSession, CloseReason> {
    let mut machine = SessionMachine::new();
    machine
        .begin_authentication()
        .map_err(|_| CloseReason::BadRequest)?;

    let claimed = params.claimed_identity.trim().to_string();
    if claimed.is_empty() {
        return Err(machine.reject(CloseReason::BadRequest));
    }
    let conversation = match params.conversation.as_deref().map(str::trim) {
        Some(conversation) if !conversation.is_empty() => conversation.to_string(),
        _ => return Err(machine.reject(CloseReason::BadRequest)),
    };
    let Some(credential) = params.credential.as_deref() else {
        return Err(machine.reject(CloseReason::BadRequest));
    };

    // An absent Origin header is treated as same-origin and allowed
    if !allowed_origins.is_empty() {
        if let Some(origin) = &params.origin {
            if !allowed_origins.iter().any(|allowed| allowed == origin) {
                tracing::warn!(%origin, "Connection rejected: origin not allowed");
                return Err(machine.reject(CloseReason::OriginDenied));
            }
        }
    }

    let identity = verifier
        .verify(credential)
        .map_err(|_| machine.reject(CloseReason::Unauthorized))?;

    machine.authorize(&identity, &claimed)?;

    let reservation = registry
        .try_admit(&identity)
        .map_err(|_| machine.reject(CloseReason::RateLimited))?;

    let (sender, outbound) = mpsc::unbounded_channel();
    let topic = Topic::new(identity, conversation);
    let handle = Arc::new(ConnectionHandle::new(
        topic.identity().clone(),
        topic,
        sender,
    ));

    if let Err(e) = registry.register(reservation, handle.clone()) {
        tracing::error!(error = %e, "Failed to register admitted connection");
        return Err(machine.reject(CloseReason::BadRequest));
    }

    machine
        .enter_streaming()
        .map_err(|_| machine.reject(CloseReason::BadRequest))?;
    router.subscribe(handle.clone()).await;

    let connected = Event::system(
        handle.topic(),
        "connected",
        "WebSocket connection established",
    );
    match serde_json::to_string(&connected) {
        Ok(frame) => {
            handle.send(frame);
        }
        Err(e) => tracing::warn!(error = %e, "Failed to serialize connected notice"),
    }

    tracing::info!(
        identity = %handle.identity(),
        handle = %handle.id(),
        topic = %handle.topic(),
        "Streaming session established"
    );
    Ok(EstablishedSession {
        machine,
        handle,
        outbound,
    })
}

/// Drive an established session over its socket until it closes
pub(crate) async fn run(
    socket: WebSocket,
    established: EstablishedSession,
    router: &ChannelRouter,
    registry: &ConnectionRegistry,
    max_inbound_frame_bytes: usize,
) {
    let EstablishedSession {
        mut machine,
        handle,
        mut outbound,
    } = established;
    let (mut ws_tx, mut ws_rx) = socket.split();
    let cancel = handle.cancel_token().clone();

    let reason = loop {
        tokio::select! {
            // Published events -> peer
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break machine.reject(CloseReason::Normal);
                        }
                    }
                    None => break machine.reject(CloseReason::Normal),
                }
            }

            // Peer -> whitelist
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let parsed = InboundFrame::parse(&text, max_inbound_frame_bytes);
                        match machine.handle_inbound(parsed) {
                            InboundDisposition::Ack(ack) => {
                                handle.touch();
                                let event = ack_event(&handle, ack);
                                if let Ok(frame) = serde_json::to_string(&event) {
                                    if ws_tx.send(Message::Text(frame)).await.is_err() {
                                        break machine.reject(CloseReason::Normal);
                                    }
                                }
                            }
                            InboundDisposition::Close(reason) => break reason,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break machine.reject(CloseReason::Normal);
                    }
                    // Protocol-level ping/pong and stray binary frames carry
                    // no discriminant; ignored as the original does
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(handle = %handle.id(), error = %e, "Socket read failed");
                        break machine.reject(CloseReason::Normal);
                    }
                }
            }

            // Sweep eviction or server shutdown
            _ = cancel.cancelled() => {
                break machine.reject(CloseReason::Normal);
            }
        }
    };

    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: reason.as_str().into(),
        })))
        .await;
    let _ = ws_tx.flush().await;

    teardown(&handle, router, registry).await;
    machine.finish_close();

    tracing::info!(
        identity = %handle.identity(),
        handle = %handle.id(),
        code = reason.code(),
        "Session closed"
    );
}

/// Release a handle from router and registry; idempotent
///
/// The sweep task and the socket loop both come through here, so eviction
/// uses the same bookkeeping path as an explicit close.
pub(crate) async fn teardown(
    handle: &Arc<ConnectionHandle>,
    router: &ChannelRouter,
    registry: &ConnectionRegistry,
) {
    router.unsubscribe(handle.topic(), handle.id()).await;
    registry.release(handle.identity(), handle.id());
    handle.close();
}

fn ack_event(handle: &ConnectionHandle, ack: LivenessAck) -> Event {
    match ack {
        LivenessAck::Pong { client_timestamp } => Event::system_echo(
            handle.topic(),
            "pong",
            "connection healthy",
            client_timestamp,
        ),
        LivenessAck::Alive => Event::system(handle.topic(), "alive", "connection healthy"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::protocol::Identity;
    use crate::session::machine::SessionState;

    struct Fixture {
        verifier: TokenVerifier,
        registry: ConnectionRegistry,
        router: ChannelRouter,
    }

    impl Fixture {
        fn new(cap: usize) -> Self {
            Self {
                verifier: TokenVerifier::new("test-secret"),
                registry: ConnectionRegistry::new(&LimitsConfig {
                    max_connections_per_user: cap,
                    ..Default::default()
                }),
                router: ChannelRouter::new(),
            }
        }

        fn params(&self, claimed: &str, subject: &str, conversation: &str) -> UpgradeParams {
            UpgradeParams {
                claimed_identity: claimed.to_string(),
                conversation: Some(conversation.to_string()),
                credential: Some(self.verifier.mint(&Identity::new(subject), 3600).unwrap()),
                origin: None,
            }
        }

        async fn establish(
            &self,
            params: UpgradeParams,
        ) -> std::result::Result<EstablishedSession, CloseReason> {
            establish(params, &self.verifier, &self.registry, &self.router, &[]).await
        }
    }

    #[tokio::test]
    async fn test_establish_reaches_streaming() {
        let fixture = Fixture::new(3);
        let mut session = fixture
            .establish(fixture.params("user-1", "user-1", "conv-1"))
            .await
            .unwrap();

        assert_eq!(session.machine.state(), SessionState::Streaming);
        assert_eq!(fixture.registry.count(&Identity::new("user-1")), 1);
        assert_eq!(
            fixture
                .router
                .subscriber_count(session.handle.topic())
                .await,
            1
        );

        // The connected notice is queued before any published event
        let frame = session.outbound.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "system");
        assert_eq!(value["status"], "connected");
    }

    #[tokio::test]
    async fn test_identity_mismatch_closes_forbidden() {
        let fixture = Fixture::new(3);
        let reason = fixture
            .establish(fixture.params("user-1", "user-2", "conv-1"))
            .await
            .unwrap_err();

        assert_eq!(reason, CloseReason::Forbidden);
        // No reservation leak for either identity involved
        assert_eq!(fixture.registry.count(&Identity::new("user-1")), 0);
        assert_eq!(fixture.registry.count(&Identity::new("user-2")), 0);
        assert_eq!(fixture.router.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_credential_closes_unauthorized() {
        let fixture = Fixture::new(3);
        let params = UpgradeParams {
            claimed_identity: "user-1".to_string(),
            conversation: Some("conv-1".to_string()),
            credential: Some("not-a-token".to_string()),
            origin: None,
        };

        assert_eq!(
            fixture.establish(params).await.unwrap_err(),
            CloseReason::Unauthorized
        );
        assert_eq!(fixture.registry.count(&Identity::new("user-1")), 0);
    }

    #[tokio::test]
    async fn test_missing_parameters_close_bad_request() {
        let fixture = Fixture::new(3);

        let mut missing_credential = fixture.params("user-1", "user-1", "conv-1");
        missing_credential.credential = None;
        assert_eq!(
            fixture.establish(missing_credential).await.unwrap_err(),
            CloseReason::BadRequest
        );

        let mut missing_conversation = fixture.params("user-1", "user-1", "conv-1");
        missing_conversation.conversation = None;
        assert_eq!(
            fixture.establish(missing_conversation).await.unwrap_err(),
            CloseReason::BadRequest
        );

        let empty_identity = fixture.params("  ", "user-1", "conv-1");
        assert_eq!(
            fixture.establish(empty_identity).await.unwrap_err(),
            CloseReason::BadRequest
        );

        assert_eq!(fixture.registry.count(&Identity::new("user-1")), 0);
    }

    #[tokio::test]
    async fn test_cap_scenario_across_identities() {
        let fixture = Fixture::new(3);

        let mut sessions = Vec::new();
        for _ in 0..3 {
            sessions.push(
                fixture
                    .establish(fixture.params("u1", "u1", "conv-1"))
                    .await
                    .unwrap(),
            );
        }

        // Fourth attempt for u1 is rejected without disturbing the rest
        assert_eq!(
            fixture
                .establish(fixture.params("u1", "u1", "conv-1"))
                .await
                .unwrap_err(),
            CloseReason::RateLimited
        );
        assert_eq!(fixture.registry.count(&Identity::new("u1")), 3);

        // u2 admits independently
        let session = fixture
            .establish(fixture.params("u2", "u2", "conv-9"))
            .await
            .unwrap();
        assert_eq!(session.machine.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_origin_enforcement() {
        let fixture = Fixture::new(3);
        let allowed = vec!["http://localhost:5173".to_string()];

        let mut denied = fixture.params("user-1", "user-1", "conv-1");
        denied.origin = Some("http://evil.example".to_string());
        let result = establish(
            denied,
            &fixture.verifier,
            &fixture.registry,
            &fixture.router,
            &allowed,
        )
        .await;
        assert_eq!(result.unwrap_err(), CloseReason::OriginDenied);

        let mut accepted = fixture.params("user-1", "user-1", "conv-1");
        accepted.origin = Some("http://localhost:5173".to_string());
        assert!(establish(
            accepted,
            &fixture.verifier,
            &fixture.registry,
            &fixture.router,
            &allowed,
        )
        .await
        .is_ok());

        // Absent Origin is treated as same-origin
        let absent = fixture.params("user-1", "user-1", "conv-2");
        assert!(establish(
            absent,
            &fixture.verifier,
            &fixture.registry,
            &fixture.router,
            &allowed,
        )
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn test_teardown_releases_everything_once() {
        let fixture = Fixture::new(3);
        let session = fixture
            .establish(fixture.params("user-1", "user-1", "conv-1"))
            .await
            .unwrap();
        let handle = session.handle.clone();
        let topic = handle.topic().clone();

        teardown(&handle, &fixture.router, &fixture.registry).await;
        assert_eq!(fixture.registry.count(&Identity::new("user-1")), 0);
        assert_eq!(fixture.router.subscriber_count(&topic).await, 0);
        assert!(handle.cancel_token().is_cancelled());

        // Double teardown stays a no-op
        teardown(&handle, &fixture.router, &fixture.registry).await;
        assert_eq!(fixture.registry.count(&Identity::new("user-1")), 0);

        // The slot is reusable afterwards
        assert!(fixture
            .establish(fixture.params("user-1", "user-1", "conv-1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_no_delivery_after_teardown() {
        let fixture = Fixture::new(3);
        let session = fixture
            .establish(fixture.params("user-1", "user-1", "conv-1"))
            .await
            .unwrap();
        let topic = session.handle.topic().clone();

        teardown(&session.handle, &fixture.router, &fixture.registry).await;

        let event = Event::status(&topic, crate::protocol::TaskStatus::Completed, "done");
        assert_eq!(fixture.router.publish(&topic, &event).await, 0);
    }
}
