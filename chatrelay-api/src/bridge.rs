//! Per-connection protocol bridge
//!
//! A session moves through `Unauthenticated -> Authenticated -> Streaming ->
//! Closed`. After authentication the inbound pump runs on the caller's task
//! while a spawned writer drains the connection's outbound queue. Whichever
//! side stops first ends the session; the bridge then cancels the other side
//! and always unregisters its own handle.

use chatrelay_cluster::{
    sync::{run_writer, WriterExit, WriterSettings},
    ConnectionHandle, ConnectionRegistry, FrameSink, OutboundFrame, OutboundQueue, RelayBus,
};
use chatrelay_core::config::ConnectionConfig;
use chatrelay_core::models::Principal;
use chatrelay_core::service::{AuthVerifier, MembershipService, MessageStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::ClientFrame;
use crate::error::BridgeError;
use crate::session::{SessionHandler, SessionServices};
use crate::transport::{FrameStream, InboundError};

#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub queue_capacity: usize,
    pub keepalive: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub auth_timeout: Duration,
    pub max_text_length: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for BridgeSettings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            keepalive: config.keepalive(),
            idle_timeout: config.idle_timeout(),
            write_timeout: config.write_timeout(),
            auth_timeout: config.auth_timeout(),
            max_text_length: config.max_text_length,
        }
    }
}

impl BridgeSettings {
    const fn writer(&self) -> WriterSettings {
        WriterSettings {
            keepalive: self.keepalive,
            write_timeout: self.write_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Streaming,
    Closed,
}

impl SessionState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unauthenticated, Self::Authenticated)
                | (Self::Authenticated, Self::Streaming)
                | (Self::Unauthenticated | Self::Authenticated | Self::Streaming, Self::Closed)
        )
    }

    fn advance(self, next: Self) -> Self {
        if !self.can_transition_to(next) {
            warn!(from = ?self, to = ?next, "Unexpected session state transition");
        }
        next
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    AuthFailed(String),
    /// The peer closed its side
    ClientClosed,
    ReadFailed(String),
    /// No inbound frame or pong within the idle timeout
    IdleTimeout,
    WriteFailed(String),
    /// A newer connection of the same principal replaced this one
    Evicted,
    /// Process shutdown
    Shutdown,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailed(_) => "auth_failed",
            Self::ClientClosed => "client_closed",
            Self::ReadFailed(_) => "read_failed",
            Self::IdleTimeout => "idle_timeout",
            Self::WriteFailed(_) => "write_failed",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

pub struct ProtocolBridge {
    registry: ConnectionRegistry,
    verifier: Arc<dyn AuthVerifier>,
    services: SessionServices,
    settings: BridgeSettings,
    active_sessions: Arc<AtomicUsize>,
}

impl ProtocolBridge {
    #[must_use]
    pub fn new(
        registry: ConnectionRegistry,
        relay: Arc<RelayBus>,
        verifier: Arc<dyn AuthVerifier>,
        store: Arc<dyn MessageStore>,
        membership: Arc<dyn MembershipService>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            registry,
            verifier,
            services: SessionServices {
                store,
                membership,
                relay,
            },
            settings,
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Sessions currently inside [`ProtocolBridge::run`], authenticated or not
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Drive one client connection until it closes
    pub async fn run<R, W>(&self, mut reader: R, mut writer: W) -> CloseReason
    where
        R: FrameStream,
        W: FrameSink,
    {
        let _active = ActiveSession::enter(&self.active_sessions);
        let mut state = SessionState::Unauthenticated;

        let principal = match self.authenticate(&mut reader).await {
            Ok(principal) => principal,
            Err(err) => {
                debug!(error = %err, "Session authentication failed");
                self.reject_unauthenticated(&mut writer, &err).await;
                return CloseReason::AuthFailed(err.client_message());
            }
        };
        state = state.advance(SessionState::Authenticated);

        let (queue, queue_rx) = OutboundQueue::bounded(self.settings.queue_capacity);
        let handle = ConnectionHandle::new(principal.clone(), queue);

        // Ready goes first on the fresh queue, ahead of anything relayed
        // once the handle is visible in the registry
        if let Err(e) = handle.enqueue(OutboundFrame::Ready {
            principal: principal.clone(),
            connection_id: handle.connection_id().to_string(),
        }) {
            warn!(principal = %principal, error = %e, "Failed to enqueue ready frame");
        }
        if let Some(evicted) = self.registry.register(handle.clone()) {
            info!(
                principal = %principal,
                evicted_connection = %evicted.connection_id(),
                "Replaced existing connection"
            );
        }

        let mut writer_task = tokio::spawn(run_writer(
            queue_rx,
            writer,
            handle.shutdown_token(),
            self.settings.writer(),
        ));

        state = state.advance(SessionState::Streaming);
        info!(
            principal = %principal,
            connection_id = %handle.connection_id(),
            "Session established"
        );

        let session = SessionHandler::new(
            principal.clone(),
            handle.clone(),
            self.services.clone(),
            self.settings.max_text_length,
        );

        let (reason, writer_finished) = tokio::select! {
            reason = pump_inbound(&mut reader, &session, self.settings.idle_timeout) => (reason, false),
            exit = &mut writer_task => (self.writer_close_reason(exit, &handle), true),
        };

        handle.shutdown();
        if !writer_finished {
            self.stop_writer(writer_task).await;
        }

        self.registry.unregister(&handle);
        state = state.advance(SessionState::Closed);

        info!(
            principal = %principal,
            connection_id = %handle.connection_id(),
            reason = reason.as_str(),
            state = ?state,
            duration_ms = u64::try_from(handle.duration().as_millis()).unwrap_or(u64::MAX),
            "Session closed"
        );
        reason
    }

    async fn authenticate<R: FrameStream>(&self, reader: &mut R) -> Result<Principal, BridgeError> {
        let first = timeout(self.settings.auth_timeout, reader.recv())
            .await
            .map_err(|_| BridgeError::AuthFailed("authentication timed out".to_string()))?;

        let token = match first {
            Some(Ok(ClientFrame::Auth { token })) => token,
            Some(Ok(other)) => {
                return Err(BridgeError::AuthFailed(format!(
                    "expected auth frame, got {}",
                    other.kind()
                )));
            }
            Some(Err(InboundError::Decode(msg))) => return Err(BridgeError::AuthFailed(msg)),
            Some(Err(InboundError::Transport(msg))) => {
                return Err(BridgeError::AuthFailed(format!("transport error: {msg}")));
            }
            None => {
                return Err(BridgeError::AuthFailed(
                    "connection closed before authentication".to_string(),
                ));
            }
        };

        self.verifier.verify(&token).await.map_err(|e| {
            debug!(error = %e, "Credential rejected");
            BridgeError::AuthFailed("invalid credential".to_string())
        })
    }

    /// No queue exists yet, so the error frame goes straight to the sink
    async fn reject_unauthenticated<W: FrameSink>(&self, writer: &mut W, err: &BridgeError) {
        let frame = OutboundFrame::error(err.code(), err.client_message());
        match timeout(self.settings.write_timeout, writer.send(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Failed to write auth error frame"),
            Err(_) => debug!("Auth error frame write timed out"),
        }
        if timeout(self.settings.write_timeout, writer.close()).await.is_err() {
            debug!("Closing unauthenticated transport timed out");
        }
    }

    fn writer_close_reason(
        &self,
        exit: Result<WriterExit, tokio::task::JoinError>,
        handle: &ConnectionHandle,
    ) -> CloseReason {
        match exit {
            Ok(WriterExit::WriteFailed(e)) => CloseReason::WriteFailed(e),
            Ok(WriterExit::Shutdown | WriterExit::QueueClosed) => {
                let replaced = self
                    .registry
                    .lookup(handle.principal())
                    .is_some_and(|current| !current.same_connection(handle));
                if replaced {
                    CloseReason::Evicted
                } else {
                    CloseReason::Shutdown
                }
            }
            Err(e) => CloseReason::WriteFailed(format!("writer task failed: {e}")),
        }
    }

    async fn stop_writer(&self, mut writer_task: JoinHandle<WriterExit>) {
        // The writer closes the transport on its way out, bounded like any write
        if timeout(self.settings.write_timeout, &mut writer_task).await.is_err() {
            warn!("Writer did not stop in time, aborting");
            writer_task.abort();
        }
    }
}

async fn pump_inbound<R: FrameStream>(
    reader: &mut R,
    session: &SessionHandler,
    idle_timeout: Duration,
) -> CloseReason {
    loop {
        let Ok(next) = timeout(idle_timeout, reader.recv()).await else {
            return CloseReason::IdleTimeout;
        };
        match next {
            None => return CloseReason::ClientClosed,
            Some(Ok(frame)) => session.handle(frame).await,
            Some(Err(InboundError::Decode(msg))) => {
                session.reject(&BridgeError::InvalidInput(msg));
            }
            Some(Err(InboundError::Transport(msg))) => return CloseReason::ReadFailed(msg),
        }
    }
}

struct ActiveSession {
    counter: Arc<AtomicUsize>,
}

impl ActiveSession {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{channel_transport, ClientEnd, SinkEvent};
    use chatrelay_cluster::{InMemoryBroker, RelayBusConfig};
    use chatrelay_core::service::{
        InMemoryMembership, InMemoryMessageStore, MockAuthVerifier, MockMessageStore,
    };
    use chatrelay_core::Error as CoreError;
    use serde_json::Value;

    fn verifier() -> MockAuthVerifier {
        let mut verifier = MockAuthVerifier::new();
        verifier.expect_verify().returning(|token| {
            token
                .strip_prefix("token-")
                .map(Principal::from)
                .ok_or_else(|| CoreError::Authentication("bad token".to_string()))
        });
        verifier
    }

    fn directory() -> InMemoryMembership {
        let membership = InMemoryMembership::new();
        membership.add_user("alice");
        membership.add_user("bob");
        membership.add_conversation("general", ["alice", "bob"]);
        membership
    }

    struct Fixture {
        bridge: Arc<ProtocolBridge>,
        relay: Arc<RelayBus>,
    }

    fn fixture_with(verifier: MockAuthVerifier, store: Arc<dyn MessageStore>) -> Fixture {
        let registry = ConnectionRegistry::new();
        let relay = RelayBus::new(
            RelayBusConfig::default(),
            Arc::new(InMemoryBroker::new()),
            registry.clone(),
        );
        let bridge = ProtocolBridge::new(
            registry,
            relay.clone(),
            Arc::new(verifier),
            store,
            Arc::new(directory()),
            BridgeSettings::default(),
        );
        Fixture {
            bridge: Arc::new(bridge),
            relay,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(verifier(), Arc::new(InMemoryMessageStore::new()))
    }

    fn start(bridge: &Arc<ProtocolBridge>) -> (ClientEnd, JoinHandle<CloseReason>) {
        let (client, stream, sink) = channel_transport(16);
        let bridge = bridge.clone();
        let task = tokio::spawn(async move { bridge.run(stream, sink).await });
        (client, task)
    }

    async fn login(bridge: &Arc<ProtocolBridge>, principal: &str) -> (ClientEnd, JoinHandle<CloseReason>) {
        let (mut client, task) = start(bridge);
        assert!(client.send(ClientFrame::Auth { token: format!("token-{principal}") }).await);
        let ready = client.recv_frame().await.unwrap();
        assert_eq!(ready["type"], "ready");
        assert_eq!(ready["principal"], principal);
        (client, task)
    }

    async fn expect_error(client: &mut ClientEnd, code: &str) -> Value {
        let frame = client.recv_frame().await.unwrap();
        assert_eq!(frame["type"], "error", "unexpected frame {frame}");
        assert_eq!(frame["code"], code);
        frame
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Unauthenticated.can_transition_to(Authenticated));
        assert!(Authenticated.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Closed));
        assert!(Unauthenticated.can_transition_to(Closed));
        assert!(!Unauthenticated.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Authenticated));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_settings_from_config() {
        let config = ConnectionConfig {
            queue_capacity: 8,
            auth_timeout_seconds: 3,
            ..ConnectionConfig::default()
        };
        let settings = BridgeSettings::from(&config);
        assert_eq!(settings.queue_capacity, 8);
        assert_eq!(settings.auth_timeout, Duration::from_secs(3));
        assert_eq!(settings.keepalive, Duration::from_secs(54));
        assert_eq!(settings.idle_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_non_auth_first_frame_fails() {
        let mut never = MockAuthVerifier::new();
        never.expect_verify().never();
        let fx = fixture_with(never, Arc::new(InMemoryMessageStore::new()));

        let (mut client, task) = start(&fx.bridge);
        client.send(ClientFrame::Ping).await;

        expect_error(&mut client, "AUTH_FAILED").await;
        assert_eq!(client.recv().await, Some(SinkEvent::Closed));
        assert!(matches!(task.await.unwrap(), CloseReason::AuthFailed(_)));
        assert_eq!(fx.bridge.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_token_fails() {
        let fx = fixture();
        let (mut client, task) = start(&fx.bridge);
        client.send(ClientFrame::Auth { token: "forged".to_string() }).await;

        let frame = expect_error(&mut client, "AUTH_FAILED").await;
        assert_eq!(frame["message"], "invalid credential");
        assert_eq!(
            task.await.unwrap(),
            CloseReason::AuthFailed("invalid credential".to_string())
        );
        assert_eq!(fx.bridge.registry().connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout() {
        let fx = fixture();
        let (mut client, task) = start(&fx.bridge);

        expect_error(&mut client, "AUTH_FAILED").await;
        assert_eq!(
            task.await.unwrap(),
            CloseReason::AuthFailed("authentication timed out".to_string())
        );
        assert_eq!(fx.bridge.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_hits_idle_timeout() {
        let fx = fixture();
        let (mut client, task) = login(&fx.bridge, "alice").await;

        // Keepalives go out but nothing ever comes back
        let mut keepalives = 0;
        loop {
            match client.recv().await {
                Some(SinkEvent::Keepalive) => keepalives += 1,
                Some(SinkEvent::Closed) | None => break,
                Some(SinkEvent::Frame(frame)) => panic!("unexpected frame {frame}"),
            }
        }

        assert_eq!(keepalives, 1);
        assert_eq!(task.await.unwrap(), CloseReason::IdleTimeout);
        assert!(!fx.bridge.registry().is_connected(&"alice".into()));
        assert_eq!(fx.bridge.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_reset_idle_timeout() {
        let fx = fixture();
        let (client, task) = login(&fx.bridge, "alice").await;

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(client.send(ClientFrame::Ping).await);
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(!task.is_finished());
        assert!(fx.bridge.registry().is_connected(&"alice".into()));

        assert_eq!(task.await.unwrap(), CloseReason::IdleTimeout);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ready_precedes_relayed_frames() {
        let fx = fixture();
        let flooding = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flood = {
            let registry = fx.bridge.registry().clone();
            let flooding = flooding.clone();
            tokio::spawn(async move {
                while flooding.load(Ordering::Acquire) {
                    registry.deliver(&"alice".into(), OutboundFrame::error("INTERNAL_ERROR", "early"));
                    tokio::task::yield_now().await;
                }
            })
        };

        // login asserts that the first frame is ready
        let (_client, _task) = login(&fx.bridge, "alice").await;
        flooding.store(false, Ordering::Release);
        flood.await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_then_client_close_unregisters() {
        let fx = fixture();
        let (mut client, task) = login(&fx.bridge, "alice").await;
        assert!(fx.bridge.registry().is_connected(&"alice".into()));
        assert_eq!(fx.bridge.active_sessions(), 1);

        client.close();
        assert_eq!(task.await.unwrap(), CloseReason::ClientClosed);
        assert!(!fx.bridge.registry().is_connected(&"alice".into()));
        assert_eq!(fx.bridge.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_validation_errors_keep_session_open() {
        let fx = fixture();
        let (mut client, task) = login(&fx.bridge, "alice").await;

        client.send(ClientFrame::text_to("bob", "   ")).await;
        expect_error(&mut client, "INVALID_INPUT").await;

        client.send(ClientFrame::text_to("bob", "x".repeat(4097))).await;
        expect_error(&mut client, "INVALID_INPUT").await;

        client.send(ClientFrame::text_to("alice", "me")).await;
        expect_error(&mut client, "INVALID_INPUT").await;

        client.send(ClientFrame::text_to("mallory", "hi")).await;
        expect_error(&mut client, "UNKNOWN_RECIPIENT").await;

        client
            .send(ClientFrame::Typing {
                conversation_id: "secret".into(),
                is_typing: true,
            })
            .await;
        expect_error(&mut client, "PERMISSION_DENIED").await;

        client.send(ClientFrame::Auth { token: "token-alice".to_string() }).await;
        expect_error(&mut client, "INVALID_INPUT").await;

        client.send_error(InboundError::Decode("malformed frame".to_string())).await;
        let frame = expect_error(&mut client, "INVALID_INPUT").await;
        assert_eq!(frame["message"], "malformed frame");

        client.close();
        assert_eq!(task.await.unwrap(), CloseReason::ClientClosed);
        assert_eq!(fx.relay.metrics().publish_dropped, 0);
    }

    #[tokio::test]
    async fn test_send_echoes_persisted_message() {
        let fx = fixture();
        let (mut client, task) = login(&fx.bridge, "alice").await;

        client
            .send(ClientFrame::Send {
                to: None,
                conversation_id: Some("general".into()),
                text: "hello all".to_string(),
                message_type: chatrelay_core::models::MessageKind::Text,
                client_id: Some("c-1".to_string()),
            })
            .await;

        let echo = client.recv_frame().await.unwrap();
        assert_eq!(echo["type"], "message");
        assert_eq!(echo["sender"], "alice");
        assert_eq!(echo["recipients"], serde_json::json!(["bob"]));
        assert_eq!(echo["sequence"], 1);
        assert_eq!(echo["payload"]["client_id"], "c-1");

        client.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_persistence_failure_is_not_published() {
        let mut store = MockMessageStore::new();
        store
            .expect_persist()
            .times(1)
            .returning(|_| Err(CoreError::Storage("disk full".to_string())));
        let fx = fixture_with(verifier(), Arc::new(store));
        let (mut client, task) = login(&fx.bridge, "alice").await;

        client.send(ClientFrame::text_to("bob", "hi")).await;
        let frame = expect_error(&mut client, "PERSISTENCE_FAILED").await;
        assert_eq!(frame["message"], "message could not be stored");

        client.close();
        task.await.unwrap();
        let metrics = fx.relay.metrics();
        assert_eq!(metrics.published, 0);
        assert_eq!(metrics.publish_dropped, 0);
    }

    #[tokio::test]
    async fn test_read_failure_closes_session() {
        let fx = fixture();
        let (client, task) = login(&fx.bridge, "bob").await;

        client
            .send_error(InboundError::Transport("reset by peer".to_string()))
            .await;
        assert_eq!(
            task.await.unwrap(),
            CloseReason::ReadFailed("reset by peer".to_string())
        );
        assert_eq!(fx.bridge.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_all_ends_session() {
        let fx = fixture();
        let (_client, task) = login(&fx.bridge, "bob").await;

        assert_eq!(fx.bridge.registry().shutdown_all(), 1);
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
    }
}
