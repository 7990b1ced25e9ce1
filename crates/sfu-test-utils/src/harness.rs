//! In-process SFU and signaling client.

use serde_json::{json, Value};
use sfu_controller::actors::{ActorMetrics, RoomRegistryHandle, DEFAULT_EMPTY_ROOM_TTL};
use sfu_controller::engine::mock::MockMediaEngine;
use sfu_controller::engine::MediaEngine;
use sfu_controller::signaling::{ServerMessage, SignalingGateway, SignalingSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default engine deadline for tests.
pub const TEST_ENGINE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long [`TestClient::next_notification`] waits.
const NOTIFICATION_WAIT: Duration = Duration::from_secs(2);

const NOTIFICATION_BUFFER: usize = 64;

/// Registry, gateway and mock engine wired together.
pub struct TestSfu {
    pub engine: Arc<MockMediaEngine>,
    pub registry: RoomRegistryHandle,
    pub metrics: Arc<ActorMetrics>,
    gateway: SignalingGateway,
}

impl Default for TestSfu {
    fn default() -> Self {
        Self::new()
    }
}

impl TestSfu {
    /// SFU backed by a mock engine that accepts every call.
    #[must_use]
    pub fn new() -> Self {
        Self::with_engine(MockMediaEngine::new(), TEST_ENGINE_TIMEOUT)
    }

    #[must_use]
    pub fn with_engine(engine: MockMediaEngine, engine_timeout: Duration) -> Self {
        Self::build(engine, engine_timeout, DEFAULT_EMPTY_ROOM_TTL)
    }

    /// SFU whose rooms close after `ttl` if nobody joins them.
    #[must_use]
    pub fn with_empty_room_ttl(ttl: Duration) -> Self {
        Self::build(MockMediaEngine::new(), TEST_ENGINE_TIMEOUT, ttl)
    }

    fn build(engine: MockMediaEngine, engine_timeout: Duration, empty_room_ttl: Duration) -> Self {
        let engine = Arc::new(engine);
        let metrics = ActorMetrics::new();
        let shared: Arc<dyn MediaEngine> = Arc::clone(&engine) as Arc<dyn MediaEngine>;
        let registry = RoomRegistryHandle::with_empty_room_ttl(
            "sfu-test".to_string(),
            shared,
            engine_timeout,
            empty_room_ttl,
            Arc::clone(&metrics),
        );
        let gateway = SignalingGateway::new(registry.clone(), Arc::clone(&metrics));
        Self {
            engine,
            registry,
            metrics,
            gateway,
        }
    }

    #[must_use]
    pub fn gateway(&self) -> SignalingGateway {
        self.gateway.clone()
    }

    /// Open a new signaling session, as if a WebSocket had connected.
    #[must_use]
    pub fn connect(&self) -> TestClient {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        TestClient {
            session: self.gateway.open_session(tx),
            notifications: rx,
            next_id: 1,
        }
    }

    /// Wait until the registry no longer lists `room_id`.
    pub async fn wait_for_room_removed(&self, room_id: &str) {
        for _ in 0..100 {
            if self.registry.get_room(room_id).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {room_id} was not removed");
    }
}

impl Drop for TestSfu {
    fn drop(&mut self) {
        self.registry.cancel();
    }
}

/// A signaling client speaking JSON frames to an in-process session.
pub struct TestClient {
    session: SignalingSession,
    notifications: mpsc::Receiver<ServerMessage>,
    next_id: u64,
}

impl TestClient {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.session.connection_id()
    }

    /// Send a raw text frame and return the response as JSON.
    pub async fn send_raw(&mut self, text: &str) -> Value {
        let reply = self.session.handle_text(text).await;
        serde_json::to_value(&reply).expect("response must serialize")
    }

    /// Send `method` with `data` and return the full response frame.
    pub async fn request(&mut self, method: &str, data: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let frame = json!({ "id": id, "method": method, "data": data });
        let response = self.send_raw(&frame.to_string()).await;
        assert_eq!(
            response.get("id").and_then(Value::as_u64),
            Some(id),
            "response must echo the request id"
        );
        response
    }

    /// Send a request that must succeed; returns its `data`.
    pub async fn request_ok(&mut self, method: &str, data: Value) -> Value {
        let response = self.request(method, data).await;
        assert_eq!(
            response.get("success"),
            Some(&Value::Bool(true)),
            "{method} failed: {response}"
        );
        response.get("data").cloned().unwrap_or(Value::Null)
    }

    /// Send a request that must fail; returns the error code.
    pub async fn request_err(&mut self, method: &str, data: Value) -> String {
        let response = self.request(method, data).await;
        assert_eq!(
            response.get("success"),
            Some(&Value::Bool(false)),
            "{method} unexpectedly succeeded: {response}"
        );
        response
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(Value::as_str)
            .expect("failure must carry an error code")
            .to_string()
    }

    pub async fn create_room(&mut self) -> String {
        let data = self.request_ok("createRoom", json!({})).await;
        string_field(&data, "roomId")
    }

    /// Join `room_id`; returns the router RTP capabilities.
    pub async fn join(&mut self, room_id: &str) -> Value {
        let data = self
            .request_ok("joinRoom", json!({ "roomId": room_id }))
            .await;
        data.get("routerRtpCapabilities")
            .cloned()
            .expect("joinRoom must return routerRtpCapabilities")
    }

    pub async fn create_send_transport(&mut self) -> String {
        let data = self.request_ok("createSendTransport", json!({})).await;
        string_field(&data, "transportId")
    }

    pub async fn create_receiving_transport(&mut self) -> String {
        let data = self
            .request_ok("createReceivingTransport", json!({}))
            .await;
        string_field(&data, "transportId")
    }

    pub async fn connect_transport(&mut self, transport_id: &str) {
        self.request_ok(
            "connectTransport",
            json!({
                "transportId": transport_id,
                "dtlsParameters": crate::fixtures::dtls_parameters(),
            }),
        )
        .await;
    }

    /// Produce on `transport_id`; returns the producer id.
    pub async fn produce(&mut self, transport_id: &str, kind: &str, rtp_parameters: Value) -> String {
        let data = self
            .request_ok(
                "produceMedia",
                json!({
                    "transportId": transport_id,
                    "kind": kind,
                    "rtpParameters": rtp_parameters,
                }),
            )
            .await;
        string_field(&data, "producerId")
    }

    /// Consume `producer_id`; returns the full consumer description.
    pub async fn consume(
        &mut self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Value {
        self.request_ok(
            "consumeMedia",
            json!({
                "transportId": transport_id,
                "producerId": producer_id,
                "rtpCapabilities": rtp_capabilities,
            }),
        )
        .await
    }

    /// Wait for the next notification frame.
    pub async fn next_notification(&mut self) -> Option<Value> {
        let message = tokio::time::timeout(NOTIFICATION_WAIT, self.notifications.recv())
            .await
            .ok()??;
        Some(serde_json::to_value(&message).expect("notification must serialize"))
    }

    /// A notification that is already queued, if any.
    pub fn try_notification(&mut self) -> Option<Value> {
        let message = self.notifications.try_recv().ok()?;
        Some(serde_json::to_value(&message).expect("notification must serialize"))
    }

    /// Close the session as if the socket had dropped.
    pub async fn disconnect(&mut self) {
        self.session.disconnect().await;
    }
}

fn string_field(data: &Value, field: &str) -> String {
    data.get(field)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("response data must carry {field}: {data}"))
        .to_string()
}
