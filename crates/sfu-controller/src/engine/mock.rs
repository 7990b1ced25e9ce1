//! In-memory media engine for tests.
//!
//! Behaves like a minimal SFU: ids are unique per process, transports accept
//! exactly one connect, closing a transport or producer cascades to dependent
//! consumers and raises [`EngineEvent`]s, and `can_consume` matches codec MIME
//! types between the producer's RTP parameters and the consumer's capabilities.
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_controller::engine::mock::{MockMediaEngine, MockOperation};
//!
//! let engine = MockMediaEngine::builder()
//!     .fail_on(MockOperation::CreateRouter)
//!     .build();
//! ```

use super::{
    CodecCapability, CodecParameter, ConsumerDescriptor, EngineError, EngineEvent, MediaEngine,
    MediaKind, ProducerDescriptor, RouterDescriptor, TransportParameters,
};

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Engine operations that can be failed, stalled or counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    CreateRouter,
    CloseRouter,
    CreateTransport,
    ConnectTransport,
    CloseTransport,
    Produce,
    CloseProducer,
    CanConsume,
    Consume,
}

impl MockOperation {
    const ALL: [MockOperation; 9] = [
        MockOperation::CreateRouter,
        MockOperation::CloseRouter,
        MockOperation::CreateTransport,
        MockOperation::ConnectTransport,
        MockOperation::CloseTransport,
        MockOperation::Produce,
        MockOperation::CloseProducer,
        MockOperation::CanConsume,
        MockOperation::Consume,
    ];
}

struct MockTransport {
    router_id: String,
    connected: bool,
}

struct MockProducer {
    router_id: String,
    transport_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
}

struct MockConsumer {
    transport_id: String,
    producer_id: String,
}

#[derive(Default)]
struct MockState {
    routers: HashMap<String, mpsc::Sender<EngineEvent>>,
    transports: HashMap<String, MockTransport>,
    producers: HashMap<String, MockProducer>,
    consumers: HashMap<String, MockConsumer>,
}

impl MockState {
    /// Remove producers matching `predicate` and every consumer that depends
    /// on them or matches `consumer_predicate`. Returns the events to raise.
    fn cascade(
        &mut self,
        producer_predicate: impl Fn(&str, &MockProducer) -> bool,
        consumer_predicate: impl Fn(&MockConsumer) -> bool,
    ) -> Vec<(String, EngineEvent)> {
        let closed_producers: Vec<(String, String)> = self
            .producers
            .iter()
            .filter(|(id, p)| producer_predicate(id.as_str(), p))
            .map(|(id, p)| (id.clone(), p.router_id.clone()))
            .collect();
        let closed_ids: HashSet<&str> = closed_producers.iter().map(|(id, _)| id.as_str()).collect();

        let closed_consumers: Vec<(String, String)> = self
            .consumers
            .iter()
            .filter(|(_, c)| consumer_predicate(c) || closed_ids.contains(c.producer_id.as_str()))
            .map(|(id, c)| (id.clone(), c.producer_id.clone()))
            .collect();

        let mut events = Vec::new();
        for (consumer_id, producer_id) in closed_consumers {
            self.consumers.remove(&consumer_id);
            let router_id = self
                .producers
                .get(&producer_id)
                .map(|p| p.router_id.clone())
                .unwrap_or_default();
            events.push((router_id, EngineEvent::ConsumerClosed { consumer_id }));
        }
        for (producer_id, router_id) in closed_producers {
            self.producers.remove(&producer_id);
            events.push((router_id, EngineEvent::ProducerClosed { producer_id }));
        }
        events
    }

    fn emit(&self, events: Vec<(String, EngineEvent)>) {
        for (router_id, event) in events {
            if let Some(sender) = self.routers.get(&router_id) {
                // Receiver may already be gone when the room is tearing down
                let _ = sender.try_send(event);
            }
        }
    }
}

/// In-memory [`MediaEngine`] with failure injection and call counting.
pub struct MockMediaEngine {
    state: Mutex<MockState>,
    failing: HashSet<MockOperation>,
    hanging: HashSet<MockOperation>,
    call_counts: HashMap<MockOperation, AtomicUsize>,
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MockMediaEngine {
    /// Create a mock that accepts every call.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> MockMediaEngineBuilder {
        MockMediaEngineBuilder::default()
    }

    /// Number of times `operation` was invoked (including failed calls).
    #[must_use]
    pub fn call_count(&self, operation: MockOperation) -> usize {
        self.call_counts
            .get(&operation)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.state().routers.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.state().transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.state().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state().consumers.len()
    }

    /// Whether the transport has completed `connect_transport`.
    #[must_use]
    pub fn is_transport_connected(&self, transport_id: &str) -> bool {
        self.state()
            .transports
            .get(transport_id)
            .is_some_and(|t| t.connected)
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, then fail or stall it if configured to.
    async fn enter(&self, operation: MockOperation) -> Result<(), EngineError> {
        if let Some(counter) = self.call_counts.get(&operation) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        if self.hanging.contains(&operation) {
            std::future::pending::<()>().await;
        }
        if self.failing.contains(&operation) {
            return Err(EngineError::Rejected(format!(
                "mock configured to fail {operation:?}"
            )));
        }
        Ok(())
    }

    fn enter_sync(&self, operation: MockOperation) -> Result<(), EngineError> {
        if let Some(counter) = self.call_counts.get(&operation) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        if self.failing.contains(&operation) {
            return Err(EngineError::Rejected(format!(
                "mock configured to fail {operation:?}"
            )));
        }
        Ok(())
    }
}

/// Builder for [`MockMediaEngine`].
#[derive(Debug, Default)]
pub struct MockMediaEngineBuilder {
    failing: HashSet<MockOperation>,
    hanging: HashSet<MockOperation>,
}

impl MockMediaEngineBuilder {
    /// Make `operation` return [`EngineError::Rejected`].
    #[must_use]
    pub fn fail_on(mut self, operation: MockOperation) -> Self {
        self.failing.insert(operation);
        self
    }

    /// Make `operation` never complete.
    #[must_use]
    pub fn hang_on(mut self, operation: MockOperation) -> Self {
        self.hanging.insert(operation);
        self
    }

    #[must_use]
    pub fn build(self) -> MockMediaEngine {
        MockMediaEngine {
            state: Mutex::new(MockState::default()),
            failing: self.failing,
            hanging: self.hanging,
            call_counts: MockOperation::ALL
                .iter()
                .map(|op| (*op, AtomicUsize::new(0)))
                .collect(),
        }
    }
}

fn mock_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

fn capabilities_json(codecs: &[CodecCapability]) -> Value {
    let codecs: Vec<Value> = codecs
        .iter()
        .map(|codec| {
            let parameters: serde_json::Map<String, Value> = codec
                .parameters
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        CodecParameter::Number(n) => json!(n),
                        CodecParameter::Text(s) => json!(s),
                    };
                    ((*key).to_string(), value)
                })
                .collect();
            let mut entry = json!({
                "kind": codec.kind.as_str(),
                "mimeType": codec.mime_type,
                "clockRate": codec.clock_rate,
                "parameters": parameters,
            });
            if let (Some(channels), Some(obj)) = (codec.channels, entry.as_object_mut()) {
                obj.insert("channels".to_string(), json!(channels));
            }
            entry
        })
        .collect();
    json!({ "codecs": codecs, "headerExtensions": [] })
}

fn mime_types(value: &Value) -> Vec<String> {
    value
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|c| c.get("mimeType").and_then(Value::as_str))
                .map(str::to_ascii_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_router(
        &self,
        codecs: &[CodecCapability],
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<RouterDescriptor, EngineError> {
        self.enter(MockOperation::CreateRouter).await?;
        let id = mock_id("router");
        self.state().routers.insert(id.clone(), events);
        Ok(RouterDescriptor {
            id,
            rtp_capabilities: capabilities_json(codecs),
        })
    }

    async fn close_router(&self, router_id: &str) -> Result<(), EngineError> {
        self.enter(MockOperation::CloseRouter).await?;
        let mut state = self.state();
        if state.routers.remove(router_id).is_none() {
            return Err(EngineError::RouterNotFound(router_id.to_string()));
        }
        let transports: HashSet<String> = state
            .transports
            .iter()
            .filter(|(_, t)| t.router_id == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        state.transports.retain(|_, t| t.router_id != router_id);
        state.producers.retain(|_, p| p.router_id != router_id);
        state
            .consumers
            .retain(|_, c| !transports.contains(&c.transport_id));
        Ok(())
    }

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
    ) -> Result<TransportParameters, EngineError> {
        self.enter(MockOperation::CreateTransport).await?;
        let mut state = self.state();
        if !state.routers.contains_key(router_id) {
            return Err(EngineError::RouterNotFound(router_id.to_string()));
        }
        let id = mock_id("transport");
        state.transports.insert(
            id.clone(),
            MockTransport {
                router_id: router_id.to_string(),
                connected: false,
            },
        );
        Ok(TransportParameters {
            ice_parameters: json!({
                "usernameFragment": format!("ufrag-{id}"),
                "password": "mock-password",
                "iceLite": true,
            }),
            ice_candidates: json!([{
                "foundation": "udpcandidate",
                "priority": 1_076_302_079_u32,
                "address": "127.0.0.1",
                "protocol": "udp",
                "port": 40000,
                "type": "host",
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": "00:11:22:33" }],
            }),
            id,
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), EngineError> {
        self.enter(MockOperation::ConnectTransport).await?;
        if !dtls_parameters.is_object() {
            return Err(EngineError::InvalidParameters(
                "dtlsParameters must be an object".to_string(),
            ));
        }
        let mut state = self.state();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;
        if transport.connected {
            return Err(EngineError::Rejected("connect() already called".to_string()));
        }
        transport.connected = true;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError> {
        self.enter(MockOperation::CloseTransport).await?;
        let mut state = self.state();
        if state.transports.remove(transport_id).is_none() {
            return Err(EngineError::TransportNotFound(transport_id.to_string()));
        }
        let events = state.cascade(
            |_, p| p.transport_id == transport_id,
            |c| c.transport_id == transport_id,
        );
        state.emit(events);
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<ProducerDescriptor, EngineError> {
        self.enter(MockOperation::Produce).await?;
        if !rtp_parameters.is_object() {
            return Err(EngineError::InvalidParameters(
                "rtpParameters must be an object".to_string(),
            ));
        }
        let mut state = self.state();
        let router_id = state
            .transports
            .get(transport_id)
            .map(|t| t.router_id.clone())
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;
        let id = mock_id("producer");
        state.producers.insert(
            id.clone(),
            MockProducer {
                router_id,
                transport_id: transport_id.to_string(),
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        Ok(ProducerDescriptor {
            id,
            kind,
            rtp_parameters,
        })
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.enter(MockOperation::CloseProducer).await?;
        let mut state = self.state();
        if !state.producers.contains_key(producer_id) {
            return Err(EngineError::ProducerNotFound(producer_id.to_string()));
        }
        let events = state.cascade(|id, _| id == producer_id, |_| false);
        state.emit(events);
        Ok(())
    }

    fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<bool, EngineError> {
        self.enter_sync(MockOperation::CanConsume)?;
        let state = self.state();
        if !state.routers.contains_key(router_id) {
            return Err(EngineError::RouterNotFound(router_id.to_string()));
        }
        let Some(producer) = state.producers.get(producer_id) else {
            return Ok(false);
        };
        if producer.router_id != router_id {
            return Ok(false);
        }
        let offered = mime_types(rtp_capabilities);
        Ok(mime_types(&producer.rtp_parameters)
            .iter()
            .any(|mime| offered.contains(mime)))
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Result<ConsumerDescriptor, EngineError> {
        self.enter(MockOperation::Consume).await?;
        if !rtp_capabilities.is_object() {
            return Err(EngineError::InvalidParameters(
                "rtpCapabilities must be an object".to_string(),
            ));
        }
        let mut state = self.state();
        if !state.transports.contains_key(transport_id) {
            return Err(EngineError::TransportNotFound(transport_id.to_string()));
        }
        let (kind, rtp_parameters) = state
            .producers
            .get(producer_id)
            .map(|p| (p.kind, p.rtp_parameters.clone()))
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.to_string()))?;
        let id = mock_id("consumer");
        state.consumers.insert(
            id.clone(),
            MockConsumer {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
            },
        );
        Ok(ConsumerDescriptor {
            id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters,
        })
    }
}
