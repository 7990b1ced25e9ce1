//! [`MediaEngine`] backed by in-process mediasoup workers.
//!
//! Routers are spread round-robin over a fixed worker pool. mediasoup closes
//! an object when its last handle is dropped, so the engine owns exactly one
//! handle per router, transport, producer and consumer and "closing" means
//! removing that handle (and everything that depends on it) from the tables.

use super::{
    CodecCapability, CodecParameter, ConsumerDescriptor, EngineError, EngineEvent, MediaEngine,
    MediaKind, ProducerDescriptor, RouterDescriptor, TransportParameters,
};

use mediasoup::consumer::{Consumer, ConsumerOptions};
use mediasoup::data_structures::{DtlsParameters, ListenInfo, Protocol};
use mediasoup::producer::{Producer, ProducerId, ProducerOptions};
use mediasoup::router::{Router, RouterOptions};
use mediasoup::rtp_parameters::{
    MediaKind as RtpMediaKind, MimeTypeAudio, MimeTypeVideo, RtcpFeedback, RtpCapabilities,
    RtpCodecCapability, RtpCodecParametersParameters, RtpCodecParametersParametersValue,
    RtpParameters,
};
use mediasoup::transport::Transport;
use mediasoup::webrtc_transport::{
    WebRtcTransport, WebRtcTransportListenInfos, WebRtcTransportOptions,
    WebRtcTransportRemoteParameters,
};
use mediasoup::worker::{Worker, WorkerSettings};
use mediasoup::worker_manager::WorkerManager;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Worker pool and network settings.
#[derive(Debug, Clone)]
pub struct MediasoupSettings {
    pub workers: usize,
    pub listen_ip: IpAddr,
    /// Public address advertised in ICE candidates.
    pub announced_address: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

struct RouterEntry {
    router: Router,
    events: mpsc::Sender<EngineEvent>,
}

struct TransportEntry {
    router_id: String,
    transport: WebRtcTransport,
}

struct ProducerEntry {
    router_id: String,
    transport_id: String,
    producer: Producer,
}

struct ConsumerEntry {
    transport_id: String,
    producer_id: String,
    _consumer: Consumer,
}

/// Handles removed from the tables. Dropped after the lock is released,
/// since dropping a handle runs mediasoup close callbacks.
#[derive(Default)]
struct Released {
    routers: Vec<RouterEntry>,
    transports: Vec<TransportEntry>,
    producers: Vec<ProducerEntry>,
    consumers: Vec<ConsumerEntry>,
}

impl Released {
    fn is_empty(&self) -> bool {
        self.routers.is_empty()
            && self.transports.is_empty()
            && self.producers.is_empty()
            && self.consumers.is_empty()
    }
}

#[derive(Default)]
struct EngineState {
    routers: HashMap<String, RouterEntry>,
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
}

impl EngineState {
    fn release_consumers(&mut self, released: &mut Released, matches: impl Fn(&ConsumerEntry) -> bool) {
        let ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| matches(c))
            .map(|(id, _)| id.clone())
            .collect();
        released
            .consumers
            .extend(ids.iter().filter_map(|id| self.consumers.remove(id)));
    }

    fn release_producer(&mut self, producer_id: &str, released: &mut Released) {
        if let Some(entry) = self.producers.remove(producer_id) {
            self.release_consumers(released, |c| c.producer_id == producer_id);
            released.producers.push(entry);
        }
    }

    fn release_transport(&mut self, transport_id: &str, released: &mut Released) {
        let Some(entry) = self.transports.remove(transport_id) else {
            return;
        };
        let producers: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            self.release_producer(&producer_id, released);
        }
        self.release_consumers(released, |c| c.transport_id == transport_id);
        released.transports.push(entry);
    }

    fn release_router(&mut self, router_id: &str, released: &mut Released) {
        let Some(entry) = self.routers.remove(router_id) else {
            return;
        };
        let transports: Vec<String> = self
            .transports
            .iter()
            .filter(|(_, t)| t.router_id == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in transports {
            self.release_transport(&transport_id, released);
        }
        released.routers.push(entry);
    }
}

type SharedState = Arc<Mutex<EngineState>>;

fn lock(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Media engine running mediasoup workers in this process.
pub struct MediasoupEngine {
    // Keeps the worker threads alive
    _manager: WorkerManager,
    workers: Vec<Worker>,
    next_worker: AtomicUsize,
    settings: MediasoupSettings,
    state: SharedState,
}

impl MediasoupEngine {
    /// Spawn the worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rejected`] if a worker fails to start.
    pub async fn start(settings: MediasoupSettings) -> Result<Self, EngineError> {
        let manager = WorkerManager::new();
        let mut workers = Vec::with_capacity(settings.workers);

        for index in 0..settings.workers.max(1) {
            let worker = manager
                .create_worker(WorkerSettings::default())
                .await
                .map_err(|e| EngineError::Rejected(format!("failed to create worker: {e}")))?;

            let worker_id = worker.id();
            worker
                .on_dead(move |_reason| {
                    error!(
                        target: "sfu.engine",
                        worker_id = %worker_id,
                        worker_index = index,
                        "mediasoup worker died"
                    );
                })
                .detach();

            info!(
                target: "sfu.engine",
                worker_id = %worker.id(),
                worker_index = index,
                "mediasoup worker started"
            );
            workers.push(worker);
        }

        Ok(Self {
            _manager: manager,
            workers,
            next_worker: AtomicUsize::new(0),
            settings,
            state: Arc::new(Mutex::new(EngineState::default())),
        })
    }

    fn next_worker(&self) -> Result<&Worker, EngineError> {
        if self.workers.is_empty() {
            return Err(EngineError::Rejected("no workers available".to_string()));
        }
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers
            .get(index)
            .ok_or_else(|| EngineError::Rejected("no workers available".to_string()))
    }

    fn listen_info(&self, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: self.settings.listen_ip,
            announced_address: self.settings.announced_address.clone(),
            port: None,
            port_range: Some(self.settings.rtc_min_port..=self.settings.rtc_max_port),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        }
    }

    fn release(&self, f: impl FnOnce(&mut EngineState, &mut Released)) -> Released {
        let mut released = Released::default();
        f(&mut lock(&self.state), &mut released);
        released
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value)
        .map_err(|e| EngineError::Rejected(format!("failed to encode engine value: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(|e| EngineError::InvalidParameters(format!("{what}: {e}")))
}

fn rtp_media_kind(kind: MediaKind) -> RtpMediaKind {
    match kind {
        MediaKind::Audio => RtpMediaKind::Audio,
        MediaKind::Video => RtpMediaKind::Video,
    }
}

fn media_kind(kind: RtpMediaKind) -> MediaKind {
    match kind {
        RtpMediaKind::Audio => MediaKind::Audio,
        RtpMediaKind::Video => MediaKind::Video,
    }
}

fn codec_parameters(codec: &CodecCapability) -> RtpCodecParametersParameters {
    let mut parameters = RtpCodecParametersParameters::default();
    for (name, value) in &codec.parameters {
        let value: RtpCodecParametersParametersValue = match value {
            CodecParameter::Number(n) => (*n).into(),
            CodecParameter::Text(s) => (*s).into(),
        };
        parameters.insert(*name, value);
    }
    parameters
}

/// Translate the controller's codec set into mediasoup codec capabilities.
fn rtp_codec_capability(codec: &CodecCapability) -> Result<RtpCodecCapability, EngineError> {
    let unsupported = || EngineError::UnsupportedCodec(codec.mime_type.to_string());
    let clock_rate = NonZeroU32::new(codec.clock_rate).ok_or_else(unsupported)?;
    let parameters = codec_parameters(codec);

    match codec.kind {
        MediaKind::Audio => {
            let mime_type = match codec.mime_type.to_ascii_lowercase().as_str() {
                "audio/opus" => MimeTypeAudio::Opus,
                "audio/pcmu" => MimeTypeAudio::Pcmu,
                "audio/pcma" => MimeTypeAudio::Pcma,
                "audio/g722" => MimeTypeAudio::G722,
                _ => return Err(unsupported()),
            };
            let channels = NonZeroU8::new(codec.channels.unwrap_or(1)).ok_or_else(unsupported)?;
            Ok(RtpCodecCapability::Audio {
                mime_type,
                preferred_payload_type: None,
                clock_rate,
                channels,
                parameters,
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            })
        }
        MediaKind::Video => {
            let mime_type = match codec.mime_type.to_ascii_lowercase().as_str() {
                "video/vp8" => MimeTypeVideo::Vp8,
                "video/vp9" => MimeTypeVideo::Vp9,
                "video/h264" => MimeTypeVideo::H264,
                "video/av1" => MimeTypeVideo::AV1,
                _ => return Err(unsupported()),
            };
            Ok(RtpCodecCapability::Video {
                mime_type,
                preferred_payload_type: None,
                clock_rate,
                parameters,
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            })
        }
    }
}

/// Remove a closed producer's entry and report the closure.
fn on_producer_closed(state: &Weak<Mutex<EngineState>>, producer_id: &str) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut released = Released::default();
    lock(&state).release_producer(producer_id, &mut released);
    drop(released);
}

fn on_consumer_closed(state: &Weak<Mutex<EngineState>>, consumer_id: &str) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let removed = lock(&state).consumers.remove(consumer_id);
    drop(removed);
}

#[async_trait::async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(
        &self,
        codecs: &[CodecCapability],
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<RouterDescriptor, EngineError> {
        let media_codecs = codecs
            .iter()
            .map(rtp_codec_capability)
            .collect::<Result<Vec<_>, _>>()?;

        let worker = self.next_worker()?;
        let router = worker
            .create_router(RouterOptions::new(media_codecs))
            .await
            .map_err(|e| EngineError::Rejected(format!("failed to create router: {e}")))?;

        let id = router.id().to_string();
        let rtp_capabilities = to_json(router.rtp_capabilities())?;
        debug!(target: "sfu.engine", router_id = %id, worker_id = %worker.id(), "Router created");

        lock(&self.state)
            .routers
            .insert(id.clone(), RouterEntry { router, events });

        Ok(RouterDescriptor {
            id,
            rtp_capabilities,
        })
    }

    async fn close_router(&self, router_id: &str) -> Result<(), EngineError> {
        let released = self.release(|state, released| state.release_router(router_id, released));
        if released.routers.is_empty() {
            return Err(EngineError::RouterNotFound(router_id.to_string()));
        }
        debug!(
            target: "sfu.engine",
            router_id = %router_id,
            transports = released.transports.len(),
            "Router closed"
        );
        Ok(())
    }

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
    ) -> Result<TransportParameters, EngineError> {
        let router = lock(&self.state)
            .routers
            .get(router_id)
            .map(|entry| entry.router.clone())
            .ok_or_else(|| EngineError::RouterNotFound(router_id.to_string()))?;

        let listen_infos = WebRtcTransportListenInfos::new(self.listen_info(Protocol::Udp))
            .insert(self.listen_info(Protocol::Tcp));
        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.prefer_udp = true;

        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| EngineError::Rejected(format!("failed to create transport: {e}")))?;

        let parameters = TransportParameters {
            id: transport.id().to_string(),
            ice_parameters: to_json(transport.ice_parameters())?,
            ice_candidates: to_json(transport.ice_candidates())?,
            dtls_parameters: to_json(&transport.dtls_parameters())?,
        };

        let mut state = lock(&self.state);
        if !state.routers.contains_key(router_id) {
            // Router closed while the transport was being created
            drop(state);
            drop(transport);
            return Err(EngineError::RouterNotFound(router_id.to_string()));
        }
        state.transports.insert(
            parameters.id.clone(),
            TransportEntry {
                router_id: router_id.to_string(),
                transport,
            },
        );
        Ok(parameters)
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), EngineError> {
        let dtls_parameters: DtlsParameters = from_json(dtls_parameters, "dtlsParameters")?;
        let transport = lock(&self.state)
            .transports
            .get(transport_id)
            .map(|entry| entry.transport.clone())
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| EngineError::Rejected(format!("failed to connect transport: {e}")))
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError> {
        let released =
            self.release(|state, released| state.release_transport(transport_id, released));
        if released.transports.is_empty() {
            return Err(EngineError::TransportNotFound(transport_id.to_string()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<ProducerDescriptor, EngineError> {
        let parsed: RtpParameters = from_json(rtp_parameters.clone(), "rtpParameters")?;
        let (transport, router_id) = lock(&self.state)
            .transports
            .get(transport_id)
            .map(|entry| (entry.transport.clone(), entry.router_id.clone()))
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;

        let producer = transport
            .produce(ProducerOptions::new(rtp_media_kind(kind), parsed))
            .await
            .map_err(|e| EngineError::Rejected(format!("failed to produce: {e}")))?;

        let id = producer.id().to_string();
        let mut state = lock(&self.state);
        let Some(events) = state.routers.get(&router_id).map(|r| r.events.clone()) else {
            drop(state);
            drop(producer);
            return Err(EngineError::RouterNotFound(router_id));
        };

        let weak_state = Arc::downgrade(&self.state);
        let closed_id = id.clone();
        producer
            .on_close(move || {
                on_producer_closed(&weak_state, &closed_id);
                // Receiver is gone once the room has torn down
                let _ = events.try_send(EngineEvent::ProducerClosed {
                    producer_id: closed_id.clone(),
                });
            })
            .detach();

        state.producers.insert(
            id.clone(),
            ProducerEntry {
                router_id,
                transport_id: transport_id.to_string(),
                producer,
            },
        );

        Ok(ProducerDescriptor {
            id,
            kind,
            rtp_parameters,
        })
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        let released =
            self.release(|state, released| state.release_producer(producer_id, released));
        if released.producers.is_empty() {
            return Err(EngineError::ProducerNotFound(producer_id.to_string()));
        }
        Ok(())
    }

    fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<bool, EngineError> {
        let capabilities: RtpCapabilities =
            from_json(rtp_capabilities.clone(), "rtpCapabilities")?;
        let state = lock(&self.state);
        let router = state
            .routers
            .get(router_id)
            .ok_or_else(|| EngineError::RouterNotFound(router_id.to_string()))?;
        let Some(producer) = state.producers.get(producer_id) else {
            return Ok(false);
        };
        if producer.router_id != router_id {
            return Ok(false);
        }
        Ok(router.router.can_consume(&producer.producer.id(), &capabilities))
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Result<ConsumerDescriptor, EngineError> {
        let capabilities: RtpCapabilities = from_json(rtp_capabilities, "rtpCapabilities")?;
        let parsed_producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| EngineError::ProducerNotFound(producer_id.to_string()))?;

        let (transport, router_id) = {
            let state = lock(&self.state);
            if !state.producers.contains_key(producer_id) {
                return Err(EngineError::ProducerNotFound(producer_id.to_string()));
            }
            state
                .transports
                .get(transport_id)
                .map(|entry| (entry.transport.clone(), entry.router_id.clone()))
                .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?
        };

        let consumer = transport
            .consume(ConsumerOptions::new(parsed_producer_id, capabilities))
            .await
            .map_err(|e| EngineError::Rejected(format!("failed to consume: {e}")))?;

        let descriptor = ConsumerDescriptor {
            id: consumer.id().to_string(),
            producer_id: producer_id.to_string(),
            kind: media_kind(consumer.kind()),
            rtp_parameters: to_json(consumer.rtp_parameters())?,
        };

        let mut state = lock(&self.state);
        let Some(events) = state.routers.get(&router_id).map(|r| r.events.clone()) else {
            drop(state);
            drop(consumer);
            return Err(EngineError::RouterNotFound(router_id));
        };
        if !state.producers.contains_key(producer_id) {
            // Producer closed while the consumer was being created
            drop(state);
            drop(consumer);
            return Err(EngineError::ProducerNotFound(producer_id.to_string()));
        }

        let weak_state = Arc::downgrade(&self.state);
        let closed_id = descriptor.id.clone();
        consumer
            .on_close(move || {
                on_consumer_closed(&weak_state, &closed_id);
                let _ = events.try_send(EngineEvent::ConsumerClosed {
                    consumer_id: closed_id.clone(),
                });
            })
            .detach();

        state.consumers.insert(
            descriptor.id.clone(),
            ConsumerEntry {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                _consumer: consumer,
            },
        );
        Ok(descriptor)
    }
}

impl Drop for MediasoupEngine {
    fn drop(&mut self) {
        let released = {
            let mut state = lock(&self.state);
            let mut released = Released::default();
            let routers: Vec<String> = state.routers.keys().cloned().collect();
            for router_id in routers {
                state.release_router(&router_id, &mut released);
            }
            released
        };
        if !released.is_empty() {
            debug!(
                target: "sfu.engine",
                routers = released.routers.len(),
                "Releasing media resources on engine drop"
            );
        }
    }
}
