//! `RoomActor` - per-room actor that owns the room's session registry.
//!
//! Each `RoomActor`:
//! - Owns the peers of one room and the transports, producers and consumers
//!   they created
//! - Is the only caller of the media engine for its router, so every
//!   check-then-act sequence (connect once, produce then broadcast) runs
//!   without interleaving
//! - Consumes the router's [`EngineEvent`] stream to forget producers and
//!   consumers the engine closed on its own
//!
//! # Room Lifecycle
//!
//! A room starts empty. When the last peer disconnects the actor releases the
//! router, closes its mailbox (pending requests fail with `RoomNotFound`),
//! reports `RoomClosed` to the registry and exits. A room nobody joins within
//! `empty_room_ttl` of its creation closes the same way.

use crate::engine::{
    call_with_timeout, ConsumerDescriptor, EngineEvent, MediaEngine, MediaKind,
    RouterDescriptor, TransportDirection, TransportParameters,
};
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::signaling::protocol::ServerMessage;

use super::messages::{PeerInfo, RegistryMessage, RoomMessage, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 256;

/// Shared dependencies every room actor is spawned with.
#[derive(Clone)]
pub struct RoomContext {
    pub engine: Arc<dyn MediaEngine>,
    /// Deadline applied to each engine call.
    pub engine_timeout: Duration,
    /// How long a room may stay without peers before it is released.
    pub empty_room_ttl: Duration,
    /// Weak so that live rooms do not keep the registry mailbox open.
    pub registry: mpsc::WeakSender<RegistryMessage>,
    pub metrics: Arc<ActorMetrics>,
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Admit a connection as a peer; returns the router RTP capabilities.
    ///
    /// Joining twice with the same connection id is a no-op that returns the
    /// same capabilities.
    pub async fn join(
        &self,
        connection_id: String,
        notifier: mpsc::Sender<ServerMessage>,
    ) -> Result<Value, SfuError> {
        self.request(|respond_to| RoomMessage::Join {
            connection_id,
            notifier,
            respond_to,
        })
        .await?
    }

    pub async fn create_transport(
        &self,
        connection_id: String,
        direction: TransportDirection,
    ) -> Result<TransportParameters, SfuError> {
        self.request(|respond_to| RoomMessage::CreateTransport {
            connection_id,
            direction,
            respond_to,
        })
        .await?
    }

    pub async fn connect_transport(
        &self,
        connection_id: String,
        transport_id: String,
        dtls_parameters: Value,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::ConnectTransport {
            connection_id,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await?
    }

    /// Start producing on one of the caller's send transports.
    ///
    /// Every other peer in the room is notified with `newProducer`.
    pub async fn produce(
        &self,
        connection_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<String, SfuError> {
        self.request(|respond_to| RoomMessage::Produce {
            connection_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to,
        })
        .await?
    }

    pub async fn consume(
        &self,
        connection_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    ) -> Result<ConsumerDescriptor, SfuError> {
        self.request(|respond_to| RoomMessage::Consume {
            connection_id,
            transport_id,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
        .await?
    }

    pub async fn close_producer(
        &self,
        connection_id: String,
        producer_id: String,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::CloseProducer {
            connection_id,
            producer_id,
            respond_to,
        })
        .await?
    }

    /// Release everything the connection's peer created.
    ///
    /// A room that already closed has nothing left to release, so this
    /// succeeds in that case too.
    pub async fn peer_disconnected(&self, connection_id: String) -> Result<(), SfuError> {
        match self
            .request(|respond_to| RoomMessage::PeerDisconnected {
                connection_id,
                respond_to,
            })
            .await
        {
            Ok(()) | Err(SfuError::RoomNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        self.request(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the room has stopped accepting messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| SfuError::RoomNotFound(self.room_id.clone()))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }
}

struct TransportRecord {
    connected: bool,
}

struct ProducerRecord {
    kind: MediaKind,
}

struct ConsumerRecord {
    producer_id: String,
}

/// A joined connection. Shares its id with the signaling connection.
struct Peer {
    notifier: mpsc::Sender<ServerMessage>,
    send_transports: HashMap<String, TransportRecord>,
    receive_transports: HashMap<String, TransportRecord>,
    producers: HashMap<String, ProducerRecord>,
    consumers: HashMap<String, ConsumerRecord>,
}

impl Peer {
    fn new(notifier: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            notifier,
            send_transports: HashMap::new(),
            receive_transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn transports_mut(
        &mut self,
        direction: TransportDirection,
    ) -> &mut HashMap<String, TransportRecord> {
        match direction {
            TransportDirection::Send => &mut self.send_transports,
            TransportDirection::Receive => &mut self.receive_transports,
        }
    }

    fn transport_ids(&self) -> impl Iterator<Item = &String> {
        self.send_transports
            .keys()
            .chain(self.receive_transports.keys())
    }

    fn info(&self, peer_id: &str) -> PeerInfo {
        PeerInfo {
            peer_id: peer_id.to_string(),
            send_transports: sorted_keys(&self.send_transports),
            receive_transports: sorted_keys(&self.receive_transports),
            producers: sorted_keys(&self.producers),
            consumers: sorted_keys(&self.consumers),
        }
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    router: RouterDescriptor,
    receiver: mpsc::Receiver<RoomMessage>,
    events: mpsc::Receiver<EngineEvent>,
    events_open: bool,
    cancel_token: CancellationToken,
    context: RoomContext,
    peers: HashMap<String, Peer>,
    /// Armed while the room has never had a peer.
    empty_deadline: Option<Instant>,
    created_at: i64,
    /// Set once the router is released; remaining messages are rejected.
    closed: bool,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor for an already created router.
    pub fn spawn(
        room_id: String,
        router: RouterDescriptor,
        events: mpsc::Receiver<EngineEvent>,
        context: RoomContext,
        cancel_token: CancellationToken,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let empty_deadline = Some(Instant::now() + context.empty_room_ttl);

        let actor = Self {
            room_id: room_id.clone(),
            router,
            receiver,
            events,
            events_open: true,
            cancel_token: cancel_token.clone(),
            context,
            peers: HashMap::new(),
            empty_deadline,
            created_at: chrono::Utc::now().timestamp(),
            closed: false,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            router_id = %self.router.id,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                () = tokio::time::sleep_until(
                    self.empty_deadline.unwrap_or_else(Instant::now)
                ), if self.empty_deadline.is_some() => {
                    self.handle_empty_timeout().await;
                }

                event = self.events.recv(), if self.events_open => {
                    match event {
                        Some(event) => self.handle_engine_event(event),
                        None => self.events_open = false,
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            self.handle_message(message).await;
                            self.mailbox.record_processed();
                            self.context.metrics.record_message_processed();
                        }
                        None => {
                            debug!(
                                target: "sfu.actor.room",
                                room_id = %self.room_id,
                                "RoomActor mailbox closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peers_remaining = self.peers.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        if self.closed {
            let room_id = self.room_id.clone();
            message.reject(|| SfuError::RoomNotFound(room_id.clone()));
            return;
        }

        match message {
            RoomMessage::Join {
                connection_id,
                notifier,
                respond_to,
            } => {
                let result = self.handle_join(connection_id, notifier);
                let _ = respond_to.send(Ok(result));
            }

            RoomMessage::CreateTransport {
                connection_id,
                direction,
                respond_to,
            } => {
                let result = self.handle_create_transport(&connection_id, direction).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ConnectTransport {
                connection_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_connect_transport(&connection_id, transport_id, dtls_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Produce {
                connection_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_produce(&connection_id, transport_id, kind, rtp_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Consume {
                connection_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self
                    .handle_consume(&connection_id, transport_id, producer_id, rtp_capabilities)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::CloseProducer {
                connection_id,
                producer_id,
                respond_to,
            } => {
                let result = self.handle_close_producer(&connection_id, producer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::PeerDisconnected {
                connection_id,
                respond_to,
            } => {
                self.handle_peer_disconnected(&connection_id).await;
                let _ = respond_to.send(());
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
        }
    }

    fn handle_join(&mut self, connection_id: String, notifier: mpsc::Sender<ServerMessage>) -> Value {
        if !self.peers.contains_key(&connection_id) {
            self.empty_deadline = None;
            self.peers.insert(connection_id.clone(), Peer::new(notifier));
            self.context.metrics.peer_joined();

            info!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                peer_id = %connection_id,
                peer_count = self.peers.len(),
                "Peer joined"
            );
        }

        self.router.rtp_capabilities.clone()
    }

    async fn handle_create_transport(
        &mut self,
        connection_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportParameters, SfuError> {
        if !self.peers.contains_key(connection_id) {
            return Err(SfuError::PeerNotFound(connection_id.to_string()));
        }

        let params = call_with_timeout(
            "create_webrtc_transport",
            self.context.engine_timeout,
            self.context.engine.create_webrtc_transport(&self.router.id),
        )
        .await?;

        if let Some(peer) = self.peers.get_mut(connection_id) {
            peer.transports_mut(direction)
                .insert(params.id.clone(), TransportRecord { connected: false });
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %connection_id,
            transport_id = %params.id,
            direction = direction.as_str(),
            "Transport created"
        );

        Ok(params)
    }

    /// Transport ids are looked up across every peer of this room only, so an
    /// id belonging to another room is never reachable.
    async fn handle_connect_transport(
        &mut self,
        connection_id: &str,
        transport_id: String,
        dtls_parameters: Value,
    ) -> Result<(), SfuError> {
        match self.find_transport_mut(&transport_id) {
            None => return Err(SfuError::TransportNotFound(transport_id)),
            Some(record) if record.connected => {
                return Err(SfuError::TransportAlreadyConnected(transport_id))
            }
            Some(_) => {}
        }

        call_with_timeout(
            "connect_transport",
            self.context.engine_timeout,
            self.context
                .engine
                .connect_transport(&transport_id, dtls_parameters),
        )
        .await?;

        if let Some(record) = self.find_transport_mut(&transport_id) {
            record.connected = true;
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %connection_id,
            transport_id = %transport_id,
            "Transport connected"
        );

        Ok(())
    }

    async fn handle_produce(
        &mut self,
        connection_id: &str,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<String, SfuError> {
        let peer = self
            .peers
            .get(connection_id)
            .ok_or_else(|| SfuError::PeerNotFound(connection_id.to_string()))?;
        if !peer.send_transports.contains_key(&transport_id) {
            return Err(SfuError::TransportNotFound(transport_id));
        }

        let producer = call_with_timeout(
            "produce",
            self.context.engine_timeout,
            self.context
                .engine
                .produce(&transport_id, kind, rtp_parameters),
        )
        .await?;

        if let Some(peer) = self.peers.get_mut(connection_id) {
            peer.producers
                .insert(producer.id.clone(), ProducerRecord { kind: producer.kind });
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %connection_id,
            producer_id = %producer.id,
            kind = %producer.kind,
            "Producer created"
        );

        self.broadcast_except(
            connection_id,
            &ServerMessage::new_producer(&producer.id, connection_id),
        );

        Ok(producer.id)
    }

    async fn handle_consume(
        &mut self,
        connection_id: &str,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    ) -> Result<ConsumerDescriptor, SfuError> {
        if !self.peers.contains_key(connection_id) {
            return Err(SfuError::PeerNotFound(connection_id.to_string()));
        }
        if !self.peers.values().any(|p| p.producers.contains_key(&producer_id)) {
            return Err(SfuError::ProducerNotFound(producer_id));
        }

        let consumable = self
            .context
            .engine
            .can_consume(&self.router.id, &producer_id, &rtp_capabilities)
            .map_err(|e| {
                metrics::record_engine_error("can_consume", "failure");
                SfuError::from(e)
            })?;
        if !consumable {
            return Err(SfuError::IncompatibleCapabilities(producer_id));
        }

        let owns_transport = self
            .peers
            .get(connection_id)
            .is_some_and(|p| p.receive_transports.contains_key(&transport_id));
        if !owns_transport {
            return Err(SfuError::TransportNotFound(transport_id));
        }

        let consumer = call_with_timeout(
            "consume",
            self.context.engine_timeout,
            self.context
                .engine
                .consume(&transport_id, &producer_id, rtp_capabilities),
        )
        .await?;

        if let Some(peer) = self.peers.get_mut(connection_id) {
            peer.consumers.insert(
                consumer.id.clone(),
                ConsumerRecord {
                    producer_id: consumer.producer_id.clone(),
                },
            );
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %connection_id,
            consumer_id = %consumer.id,
            producer_id = %consumer.producer_id,
            "Consumer created"
        );

        Ok(consumer)
    }

    async fn handle_close_producer(
        &mut self,
        connection_id: &str,
        producer_id: String,
    ) -> Result<(), SfuError> {
        let Some(kind) = self
            .peers
            .get(connection_id)
            .and_then(|p| p.producers.get(&producer_id))
            .map(|record| record.kind)
        else {
            return Err(SfuError::ProducerNotFound(producer_id));
        };

        call_with_timeout(
            "close_producer",
            self.context.engine_timeout,
            self.context.engine.close_producer(&producer_id),
        )
        .await?;

        self.forget_producer(&producer_id);

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %connection_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer closed"
        );

        Ok(())
    }

    async fn handle_peer_disconnected(&mut self, connection_id: &str) {
        let Some(peer) = self.peers.remove(connection_id) else {
            debug!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                peer_id = %connection_id,
                "Disconnect for unknown peer ignored"
            );
            return;
        };
        self.context.metrics.peer_left();

        // Consumers of other peers go with the departing peer's producers
        for producer_id in peer.producers.keys() {
            self.forget_producer(producer_id);
        }
        for transport_id in peer.transport_ids() {
            self.release_transport(transport_id).await;
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %connection_id,
            producers_closed = peer.producers.len(),
            peer_count = self.peers.len(),
            "Peer left"
        );

        if self.peers.is_empty() {
            self.close_room("last peer left").await;
        }
    }

    /// Release a room that nobody joined in time.
    async fn handle_empty_timeout(&mut self) {
        self.empty_deadline = None;
        if self.closed || !self.peers.is_empty() {
            return;
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            ttl_ms = u64::try_from(self.context.empty_room_ttl.as_millis()).unwrap_or(u64::MAX),
            "Room was never joined"
        );
        self.close_room("never joined").await;
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ProducerClosed { producer_id } => {
                if self.forget_producer(&producer_id) {
                    debug!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        producer_id = %producer_id,
                        "Producer closed by media engine"
                    );
                }
            }
            EngineEvent::ConsumerClosed { consumer_id } => {
                for peer in self.peers.values_mut() {
                    if peer.consumers.remove(&consumer_id).is_some() {
                        debug!(
                            target: "sfu.actor.room",
                            room_id = %self.room_id,
                            consumer_id = %consumer_id,
                            "Consumer closed by media engine"
                        );
                    }
                }
            }
        }
    }

    /// Drop a producer record and every consumer of it, in any peer.
    /// Returns whether the producer was known.
    fn forget_producer(&mut self, producer_id: &str) -> bool {
        let mut known = false;
        for peer in self.peers.values_mut() {
            known |= peer.producers.remove(producer_id).is_some();
            peer.consumers.retain(|_, c| c.producer_id != producer_id);
        }
        known
    }

    fn find_transport_mut(&mut self, transport_id: &str) -> Option<&mut TransportRecord> {
        self.peers.values_mut().find_map(|peer| {
            if let Some(record) = peer.send_transports.get_mut(transport_id) {
                return Some(record);
            }
            peer.receive_transports.get_mut(transport_id)
        })
    }

    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        for (peer_id, peer) in self.peers.iter().filter(|(id, _)| id.as_str() != sender_id) {
            match peer.notifier.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    metrics::record_broadcast_dropped();
                    warn!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        "Outbound queue full, notification dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    metrics::record_broadcast_dropped();
                    debug!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        "Peer connection gone, notification dropped"
                    );
                }
            }
        }
    }

    /// Best-effort engine cleanup; failures are already logged by
    /// `call_with_timeout`.
    async fn release_transport(&self, transport_id: &str) {
        let _ = call_with_timeout(
            "close_transport",
            self.context.engine_timeout,
            self.context.engine.close_transport(transport_id),
        )
        .await;
    }

    /// Release the router and stop accepting messages.
    async fn close_room(&mut self, reason: &'static str) {
        self.closed = true;
        self.empty_deadline = None;
        self.receiver.close();

        let _ = call_with_timeout(
            "close_router",
            self.context.engine_timeout,
            self.context.engine.close_router(&self.router.id),
        )
        .await;

        if let Some(registry) = self.context.registry.upgrade() {
            // A full registry mailbox is fine: the registry reaps finished rooms
            let _ = registry.try_send(RegistryMessage::RoomClosed {
                room_id: self.room_id.clone(),
            });
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            router_id = %self.router.id,
            reason,
            "Room closed"
        );
    }

    fn state(&self) -> RoomState {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .iter()
            .map(|(peer_id, peer)| peer.info(peer_id))
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        RoomState {
            room_id: self.room_id.clone(),
            router_id: self.router.id.clone(),
            created_at: self.created_at,
            peers,
        }
    }

    /// Release every engine resource and reject queued requests.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_count = self.peers.len(),
            "Performing graceful shutdown"
        );

        self.receiver.close();

        let peers: Vec<Peer> = self.peers.drain().map(|(_, peer)| peer).collect();
        for peer in &peers {
            self.context.metrics.peer_left();
            for transport_id in peer.transport_ids() {
                self.release_transport(transport_id).await;
            }
        }

        if !self.closed {
            self.closed = true;
            let _ = call_with_timeout(
                "close_router",
                self.context.engine_timeout,
                self.context.engine.close_router(&self.router.id),
            )
            .await;
        }

        while let Ok(message) = self.receiver.try_recv() {
            message.reject(|| SfuError::Draining);
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peers_released = peers.len(),
            "Graceful shutdown complete"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockMediaEngine, MockOperation};
    use crate::engine::default_media_codecs;
    use serde_json::json;

    const EMPTY_ROOM_TTL: Duration = Duration::from_secs(30);

    struct Fixture {
        engine: Arc<MockMediaEngine>,
        handle: RoomActorHandle,
        task: JoinHandle<()>,
        registry_rx: mpsc::Receiver<RegistryMessage>,
        _registry_tx: mpsc::Sender<RegistryMessage>,
    }

    async fn spawn_room(engine: MockMediaEngine) -> Fixture {
        let engine = Arc::new(engine);
        let (events_tx, events_rx) = mpsc::channel(64);
        let router = engine
            .create_router(&default_media_codecs(), events_tx)
            .await
            .unwrap();
        let (registry_tx, registry_rx) = mpsc::channel(8);
        let context = RoomContext {
            engine: Arc::clone(&engine) as Arc<dyn MediaEngine>,
            engine_timeout: Duration::from_secs(1),
            empty_room_ttl: EMPTY_ROOM_TTL,
            registry: registry_tx.downgrade(),
            metrics: ActorMetrics::new(),
        };
        let (handle, task) = RoomActor::spawn(
            "room-test".to_string(),
            router,
            events_rx,
            context,
            CancellationToken::new(),
        );
        Fixture {
            engine,
            handle,
            task,
            registry_rx,
            _registry_tx: registry_tx,
        }
    }

    fn vp8_rtp_parameters() -> Value {
        json!({
            "mid": "0",
            "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
            "encodings": [{ "ssrc": 1111 }],
        })
    }

    fn vp8_capabilities() -> Value {
        json!({ "codecs": [{ "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }] })
    }

    async fn join(handle: &RoomActorHandle, peer: &str) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(16);
        handle.join(peer.to_string(), tx).await.unwrap();
        rx
    }

    async fn send_transport(handle: &RoomActorHandle, peer: &str) -> String {
        handle
            .create_transport(peer.to_string(), TransportDirection::Send)
            .await
            .unwrap()
            .id
    }

    async fn recv_transport(handle: &RoomActorHandle, peer: &str) -> String {
        handle
            .create_transport(peer.to_string(), TransportDirection::Receive)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_join_returns_router_capabilities_and_is_idempotent() {
        let fx = spawn_room(MockMediaEngine::new()).await;

        let (tx, _rx) = mpsc::channel(4);
        let first = fx.handle.join("peer-a".to_string(), tx.clone()).await.unwrap();
        let second = fx.handle.join("peer-a".to_string(), tx).await.unwrap();
        assert_eq!(first, second);
        assert!(first.get("codecs").is_some());

        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.peers.len(), 1);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_create_transport_requires_peer() {
        let fx = spawn_room(MockMediaEngine::new()).await;

        let result = fx
            .handle
            .create_transport("stranger".to_string(), TransportDirection::Send)
            .await;
        assert!(matches!(result, Err(SfuError::PeerNotFound(_))));
        assert_eq!(fx.engine.call_count(MockOperation::CreateTransport), 0);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_transports_are_filed_by_direction() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx = join(&fx.handle, "peer-a").await;

        let send = send_transport(&fx.handle, "peer-a").await;
        let recv = recv_transport(&fx.handle, "peer-a").await;

        let state = fx.handle.get_state().await.unwrap();
        let peer = state.peer("peer-a").unwrap();
        assert_eq!(peer.send_transports, vec![send]);
        assert_eq!(peer.receive_transports, vec![recv]);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_connect_is_accepted_once() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx = join(&fx.handle, "peer-a").await;
        let transport_id = send_transport(&fx.handle, "peer-a").await;
        let dtls = json!({ "role": "client", "fingerprints": [] });

        fx.handle
            .connect_transport("peer-a".to_string(), transport_id.clone(), dtls.clone())
            .await
            .unwrap();
        assert!(fx.engine.is_transport_connected(&transport_id));

        let again = fx
            .handle
            .connect_transport("peer-a".to_string(), transport_id, dtls)
            .await;
        assert!(matches!(again, Err(SfuError::TransportAlreadyConnected(_))));
        assert_eq!(fx.engine.call_count(MockOperation::ConnectTransport), 1);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_connect_unknown_transport() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx = join(&fx.handle, "peer-a").await;

        let result = fx
            .handle
            .connect_transport("peer-a".to_string(), "transport-x".to_string(), json!({}))
            .await;
        assert!(matches!(result, Err(SfuError::TransportNotFound(_))));

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_produce_broadcasts_to_other_peers_only() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let mut rx_a = join(&fx.handle, "peer-a").await;
        let mut rx_b = join(&fx.handle, "peer-b").await;
        let transport_id = send_transport(&fx.handle, "peer-a").await;

        let producer_id = fx
            .handle
            .produce(
                "peer-a".to_string(),
                transport_id,
                MediaKind::Video,
                vp8_rtp_parameters(),
            )
            .await
            .unwrap();

        let notification = rx_b.try_recv().unwrap();
        assert_eq!(
            notification,
            ServerMessage::new_producer(&producer_id, "peer-a")
        );
        assert!(rx_a.try_recv().is_err());

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_produce_on_receive_transport_rejected() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx = join(&fx.handle, "peer-a").await;
        let recv = recv_transport(&fx.handle, "peer-a").await;

        let result = fx
            .handle
            .produce("peer-a".to_string(), recv, MediaKind::Video, vp8_rtp_parameters())
            .await;
        assert!(matches!(result, Err(SfuError::TransportNotFound(_))));
        assert_eq!(fx.engine.call_count(MockOperation::Produce), 0);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_full_notifier_drops_notification_without_failing_produce() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx_a = join(&fx.handle, "peer-a").await;
        let (tx_b, _rx_b) = mpsc::channel(1);
        fx.handle.join("peer-b".to_string(), tx_b.clone()).await.unwrap();
        tx_b.try_send(ServerMessage::new_producer("filler", "x")).unwrap();

        let transport_id = send_transport(&fx.handle, "peer-a").await;
        let result = fx
            .handle
            .produce(
                "peer-a".to_string(),
                transport_id,
                MediaKind::Video,
                vp8_rtp_parameters(),
            )
            .await;
        assert!(result.is_ok());

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_consume_checks_run_in_order() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx_a = join(&fx.handle, "peer-a").await;
        let _rx_b = join(&fx.handle, "peer-b").await;
        let send = send_transport(&fx.handle, "peer-a").await;
        let producer_id = fx
            .handle
            .produce("peer-a".to_string(), send, MediaKind::Video, vp8_rtp_parameters())
            .await
            .unwrap();

        // Unknown producer wins over a bogus transport
        let result = fx
            .handle
            .consume(
                "peer-b".to_string(),
                "bogus".to_string(),
                "producer-x".to_string(),
                vp8_capabilities(),
            )
            .await;
        assert!(matches!(result, Err(SfuError::ProducerNotFound(_))));

        // Capability mismatch is reported before the transport is resolved
        let h264 = json!({ "codecs": [{ "kind": "video", "mimeType": "video/H264", "clockRate": 90000 }] });
        let result = fx
            .handle
            .consume("peer-b".to_string(), "bogus".to_string(), producer_id.clone(), h264)
            .await;
        assert!(matches!(result, Err(SfuError::IncompatibleCapabilities(_))));

        let result = fx
            .handle
            .consume(
                "peer-b".to_string(),
                "bogus".to_string(),
                producer_id,
                vp8_capabilities(),
            )
            .await;
        assert!(matches!(result, Err(SfuError::TransportNotFound(_))));
        assert_eq!(fx.engine.call_count(MockOperation::Consume), 0);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_consume_records_consumer() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx_a = join(&fx.handle, "peer-a").await;
        let _rx_b = join(&fx.handle, "peer-b").await;
        let send = send_transport(&fx.handle, "peer-a").await;
        let recv = recv_transport(&fx.handle, "peer-b").await;
        let producer_id = fx
            .handle
            .produce("peer-a".to_string(), send, MediaKind::Video, vp8_rtp_parameters())
            .await
            .unwrap();

        let consumer = fx
            .handle
            .consume("peer-b".to_string(), recv, producer_id.clone(), vp8_capabilities())
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, producer_id);
        assert_eq!(consumer.kind, MediaKind::Video);

        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.peer("peer-b").unwrap().consumers, vec![consumer.id]);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_close_producer_removes_dependent_consumers() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx_a = join(&fx.handle, "peer-a").await;
        let _rx_b = join(&fx.handle, "peer-b").await;
        let send = send_transport(&fx.handle, "peer-a").await;
        let recv = recv_transport(&fx.handle, "peer-b").await;
        let producer_id = fx
            .handle
            .produce("peer-a".to_string(), send, MediaKind::Video, vp8_rtp_parameters())
            .await
            .unwrap();
        fx.handle
            .consume("peer-b".to_string(), recv, producer_id.clone(), vp8_capabilities())
            .await
            .unwrap();

        // Only the owner may close it
        let result = fx
            .handle
            .close_producer("peer-b".to_string(), producer_id.clone())
            .await;
        assert!(matches!(result, Err(SfuError::ProducerNotFound(_))));

        fx.handle
            .close_producer("peer-a".to_string(), producer_id)
            .await
            .unwrap();

        let state = fx.handle.get_state().await.unwrap();
        assert!(state.peer("peer-a").unwrap().producers.is_empty());
        assert!(state.peer("peer-b").unwrap().consumers.is_empty());

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_engine_closed_producer_is_forgotten() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx_a = join(&fx.handle, "peer-a").await;
        let send = send_transport(&fx.handle, "peer-a").await;
        let producer_id = fx
            .handle
            .produce("peer-a".to_string(), send, MediaKind::Video, vp8_rtp_parameters())
            .await
            .unwrap();

        // Closed directly on the engine, bypassing the room
        fx.engine.close_producer(&producer_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = fx.handle.get_state().await.unwrap();
        assert!(state.peer("peer-a").unwrap().producers.is_empty());

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_releases_peer_resources() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx_a = join(&fx.handle, "peer-a").await;
        let _rx_b = join(&fx.handle, "peer-b").await;
        let send = send_transport(&fx.handle, "peer-a").await;
        let recv = recv_transport(&fx.handle, "peer-b").await;
        let producer_id = fx
            .handle
            .produce("peer-a".to_string(), send, MediaKind::Video, vp8_rtp_parameters())
            .await
            .unwrap();
        fx.handle
            .consume("peer-b".to_string(), recv, producer_id, vp8_capabilities())
            .await
            .unwrap();

        fx.handle
            .peer_disconnected("peer-a".to_string())
            .await
            .unwrap();

        let state = fx.handle.get_state().await.unwrap();
        assert!(state.peer("peer-a").is_none());
        assert!(state.peer("peer-b").unwrap().consumers.is_empty());
        assert_eq!(fx.engine.producer_count(), 0);
        assert_eq!(fx.engine.call_count(MockOperation::CloseTransport), 1);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_last_disconnect_closes_room() {
        let mut fx = spawn_room(MockMediaEngine::new()).await;
        let _rx_a = join(&fx.handle, "peer-a").await;
        let _ = send_transport(&fx.handle, "peer-a").await;

        fx.handle
            .peer_disconnected("peer-a".to_string())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), &mut fx.task)
            .await
            .expect("room task should exit")
            .unwrap();
        assert!(fx.handle.is_closed());
        assert_eq!(fx.engine.router_count(), 0);
        assert_eq!(fx.engine.transport_count(), 0);

        let notice = fx.registry_rx.try_recv().unwrap();
        assert!(matches!(
            notice,
            RegistryMessage::RoomClosed { room_id } if room_id == "room-test"
        ));

        let (tx, _rx) = mpsc::channel(4);
        let result = fx.handle.join("peer-c".to_string(), tx).await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));

        // Disconnect after close is a no-op
        assert!(fx.handle.peer_disconnected("peer-a".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_unknown_peer_is_noop() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx = join(&fx.handle, "peer-a").await;

        fx.handle
            .peer_disconnected("stranger".to_string())
            .await
            .unwrap();

        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.peers.len(), 1);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_engine_failure_leaves_no_record() {
        let fx = spawn_room(
            MockMediaEngine::builder()
                .fail_on(MockOperation::CreateTransport)
                .build(),
        )
        .await;
        let _rx = join(&fx.handle, "peer-a").await;

        let result = fx
            .handle
            .create_transport("peer-a".to_string(), TransportDirection::Send)
            .await;
        assert!(matches!(result, Err(SfuError::EngineFailure(_))));

        let state = fx.handle.get_state().await.unwrap();
        assert!(state.peer("peer-a").unwrap().send_transports.is_empty());

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_cancel_releases_router() {
        let mut fx = spawn_room(MockMediaEngine::new()).await;
        let _rx = join(&fx.handle, "peer-a").await;
        let _ = send_transport(&fx.handle, "peer-a").await;

        fx.handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), &mut fx.task)
            .await
            .expect("room task should exit")
            .unwrap();

        assert!(fx.handle.is_cancelled());
        assert_eq!(fx.engine.router_count(), 0);
        assert_eq!(fx.engine.transport_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_transport_released_with_router() {
        let fx = spawn_room(
            MockMediaEngine::builder()
                .hang_on(MockOperation::CreateTransport)
                .build(),
        )
        .await;
        let _rx = join(&fx.handle, "peer-a").await;

        let result = fx
            .handle
            .create_transport("peer-a".to_string(), TransportDirection::Send)
            .await;
        assert!(matches!(result, Err(SfuError::EngineTimeout { .. })));

        let state = fx.handle.get_state().await.unwrap();
        let peer = state.peer("peer-a").unwrap();
        assert!(peer.send_transports.is_empty());

        fx.handle.peer_disconnected("peer-a".to_string()).await.unwrap();
        fx.task.await.unwrap();
        assert_eq!(fx.engine.router_count(), 0);
        assert_eq!(fx.engine.transport_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unjoined_room_released_after_ttl() {
        let mut fx = spawn_room(MockMediaEngine::new()).await;
        assert_eq!(fx.engine.router_count(), 1);

        tokio::time::sleep(EMPTY_ROOM_TTL + Duration::from_secs(1)).await;

        tokio::time::timeout(Duration::from_secs(1), &mut fx.task)
            .await
            .expect("room task should exit")
            .unwrap();
        assert!(fx.handle.is_closed());
        assert_eq!(fx.engine.router_count(), 0);

        let notice = fx.registry_rx.try_recv().unwrap();
        assert!(matches!(
            notice,
            RegistryMessage::RoomClosed { room_id } if room_id == "room-test"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_room_outlives_ttl() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        tokio::time::sleep(EMPTY_ROOM_TTL / 2).await;
        let _rx = join(&fx.handle, "peer-a").await;

        tokio::time::sleep(EMPTY_ROOM_TTL * 2).await;

        assert!(!fx.handle.is_closed());
        assert_eq!(fx.engine.router_count(), 1);
        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.peers.len(), 1);

        fx.handle.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_serialized_with_in_flight_produce() {
        let fx = spawn_room(MockMediaEngine::new()).await;
        let _rx_1 = join(&fx.handle, "p1").await;
        let _rx_2 = join(&fx.handle, "p2").await;
        let send = send_transport(&fx.handle, "p1").await;

        let producing = {
            let handle = fx.handle.clone();
            tokio::spawn(async move {
                handle
                    .produce("p1".to_string(), send, MediaKind::Video, vp8_rtp_parameters())
                    .await
            })
        };
        let leaving = {
            let handle = fx.handle.clone();
            tokio::spawn(async move { handle.peer_disconnected("p1".to_string()).await })
        };
        let (produced, left) = tokio::join!(producing, leaving);
        left.unwrap().unwrap();

        // Produce either ran first and was cleaned up, or found no peer
        if let Err(e) = produced.unwrap() {
            assert!(matches!(e, SfuError::PeerNotFound(_)));
        }

        let state = fx.handle.get_state().await.unwrap();
        assert!(state.peer("p1").is_none());
        assert!(state.peers.iter().all(|p| p.producers.is_empty()));
        assert_eq!(fx.engine.producer_count(), 0);
        assert_eq!(fx.engine.transport_count(), 0);

        fx.handle.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_joins_create_one_peer() {
        let fx = spawn_room(MockMediaEngine::new()).await;

        let joins: Vec<_> = (0..2)
            .map(|_| {
                let handle = fx.handle.clone();
                tokio::spawn(async move {
                    let (tx, rx) = mpsc::channel(4);
                    let caps = handle.join("p1".to_string(), tx).await;
                    (caps, rx)
                })
            })
            .collect();

        let mut capabilities = Vec::new();
        let mut _receivers = Vec::new();
        for join in joins {
            let (caps, rx) = join.await.unwrap();
            capabilities.push(caps.unwrap());
            _receivers.push(rx);
        }
        assert!(capabilities.windows(2).all(|w| w.first() == w.last()));

        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.peers.len(), 1);
        assert!(state.peer("p1").is_some());

        fx.handle.cancel();
    }
}
