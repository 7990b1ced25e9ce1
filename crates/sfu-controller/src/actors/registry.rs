//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! The `RoomRegistryActor` is the top-level actor of the SFU:
//!
//! - Singleton per SFU instance
//! - Maps room ids to `RoomActor` instances
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! Router creation happens in [`RoomRegistryHandle::create_room`] before the
//! registry is involved, so a slow media engine never stalls room lookups.
//!
//! # Graceful Shutdown
//!
//! On SIGTERM, the registry:
//! 1. Sets `accepting_new = false`
//! 2. Cancels the root `CancellationToken` (propagates to all rooms)
//! 3. Waits for every room to release its engine resources

use crate::engine::{
    call_with_timeout, default_media_codecs, EngineEvent, MediaEngine, RouterDescriptor,
};
use crate::errors::SfuError;
use crate::ids;

use super::messages::{RegistryMessage, RegistryStatus, RoomInfo};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomContext};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Buffer for engine closure events of one router.
const ENGINE_EVENT_BUFFER: usize = 256;

/// Default lifetime of a room nobody joins.
pub const DEFAULT_EMPTY_ROOM_TTL: Duration = Duration::from_secs(30);

/// Default time to wait for each room during shutdown.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Handle to the `RoomRegistryActor`.
///
/// This is the public interface for room creation and lookup.
/// All methods are async and return results via oneshot channels.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    engine: Arc<dyn MediaEngine>,
    engine_timeout: Duration,
}

impl RoomRegistryHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    ///
    /// # Arguments
    ///
    /// * `sfu_id` - SFU instance ID
    /// * `engine` - Media engine every room delegates to
    /// * `engine_timeout` - Deadline for each engine call
    /// * `metrics` - Shared actor metrics
    #[must_use]
    pub fn new(
        sfu_id: String,
        engine: Arc<dyn MediaEngine>,
        engine_timeout: Duration,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        Self::with_empty_room_ttl(sfu_id, engine, engine_timeout, DEFAULT_EMPTY_ROOM_TTL, metrics)
    }

    /// Like [`RoomRegistryHandle::new`], releasing rooms nobody joins within
    /// `empty_room_ttl`.
    #[must_use]
    pub fn with_empty_room_ttl(
        sfu_id: String,
        engine: Arc<dyn MediaEngine>,
        engine_timeout: Duration,
        empty_room_ttl: Duration,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let context = RoomContext {
            engine: Arc::clone(&engine),
            engine_timeout,
            empty_room_ttl,
            registry: sender.downgrade(),
            metrics: Arc::clone(&metrics),
        };
        let actor = RoomRegistryActor::new(sfu_id, receiver, cancel_token.clone(), context);

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            engine,
            engine_timeout,
        }
    }

    /// Create a room: a new router plus an empty room actor.
    ///
    /// Returns the room id. If the engine fails, nothing is registered.
    pub async fn create_room(&self) -> Result<String, SfuError> {
        if self.cancel_token.is_cancelled() {
            return Err(SfuError::Draining);
        }

        let room_id = ids::new_room_id();
        let (events_tx, events_rx) = mpsc::channel(ENGINE_EVENT_BUFFER);

        let router = call_with_timeout(
            "create_router",
            self.engine_timeout,
            self.engine.create_router(&default_media_codecs(), events_tx),
        )
        .await?;
        let router_id = router.id.clone();

        if let Err(e) = self.register_room(room_id.clone(), router, events_rx).await {
            let _ = call_with_timeout(
                "close_router",
                self.engine_timeout,
                self.engine.close_router(&router_id),
            )
            .await;
            return Err(e);
        }

        Ok(room_id)
    }

    async fn register_room(
        &self,
        room_id: String,
        router: RouterDescriptor,
        events: mpsc::Receiver<EngineEvent>,
    ) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::RegisterRoom {
                room_id,
                router,
                events,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Resolve a live room.
    pub async fn get_room(&self, room_id: &str) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_id: room_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Summary of a live room, queried from the room actor itself.
    pub async fn get_room_info(&self, room_id: &str) -> Result<RoomInfo, SfuError> {
        let state = self.get_room(room_id).await?.get_state().await?;
        Ok(RoomInfo {
            room_id: state.room_id,
            peer_count: state.peers.len(),
            created_at: state.created_at,
        })
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown; each room gets up to `deadline` to finish.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the registry (and all rooms).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for dependent tasks.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Managed room state in the registry.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    sfu_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<String, ManagedRoom>,
    /// Whether we're accepting new rooms.
    accepting_new: bool,
    /// Per-room wait applied during shutdown.
    shutdown_deadline: Duration,
    context: RoomContext,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    fn new(
        sfu_id: String,
        receiver: mpsc::Receiver<RegistryMessage>,
        cancel_token: CancellationToken,
        context: RoomContext,
    ) -> Self {
        let mailbox = MailboxMonitor::new(ActorType::Registry, &sfu_id);

        Self {
            sfu_id,
            receiver,
            cancel_token,
            rooms: HashMap::new(),
            accepting_new: true,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            context,
            mailbox,
        }
    }

    fn metrics(&self) -> &ActorMetrics {
        &self.context.metrics
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.registry", fields(sfu_id = %self.sfu_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            "RoomRegistryActor started"
        );

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            self.handle_message(message);
                            self.mailbox.record_processed();
                            self.metrics().record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.registry",
                                sfu_id = %self.sfu_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    /// Handle a single message. Never awaits a room actor.
    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::RegisterRoom {
                room_id,
                router,
                events,
                respond_to,
            } => {
                let result = self.register_room(room_id, router, events);
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.get_room(&room_id));
            }

            RegistryMessage::RoomClosed { room_id } => {
                self.remove_room(&room_id);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                let result = self.initiate_shutdown(deadline);
                let _ = respond_to.send(result);
            }
        }
    }

    fn register_room(
        &mut self,
        room_id: String,
        router: RouterDescriptor,
        events: mpsc::Receiver<EngineEvent>,
    ) -> Result<(), SfuError> {
        if !self.accepting_new {
            return Err(SfuError::Draining);
        }

        if self.rooms.contains_key(&room_id) {
            return Err(SfuError::Internal("room id collision".to_string()));
        }

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            router,
            events,
            self.context.clone(),
            self.cancel_token.child_token(),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle,
                task_handle,
            },
        );

        self.metrics().room_created();

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Room created"
        );

        Ok(())
    }

    /// A room that closed its mailbox is gone even if its task has not been
    /// reaped yet.
    fn get_room(&self, room_id: &str) -> Result<RoomActorHandle, SfuError> {
        match self.rooms.get(room_id) {
            Some(managed) if !managed.handle.is_closed() => Ok(managed.handle.clone()),
            _ => Err(SfuError::RoomNotFound(room_id.to_string())),
        }
    }

    /// Drop a room that reported its own closure.
    ///
    /// Waiting for the task runs in the background so the message loop is
    /// never blocked.
    fn remove_room(&mut self, room_id: &str) {
        let Some(managed) = self.rooms.remove(room_id) else {
            return;
        };

        let room_id_owned = room_id.to_string();
        let sfu_id = self.sfu_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_id = %room_id_owned,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_id = %room_id_owned,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_id = %room_id_owned,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });

        self.metrics().room_removed();

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Room removed"
        );
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self
                .rooms
                .values()
                .filter(|managed| !managed.handle.is_closed())
                .count(),
            peer_count: self.metrics().peer_count(),
            connection_count: self.metrics().connection_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    fn initiate_shutdown(&mut self, deadline: Duration) -> Result<(), SfuError> {
        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_count = self.rooms.len(),
            deadline_secs = deadline.as_secs(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;
        self.shutdown_deadline = deadline;

        // Propagates to every room
        self.cancel_token.cancel();

        Ok(())
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        let deadline = self.shutdown_deadline;
        let rooms: Vec<(String, ManagedRoom)> = self.rooms.drain().collect();
        for (room_id, managed) in rooms {
            match tokio::time::timeout(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics().room_removed();
        }

        // Reject anything that raced the cancellation
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            reject_draining(message);
        }

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            "Graceful shutdown complete"
        );
    }

    /// Reap room actors whose task ended without reporting `RoomClosed`.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sfu.actor.registry",
                            sfu_id = %self.sfu_id,
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked - triggering investigation"
                        );
                        self.metrics().record_panic(ActorType::Room);
                    }
                }
            }

            self.metrics().room_removed();
        }
    }
}

fn reject_draining(message: RegistryMessage) {
    match message {
        RegistryMessage::RegisterRoom { respond_to, .. }
        | RegistryMessage::Shutdown { respond_to, .. } => {
            let _ = respond_to.send(Err(SfuError::Draining));
        }
        RegistryMessage::GetRoom { respond_to, .. } => {
            let _ = respond_to.send(Err(SfuError::Draining));
        }
        // Dropped senders surface as receive errors
        RegistryMessage::GetStatus { .. } | RegistryMessage::RoomClosed { .. } => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockMediaEngine, MockOperation};
    use crate::engine::TransportDirection;

    fn registry_with(engine: MockMediaEngine) -> (RoomRegistryHandle, Arc<MockMediaEngine>) {
        let engine = Arc::new(engine);
        let handle = RoomRegistryHandle::new(
            "sfu-test".to_string(),
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            Duration::from_secs(1),
            ActorMetrics::new(),
        );
        (handle, engine)
    }

    #[tokio::test]
    async fn test_create_room_registers_router() {
        let (registry, engine) = registry_with(MockMediaEngine::new());

        let room_id = registry.create_room().await.unwrap();
        assert_eq!(engine.router_count(), 1);

        let room = registry.get_room(&room_id).await.unwrap();
        assert_eq!(room.room_id(), room_id);

        let info = registry.get_room_info(&room_id).await.unwrap();
        assert_eq!(info.peer_count, 0);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_room_ids_are_distinct() {
        let (registry, engine) = registry_with(MockMediaEngine::new());

        let first = registry.create_room().await.unwrap();
        let second = registry.create_room().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.router_count(), 2);

        let status = registry.get_status().await.unwrap();
        assert_eq!(status.room_count, 2);
        assert!(!status.is_draining);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_get_unknown_room() {
        let (registry, _engine) = registry_with(MockMediaEngine::new());

        let result = registry.get_room("nonexistent").await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_router_failure_registers_nothing() {
        let (registry, engine) = registry_with(
            MockMediaEngine::builder()
                .fail_on(MockOperation::CreateRouter)
                .build(),
        );

        let result = registry.create_room().await;
        assert!(matches!(result, Err(SfuError::EngineFailure(_))));
        assert_eq!(engine.router_count(), 0);

        let status = registry.get_status().await.unwrap();
        assert_eq!(status.room_count, 0);

        registry.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_router_timeout() {
        let engine = Arc::new(
            MockMediaEngine::builder()
                .hang_on(MockOperation::CreateRouter)
                .build(),
        );
        let registry = RoomRegistryHandle::new(
            "sfu-test".to_string(),
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            Duration::from_millis(100),
            ActorMetrics::new(),
        );

        let result = registry.create_room().await;
        assert!(matches!(
            result,
            Err(SfuError::EngineTimeout {
                operation: "create_router"
            })
        ));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_room_removed_after_last_peer_leaves() {
        let metrics = ActorMetrics::new();
        let engine = Arc::new(MockMediaEngine::new());
        let registry = RoomRegistryHandle::new(
            "sfu-test".to_string(),
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            Duration::from_secs(1),
            Arc::clone(&metrics),
        );

        let room_id = registry.create_room().await.unwrap();
        let room = registry.get_room(&room_id).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        room.join("peer-a".to_string(), tx).await.unwrap();
        room.create_transport("peer-a".to_string(), TransportDirection::Send)
            .await
            .unwrap();
        assert_eq!(metrics.room_count(), 1);

        room.peer_disconnected("peer-a".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = registry.get_room(&room_id).await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));
        assert_eq!(engine.router_count(), 0);
        assert_eq!(metrics.room_count(), 0);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_releases_rooms_and_rejects_new_ones() {
        let (registry, engine) = registry_with(MockMediaEngine::new());
        let _ = registry.create_room().await.unwrap();

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(registry.is_cancelled());
        assert_eq!(engine.router_count(), 0);

        let result = registry.create_room().await;
        assert!(matches!(result, Err(SfuError::Draining)));
    }

    #[tokio::test]
    async fn test_cancellation_token() {
        let (registry, _engine) = registry_with(MockMediaEngine::new());

        assert!(!registry.is_cancelled());
        let child = registry.child_token();
        assert!(!child.is_cancelled());

        registry.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(registry.is_cancelled());
        assert!(child.is_cancelled());
    }
}
