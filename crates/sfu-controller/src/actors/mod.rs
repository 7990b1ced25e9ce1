//! Actor hierarchy of the SFU controller.
//!
//! ```text
//! RoomRegistryActor (singleton per SFU instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per room)
//!         ├── owns peers, transports, producers, consumers
//!         └── sole caller of the media engine for its router
//! ```
//!
//! # Key Design Decisions
//!
//! - **Serialized rooms**: Every mutation of a room runs inside its actor, so
//!   concurrent requests from different peers never interleave
//! - **Unshared rooms**: Rooms share nothing with each other, so they scale
//!   across tokio worker threads
//! - **CancellationToken propagation**: The registry hands each room a child token
//! - **Mailbox monitoring**: Depth thresholds with metrics (Registry: 200/1000, Room: 50/250)
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton that creates and resolves rooms
//! - [`room`] - `RoomActor` per room, owns the session registry of that room
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

pub use messages::{PeerInfo, RegistryStatus, RoomInfo, RoomState};
pub use metrics::{ActorMetrics, MailboxMonitor};
pub use registry::{RoomRegistryActor, RoomRegistryHandle, DEFAULT_EMPTY_ROOM_TTL};
pub use room::{RoomActor, RoomActorHandle, RoomContext};
