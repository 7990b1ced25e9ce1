//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU Controller.
//!
//! Everything here runs in-process against the in-memory media engine, so
//! signaling flows can be tested without mediasoup workers or sockets.
//!
//! ## Modules
//!
//! - `harness` - [`TestSfu`] (registry + gateway + mock engine) and [`TestClient`]
//! - `fixtures` - RTP parameters, RTP capabilities and DTLS parameters
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let sfu = TestSfu::new();
//!     let mut alice = sfu.connect();
//!
//!     let room_id = alice.create_room().await;
//!     alice.join(&room_id).await;
//!     let transport_id = alice.create_send_transport().await;
//!     alice.connect_transport(&transport_id).await;
//!     let producer_id = alice.produce(&transport_id, "video", vp8_rtp_parameters()).await;
//! }
//! ```

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::{TestClient, TestSfu};
