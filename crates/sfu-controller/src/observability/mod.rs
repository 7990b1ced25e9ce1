//! Observability for the SFU Controller (ADR-0011).
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Client-supplied payloads (RTP parameters, DTLS fingerprints) are never
//! logged or used as metric labels.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Live rooms |
//! | `sfu_peers_active` | Gauge | none | Joined peers across all rooms |
//! | `sfu_connections_active` | Gauge | none | Open signaling connections |
//! | `sfu_request_latency_seconds` | Histogram | `method` | Signaling request latency |
//! | `sfu_requests_total` | Counter | `method`, `status` | Signaling outcomes |
//! | `sfu_engine_latency_seconds` | Histogram | `operation` | Media engine call latency |
//! | `sfu_engine_errors_total` | Counter | `operation`, `kind` | Engine failures and timeouts |
//! | `sfu_broadcast_dropped_total` | Counter | none | Undeliverable `newProducer` notifications |
//! | `sfu_actor_panics_total` | Counter | `actor_type` | Actor panics |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, Phase};
pub use metrics::init_metrics_recorder;
