//! Media engine contract.
//!
//! The controller never touches media. Every RTP/ICE/DTLS concern is delegated
//! to a [`MediaEngine`] through this narrow asynchronous interface, and every
//! call is bounded by [`call_with_timeout`].

mod types;

#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use types::{
    default_media_codecs, CodecCapability, CodecParameter, ConsumerDescriptor, EngineError,
    EngineEvent, MediaKind, ProducerDescriptor, RouterDescriptor, TransportDirection,
    TransportParameters,
};

use crate::errors::SfuError;
use crate::observability::metrics;
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

/// Asynchronous contract with the external media engine.
///
/// Callers may drop a pending call once its deadline passes. An object the
/// engine finishes creating after that point is never reported back, so the
/// caller holds no id for it. Implementations must own such objects under
/// their parent: a late transport is released by [`MediaEngine::close_router`],
/// a late producer or consumer by [`MediaEngine::close_transport`] on the
/// transport it was created on.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a routing context with the given codec set.
    ///
    /// Closure of producers and consumers created under this router is
    /// reported on `events`.
    async fn create_router(
        &self,
        codecs: &[CodecCapability],
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<RouterDescriptor, EngineError>;

    /// Release a routing context and everything created under it.
    async fn close_router(&self, router_id: &str) -> Result<(), EngineError>;

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
    ) -> Result<TransportParameters, EngineError>;

    /// Complete the DTLS handshake parameters of a transport.
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), EngineError>;

    /// Close a transport. Producers and consumers on it close with it.
    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<ProducerDescriptor, EngineError>;

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    /// Whether a client with `rtp_capabilities` can receive `producer_id`.
    fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<bool, EngineError>;

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Result<ConsumerDescriptor, EngineError>;
}

/// Run an engine call under a deadline, recording latency and failures.
///
/// Expiry maps to [`SfuError::EngineTimeout`]; engine errors map to
/// [`SfuError::EngineFailure`]. On expiry `call` is dropped unfinished; see
/// [`MediaEngine`] for what happens to objects it would have created.
pub async fn call_with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, SfuError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    let start = Instant::now();
    let outcome = tokio::time::timeout(timeout, call).await;
    metrics::record_engine_latency(operation, start.elapsed());

    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            metrics::record_engine_error(operation, "failure");
            warn!(
                target: "sfu.engine",
                operation = operation,
                error = %e,
                "Media engine call failed"
            );
            Err(e.into())
        }
        Err(_) => {
            metrics::record_engine_error(operation, "timeout");
            warn!(
                target: "sfu.engine",
                operation = operation,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Media engine call timed out"
            );
            Err(SfuError::EngineTimeout { operation })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_with_timeout_passes_value_through() {
        let result = call_with_timeout("noop", Duration::from_secs(1), async {
            Ok::<_, EngineError>(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_call_with_timeout_maps_engine_error() {
        let result: Result<(), SfuError> =
            call_with_timeout("connect_transport", Duration::from_secs(1), async {
                Err(EngineError::TransportNotFound("t-1".to_string()))
            })
            .await;
        assert!(matches!(result, Err(SfuError::EngineFailure(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_with_timeout_expires() {
        let result: Result<(), SfuError> =
            call_with_timeout("create_router", Duration::from_millis(50), async {
                std::future::pending::<Result<(), EngineError>>().await
            })
            .await;
        assert!(matches!(
            result,
            Err(SfuError::EngineTimeout {
                operation: "create_router"
            })
        ));
    }
}
