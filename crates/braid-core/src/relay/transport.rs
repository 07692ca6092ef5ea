use std::pin::Pin;

use futures::Stream;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One routed message on the relay bus. The channel authenticates the
/// sender; payloads are opaque strings to the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PublicKey,
    pub to: PublicKey,
    pub payload: String,
}

pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay connection failed: {0}")]
    Connection(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("subscription failed: {0}")]
    Subscription(String),
}

/// Best-effort, per-recipient routed pub/sub. Delivery may be lossy; the
/// request layer above owns timeouts and correlation.
#[async_trait::async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    async fn send(&self, envelope: Envelope) -> Result<(), RelayError>;

    /// Stream of messages addressed to this endpoint's own key.
    async fn incoming(&self) -> Result<EnvelopeStream, RelayError>;
}
