use thiserror::Error;

#[derive(Debug, Error)]
pub enum LightningError {
    #[error("invoice creation failed: {0}")]
    InvoiceCreationFailed(String),
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("lightning node unavailable: {0}")]
    NodeUnavailable(String),
    #[error("stream error: {0}")]
    StreamError(String),
    #[error("invalid payment request: {0}")]
    InvalidPaymentRequest(String),
}
