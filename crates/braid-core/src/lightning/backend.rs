use std::pin::Pin;

use futures::Stream;

use crate::lightning::error::LightningError;
use crate::lightning::types::{LnInvoice, LnPayment, PaymentReceivedEvent};

pub type PaymentStream =
    Pin<Box<dyn Stream<Item = Result<PaymentReceivedEvent, LightningError>> + Send>>;

/// The lightning surface this system consumes, behind a wallet-connect-like
/// RPC. Only the request/response shape matters here.
#[async_trait::async_trait]
pub trait LightningBackend: Send + Sync + 'static {
    /// Create an invoice. When `hodl_payment_hash` is given and the backend
    /// supports held invoices, the invoice is bound to that hash; otherwise
    /// the backend picks its own preimage and the returned `payment_hash`
    /// is the authoritative one.
    async fn make_invoice(
        &self,
        amount_sat: u64,
        memo: &str,
        expiry_secs: u64,
        hodl_payment_hash: Option<[u8; 32]>,
    ) -> Result<LnInvoice, LightningError>;

    async fn pay_invoice(&self, payment_request: &str) -> Result<LnPayment, LightningError>;

    async fn subscribe_payments(&self) -> Result<PaymentStream, LightningError>;
}
