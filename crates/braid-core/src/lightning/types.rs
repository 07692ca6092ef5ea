use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LnInvoice {
    pub payment_request: String,
    pub payment_hash: [u8; 32],
    /// Absolute unix expiry of the invoice.
    pub expires_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LnPayment {
    pub payment_hash: [u8; 32],
    pub preimage: [u8; 32],
    pub fee_msat: u64,
}

/// Settlement notification of an incoming payment. Delivery is
/// at-least-once; consumers deduplicate by preimage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentReceivedEvent {
    pub payment_hash: [u8; 32],
    pub preimage: [u8; 32],
    pub amount_sat: u64,
}
