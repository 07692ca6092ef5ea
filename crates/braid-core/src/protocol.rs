//! Typed request and response bodies for the peer method set, shared by all
//! three roles.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::proof::{BlindSignature, BlindedMessage};

pub const METHOD_INFO: &str = "info";
pub const METHOD_REQUEST_DEALER_FEE: &str = "request_dealer_fee";
pub const METHOD_MAKE_INVOICE: &str = "make_invoice";
pub const METHOD_SWAP_HTLC: &str = "swap_htlc";
pub const METHOD_BLINDED_SIGNATURES: &str = "blinded_signatures";
pub const METHOD_PAY_INVOICE: &str = "pay_invoice";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerType {
    #[serde(rename = "A")]
    Payer,
    #[serde(rename = "G")]
    Gateway,
    #[serde(rename = "D")]
    Dealer,
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerType::Payer => "A",
            PeerType::Gateway => "G",
            PeerType::Dealer => "D",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InfoResult {
    #[serde(rename = "type")]
    pub peer_type: PeerType,
    pub name: String,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DealerFeeParams {
    pub preimage_hash: String,
    pub amount: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DealerFeeResult {
    pub fee_amount: u64,
    pub blinded_messages: Vec<BlindedMessage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MakeInvoiceParams {
    pub amount: u64,
    pub preimage_hash: String,
    pub blinded_messages: Vec<BlindedMessage>,
    pub dealer_pubkey: PublicKey,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MakeInvoiceResult {
    pub invoice: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwapHtlcParams {
    pub token: String,
    pub blinded_messages: Vec<BlindedMessage>,
    /// Correlation key from the payer's original fee request; echoed, never
    /// assumed equal to the invoice's payment hash.
    pub request_preimage_hash: String,
    pub preimage: String,
    pub payer_pubkey: PublicKey,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwapHtlcResult {
    pub success: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlindedSignaturesParams {
    pub preimage_hash: String,
    pub signatures: Vec<BlindSignature>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlindedSignaturesResult {
    pub success: bool,
    pub total_amount: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PayInvoiceParams {
    pub invoice: String,
    pub token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PayInvoiceResult {
    pub preimage: String,
    pub fees_paid: u64,
}

pub fn unix_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_secs(),
        Err(_) => 0,
    }
}
