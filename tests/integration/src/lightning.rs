//! A lightning backend double. Invoices are real signed BOLT11 strings; the
//! notification stream is a broadcast channel the tests can push duplicate
//! deliveries into. Held-invoice binding is unsupported on purpose: the
//! backend always picks its own preimage, exercising the degraded path
//! where the payer's requested hash and the invoice hash differ.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bitcoin::hashes::{sha256 as bitcoin_sha256, Hash as _};
use futures::StreamExt;
use lightning_invoice::{Bolt11Invoice, Currency, InvoiceBuilder, PaymentSecret};
use secp256k1::global::SECP256K1;
use secp256k1::SecretKey;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use braid_core::crypto::{random_preimage, random_secret_key, sha256};
use braid_core::lightning::backend::{LightningBackend, PaymentStream};
use braid_core::lightning::error::LightningError;
use braid_core::lightning::types::{LnInvoice, LnPayment, PaymentReceivedEvent};
use braid_core::protocol::unix_now;

struct IssuedInvoice {
    preimage: [u8; 32],
    amount_sat: u64,
    settled: bool,
}

#[derive(Default)]
struct LnLedger {
    invoices: HashMap<[u8; 32], IssuedInvoice>,
    received_sat: u64,
    sent_sat: u64,
}

pub struct FakeLightning {
    node_secret: SecretKey,
    events: broadcast::Sender<PaymentReceivedEvent>,
    ledger: Mutex<LnLedger>,
}

impl FakeLightning {
    pub fn new() -> std::sync::Arc<Self> {
        let (events, _) = broadcast::channel(64);
        std::sync::Arc::new(FakeLightning {
            node_secret: random_secret_key(),
            events,
            ledger: Mutex::new(LnLedger::default()),
        })
    }

    /// Net incoming volume settled on this wallet.
    pub fn received_sat(&self) -> u64 {
        self.ledger.lock().unwrap().received_sat
    }

    /// Net outgoing volume paid from this wallet.
    pub fn sent_sat(&self) -> u64 {
        self.ledger.lock().unwrap().sent_sat
    }

    /// Settle one of our own invoices as if an external payer paid it.
    pub fn pay_external(&self, payment_request: &str) -> [u8; 32] {
        let invoice: Bolt11Invoice = payment_request.parse().expect("valid invoice");
        let payment_hash: [u8; 32] = invoice.payment_hash().to_byte_array();

        let (preimage, amount_sat) = {
            let mut ledger = self.ledger.lock().unwrap();
            let entry = ledger
                .invoices
                .get_mut(&payment_hash)
                .expect("invoice was issued here");
            entry.settled = true;
            let pair = (entry.preimage, entry.amount_sat);
            ledger.received_sat += pair.1;
            pair
        };

        let _ = self.events.send(PaymentReceivedEvent {
            payment_hash,
            preimage,
            amount_sat,
        });
        preimage
    }

    /// Redeliver the settlement notification for an already-settled
    /// invoice, as an at-least-once stream would.
    pub fn resend_notification(&self, payment_hash: [u8; 32]) {
        let (preimage, amount_sat) = {
            let ledger = self.ledger.lock().unwrap();
            let entry = ledger.invoices.get(&payment_hash).expect("invoice exists");
            assert!(entry.settled, "invoice was never settled");
            (entry.preimage, entry.amount_sat)
        };
        let _ = self.events.send(PaymentReceivedEvent {
            payment_hash,
            preimage,
            amount_sat,
        });
    }

    fn build_invoice(
        &self,
        payment_hash: [u8; 32],
        amount_sat: u64,
        memo: &str,
        expiry_secs: u64,
    ) -> Result<String, LightningError> {
        let hash = bitcoin_sha256::Hash::from_byte_array(payment_hash);
        let invoice = InvoiceBuilder::new(Currency::Bitcoin)
            .description(memo.to_string())
            .payment_hash(hash)
            .payment_secret(PaymentSecret(random_preimage()))
            .current_timestamp()
            .min_final_cltv_expiry_delta(18)
            .amount_milli_satoshis(amount_sat * 1000)
            .expiry_time(Duration::from_secs(expiry_secs))
            .build_signed(|digest| {
                SECP256K1.sign_ecdsa_recoverable(digest, &self.node_secret)
            })
            .map_err(|e| LightningError::InvoiceCreationFailed(e.to_string()))?;
        Ok(invoice.to_string())
    }
}

#[async_trait::async_trait]
impl LightningBackend for FakeLightning {
    async fn make_invoice(
        &self,
        amount_sat: u64,
        memo: &str,
        expiry_secs: u64,
        _hodl_payment_hash: Option<[u8; 32]>,
    ) -> Result<LnInvoice, LightningError> {
        let preimage = random_preimage();
        let payment_hash = sha256(&preimage);
        let payment_request = self.build_invoice(payment_hash, amount_sat, memo, expiry_secs)?;

        self.ledger.lock().unwrap().invoices.insert(
            payment_hash,
            IssuedInvoice {
                preimage,
                amount_sat,
                settled: false,
            },
        );

        Ok(LnInvoice {
            payment_request,
            payment_hash,
            expires_at: unix_now() + expiry_secs,
        })
    }

    async fn pay_invoice(&self, payment_request: &str) -> Result<LnPayment, LightningError> {
        let invoice: Bolt11Invoice = payment_request
            .parse()
            .map_err(|e| LightningError::InvalidPaymentRequest(format!("{e}")))?;
        let payment_hash: [u8; 32] = invoice.payment_hash().to_byte_array();
        let amount_sat = invoice
            .amount_milli_satoshis()
            .map(|msat| msat / 1000)
            .ok_or_else(|| {
                LightningError::InvalidPaymentRequest("invoice carries no amount".to_string())
            })?;

        let preimage = {
            let mut ledger = self.ledger.lock().unwrap();
            let Some(entry) = ledger.invoices.get_mut(&payment_hash) else {
                return Err(LightningError::PaymentFailed("no route".to_string()));
            };
            entry.settled = true;
            let preimage = entry.preimage;
            let received = entry.amount_sat;
            ledger.sent_sat += amount_sat;
            ledger.received_sat += received;
            preimage
        };

        // Paying our own invoice settles it; notify like any settlement.
        let _ = self.events.send(PaymentReceivedEvent {
            payment_hash,
            preimage,
            amount_sat,
        });

        Ok(LnPayment {
            payment_hash,
            preimage,
            fee_msat: 0,
        })
    }

    async fn subscribe_payments(&self) -> Result<PaymentStream, LightningError> {
        let receiver = self.events.subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
            match item {
                Ok(event) => Some(Ok(event)),
                // Lagged receivers miss events; at-least-once, not reliable.
                Err(_) => None,
            }
        });
        Ok(Box::pin(stream))
    }
}
