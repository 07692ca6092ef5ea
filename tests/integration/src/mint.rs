//! A mint double with real verification: balanced amounts, hashlocks,
//! per-input and aggregate signatures, locktime refund paths, and
//! discrete-log-equality proofs on everything it signs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;

use secp256k1::global::SECP256K1;
use secp256k1::{PublicKey, Scalar, SecretKey};
use sha2::{Digest, Sha256};

use braid_core::contract::{ContractSecret, SecretKind, SigFlag, SpendConditions};
use braid_core::crypto::{dleq_challenge, hash_to_curve, random_secret_key, sha256};
use braid_core::error::{BraidError, Result};
use braid_core::mint::{Keyset, MintConnector, ProofState, ProofStateUpdate};
use braid_core::outputs::split_amount;
use braid_core::proof::{BlindSignature, Proof, SignatureDleq};
use braid_core::protocol::unix_now;
use braid_core::swap::{
    verify_input_signatures, verify_swap_sig_all, SwapRequest, SwapResponse,
};

const CODE_UNBALANCED: i64 = 11002;
const CODE_ALREADY_SPENT: i64 = 11001;
const CODE_NOT_VERIFIED: i64 = 10003;

fn mint_error(code: i64, detail: impl Into<String>) -> BraidError {
    BraidError::Mint {
        code,
        detail: detail.into(),
    }
}

struct Ledger {
    /// Spent `Y` -> witness observed at spend time.
    spent: HashMap<String, Option<String>>,
    swaps: u64,
}

pub struct TestMint {
    keyset: Keyset,
    secrets: BTreeMap<u64, SecretKey>,
    ledger: Mutex<Ledger>,
}

impl TestMint {
    pub fn new() -> Arc<Self> {
        let mut secrets = BTreeMap::new();
        let mut keys = BTreeMap::new();
        for exponent in 0..=20u32 {
            let amount = 1u64 << exponent;
            let secret = random_secret_key();
            keys.insert(amount, secret.public_key(SECP256K1));
            secrets.insert(amount, secret);
        }

        let mut hasher = Sha256::new();
        for key in keys.values() {
            hasher.update(key.serialize());
        }
        let id = format!("00{}", &hex::encode(hasher.finalize())[..14]);

        Arc::new(TestMint {
            keyset: Keyset {
                id,
                unit: "sat".to_string(),
                keys,
            },
            secrets,
            ledger: Mutex::new(Ledger {
                spent: HashMap::new(),
                swaps: 0,
            }),
        })
    }

    pub fn url() -> &'static str {
        "http://mint.test"
    }

    pub fn keyset_id(&self) -> &str {
        &self.keyset.id
    }

    pub fn swap_count(&self) -> u64 {
        self.ledger.lock().unwrap().swaps
    }

    /// Sign a proof for the given secret directly, bypassing the swap path.
    /// Test setup only; the proof is unspent.
    pub fn issue_proof(&self, secret: &str, amount: u64) -> Proof {
        let mint_secret = self.secrets.get(&amount).expect("unknown denomination");
        let y = hash_to_curve(secret.as_bytes()).expect("secret maps to the curve");
        let c = y
            .mul_tweak(SECP256K1, &Scalar::from(*mint_secret))
            .expect("tweak is valid");
        Proof {
            id: self.keyset.id.clone(),
            amount,
            secret: secret.to_string(),
            c,
            witness: None,
            dleq: None,
        }
    }

    /// Grant `amount` in fresh self-locked proofs to `owner`.
    pub fn issue_to(&self, owner: &PublicKey, amount: u64) -> Vec<Proof> {
        split_amount(amount)
            .into_iter()
            .map(|denomination| {
                let secret =
                    ContractSecret::p2pk(owner, SpendConditions::default()).to_string();
                self.issue_proof(&secret, denomination)
            })
            .collect()
    }

    fn sign_output(&self, amount: u64, blinded: &PublicKey) -> Result<(PublicKey, SignatureDleq)> {
        let mint_secret = self
            .secrets
            .get(&amount)
            .ok_or_else(|| mint_error(CODE_NOT_VERIFIED, format!("no key for {amount}")))?;
        let c = blinded.mul_tweak(SECP256K1, &Scalar::from(*mint_secret))?;

        // e is a hash; retry the nonce on the negligible chance it is not a
        // valid scalar.
        loop {
            let nonce = random_secret_key();
            let r1 = nonce.public_key(SECP256K1);
            let r2 = blinded.mul_tweak(SECP256K1, &Scalar::from(nonce))?;
            let challenge = dleq_challenge(&r1, &r2, &mint_secret.public_key(SECP256K1), &c);
            let Ok(e) = SecretKey::from_slice(&challenge) else {
                continue;
            };
            let s = mint_secret
                .mul_tweak(&Scalar::from(e))?
                .add_tweak(&Scalar::from(nonce))?;
            return Ok((
                c,
                SignatureDleq {
                    e: hex::encode(e.secret_bytes()),
                    s: hex::encode(s.secret_bytes()),
                },
            ));
        }
    }

    fn verify_inputs(&self, request: &SwapRequest, now: u64) -> Result<()> {
        let first_witness = request.inputs[0].parse_witness().unwrap_or(None);

        for proof in &request.inputs {
            let Ok(contract) = proof.secret.parse::<ContractSecret>() else {
                // Plain secrets carry no spending conditions.
                continue;
            };
            let conditions = &contract.conditions;

            if conditions.locktime.is_some_and(|t| now >= t)
                && !conditions.refund_keys.is_empty()
            {
                let refund_keys: Vec<Vec<u8>> = conditions
                    .refund_keys
                    .iter()
                    .map(|k| k.serialize().to_vec())
                    .collect();
                verify_input_signatures(&refund_keys, proof, conditions.required_refund_sigs())
                    .map_err(|e| {
                        mint_error(CODE_NOT_VERIFIED, format!("refund not satisfied: {e}"))
                    })?;
                continue;
            }

            if contract.kind == SecretKind::Htlc {
                let own_witness = proof.parse_witness().unwrap_or(None);
                let preimage_hex = own_witness
                    .as_ref()
                    .and_then(|w| w.preimage.clone())
                    .or_else(|| first_witness.as_ref().and_then(|w| w.preimage.clone()))
                    .ok_or_else(|| mint_error(CODE_NOT_VERIFIED, "missing preimage"))?;
                let preimage = hex::decode(&preimage_hex)
                    .map_err(|_| mint_error(CODE_NOT_VERIFIED, "malformed preimage"))?;
                if hex::encode(sha256(&preimage)) != contract.data {
                    return Err(mint_error(
                        CODE_NOT_VERIFIED,
                        "preimage does not resolve the hashlock",
                    ));
                }
            }

            let mut signing_keys: Vec<Vec<u8>> = Vec::new();
            if contract.kind == SecretKind::P2pk {
                let owner = contract
                    .locking_pubkey()
                    .map_err(|e| mint_error(CODE_NOT_VERIFIED, e.to_string()))?;
                signing_keys.push(owner.serialize().to_vec());
            }
            signing_keys.extend(conditions.pubkeys.iter().map(|k| k.serialize().to_vec()));

            match conditions.sig_flag {
                SigFlag::SigAll => {
                    verify_swap_sig_all(&signing_keys, &request.inputs, &request.outputs)
                        .map_err(|e| {
                            mint_error(
                                CODE_NOT_VERIFIED,
                                format!("aggregate signature invalid: {e}"),
                            )
                        })?;
                }
                SigFlag::SigInputs => {
                    verify_input_signatures(&signing_keys, proof, conditions.required_sigs())
                        .map_err(|e| {
                            mint_error(CODE_NOT_VERIFIED, format!("signature invalid: {e}"))
                        })?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MintConnector for TestMint {
    async fn keysets(&self) -> Result<Vec<Keyset>> {
        Ok(vec![self.keyset.clone()])
    }

    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse> {
        if request.inputs.is_empty() || request.outputs.is_empty() {
            return Err(mint_error(CODE_NOT_VERIFIED, "empty swap"));
        }
        for proof in &request.inputs {
            if proof.id != self.keyset.id {
                return Err(mint_error(CODE_NOT_VERIFIED, "unknown keyset on input"));
            }
        }
        for output in &request.outputs {
            if output.id != self.keyset.id {
                return Err(mint_error(CODE_NOT_VERIFIED, "unknown keyset on output"));
            }
        }

        let in_total: u64 = request.inputs.iter().map(|p| p.amount).sum();
        let out_total: u64 = request.outputs.iter().map(|o| o.amount).sum();
        if in_total != out_total {
            return Err(mint_error(
                CODE_UNBALANCED,
                format!("inputs {in_total} != outputs {out_total}"),
            ));
        }

        let mut ys = Vec::with_capacity(request.inputs.len());
        let mut distinct = HashSet::new();
        for proof in &request.inputs {
            let y = proof.y()?.to_string();
            if !distinct.insert(y.clone()) {
                return Err(mint_error(CODE_NOT_VERIFIED, "duplicate input"));
            }
            ys.push(y);
        }

        {
            let ledger = self.ledger.lock().unwrap();
            if ys.iter().any(|y| ledger.spent.contains_key(y)) {
                return Err(mint_error(CODE_ALREADY_SPENT, "input already spent"));
            }
        }

        self.verify_inputs(&request, unix_now())?;

        let mut signatures = Vec::with_capacity(request.outputs.len());
        for output in &request.outputs {
            let (c, dleq) = self.sign_output(output.amount, &output.b)?;
            signatures.push(BlindSignature {
                amount: output.amount,
                id: output.id.clone(),
                c,
                dleq: Some(dleq),
            });
        }

        let mut ledger = self.ledger.lock().unwrap();
        for (proof, y) in request.inputs.iter().zip(ys) {
            ledger.spent.insert(y, proof.witness.clone());
        }
        ledger.swaps += 1;
        Ok(SwapResponse { signatures })
    }

    async fn check_state(&self, ys: Vec<PublicKey>) -> Result<Vec<ProofStateUpdate>> {
        let ledger = self.ledger.lock().unwrap();
        Ok(ys
            .into_iter()
            .map(|y| match ledger.spent.get(&y.to_string()) {
                Some(witness) => ProofStateUpdate {
                    y,
                    state: ProofState::Spent,
                    witness: witness.clone(),
                },
                None => ProofStateUpdate {
                    y,
                    state: ProofState::Unspent,
                    witness: None,
                },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::outputs::{blinded_messages, create_outputs, unblind_outputs, OutputLock};
    use braid_core::swap::sign_inputs;
    use braid_core::wallet::PeerKeys;

    #[tokio::test]
    async fn swap_rejects_unbalanced_and_double_spends() {
        let mint = TestMint::new();
        let keys = PeerKeys::new(random_secret_key());
        let proofs = mint.issue_to(&keys.public, 8);

        let lock = OutputLock::P2pk {
            owner: keys.public,
            conditions: SpendConditions::default(),
        };
        let outputs = create_outputs(4, mint.keyset_id(), &lock).unwrap();
        let mut inputs = proofs.clone();
        sign_inputs(&keys.secret, &mut inputs, None).unwrap();

        let unbalanced = SwapRequest {
            inputs: inputs.clone(),
            outputs: blinded_messages(&outputs),
        };
        let err = mint.swap(unbalanced).await.unwrap_err();
        assert!(matches!(err, BraidError::Mint { code: 11002, .. }));

        let outputs = create_outputs(8, mint.keyset_id(), &lock).unwrap();
        let request = SwapRequest {
            inputs: inputs.clone(),
            outputs: blinded_messages(&outputs),
        };
        let response = mint.swap(request.clone()).await.unwrap();

        let keyset = mint.keysets().await.unwrap().remove(0);
        let proofs = unblind_outputs(&outputs, &response.signatures, &keyset).unwrap();
        assert_eq!(proofs.iter().map(|p| p.amount).sum::<u64>(), 8);

        let err = mint.swap(request).await.unwrap_err();
        assert!(matches!(err, BraidError::Mint { code: 11001, .. }));
    }

    #[tokio::test]
    async fn swap_requires_owner_signature() {
        let mint = TestMint::new();
        let keys = PeerKeys::new(random_secret_key());
        let inputs = mint.issue_to(&keys.public, 4);

        let lock = OutputLock::P2pk {
            owner: keys.public,
            conditions: SpendConditions::default(),
        };
        let outputs = create_outputs(4, mint.keyset_id(), &lock).unwrap();

        // No signatures at all.
        let err = mint
            .swap(SwapRequest {
                inputs: inputs.clone(),
                outputs: blinded_messages(&outputs),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BraidError::Mint { code: 10003, .. }));

        // Signed by a stranger.
        let stranger = random_secret_key();
        let mut signed = inputs;
        sign_inputs(&stranger, &mut signed, None).unwrap();
        let err = mint
            .swap(SwapRequest {
                inputs: signed,
                outputs: blinded_messages(&outputs),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BraidError::Mint { code: 10003, .. }));
    }
}
