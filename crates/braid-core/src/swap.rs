//! Swap request assembly and the two signature commitment modes.
//!
//! `SIG_ALL` binds one signature to every input secret and every blinded
//! output, carried on the first input's witness only; `SIG_INPUTS` signs each
//! input independently and commits to nothing else.

use secp256k1::schnorr::Signature;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::contract::Witness;
use crate::crypto::{sha256, sign_digest, verify_digest};
use crate::error::{BraidError, Result};
use crate::proof::{BlindSignature, BlindedMessage, Proof};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwapRequest {
    pub inputs: Vec<Proof>,
    pub outputs: Vec<BlindedMessage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwapResponse {
    pub signatures: Vec<BlindSignature>,
}

/// Digest committed to by a `SIG_ALL` signature:
/// `SHA256(secret_0 || .. || secret_n || B_0 || .. || B_m)` with secrets as
/// their canonical UTF-8 strings and blinded points as lowercase compressed
/// hex.
pub fn sig_all_message(inputs: &[Proof], outputs: &[BlindedMessage]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for input in inputs {
        hasher.update(input.secret.as_bytes());
    }
    for output in outputs {
        hasher.update(output.b.to_string().as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Sign a swap under `SIG_ALL` and attach the witness to the first input.
pub fn sign_swap_sig_all(
    secret_key: &SecretKey,
    request: &mut SwapRequest,
    preimage: Option<[u8; 32]>,
) -> Result<()> {
    let first = request
        .inputs
        .first()
        .ok_or_else(|| BraidError::Protocol("swap has no inputs".to_string()))?
        .clone();
    let digest = sig_all_message(&request.inputs, &request.outputs);
    let signature = sign_digest(secret_key, &digest);

    let mut witness = first.parse_witness()?.unwrap_or_default();
    witness.signatures = vec![signature.to_string()];
    witness.preimage = preimage.map(hex::encode);
    request.inputs[0].set_witness(&witness)?;
    Ok(())
}

/// Verify the aggregate signature on the first input against one of the
/// given locking keys. `pubkeys` may be 32-byte x-only or 33-byte
/// compressed encodings.
pub fn verify_swap_sig_all(
    pubkeys: &[Vec<u8>],
    inputs: &[Proof],
    outputs: &[BlindedMessage],
) -> Result<()> {
    let first = inputs
        .first()
        .ok_or_else(|| BraidError::Protocol("swap has no inputs".to_string()))?;
    let witness = first
        .parse_witness()?
        .ok_or_else(|| BraidError::Crypto("missing witness on first input".to_string()))?;
    let raw = witness
        .signatures
        .first()
        .ok_or_else(|| BraidError::Crypto("missing aggregate signature".to_string()))?;
    let signature: Signature = raw
        .parse()
        .map_err(|e| BraidError::Crypto(format!("malformed signature: {e}")))?;

    let digest = sig_all_message(inputs, outputs);
    for pubkey in pubkeys {
        if verify_digest(pubkey, &digest, &signature).is_ok() {
            return Ok(());
        }
    }
    Err(BraidError::Crypto(
        "aggregate signature matches no locking key".to_string(),
    ))
}

/// Sign every input independently (`SIG_INPUTS`): one Schnorr signature over
/// `SHA256(secret)` per proof, each carried on its own witness.
pub fn sign_inputs(
    secret_key: &SecretKey,
    inputs: &mut [Proof],
    preimage: Option<[u8; 32]>,
) -> Result<()> {
    for input in inputs.iter_mut() {
        let digest = sha256(input.secret.as_bytes());
        let signature = sign_digest(secret_key, &digest);
        let mut witness = input.parse_witness()?.unwrap_or_default();
        witness.signatures.push(signature.to_string());
        if let Some(preimage) = preimage {
            witness.preimage = Some(hex::encode(preimage));
        }
        input.set_witness(&witness)?;
    }
    Ok(())
}

/// Verify that `proof` carries at least `required` valid signatures from
/// distinct entries of `pubkeys` over `SHA256(secret)`.
pub fn verify_input_signatures(
    pubkeys: &[Vec<u8>],
    proof: &Proof,
    required: u64,
) -> Result<()> {
    let witness = proof
        .parse_witness()?
        .ok_or_else(|| BraidError::Crypto("missing witness".to_string()))?;
    let digest = sha256(proof.secret.as_bytes());

    let mut matched = 0u64;
    let mut used = vec![false; pubkeys.len()];
    for raw in &witness.signatures {
        let Ok(signature) = raw.parse::<Signature>() else {
            continue;
        };
        for (i, pubkey) in pubkeys.iter().enumerate() {
            if !used[i] && verify_digest(pubkey, &digest, &signature).is_ok() {
                used[i] = true;
                matched += 1;
                break;
            }
        }
    }

    if matched < required {
        return Err(BraidError::Crypto(format!(
            "{matched} of {required} required signatures present"
        )));
    }
    Ok(())
}
