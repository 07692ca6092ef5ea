use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::global::SECP256K1;
use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, PublicKey, Scalar, SecretKey, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{BraidError, Result};

/// Domain separator of the mint's hash-to-curve map.
const H2C_DOMAIN_SEPARATOR: &[u8] = b"Secp256k1_HashToCurve_Cashu_";

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Map a byte string to a curve point.
///
/// `msg_hash = SHA256(separator || message)`, then the first counter in
/// `0..2^16` for which `0x02 || SHA256(msg_hash || counter_le32)` decodes as
/// a compressed point wins.
pub fn hash_to_curve(message: &[u8]) -> Result<PublicKey> {
    let mut hasher = Sha256::new();
    hasher.update(H2C_DOMAIN_SEPARATOR);
    hasher.update(message);
    let msg_hash = hasher.finalize();

    for counter in 0u32..65536 {
        let mut attempt = Sha256::new();
        attempt.update(msg_hash);
        attempt.update(counter.to_le_bytes());
        let digest = attempt.finalize();

        let mut candidate = [0u8; 33];
        candidate[0] = 0x02;
        candidate[1..].copy_from_slice(&digest);
        if let Ok(point) = PublicKey::from_slice(&candidate) {
            return Ok(point);
        }
    }

    Err(BraidError::Crypto(
        "no curve point found for message".to_string(),
    ))
}

/// Blind a secret for the mint: `B_ = H2C(secret) + r*G`.
///
/// Returns the blinded point together with the blinding factor `r`; the
/// caller must retain `r` to unblind the mint's signature later.
pub fn blind_message(secret: &[u8], blinding: Option<SecretKey>) -> Result<(PublicKey, SecretKey)> {
    let y = hash_to_curve(secret)?;
    let r = blinding.unwrap_or_else(|| SecretKey::new(&mut OsRng));
    let b = y.combine(&r.public_key(SECP256K1))?;
    Ok((b, r))
}

/// Unblind a mint signature: `C = C_ - r*K`.
pub fn unblind_signature(
    blinded_sig: &PublicKey,
    r: &SecretKey,
    mint_key: &PublicKey,
) -> Result<PublicKey> {
    let rk = mint_key.mul_tweak(SECP256K1, &Scalar::from(*r))?;
    Ok(blinded_sig.combine(&rk.negate(SECP256K1))?)
}

/// BIP340 signature over a 32-byte digest.
pub fn sign_digest(secret_key: &SecretKey, digest: &[u8; 32]) -> Signature {
    let keypair = Keypair::from_secret_key(SECP256K1, secret_key);
    SECP256K1.sign_schnorr(&Message::from_digest(*digest), &keypair)
}

/// Parse an x-only key from either a 32-byte x-only or a 33-byte compressed
/// encoding; the parity prefix of the latter is stripped.
pub fn xonly_from_bytes(bytes: &[u8]) -> Result<XOnlyPublicKey> {
    let key = match bytes.len() {
        32 => XOnlyPublicKey::from_slice(bytes)?,
        33 => XOnlyPublicKey::from_slice(&bytes[1..])?,
        n => {
            return Err(BraidError::Crypto(format!(
                "invalid public key length {n}"
            )))
        }
    };
    Ok(key)
}

pub fn verify_digest(pubkey: &[u8], digest: &[u8; 32], signature: &Signature) -> Result<()> {
    let key = xonly_from_bytes(pubkey)?;
    SECP256K1
        .verify_schnorr(signature, &Message::from_digest(*digest), &key)
        .map_err(|e| BraidError::Crypto(format!("signature verification failed: {e}")))
}

pub fn pubkey_from_hex(s: &str) -> Result<PublicKey> {
    s.parse()
        .map_err(|e| BraidError::Crypto(format!("invalid public key {s:?}: {e}")))
}

pub fn random_secret_key() -> SecretKey {
    SecretKey::new(&mut OsRng)
}

/// Fresh 32-byte nonce, hex encoded.
pub fn random_nonce() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn random_preimage() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Challenge scalar of the mint's discrete-log-equality proof: the SHA-256
/// of the uncompressed hex encodings of `R1, R2, K, C_`, in that order.
pub fn dleq_challenge(
    r1: &PublicKey,
    r2: &PublicKey,
    mint_key: &PublicKey,
    blinded_sig: &PublicKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for point in [r1, r2, mint_key, blinded_sig] {
        hasher.update(hex::encode(point.serialize_uncompressed()).as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Verify a `(e, s)` discrete-log-equality proof for a blinded signature:
/// `R1 = s*G - e*K`, `R2 = s*B_ - e*C_`, accept iff the recomputed
/// challenge equals `e`.
pub fn verify_dleq(
    blinded_message: &PublicKey,
    blinded_sig: &PublicKey,
    e: &SecretKey,
    s: &SecretKey,
    mint_key: &PublicKey,
) -> Result<()> {
    let e_scalar = Scalar::from(*e);
    let s_scalar = Scalar::from(*s);

    let ek = mint_key.mul_tweak(SECP256K1, &e_scalar)?.negate(SECP256K1);
    let r1 = s.public_key(SECP256K1).combine(&ek)?;

    let sb = blinded_message.mul_tweak(SECP256K1, &s_scalar)?;
    let ec = blinded_sig.mul_tweak(SECP256K1, &e_scalar)?.negate(SECP256K1);
    let r2 = sb.combine(&ec)?;

    let expected = dleq_challenge(&r1, &r2, mint_key, blinded_sig);
    if e.secret_bytes() != expected {
        return Err(BraidError::Crypto("dleq verification failed".to_string()));
    }
    Ok(())
}
