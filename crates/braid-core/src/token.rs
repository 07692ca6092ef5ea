//! Compact token encoding for transporting proofs between peers: CBOR body,
//! base64-url without padding, `cashuB` prefix. Proofs are grouped by
//! keyset, points travel as raw bytes.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ciborium::value::Value;
use secp256k1::PublicKey;

use crate::error::{BraidError, Result};
use crate::proof::Proof;

const TOKEN_PREFIX: &str = "cashuB";

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub mint_url: String,
    pub unit: String,
    pub memo: Option<String>,
    pub proofs: Vec<Proof>,
}

impl Token {
    pub fn new(mint_url: impl Into<String>, unit: impl Into<String>, proofs: Vec<Proof>) -> Self {
        Token {
            mint_url: mint_url.into(),
            unit: unit.into(),
            memo: None,
            proofs,
        }
    }

    pub fn total_amount(&self) -> u64 {
        self.proofs.iter().map(|p| p.amount).sum()
    }

    pub fn encode(&self) -> Result<String> {
        let mut groups: BTreeMap<String, Vec<&Proof>> = BTreeMap::new();
        for proof in &self.proofs {
            groups.entry(proof.id.clone()).or_default().push(proof);
        }

        let keyset_groups: Vec<Value> = groups
            .into_iter()
            .map(|(id, proofs)| {
                let id_bytes = hex::decode(&id)
                    .map_err(|_| BraidError::Token(format!("keyset id {id:?} is not hex")))?;
                let entries: Vec<Value> = proofs
                    .into_iter()
                    .map(|p| {
                        let mut fields = vec![
                            (Value::Text("a".into()), Value::Integer(p.amount.into())),
                            (Value::Text("s".into()), Value::Text(p.secret.clone())),
                            (Value::Text("c".into()), Value::Bytes(p.c.serialize().to_vec())),
                        ];
                        if let Some(witness) = &p.witness {
                            fields.push((Value::Text("w".into()), Value::Text(witness.clone())));
                        }
                        Value::Map(fields)
                    })
                    .collect();
                Ok(Value::Map(vec![
                    (Value::Text("i".into()), Value::Bytes(id_bytes)),
                    (Value::Text("p".into()), Value::Array(entries)),
                ]))
            })
            .collect::<Result<_>>()?;

        let mut body = vec![
            (Value::Text("m".into()), Value::Text(self.mint_url.clone())),
            (Value::Text("u".into()), Value::Text(self.unit.clone())),
        ];
        if let Some(memo) = &self.memo {
            body.push((Value::Text("d".into()), Value::Text(memo.clone())));
        }
        body.push((Value::Text("t".into()), Value::Array(keyset_groups)));

        let mut encoded = Vec::new();
        ciborium::into_writer(&Value::Map(body), &mut encoded)
            .map_err(|e| BraidError::Token(format!("cbor encoding failed: {e}")))?;
        Ok(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(encoded)))
    }

    pub fn decode(raw: &str) -> Result<Token> {
        let body = raw
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| BraidError::Token("missing token prefix".to_string()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| BraidError::Token(format!("invalid base64: {e}")))?;
        let value: Value = ciborium::from_reader(bytes.as_slice())
            .map_err(|e| BraidError::Token(format!("invalid cbor: {e}")))?;

        let top = as_map(&value)?;
        let mint_url = as_text(field(top, "m")?)?.to_string();
        let unit = as_text(field(top, "u")?)?.to_string();
        let memo = match field(top, "d") {
            Ok(v) => Some(as_text(v)?.to_string()),
            Err(_) => None,
        };

        let mut proofs = Vec::new();
        for group in as_array(field(top, "t")?)? {
            let group = as_map(group)?;
            let id = hex::encode(as_bytes(field(group, "i")?)?);
            for entry in as_array(field(group, "p")?)? {
                let entry = as_map(entry)?;
                let amount = as_integer(field(entry, "a")?)?;
                let secret = as_text(field(entry, "s")?)?.to_string();
                let c = PublicKey::from_slice(as_bytes(field(entry, "c")?)?)
                    .map_err(|e| BraidError::Token(format!("invalid proof point: {e}")))?;
                let witness = match field(entry, "w") {
                    Ok(v) => Some(as_text(v)?.to_string()),
                    Err(_) => None,
                };
                proofs.push(Proof {
                    id: id.clone(),
                    amount,
                    secret,
                    c,
                    witness,
                    dleq: None,
                });
            }
        }

        if proofs.is_empty() {
            return Err(BraidError::Token("token carries no proofs".to_string()));
        }
        Ok(Token {
            mint_url,
            unit,
            memo,
            proofs,
        })
    }
}

fn as_map(value: &Value) -> Result<&Vec<(Value, Value)>> {
    value
        .as_map()
        .ok_or_else(|| BraidError::Token("expected cbor map".to_string()))
}

fn as_array(value: &Value) -> Result<&Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| BraidError::Token("expected cbor array".to_string()))
}

fn as_text(value: &Value) -> Result<&str> {
    value
        .as_text()
        .ok_or_else(|| BraidError::Token("expected cbor text".to_string()))
}

fn as_bytes(value: &Value) -> Result<&[u8]> {
    value
        .as_bytes()
        .map(|b| b.as_slice())
        .ok_or_else(|| BraidError::Token("expected cbor bytes".to_string()))
}

fn as_integer(value: &Value) -> Result<u64> {
    let integer = value
        .as_integer()
        .ok_or_else(|| BraidError::Token("expected cbor integer".to_string()))?;
    u64::try_from(integer).map_err(|_| BraidError::Token("amount out of range".to_string()))
}

fn field<'a>(map: &'a [(Value, Value)], key: &str) -> Result<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
        .ok_or_else(|| BraidError::Token(format!("missing field {key:?}")))
}
