//! Local persistence: the proof table keyed by `Y`, the mint keyset cache,
//! and the outbound-HTLC table backing the refund path.

use std::collections::BTreeMap;

use secp256k1::PublicKey;
use sqlx::{Row, SqlitePool};

use crate::error::{BraidError, Result};
use crate::mint::Keyset;
use crate::proof::{Proof, ProofDleq};
use crate::protocol::unix_now;

#[derive(Clone)]
pub struct ProofDb {
    pool: SqlitePool,
}

/// An HTLC sent out in a pay flow, retained until the gateway's claim is
/// confirmed or the locktime refund sweeps it back.
#[derive(Clone, Debug)]
pub struct PendingHtlc {
    pub payment_hash: String,
    pub proofs: Vec<Proof>,
    pub amount: u64,
    pub locktime: u64,
}

impl ProofDb {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS proofs (
                 y TEXT PRIMARY KEY,
                 keyset_id TEXT NOT NULL,
                 amount INTEGER NOT NULL,
                 secret TEXT NOT NULL,
                 c TEXT NOT NULL,
                 witness TEXT,
                 dleq TEXT,
                 stored_at INTEGER NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS keysets (
                 id TEXT PRIMARY KEY,
                 unit TEXT NOT NULL,
                 keys_json TEXT NOT NULL,
                 fetched_at INTEGER NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pending_htlcs (
                 payment_hash TEXT PRIMARY KEY,
                 proofs_json TEXT NOT NULL,
                 amount INTEGER NOT NULL,
                 locktime INTEGER NOT NULL,
                 created_at INTEGER NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn save_proofs(&self, proofs: &[Proof]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for proof in proofs {
            insert_proof(&mut tx, proof).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Consume `spent` and record `received` in one transaction, so a send
    /// can never leave the store holding both sides.
    pub async fn swap_commit(&self, spent: &[Proof], received: &[Proof]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for proof in spent {
            let y = proof.y()?.to_string();
            sqlx::query("DELETE FROM proofs WHERE y = ?1")
                .bind(y)
                .execute(&mut *tx)
                .await?;
        }
        for proof in received {
            insert_proof(&mut tx, proof).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_proofs(&self, proofs: &[Proof]) -> Result<()> {
        self.swap_commit(proofs, &[]).await
    }

    pub async fn all_proofs(&self) -> Result<Vec<Proof>> {
        let rows = sqlx::query(
            "SELECT keyset_id, amount, secret, c, witness, dleq
               FROM proofs ORDER BY amount ASC, y ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_proof).collect()
    }

    pub async fn balance(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(SUM(amount), 0) AS total FROM proofs")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    /// Deterministic selection: smallest amounts first, `Y` as tie-break,
    /// greedy until the target is covered.
    pub async fn select_for_spend(&self, amount: u64) -> Result<Vec<Proof>> {
        let all = self.all_proofs().await?;
        let available: u64 = all.iter().map(|p| p.amount).sum();
        if available < amount {
            return Err(BraidError::InsufficientFunds {
                needed: amount,
                available,
            });
        }

        let mut selected = Vec::new();
        let mut covered = 0u64;
        for proof in all {
            if covered >= amount {
                break;
            }
            covered += proof.amount;
            selected.push(proof);
        }
        Ok(selected)
    }

    pub async fn upsert_keysets(&self, keysets: &[Keyset]) -> Result<()> {
        let fetched_at = unix_now() as i64;
        let mut tx = self.pool.begin().await?;
        for keyset in keysets {
            let keys_json = serde_json::to_string(&keyset.keys)?;
            sqlx::query(
                "INSERT INTO keysets (id, unit, keys_json, fetched_at)
                  VALUES (?1, ?2, ?3, ?4)
                  ON CONFLICT(id) DO UPDATE SET
                    unit = excluded.unit,
                    keys_json = excluded.keys_json,
                    fetched_at = excluded.fetched_at",
            )
            .bind(&keyset.id)
            .bind(&keyset.unit)
            .bind(keys_json)
            .bind(fetched_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_keysets(&self) -> Result<Vec<Keyset>> {
        let rows = sqlx::query("SELECT id, unit, keys_json FROM keysets ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut keysets = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let unit: String = row.try_get("unit")?;
            let keys_json: String = row.try_get("keys_json")?;
            let keys: BTreeMap<u64, PublicKey> = serde_json::from_str(&keys_json)?;
            keysets.push(Keyset { id, unit, keys });
        }
        Ok(keysets)
    }

    pub async fn insert_pending_htlc(&self, pending: &PendingHtlc) -> Result<()> {
        let proofs_json = serde_json::to_string(&pending.proofs)?;
        sqlx::query(
            "INSERT OR REPLACE INTO pending_htlcs
                 (payment_hash, proofs_json, amount, locktime, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&pending.payment_hash)
        .bind(proofs_json)
        .bind(pending.amount as i64)
        .bind(pending.locktime as i64)
        .bind(unix_now() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_pending_htlcs(&self) -> Result<Vec<PendingHtlc>> {
        let rows = sqlx::query(
            "SELECT payment_hash, proofs_json, amount, locktime
               FROM pending_htlcs ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let payment_hash: String = row.try_get("payment_hash")?;
            let proofs_json: String = row.try_get("proofs_json")?;
            let amount: i64 = row.try_get("amount")?;
            let locktime: i64 = row.try_get("locktime")?;
            pending.push(PendingHtlc {
                payment_hash,
                proofs: serde_json::from_str(&proofs_json)?,
                amount: amount as u64,
                locktime: locktime as u64,
            });
        }
        Ok(pending)
    }

    pub async fn remove_pending_htlc(&self, payment_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_htlcs WHERE payment_hash = ?1")
            .bind(payment_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn insert_proof(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    proof: &Proof,
) -> Result<()> {
    let y = proof.y()?.to_string();
    let dleq = match &proof.dleq {
        Some(dleq) => Some(serde_json::to_string(dleq)?),
        None => None,
    };
    let result = sqlx::query(
        "INSERT INTO proofs (y, keyset_id, amount, secret, c, witness, dleq, stored_at)
          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&y)
    .bind(&proof.id)
    .bind(proof.amount as i64)
    .bind(&proof.secret)
    .bind(proof.c.to_string())
    .bind(&proof.witness)
    .bind(dleq)
    .bind(unix_now() as i64)
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(BraidError::Store(
            format!("proof {y} already stored"),
        )),
        Err(e) => Err(e.into()),
    }
}

fn row_to_proof(row: &sqlx::sqlite::SqliteRow) -> Result<Proof> {
    let keyset_id: String = row.try_get("keyset_id")?;
    let amount: i64 = row.try_get("amount")?;
    let secret: String = row.try_get("secret")?;
    let c: String = row.try_get("c")?;
    let witness: Option<String> = row.try_get("witness")?;
    let dleq: Option<String> = row.try_get("dleq")?;

    let dleq: Option<ProofDleq> = match dleq {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };

    Ok(Proof {
        id: keyset_id,
        amount: amount as u64,
        secret,
        c: c
            .parse()
            .map_err(|e| BraidError::Store(format!("invalid point in DB: {e}")))?,
        witness,
        dleq,
    })
}
