use anyhow::Result;
use rusqlite::params;

use super::catalog::bad_column;
use super::types::{CreditTransactionRecord, ReservationRecord, ReservationState};
use super::{Store, now_rfc3339};
use crate::core::errors::DispatchError;

/// Credit ledger. Reservations are the exactly-once settlement primitive:
/// `commit` and `release` only transition a token out of `held` once, and a
/// second call is a no-op enforced here, not by the caller, because the
/// dispatcher (or the reconciliation sweep) may retry settlement after a
/// crash.
impl Store {
    pub async fn balance(&self, account_id: &str) -> Result<i64> {
        let db = self.db().lock().await;
        let balance = db
            .query_row(
                "SELECT balance FROM credit_balances WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .unwrap_or(0);
        Ok(balance)
    }

    /// Credit top-up (purchase flows are external; tests and the credits API
    /// call this directly).
    pub async fn grant_credits(&self, account_id: &str, amount: i64) -> Result<i64> {
        anyhow::ensure!(amount > 0, "grant amount must be positive");
        let mut db = self.db().lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO credit_balances (account_id, balance) VALUES (?1, ?2)
             ON CONFLICT(account_id) DO UPDATE SET balance = balance + ?2",
            params![account_id, amount],
        )?;
        tx.execute(
            "INSERT INTO credit_transactions (execution_id, account_id, amount, reason, created_at)
             VALUES (NULL, ?1, ?2, 'grant', ?3)",
            params![account_id, amount, now_rfc3339()],
        )?;
        let balance = tx.query_row(
            "SELECT balance FROM credit_balances WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(balance)
    }

    /// Atomic check-and-decrement. Never partially decrements: the balance
    /// update and the audit rows land in one SQLite transaction, and the
    /// conditional UPDATE rejects the reserve when the balance cannot cover
    /// it. The connection mutex serializes concurrent reserves for the same
    /// user.
    pub async fn reserve_credits(
        &self,
        user_id: &str,
        amount: i64,
        execution_id: &str,
    ) -> Result<String, DispatchError> {
        if amount <= 0 {
            return Err(DispatchError::Internal(anyhow::anyhow!(
                "reserve amount must be positive, got {amount}"
            )));
        }
        let token = uuid::Uuid::new_v4().to_string();
        let mut db = self.db().lock().await;
        let tx = db.transaction().map_err(anyhow::Error::from)?;

        let updated = tx
            .execute(
                "UPDATE credit_balances SET balance = balance - ?1
                 WHERE account_id = ?2 AND balance >= ?1",
                params![amount, user_id],
            )
            .map_err(anyhow::Error::from)?;
        if updated == 0 {
            let available: i64 = tx
                .query_row(
                    "SELECT balance FROM credit_balances WHERE account_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .unwrap_or(0);
            return Err(DispatchError::InsufficientCredits {
                required: amount,
                available,
            });
        }

        let created_at = now_rfc3339();
        tx.execute(
            "INSERT INTO credit_transactions (execution_id, account_id, amount, reason, created_at)
             VALUES (?1, ?2, ?3, 'reservation', ?4)",
            params![execution_id, user_id, -amount, created_at],
        )
        .map_err(anyhow::Error::from)?;
        tx.execute(
            "INSERT INTO credit_reservations (token, user_id, execution_id, amount, state, created_at)
             VALUES (?1, ?2, ?3, ?4, 'held', ?5)",
            params![token, user_id, execution_id, amount, created_at],
        )
        .map_err(anyhow::Error::from)?;
        tx.commit().map_err(anyhow::Error::from)?;
        Ok(token)
    }

    /// Converts a held reservation into a permanent debit and books the
    /// publisher's revenue share. Returns the charged amount (the amount at
    /// reservation time, never re-read from the catalog), or None if the
    /// token was already finalized.
    pub async fn commit_reservation(
        &self,
        token: &str,
        publisher_id: &str,
        platform_fee_percent: u8,
    ) -> Result<Option<i64>> {
        let mut db = self.db().lock().await;
        let tx = db.transaction()?;
        let finalized_at = now_rfc3339();
        let updated = tx.execute(
            "UPDATE credit_reservations SET state = 'committed', finalized_at = ?1
             WHERE token = ?2 AND state = 'held'",
            params![finalized_at, token],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let (amount, execution_id): (i64, Option<String>) = tx.query_row(
            "SELECT amount, execution_id FROM credit_reservations WHERE token = ?1",
            params![token],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let fee = amount * i64::from(platform_fee_percent.min(100)) / 100;
        let publisher_share = amount - fee;
        tx.execute(
            "INSERT INTO credit_balances (account_id, balance) VALUES (?1, ?2)
             ON CONFLICT(account_id) DO UPDATE SET balance = balance + ?2",
            params![publisher_id, publisher_share],
        )?;
        tx.execute(
            "INSERT INTO credit_transactions (execution_id, account_id, amount, reason, created_at)
             VALUES (?1, ?2, ?3, 'settlement', ?4)",
            params![execution_id, publisher_id, publisher_share, finalized_at],
        )?;
        tx.commit()?;
        Ok(Some(amount))
    }

    /// Returns the reserved amount to the user's balance. Idempotent: a token
    /// already committed or released is left untouched and reported as false.
    pub async fn release_reservation(&self, token: &str) -> Result<bool> {
        let mut db = self.db().lock().await;
        let tx = db.transaction()?;
        let finalized_at = now_rfc3339();
        let updated = tx.execute(
            "UPDATE credit_reservations SET state = 'released', finalized_at = ?1
             WHERE token = ?2 AND state = 'held'",
            params![finalized_at, token],
        )?;
        if updated == 0 {
            return Ok(false);
        }

        let (user_id, amount, execution_id): (String, i64, Option<String>) = tx.query_row(
            "SELECT user_id, amount, execution_id FROM credit_reservations WHERE token = ?1",
            params![token],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        tx.execute(
            "INSERT INTO credit_balances (account_id, balance) VALUES (?1, ?2)
             ON CONFLICT(account_id) DO UPDATE SET balance = balance + ?2",
            params![user_id, amount],
        )?;
        tx.execute(
            "INSERT INTO credit_transactions (execution_id, account_id, amount, reason, created_at)
             VALUES (?1, ?2, ?3, 'refund', ?4)",
            params![execution_id, user_id, amount, finalized_at],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub async fn get_reservation(&self, token: &str) -> Result<Option<ReservationRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT token, user_id, execution_id, amount, state, created_at, finalized_at
             FROM credit_reservations WHERE token = ?1",
        )?;
        let mut rows = stmt.query_map(params![token], reservation_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Held reservations whose execution never reached a terminal state.
    /// Feed for the reconciliation sweep.
    pub async fn held_reservations_older_than(
        &self,
        cutoff: &str,
    ) -> Result<Vec<ReservationRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT token, user_id, execution_id, amount, state, created_at, finalized_at
             FROM credit_reservations WHERE state = 'held' AND created_at < ?1
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![cutoff], reservation_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn transactions_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<CreditTransactionRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, execution_id, account_id, amount, reason, created_at
             FROM credit_transactions WHERE execution_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![execution_id], transaction_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn transactions_for_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<CreditTransactionRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, execution_id, account_id, amount, reason, created_at
             FROM credit_transactions WHERE account_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![account_id], transaction_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

fn reservation_from_row(row: &rusqlite::Row) -> rusqlite::Result<ReservationRecord> {
    let state_raw: String = row.get(4)?;
    let state = ReservationState::from_status(&state_raw)
        .ok_or_else(|| bad_column(4, format!("unknown reservation state '{state_raw}'")))?;
    Ok(ReservationRecord {
        token: row.get(0)?,
        user_id: row.get(1)?,
        execution_id: row.get(2)?,
        amount: row.get(3)?,
        state,
        created_at: row.get(5)?,
        finalized_at: row.get(6)?,
    })
}

fn transaction_from_row(row: &rusqlite::Row) -> rusqlite::Result<CreditTransactionRecord> {
    Ok(CreditTransactionRecord {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        account_id: row.get(2)?,
        amount: row.get(3)?,
        reason: row.get(4)?,
        created_at: row.get(5)?,
    })
}
