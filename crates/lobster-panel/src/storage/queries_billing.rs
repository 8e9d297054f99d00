//! Credit ledger, transaction and region bandwidth queries.
//!
//! Every credit movement writes a charge row and adjusts `users.credit` in
//! the same database transaction, so the ledger and the balance never
//! diverge.

use lobster_core::db::unix_timestamp;
use sqlx::{Sqlite, Transaction as SqlxTransaction};

use super::db::{DatabaseError, PanelDatabase};
use super::models::{Charge, RegionBandwidth, Transaction};

/// One line on a user's ledger. A positive `amount` debits the account;
/// credits are written with a negative amount.
pub struct LedgerEntry<'a> {
    pub user_id: i64,
    pub name: &'a str,
    pub detail: &'a str,
    pub key: &'a str,
    /// `YYYY-MM-DD`.
    pub day: &'a str,
    pub amount: i64,
}

/// Parameters for recording a payment gateway transaction.
pub struct TransactionParams<'a> {
    pub user_id: i64,
    pub gateway: &'a str,
    pub gateway_identifier: &'a str,
    pub notes: &'a str,
    pub amount: i64,
    pub fee: i64,
}

async fn write_ledger(
    tx: &mut SqlxTransaction<'_, Sqlite>,
    entry: &LedgerEntry<'_>,
    activate: bool,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO charges (user_id, name, detail, k, day, amount) VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(user_id, k, day) DO UPDATE SET amount = amount + excluded.amount, \
         name = excluded.name, detail = excluded.detail",
    )
    .bind(entry.user_id)
    .bind(entry.name)
    .bind(entry.detail)
    .bind(entry.key)
    .bind(entry.day)
    .bind(entry.amount)
    .execute(&mut **tx)
    .await?;

    let result = sqlx::query("UPDATE users SET credit = credit - ? WHERE id = ?")
        .bind(entry.amount)
        .bind(entry.user_id)
        .execute(&mut **tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFound(format!("User {}", entry.user_id)));
    }

    if activate {
        sqlx::query("UPDATE users SET status = 'active' WHERE id = ? AND status = 'new'")
            .bind(entry.user_id)
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

impl PanelDatabase {
    // =========================================================================
    // Ledger
    // =========================================================================

    /// Debit a charge (or, with a negative amount, a credit) atomically.
    ///
    /// `activate` promotes a `new` user to `active`.
    pub async fn record_ledger_entry(
        &self,
        entry: &LedgerEntry<'_>,
        activate: bool,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        write_ledger(&mut tx, entry, activate).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Charges for a user whose day starts with `day_prefix` (e.g. `2024-05`).
    pub async fn list_charges(
        &self,
        user_id: i64,
        day_prefix: &str,
    ) -> Result<Vec<Charge>, DatabaseError> {
        let charges = sqlx::query_as::<_, Charge>(
            "SELECT * FROM charges WHERE user_id = ? AND day LIKE ? ORDER BY day, id",
        )
        .bind(user_id)
        .bind(format!("{day_prefix}%"))
        .fetch_all(self.pool())
        .await?;
        Ok(charges)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Record a gateway transaction and credit the user in one step.
    ///
    /// Returns `Ok(None)` when the `(gateway, gateway_identifier)` pair was
    /// already recorded; nothing is credited twice.
    pub async fn record_transaction(
        &self,
        params: &TransactionParams<'_>,
        entry: &LedgerEntry<'_>,
    ) -> Result<Option<Transaction>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO transactions (user_id, gateway, gateway_identifier, notes, amount, fee, time) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.user_id)
        .bind(params.gateway)
        .bind(params.gateway_identifier)
        .bind(params.notes)
        .bind(params.amount)
        .bind(params.fee)
        .bind(unix_timestamp())
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from);

        let id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(DatabaseError::Conflict(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        write_ledger(&mut tx, entry, true).await?;
        tx.commit().await?;

        self.get_transaction(id).await.map(Some)
    }

    pub async fn get_transaction(&self, id: i64) -> Result<Transaction, DatabaseError> {
        sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Transaction {id}")))
    }

    pub async fn transaction_exists(
        &self,
        gateway: &str,
        gateway_identifier: &str,
    ) -> Result<bool, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transactions WHERE gateway = ? AND gateway_identifier = ?",
        )
        .bind(gateway)
        .bind(gateway_identifier)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    /// Transactions, newest first, optionally for a single user.
    pub async fn list_transactions(
        &self,
        user_id: Option<i64>,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let transactions = if let Some(user_id) = user_id {
            sqlx::query_as::<_, Transaction>(
                "SELECT * FROM transactions WHERE user_id = ? ORDER BY id DESC",
            )
            .bind(user_id)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, Transaction>("SELECT * FROM transactions ORDER BY id DESC")
                .fetch_all(self.pool())
                .await?
        };
        Ok(transactions)
    }

    // =========================================================================
    // Region bandwidth
    // =========================================================================

    pub async fn get_region_bandwidth(
        &self,
        user_id: i64,
        region: &str,
    ) -> Result<Option<RegionBandwidth>, DatabaseError> {
        let row = sqlx::query_as::<_, RegionBandwidth>(
            "SELECT * FROM region_bandwidth WHERE user_id = ? AND region = ?",
        )
        .bind(user_id)
        .bind(region)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn list_region_bandwidth(
        &self,
        user_id: i64,
    ) -> Result<Vec<RegionBandwidth>, DatabaseError> {
        let rows = sqlx::query_as::<_, RegionBandwidth>(
            "SELECT * FROM region_bandwidth WHERE user_id = ? ORDER BY region",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Add bytes to the metered usage counter, creating the row if needed.
    pub async fn add_bandwidth_used(
        &self,
        user_id: i64,
        region: &str,
        bytes: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO region_bandwidth (user_id, region, bandwidth_used) VALUES (?, ?, ?) \
             ON CONFLICT(user_id, region) DO UPDATE SET bandwidth_used = bandwidth_used + excluded.bandwidth_used",
        )
        .bind(user_id)
        .bind(region)
        .bind(bytes)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Add bytes to the extra allowance left behind by deleted or resized VMs.
    pub async fn add_bandwidth_additional(
        &self,
        user_id: i64,
        region: &str,
        bytes: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO region_bandwidth (user_id, region, bandwidth_additional) VALUES (?, ?, ?) \
             ON CONFLICT(user_id, region) DO UPDATE SET bandwidth_additional = bandwidth_additional + excluded.bandwidth_additional",
        )
        .bind(user_id)
        .bind(region)
        .bind(bytes)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn add_bandwidth_billed(&self, id: i64, bytes: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE region_bandwidth SET bandwidth_billed = bandwidth_billed + ? WHERE id = ?")
            .bind(bytes)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_bandwidth_notified(&self, id: i64, percent: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE region_bandwidth SET bandwidth_notified_percent = ? WHERE id = ?")
            .bind(percent)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Zero every bandwidth counter at a month boundary.
    pub async fn reset_bandwidth(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE region_bandwidth SET bandwidth_used = 0, bandwidth_additional = 0, \
             bandwidth_billed = 0, bandwidth_notified_percent = 0",
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
