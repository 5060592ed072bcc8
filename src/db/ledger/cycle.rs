//! Payday cycle rows: open/close lifecycle, stage counter, statistics.

use super::{parse_money, Ledger, LedgerError};
use crate::domain::{CycleId, Money, TimeMs};
use sqlx::Row;

/// One row of the paydays table, as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRecord {
    pub id: CycleId,
    pub ts_start: TimeMs,
    /// Epoch zero while the cycle is open.
    pub ts_end: TimeMs,
    pub stage: i64,
    pub ncc_failing: i64,
    pub ndebit_failing: i64,
}

impl CycleRecord {
    pub fn is_open(&self) -> bool {
        self.ts_end.is_epoch_zero()
    }
}

/// Aggregates computed after settlement and stored on the cycle row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CycleStats {
    pub nactive: i64,
    pub ntransfers: i64,
    pub transfer_volume: Money,
    pub ncharges: i64,
    pub charge_volume: Money,
    pub charge_fees_volume: Money,
    pub ndebits: i64,
    pub debit_volume: Money,
    pub debit_fees_volume: Money,
}

fn row_to_cycle(row: &sqlx::sqlite::SqliteRow) -> CycleRecord {
    CycleRecord {
        id: CycleId::new(row.get("id")),
        ts_start: TimeMs::new(row.get("ts_start_ms")),
        ts_end: TimeMs::new(row.get("ts_end_ms")),
        stage: row.get("stage"),
        ncc_failing: row.get("ncc_failing"),
        ndebit_failing: row.get("ndebit_failing"),
    }
}

impl Ledger {
    /// Open a cycle, or pick up the one already open.
    ///
    /// The insert races against concurrent starters on the unique open-cycle
    /// index; whoever loses reads the winner's row. Returns the record and
    /// whether this call created it.
    pub async fn start_cycle(&self, now: TimeMs) -> Result<(CycleRecord, bool), LedgerError> {
        let inserted = sqlx::query("INSERT OR IGNORE INTO paydays (ts_start_ms) VALUES (?)")
            .bind(now.as_i64())
            .execute(self.pool())
            .await?
            .rows_affected();

        let record = self
            .open_cycle()
            .await?
            .ok_or(LedgerError::NoOpenCycle)?;
        Ok((record, inserted > 0))
    }

    /// The currently open cycle, if any.
    pub async fn open_cycle(&self) -> Result<Option<CycleRecord>, LedgerError> {
        let row = sqlx::query("SELECT * FROM paydays WHERE ts_end_ms = 0")
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(row_to_cycle))
    }

    pub async fn cycle(&self, id: CycleId) -> Result<Option<CycleRecord>, LedgerError> {
        let row = sqlx::query("SELECT * FROM paydays WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(row_to_cycle))
    }

    /// Advance the open cycle's stage counter by one.
    ///
    /// Errors with `NoOpenCycle` if the cycle was closed underneath us,
    /// which aborts a racing duplicate run.
    pub async fn mark_stage_done(&self) -> Result<i64, LedgerError> {
        let row = sqlx::query(
            "UPDATE paydays SET stage = stage + 1 WHERE ts_end_ms = 0 RETURNING stage",
        )
        .fetch_optional(self.pool())
        .await?;
        match row {
            Some(row) => Ok(row.get("stage")),
            None => Err(LedgerError::NoOpenCycle),
        }
    }

    /// Store the count of failing card charges on the open cycle.
    ///
    /// An overwrite, not an accumulation: hold reconciliation counts every
    /// declining card each time it runs, so a resumed payin stores the same
    /// cards once instead of twice.
    pub async fn set_ncc_failing(&self, n: i64) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE paydays SET ncc_failing = ? WHERE ts_end_ms = 0")
            .bind(n)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NoOpenCycle);
        }
        Ok(())
    }

    /// Close the cycle if it is still open.
    ///
    /// Returns the cycle's end instant: `now` if this call closed it, or
    /// the previously stored one if a crashed run already had.
    pub async fn end_cycle(&self, id: CycleId, now: TimeMs) -> Result<TimeMs, LedgerError> {
        let result = sqlx::query("UPDATE paydays SET ts_end_ms = ? WHERE id = ? AND ts_end_ms = 0")
            .bind(now.as_i64())
            .bind(id.as_i64())
            .execute(self.pool())
            .await?;
        if result.rows_affected() > 0 {
            return Ok(now);
        }

        let stored = self.cycle(id).await?.ok_or(LedgerError::NoOpenCycle)?;
        if stored.ts_end.is_epoch_zero() {
            return Err(LedgerError::Corrupt(format!(
                "cycle {} neither closed nor closable",
                id
            )));
        }
        Ok(stored.ts_end)
    }

    /// Store the computed statistics on a cycle row.
    pub async fn store_cycle_stats(
        &self,
        id: CycleId,
        stats: &CycleStats,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE paydays SET
                nactive = ?, ntransfers = ?, transfer_volume = ?,
                ncharges = ?, charge_volume = ?, charge_fees_volume = ?,
                ndebits = ?, debit_volume = ?, debit_fees_volume = ?
            WHERE id = ?
            "#,
        )
        .bind(stats.nactive)
        .bind(stats.ntransfers)
        .bind(stats.transfer_volume.to_canonical_string())
        .bind(stats.ncharges)
        .bind(stats.charge_volume.to_canonical_string())
        .bind(stats.charge_fees_volume.to_canonical_string())
        .bind(stats.ndebits)
        .bind(stats.debit_volume.to_canonical_string())
        .bind(stats.debit_fees_volume.to_canonical_string())
        .bind(id.as_i64())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn cycle_stats(&self, id: CycleId) -> Result<CycleStats, LedgerError> {
        let row = sqlx::query("SELECT * FROM paydays WHERE id = ?")
            .bind(id.as_i64())
            .fetch_one(self.pool())
            .await?;
        let transfer_volume: String = row.get("transfer_volume");
        let charge_volume: String = row.get("charge_volume");
        let charge_fees_volume: String = row.get("charge_fees_volume");
        let debit_volume: String = row.get("debit_volume");
        let debit_fees_volume: String = row.get("debit_fees_volume");
        Ok(CycleStats {
            nactive: row.get("nactive"),
            ntransfers: row.get("ntransfers"),
            transfer_volume: parse_money(&transfer_volume, "paydays.transfer_volume")?,
            ncharges: row.get("ncharges"),
            charge_volume: parse_money(&charge_volume, "paydays.charge_volume")?,
            charge_fees_volume: parse_money(&charge_fees_volume, "paydays.charge_fees_volume")?,
            ndebits: row.get("ndebits"),
            debit_volume: parse_money(&debit_volume, "paydays.debit_volume")?,
            debit_fees_volume: parse_money(&debit_fees_volume, "paydays.debit_fees_volume")?,
        })
    }
}
