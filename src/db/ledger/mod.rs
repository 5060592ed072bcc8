//! Ledger repository: accounts, journal posting, and invariant checks.
//!
//! One `Ledger` struct owns the connection pool. Methods are organized
//! across submodules by concern:
//! - `cycle.rs` - payday cycle rows and stage transitions
//! - `staging.rs` - cycle-scoped staging snapshot tables
//! - `directory.rs` - participants, teams, commitments, absorptions, exchanges

mod cycle;
mod directory;
mod staging;

pub use cycle::{CycleRecord, CycleStats};
pub use directory::{CurrentCommitment, NewParticipant, Participant, Team};
pub use staging::{StagingParticipant, StagingTeam};

use crate::domain::{AccountId, AccountOwner, JournalLine, Money, Reason, SystemTag, TimeMs};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors surfaced by the ledger store.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A stage-advance operation found no open cycle.
    #[error("no open payday cycle where one was expected")]
    NoOpenCycle,
    /// Posting the batch would drive an account balance negative.
    #[error("posting rejected: account {account} would go to {balance}")]
    NegativeBalance { account: AccountId, balance: Money },
    /// Journal amounts must be strictly positive.
    #[error("posting rejected: non-positive amount {amount}")]
    NonPositiveAmount { amount: Money },
    /// Stored balances disagree with the journal-derived balances.
    #[error("ledger self-check failed: {0}")]
    SelfCheck(String),
    /// A stored value could not be decoded.
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Decode a canonical money string pulled from the store.
pub(crate) fn parse_money(raw: &str, context: &str) -> Result<Money, LedgerError> {
    Money::from_str_canonical(raw)
        .map_err(|e| LedgerError::Corrupt(format!("{}: bad amount {:?}: {}", context, raw, e)))
}

pub(crate) fn parse_reason(raw: &str) -> Result<Reason, LedgerError> {
    match raw {
        "commitment" => Ok(Reason::Commitment),
        "draw" => Ok(Reason::Draw),
        "charge" => Ok(Reason::Charge),
        "charge-fee" => Ok(Reason::ChargeFee),
        "take-over" => Ok(Reason::TakeOver),
        other => Err(LedgerError::Corrupt(format!("unknown reason {:?}", other))),
    }
}

/// A journal row joined with the participant owners of both accounts,
/// as needed by the statistics pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRow {
    pub amount: Money,
    pub reason: Reason,
    pub debit_participant: Option<i64>,
    pub credit_participant: Option<i64>,
}

/// Repository for the double-entry ledger and everything around it.
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Create a new ledger over the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Ledger { pool }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Find the account for an owner, if one exists.
    pub async fn find_account(&self, owner: AccountOwner) -> Result<Option<AccountId>, LedgerError> {
        let row = match owner {
            AccountOwner::Participant(p) => {
                sqlx::query("SELECT id FROM accounts WHERE participant_id = ?")
                    .bind(p.as_i64())
                    .fetch_optional(&self.pool)
                    .await?
            }
            AccountOwner::Team(t) => sqlx::query("SELECT id FROM accounts WHERE team_id = ?")
                .bind(t.as_i64())
                .fetch_optional(&self.pool)
                .await?,
            AccountOwner::System(tag) => {
                sqlx::query("SELECT id FROM accounts WHERE system_tag = ?")
                    .bind(tag.as_str())
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        Ok(row.map(|r| AccountId::new(r.get("id"))))
    }

    /// Get the account for an owner, creating it lazily on first use.
    pub async fn get_or_create_account(
        &self,
        owner: AccountOwner,
    ) -> Result<AccountId, LedgerError> {
        if let Some(id) = self.find_account(owner).await? {
            return Ok(id);
        }

        match owner {
            AccountOwner::Participant(p) => {
                sqlx::query("INSERT OR IGNORE INTO accounts (participant_id) VALUES (?)")
                    .bind(p.as_i64())
                    .execute(&self.pool)
                    .await?;
            }
            AccountOwner::Team(t) => {
                sqlx::query("INSERT OR IGNORE INTO accounts (team_id) VALUES (?)")
                    .bind(t.as_i64())
                    .execute(&self.pool)
                    .await?;
            }
            AccountOwner::System(tag) => {
                sqlx::query("INSERT OR IGNORE INTO accounts (system_tag) VALUES (?)")
                    .bind(tag.as_str())
                    .execute(&self.pool)
                    .await?;
            }
        }

        self.find_account(owner).await?.ok_or_else(|| {
            LedgerError::Corrupt(format!("account for {:?} missing after insert", owner))
        })
    }

    /// Live balance of an account.
    pub async fn account_balance(&self, account: AccountId) -> Result<Money, LedgerError> {
        let row = sqlx::query("SELECT balance FROM accounts WHERE id = ?")
            .bind(account.as_i64())
            .fetch_one(&self.pool)
            .await?;
        let raw: String = row.get("balance");
        parse_money(&raw, "accounts.balance")
    }

    /// Live balance of an owner's account; zero if no account exists yet.
    pub async fn balance_of(&self, owner: AccountOwner) -> Result<Money, LedgerError> {
        match self.find_account(owner).await? {
            Some(id) => self.account_balance(id).await,
            None => Ok(Money::zero()),
        }
    }

    // =========================================================================
    // Journal posting
    // =========================================================================

    /// Post a batch of journal entries atomically against live balances.
    ///
    /// The whole batch is applied or none of it is. Participant and team
    /// accounts may not end the batch below zero; system accounts mirror
    /// flows to and from the outside world and carry no floor.
    pub async fn post_journal_batch(
        &self,
        lines: &[JournalLine],
        payday: Option<crate::domain::CycleId>,
        ts: TimeMs,
    ) -> Result<(), LedgerError> {
        if lines.is_empty() {
            return Ok(());
        }
        for line in lines {
            if !line.amount.is_positive() {
                return Err(LedgerError::NonPositiveAmount {
                    amount: line.amount,
                });
            }
        }

        let mut tx = self.pool.begin().await?;

        // Load every affected account once: balance, floor, participant mirror.
        struct Affected {
            balance: Money,
            floored: bool,
            participant_id: Option<i64>,
        }
        let mut affected: BTreeMap<i64, Affected> = BTreeMap::new();
        for line in lines {
            for account in [line.debit, line.credit] {
                if affected.contains_key(&account.as_i64()) {
                    continue;
                }
                let row = sqlx::query(
                    "SELECT balance, participant_id, team_id FROM accounts WHERE id = ?",
                )
                .bind(account.as_i64())
                .fetch_one(&mut *tx)
                .await?;
                let raw: String = row.get("balance");
                let participant_id: Option<i64> = row.get("participant_id");
                let team_id: Option<i64> = row.get("team_id");
                affected.insert(
                    account.as_i64(),
                    Affected {
                        balance: parse_money(&raw, "accounts.balance")?,
                        floored: participant_id.is_some() || team_id.is_some(),
                        participant_id,
                    },
                );
            }
        }

        // Apply the batch's net effect in memory.
        for line in lines {
            let debit = affected
                .get_mut(&line.debit.as_i64())
                .ok_or_else(|| LedgerError::Corrupt("debit account vanished".into()))?;
            debit.balance = debit.balance - line.amount;
            let credit = affected
                .get_mut(&line.credit.as_i64())
                .ok_or_else(|| LedgerError::Corrupt("credit account vanished".into()))?;
            credit.balance = credit.balance + line.amount;
        }

        // All-or-nothing floor check before anything is written.
        for (id, acct) in &affected {
            if acct.floored && acct.balance.is_negative() {
                return Err(LedgerError::NegativeBalance {
                    account: AccountId::new(*id),
                    balance: acct.balance,
                });
            }
        }

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO journal (ts_ms, amount, debit, credit, payday, reason)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(ts.as_i64())
            .bind(line.amount.to_canonical_string())
            .bind(line.debit.as_i64())
            .bind(line.credit.as_i64())
            .bind(payday.map(|c| c.as_i64()))
            .bind(line.reason.as_str())
            .execute(&mut *tx)
            .await?;
        }

        for (id, acct) in &affected {
            sqlx::query("UPDATE accounts SET balance = ? WHERE id = ?")
                .bind(acct.balance.to_canonical_string())
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if let Some(pid) = acct.participant_id {
                sqlx::query("UPDATE participants SET balance = ? WHERE id = ?")
                    .bind(acct.balance.to_canonical_string())
                    .bind(pid)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Journal rows within `[from, to)`, joined with participant ownership.
    ///
    /// Amounts are summed in Rust by the caller to preserve decimal
    /// precision; SQLite's SUM would coerce the stored strings to REAL.
    pub async fn journal_rows_in_window(
        &self,
        from: TimeMs,
        to: TimeMs,
    ) -> Result<Vec<JournalRow>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT j.amount, j.reason,
                   da.participant_id AS debit_participant,
                   ca.participant_id AS credit_participant
            FROM journal j
            JOIN accounts da ON da.id = j.debit
            JOIN accounts ca ON ca.id = j.credit
            WHERE j.ts_ms >= ? AND j.ts_ms < ?
            ORDER BY j.id ASC
            "#,
        )
        .bind(from.as_i64())
        .bind(to.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let raw: String = row.get("amount");
                let reason: String = row.get("reason");
                Ok(JournalRow {
                    amount: parse_money(&raw, "journal.amount")?,
                    reason: parse_reason(&reason)?,
                    debit_participant: row.get("debit_participant"),
                    credit_participant: row.get("credit_participant"),
                })
            })
            .collect()
    }

    // =========================================================================
    // Invariant check
    // =========================================================================

    /// Verify that every stored balance equals its journal-derived balance.
    ///
    /// Mismatches indicate a bug or data inconsistency with direct monetary
    /// impact; callers must treat this as fatal for the cycle.
    pub async fn self_check(&self) -> Result<(), LedgerError> {
        let accounts = sqlx::query(
            "SELECT id, balance, participant_id FROM accounts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        for account in accounts {
            let id: i64 = account.get("id");
            let raw: String = account.get("balance");
            let stored = parse_money(&raw, "accounts.balance")?;

            let entries = sqlx::query("SELECT amount, debit, credit FROM journal WHERE debit = ? OR credit = ?")
                .bind(id)
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
            let mut derived = Money::zero();
            for entry in entries {
                let raw: String = entry.get("amount");
                let amount = parse_money(&raw, "journal.amount")?;
                let credit: i64 = entry.get("credit");
                if credit == id {
                    derived = derived + amount;
                } else {
                    derived = derived - amount;
                }
            }

            if derived != stored {
                return Err(LedgerError::SelfCheck(format!(
                    "account {} stores {} but journal derives {}",
                    id, stored, derived
                )));
            }

            if let Some(pid) = account.get::<Option<i64>, _>("participant_id") {
                let row = sqlx::query("SELECT balance FROM participants WHERE id = ?")
                    .bind(pid)
                    .fetch_one(&self.pool)
                    .await?;
                let raw: String = row.get("balance");
                let mirrored = parse_money(&raw, "participants.balance")?;
                if mirrored != stored {
                    return Err(LedgerError::SelfCheck(format!(
                        "participant {} mirrors {} but account {} stores {}",
                        pid, mirrored, id, stored
                    )));
                }
            }
        }

        Ok(())
    }

    /// Convenience accessor for a system account, creating it if needed.
    pub async fn system_account(&self, tag: SystemTag) -> Result<AccountId, LedgerError> {
        self.get_or_create_account(AccountOwner::System(tag)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::domain::{ParticipantId, Reason};
    use tempfile::TempDir;

    async fn setup() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Ledger::new(pool), temp_dir)
    }

    fn money(s: &str) -> Money {
        Money::from_str_canonical(s).unwrap()
    }

    #[tokio::test]
    async fn test_account_created_lazily_and_once() {
        let (ledger, _temp) = setup().await;
        let p = ledger
            .create_participant(NewParticipant::new("alice"))
            .await
            .unwrap();

        let first = ledger
            .get_or_create_account(AccountOwner::Participant(p))
            .await
            .unwrap();
        let second = ledger
            .get_or_create_account(AccountOwner::Participant(p))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_post_journal_moves_balance() {
        let (ledger, _temp) = setup().await;
        let p = ledger
            .create_participant(NewParticipant::new("alice"))
            .await
            .unwrap();
        let alice = ledger
            .get_or_create_account(AccountOwner::Participant(p))
            .await
            .unwrap();
        let cash = ledger.system_account(SystemTag::Cash).await.unwrap();

        let line = JournalLine::new(money("9.41"), cash, alice, Reason::Charge);
        ledger
            .post_journal_batch(&[line], None, TimeMs::new(1000))
            .await
            .unwrap();

        assert_eq!(ledger.account_balance(alice).await.unwrap(), money("9.41"));
        assert_eq!(ledger.account_balance(cash).await.unwrap(), money("-9.41"));
        assert_eq!(
            ledger.participant(p).await.unwrap().balance,
            money("9.41"),
            "participants.balance mirrors the account"
        );
        ledger.self_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_post_journal_rejects_negative_participant_balance() {
        let (ledger, _temp) = setup().await;
        let p = ledger
            .create_participant(NewParticipant::new("alice"))
            .await
            .unwrap();
        let alice = ledger
            .get_or_create_account(AccountOwner::Participant(p))
            .await
            .unwrap();
        let cash = ledger.system_account(SystemTag::Cash).await.unwrap();

        let line = JournalLine::new(money("10.77"), alice, cash, Reason::Commitment);
        let err = ledger
            .post_journal_batch(&[line], None, TimeMs::new(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NegativeBalance { .. }));

        // Nothing applied.
        assert_eq!(ledger.account_balance(alice).await.unwrap(), Money::zero());
        ledger.self_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_post_journal_batch_is_all_or_nothing() {
        let (ledger, _temp) = setup().await;
        let p = ledger
            .create_participant(NewParticipant::new("alice"))
            .await
            .unwrap();
        ledger
            .seed_exchange(p, money("5"), TimeMs::new(10))
            .await
            .unwrap();
        let q = ledger
            .create_participant(NewParticipant::new("bob"))
            .await
            .unwrap();
        let alice = ledger
            .get_or_create_account(AccountOwner::Participant(p))
            .await
            .unwrap();
        let bob = ledger
            .get_or_create_account(AccountOwner::Participant(q))
            .await
            .unwrap();

        // First line alone is fine, second would overdraw bob.
        let lines = vec![
            JournalLine::new(money("2"), alice, bob, Reason::Commitment),
            JournalLine::new(money("3"), bob, alice, Reason::Commitment),
        ];
        // Net: alice +1, bob -1. Rejected as a whole.
        let err = ledger
            .post_journal_batch(&lines, None, TimeMs::new(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NegativeBalance { .. }));
        assert_eq!(ledger.account_balance(alice).await.unwrap(), money("5"));
        assert_eq!(ledger.account_balance(bob).await.unwrap(), Money::zero());
    }

    #[tokio::test]
    async fn test_post_journal_rejects_negative_team_balance() {
        let (ledger, _temp) = setup().await;
        let p = ledger
            .create_participant(NewParticipant::new("owner"))
            .await
            .unwrap();
        let owner = ledger
            .get_or_create_account(AccountOwner::Participant(p))
            .await
            .unwrap();
        let team_id = ledger.create_team("a-team", p, true).await.unwrap();
        let team = ledger
            .get_or_create_account(AccountOwner::Team(team_id))
            .await
            .unwrap();

        let line = JournalLine::new(money("5"), team, owner, Reason::Draw);
        let err = ledger
            .post_journal_batch(&[line], None, TimeMs::new(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NegativeBalance { .. }));
        assert_eq!(ledger.account_balance(team).await.unwrap(), Money::zero());
        assert_eq!(ledger.account_balance(owner).await.unwrap(), Money::zero());
    }

    #[tokio::test]
    async fn test_post_journal_rejects_zero_amount() {
        let (ledger, _temp) = setup().await;
        let cash = ledger.system_account(SystemTag::Cash).await.unwrap();
        let fees = ledger.system_account(SystemTag::FeeRevenue).await.unwrap();

        let line = JournalLine::new(Money::zero(), cash, fees, Reason::Charge);
        let err = ledger
            .post_journal_batch(&[line], None, TimeMs::new(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NonPositiveAmount { .. }));
    }

    #[tokio::test]
    async fn test_balance_of_unknown_owner_is_zero() {
        let (ledger, _temp) = setup().await;
        let balance = ledger
            .balance_of(AccountOwner::Participant(ParticipantId::new(999)))
            .await
            .unwrap();
        assert_eq!(balance, Money::zero());
    }
}
