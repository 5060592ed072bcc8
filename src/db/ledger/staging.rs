//! Cycle-scoped staging tables.
//!
//! `prepare` rebuilds three scratch tables from the durable state as of the
//! cycle start. The payin pass then accumulates its would-be journal in
//! `payday_journal` and its balance effects in the staging rows, so a crashed
//! run leaves the durable ledger untouched and a resumed run starts from a
//! fresh snapshot.

use super::{parse_money, parse_reason, Ledger, LedgerError};
use crate::domain::{
    AccountId, JournalLine, Money, ParticipantId, TeamId, TimeMs,
};
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet};

/// A participant's staged view for the running cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingParticipant {
    pub participant_id: ParticipantId,
    pub username: String,
    /// Balance at cycle start, frozen by prepare.
    pub old_balance: Money,
    /// Sum of current commitments to approved teams.
    pub giving_today: Money,
    pub has_card: bool,
    pub is_suspicious: bool,
    /// Set once a sufficient card hold is in place; relaxes the staging floor.
    pub card_hold_ok: bool,
    pub new_balance: Money,
}

impl StagingParticipant {
    /// Whether this row needs a card hold to fund its commitments.
    pub fn needs_hold(&self) -> bool {
        self.has_card && !self.is_suspicious && self.old_balance < self.giving_today
    }

    /// The net amount a hold must cover: today's giving plus any deficit.
    pub fn required_net(&self) -> Money {
        let deficit = if self.old_balance.is_negative() {
            -self.old_balance
        } else {
            Money::zero()
        };
        self.giving_today + deficit
    }
}

/// A team's staged view for the running cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTeam {
    pub team_id: TeamId,
    pub slug: String,
    pub owner_id: ParticipantId,
    pub balance: Money,
    pub is_drained: bool,
}

const STAGING_DDL: &[&str] = &[
    "DROP TABLE IF EXISTS payday_journal",
    "DROP TABLE IF EXISTS payday_participants",
    "DROP TABLE IF EXISTS payday_teams",
    r#"
    CREATE TABLE payday_participants (
        participant_id INTEGER PRIMARY KEY,
        username TEXT NOT NULL,
        old_balance TEXT NOT NULL,
        giving_today TEXT NOT NULL,
        has_card INTEGER NOT NULL,
        is_suspicious INTEGER NOT NULL,
        card_hold_ok INTEGER NOT NULL DEFAULT 0,
        new_balance TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE payday_teams (
        team_id INTEGER PRIMARY KEY,
        slug TEXT NOT NULL,
        owner_id INTEGER NOT NULL,
        balance TEXT NOT NULL,
        is_drained INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE payday_journal (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        amount TEXT NOT NULL,
        debit INTEGER NOT NULL,
        credit INTEGER NOT NULL,
        reason TEXT NOT NULL
    )
    "#,
];

fn row_to_staging_participant(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<StagingParticipant, LedgerError> {
    let old_balance: String = row.get("old_balance");
    let giving_today: String = row.get("giving_today");
    let new_balance: String = row.get("new_balance");
    Ok(StagingParticipant {
        participant_id: ParticipantId::new(row.get("participant_id")),
        username: row.get("username"),
        old_balance: parse_money(&old_balance, "payday_participants.old_balance")?,
        giving_today: parse_money(&giving_today, "payday_participants.giving_today")?,
        has_card: row.get::<i64, _>("has_card") != 0,
        is_suspicious: row.get::<i64, _>("is_suspicious") != 0,
        card_hold_ok: row.get::<i64, _>("card_hold_ok") != 0,
        new_balance: parse_money(&new_balance, "payday_participants.new_balance")?,
    })
}

fn row_to_staging_team(row: &sqlx::sqlite::SqliteRow) -> Result<StagingTeam, LedgerError> {
    let balance: String = row.get("balance");
    Ok(StagingTeam {
        team_id: TeamId::new(row.get("team_id")),
        slug: row.get("slug"),
        owner_id: ParticipantId::new(row.get("owner_id")),
        balance: parse_money(&balance, "payday_teams.balance")?,
        is_drained: row.get::<i64, _>("is_drained") != 0,
    })
}

impl Ledger {
    /// Rebuild the staging snapshot from durable state as of `ts_start`.
    ///
    /// Idempotent: rerunning drops the previous snapshot and derives the
    /// same rows again from the same durable inputs.
    pub async fn prepare_staging(&self, ts_start: TimeMs) -> Result<(), LedgerError> {
        let participants = self.claimed_participants().await?;
        let teams = self.approved_teams().await?;
        let commitments = self.current_commitments(ts_start).await?;

        // Commitments to teams with suspicious owners are not charged.
        let suspicious: BTreeSet<i64> = participants
            .iter()
            .filter(|p| p.is_suspicious)
            .map(|p| p.id.as_i64())
            .collect();
        let owner_of: BTreeMap<i64, i64> = teams
            .iter()
            .map(|t| (t.id.as_i64(), t.owner_id.as_i64()))
            .collect();
        let mut giving_today: BTreeMap<i64, Money> = BTreeMap::new();
        for c in &commitments {
            let owner = match owner_of.get(&c.team_id.as_i64()) {
                Some(owner) => *owner,
                None => continue,
            };
            if suspicious.contains(&owner) {
                continue;
            }
            let entry = giving_today
                .entry(c.participant_id.as_i64())
                .or_insert_with(Money::zero);
            *entry = *entry + c.amount;
        }

        let mut team_balances = Vec::with_capacity(teams.len());
        for team in &teams {
            let balance = self
                .balance_of(crate::domain::AccountOwner::Team(team.id))
                .await?;
            team_balances.push(balance);
        }

        let mut tx = self.pool().begin().await?;
        for ddl in STAGING_DDL {
            sqlx::query(ddl).execute(&mut *tx).await?;
        }

        for p in &participants {
            let giving = giving_today
                .get(&p.id.as_i64())
                .copied()
                .unwrap_or_else(Money::zero);
            sqlx::query(
                r#"
                INSERT INTO payday_participants
                    (participant_id, username, old_balance, giving_today,
                     has_card, is_suspicious, new_balance)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(p.id.as_i64())
            .bind(&p.username)
            .bind(p.balance.to_canonical_string())
            .bind(giving.to_canonical_string())
            .bind(p.has_card as i64)
            .bind(p.is_suspicious as i64)
            .bind(p.balance.to_canonical_string())
            .execute(&mut *tx)
            .await?;
        }

        for (team, balance) in teams.iter().zip(team_balances) {
            sqlx::query(
                "INSERT INTO payday_teams (team_id, slug, owner_id, balance) VALUES (?, ?, ?, ?)",
            )
            .bind(team.id.as_i64())
            .bind(&team.slug)
            .bind(team.owner_id.as_i64())
            .bind(balance.to_canonical_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn staging_participants(&self) -> Result<Vec<StagingParticipant>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM payday_participants ORDER BY participant_id ASC")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_staging_participant).collect()
    }

    pub async fn staging_participant(
        &self,
        id: ParticipantId,
    ) -> Result<Option<StagingParticipant>, LedgerError> {
        let row = sqlx::query("SELECT * FROM payday_participants WHERE participant_id = ?")
            .bind(id.as_i64())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_staging_participant).transpose()
    }

    pub async fn staging_teams(&self) -> Result<Vec<StagingTeam>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM payday_teams ORDER BY team_id ASC")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_staging_team).collect()
    }

    /// Mark participants whose card hold is in place.
    pub async fn set_card_hold_ok(&self, ids: &[ParticipantId]) -> Result<(), LedgerError> {
        for id in ids {
            sqlx::query("UPDATE payday_participants SET card_hold_ok = 1 WHERE participant_id = ?")
                .bind(id.as_i64())
                .execute(self.pool())
                .await?;
        }
        Ok(())
    }

    /// Stage one journal line against the snapshot balances.
    ///
    /// A participant's staged balance may only go negative when a card hold
    /// stands ready to cover the deficit at settlement. Team staged balances
    /// never go negative.
    pub async fn stage_journal(&self, line: &JournalLine) -> Result<(), LedgerError> {
        if !line.amount.is_positive() {
            return Err(LedgerError::NonPositiveAmount {
                amount: line.amount,
            });
        }

        let mut tx = self.pool().begin().await?;

        for (account, is_debit) in [(line.debit, true), (line.credit, false)] {
            let owner = sqlx::query("SELECT participant_id, team_id FROM accounts WHERE id = ?")
                .bind(account.as_i64())
                .fetch_one(&mut *tx)
                .await?;
            let participant_id: Option<i64> = owner.get("participant_id");
            let team_id: Option<i64> = owner.get("team_id");

            if let Some(pid) = participant_id {
                let row = sqlx::query(
                    "SELECT new_balance, card_hold_ok FROM payday_participants WHERE participant_id = ?",
                )
                .bind(pid)
                .fetch_optional(&mut *tx)
                .await?;
                // Participants outside the snapshot carry no staged balance.
                if let Some(row) = row {
                    let raw: String = row.get("new_balance");
                    let card_hold_ok = row.get::<i64, _>("card_hold_ok") != 0;
                    let mut balance = parse_money(&raw, "payday_participants.new_balance")?;
                    balance = if is_debit {
                        balance - line.amount
                    } else {
                        balance + line.amount
                    };
                    if balance.is_negative() && !card_hold_ok {
                        return Err(LedgerError::NegativeBalance {
                            account,
                            balance,
                        });
                    }
                    sqlx::query(
                        "UPDATE payday_participants SET new_balance = ? WHERE participant_id = ?",
                    )
                    .bind(balance.to_canonical_string())
                    .bind(pid)
                    .execute(&mut *tx)
                    .await?;
                }
            } else if let Some(tid) = team_id {
                let row = sqlx::query("SELECT balance FROM payday_teams WHERE team_id = ?")
                    .bind(tid)
                    .fetch_optional(&mut *tx)
                    .await?;
                if let Some(row) = row {
                    let raw: String = row.get("balance");
                    let mut balance = parse_money(&raw, "payday_teams.balance")?;
                    balance = if is_debit {
                        balance - line.amount
                    } else {
                        balance + line.amount
                    };
                    if balance.is_negative() {
                        return Err(LedgerError::NegativeBalance {
                            account,
                            balance,
                        });
                    }
                    sqlx::query("UPDATE payday_teams SET balance = ? WHERE team_id = ?")
                        .bind(balance.to_canonical_string())
                        .bind(tid)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            // System accounts have no staged floor and no staged row.
        }

        sqlx::query("INSERT INTO payday_journal (amount, debit, credit, reason) VALUES (?, ?, ?, ?)")
            .bind(line.amount.to_canonical_string())
            .bind(line.debit.as_i64())
            .bind(line.credit.as_i64())
            .bind(line.reason.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// The staged journal, in posting order.
    pub async fn staged_journal(&self) -> Result<Vec<JournalLine>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM payday_journal ORDER BY id ASC")
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| {
                let amount: String = row.get("amount");
                let reason: String = row.get("reason");
                Ok(JournalLine {
                    amount: parse_money(&amount, "payday_journal.amount")?,
                    debit: AccountId::new(row.get("debit")),
                    credit: AccountId::new(row.get("credit")),
                    reason: parse_reason(&reason)?,
                })
            })
            .collect()
    }

    /// Shift a staged participant balance by `delta`, without a floor.
    ///
    /// Settlement uses this to reflect a captured charge, which by
    /// construction brings a held-back balance up to zero or above.
    pub async fn adjust_staging_balance(
        &self,
        id: ParticipantId,
        delta: Money,
    ) -> Result<Money, LedgerError> {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query("SELECT new_balance FROM payday_participants WHERE participant_id = ?")
            .bind(id.as_i64())
            .fetch_one(&mut *tx)
            .await?;
        let raw: String = row.get("new_balance");
        let balance = parse_money(&raw, "payday_participants.new_balance")? + delta;
        sqlx::query("UPDATE payday_participants SET new_balance = ? WHERE participant_id = ?")
            .bind(balance.to_canonical_string())
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(balance)
    }

    pub async fn mark_team_drained(&self, id: TeamId) -> Result<(), LedgerError> {
        sqlx::query("UPDATE payday_teams SET is_drained = 1 WHERE team_id = ?")
            .bind(id.as_i64())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
