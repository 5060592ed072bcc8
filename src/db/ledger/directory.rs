//! Participants, teams, commitments, absorptions, and exchanges.
//!
//! The engine only reads and writes the fields below; the rest of the
//! platform's CRUD surface lives elsewhere. `set_commitment` is the one
//! collaborator-facing mutation: it applies the commitment delta to the
//! giving/receiving caches inside a single transaction.

use super::{parse_money, Ledger, LedgerError};
use crate::domain::{
    AccountOwner, Exchange, ExchangeId, ExchangeStatus, JournalLine, Money, ParticipantId, Reason,
    SystemTag, TeamId, TimeMs,
};
use sqlx::Row;
use std::collections::BTreeMap;

/// A participant row, restricted to the fields the engine touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub username: String,
    pub balance: Money,
    pub giving: Money,
    pub receiving: Money,
    pub has_card: bool,
    pub is_suspicious: bool,
    pub claimed: bool,
    pub notify_charge: i64,
}

/// A team row, restricted to the fields the engine touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub id: TeamId,
    pub slug: String,
    pub owner_id: ParticipantId,
    pub is_approved: bool,
    pub receiving: Money,
}

/// Builder for participant fixtures and sign-ups.
#[derive(Debug, Clone)]
pub struct NewParticipant {
    pub username: String,
    pub has_card: bool,
    pub is_suspicious: bool,
    pub claimed: bool,
    pub notify_charge: i64,
}

impl NewParticipant {
    pub fn new(username: &str) -> Self {
        NewParticipant {
            username: username.to_string(),
            has_card: false,
            is_suspicious: false,
            claimed: true,
            notify_charge: 3,
        }
    }

    pub fn with_card(mut self) -> Self {
        self.has_card = true;
        self
    }

    pub fn suspicious(mut self) -> Self {
        self.is_suspicious = true;
        self
    }

    pub fn unclaimed(mut self) -> Self {
        self.claimed = false;
        self
    }

    pub fn notify_charge(mut self, mask: i64) -> Self {
        self.notify_charge = mask;
        self
    }
}

/// One standing commitment as of some instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentCommitment {
    pub participant_id: ParticipantId,
    pub team_id: TeamId,
    pub amount: Money,
}

fn row_to_participant(row: &sqlx::sqlite::SqliteRow) -> Result<Participant, LedgerError> {
    let balance: String = row.get("balance");
    let giving: String = row.get("giving");
    let receiving: String = row.get("receiving");
    Ok(Participant {
        id: ParticipantId::new(row.get("id")),
        username: row.get("username"),
        balance: parse_money(&balance, "participants.balance")?,
        giving: parse_money(&giving, "participants.giving")?,
        receiving: parse_money(&receiving, "participants.receiving")?,
        has_card: row.get::<i64, _>("has_card") != 0,
        is_suspicious: row.get::<i64, _>("is_suspicious") != 0,
        claimed: row.get::<i64, _>("claimed") != 0,
        notify_charge: row.get("notify_charge"),
    })
}

fn row_to_team(row: &sqlx::sqlite::SqliteRow) -> Result<Team, LedgerError> {
    let receiving: String = row.get("receiving");
    Ok(Team {
        id: TeamId::new(row.get("id")),
        slug: row.get("slug"),
        owner_id: ParticipantId::new(row.get("owner_id")),
        is_approved: row.get::<i64, _>("is_approved") != 0,
        receiving: parse_money(&receiving, "teams.receiving")?,
    })
}

impl Ledger {
    // =========================================================================
    // Participants
    // =========================================================================

    pub async fn create_participant(
        &self,
        new: NewParticipant,
    ) -> Result<ParticipantId, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO participants (username, has_card, is_suspicious, claimed, notify_charge)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.username)
        .bind(new.has_card as i64)
        .bind(new.is_suspicious as i64)
        .bind(new.claimed as i64)
        .bind(new.notify_charge)
        .execute(self.pool())
        .await?;

        Ok(ParticipantId::new(result.last_insert_rowid()))
    }

    pub async fn participant(&self, id: ParticipantId) -> Result<Participant, LedgerError> {
        let row = sqlx::query("SELECT * FROM participants WHERE id = ?")
            .bind(id.as_i64())
            .fetch_one(self.pool())
            .await?;
        row_to_participant(&row)
    }

    pub async fn participant_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Participant>, LedgerError> {
        let row = sqlx::query("SELECT * FROM participants WHERE username = ?")
            .bind(username)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_participant).transpose()
    }

    pub async fn claimed_participants(&self) -> Result<Vec<Participant>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM participants WHERE claimed = 1 ORDER BY id ASC")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_participant).collect()
    }

    pub async fn set_suspicious(
        &self,
        id: ParticipantId,
        is_suspicious: bool,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE participants SET is_suspicious = ? WHERE id = ?")
            .bind(is_suspicious as i64)
            .bind(id.as_i64())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub(crate) async fn set_cached_giving(
        &self,
        id: ParticipantId,
        giving: Money,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE participants SET giving = ? WHERE id = ?")
            .bind(giving.to_canonical_string())
            .bind(id.as_i64())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub(crate) async fn set_cached_receiving(
        &self,
        id: ParticipantId,
        receiving: Money,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE participants SET receiving = ? WHERE id = ?")
            .bind(receiving.to_canonical_string())
            .bind(id.as_i64())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Teams
    // =========================================================================

    pub async fn create_team(
        &self,
        slug: &str,
        owner: ParticipantId,
        is_approved: bool,
    ) -> Result<TeamId, LedgerError> {
        let result = sqlx::query("INSERT INTO teams (slug, owner_id, is_approved) VALUES (?, ?, ?)")
            .bind(slug)
            .bind(owner.as_i64())
            .bind(is_approved as i64)
            .execute(self.pool())
            .await?;
        Ok(TeamId::new(result.last_insert_rowid()))
    }

    pub async fn team(&self, id: TeamId) -> Result<Team, LedgerError> {
        let row = sqlx::query("SELECT * FROM teams WHERE id = ?")
            .bind(id.as_i64())
            .fetch_one(self.pool())
            .await?;
        row_to_team(&row)
    }

    pub async fn approved_teams(&self) -> Result<Vec<Team>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM teams WHERE is_approved = 1 ORDER BY id ASC")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_team).collect()
    }

    pub(crate) async fn set_cached_team_receiving(
        &self,
        id: TeamId,
        receiving: Money,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE teams SET receiving = ? WHERE id = ?")
            .bind(receiving.to_canonical_string())
            .bind(id.as_i64())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Commitments
    // =========================================================================

    /// Change a participant's standing commitment to a team.
    ///
    /// Reads the current amount, appends the new commitment row, and applies
    /// the delta to the giving/receiving caches in one transaction so two
    /// concurrent changes for the same pair cannot compute stale deltas.
    pub async fn set_commitment(
        &self,
        participant: ParticipantId,
        team: TeamId,
        amount: Money,
    ) -> Result<(), LedgerError> {
        let mut tx = self.pool().begin().await?;

        let current = sqlx::query(
            r#"
            SELECT amount FROM commitments
            WHERE participant_id = ? AND team_id = ?
            ORDER BY mtime_ms DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(participant.as_i64())
        .bind(team.as_i64())
        .fetch_optional(&mut *tx)
        .await?;
        let old = match current {
            Some(row) => {
                let raw: String = row.get("amount");
                parse_money(&raw, "commitments.amount")?
            }
            None => Money::zero(),
        };

        sqlx::query(
            "INSERT INTO commitments (participant_id, team_id, amount, mtime_ms) VALUES (?, ?, ?, ?)",
        )
        .bind(participant.as_i64())
        .bind(team.as_i64())
        .bind(amount.to_canonical_string())
        .bind(TimeMs::now().as_i64())
        .execute(&mut *tx)
        .await?;

        let delta = amount - old;
        if !delta.is_zero() {
            let row = sqlx::query("SELECT giving FROM participants WHERE id = ?")
                .bind(participant.as_i64())
                .fetch_one(&mut *tx)
                .await?;
            let raw: String = row.get("giving");
            let giving = parse_money(&raw, "participants.giving")? + delta;
            sqlx::query("UPDATE participants SET giving = ? WHERE id = ?")
                .bind(giving.to_canonical_string())
                .bind(participant.as_i64())
                .execute(&mut *tx)
                .await?;

            let row = sqlx::query("SELECT receiving FROM teams WHERE id = ?")
                .bind(team.as_i64())
                .fetch_one(&mut *tx)
                .await?;
            let raw: String = row.get("receiving");
            let receiving = parse_money(&raw, "teams.receiving")? + delta;
            sqlx::query("UPDATE teams SET receiving = ? WHERE id = ?")
                .bind(receiving.to_canonical_string())
                .bind(team.as_i64())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// The current positive commitments as of `before`, to approved teams.
    ///
    /// Latest row per (participant, team) pair with `mtime_ms` strictly
    /// before the instant; folded in Rust to keep decimal precision.
    pub async fn current_commitments(
        &self,
        before: TimeMs,
    ) -> Result<Vec<CurrentCommitment>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT c.participant_id, c.team_id, c.amount
            FROM commitments c
            JOIN teams t ON t.id = c.team_id
            WHERE c.mtime_ms < ? AND t.is_approved = 1
            ORDER BY c.mtime_ms ASC, c.id ASC
            "#,
        )
        .bind(before.as_i64())
        .fetch_all(self.pool())
        .await?;

        // Later rows overwrite earlier ones, leaving the latest per pair.
        let mut latest: BTreeMap<(i64, i64), Money> = BTreeMap::new();
        for row in rows {
            let participant_id: i64 = row.get("participant_id");
            let team_id: i64 = row.get("team_id");
            let raw: String = row.get("amount");
            let amount = parse_money(&raw, "commitments.amount")?;
            latest.insert((participant_id, team_id), amount);
        }

        Ok(latest
            .into_iter()
            .filter(|(_, amount)| amount.is_positive())
            .map(|((participant_id, team_id), amount)| CurrentCommitment {
                participant_id: ParticipantId::new(participant_id),
                team_id: TeamId::new(team_id),
                amount,
            })
            .collect())
    }

    // =========================================================================
    // Absorptions
    // =========================================================================

    pub async fn add_absorption(
        &self,
        archived: ParticipantId,
        absorbing: ParticipantId,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO absorptions (archived_participant_id, absorbing_participant_id) VALUES (?, ?)",
        )
        .bind(archived.as_i64())
        .bind(absorbing.as_i64())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn absorptions(&self) -> Result<Vec<(ParticipantId, ParticipantId)>, LedgerError> {
        let rows = sqlx::query(
            "SELECT archived_participant_id, absorbing_participant_id FROM absorptions ORDER BY id ASC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    ParticipantId::new(row.get("archived_participant_id")),
                    ParticipantId::new(row.get("absorbing_participant_id")),
                )
            })
            .collect())
    }

    // =========================================================================
    // Exchanges
    // =========================================================================

    /// Record one external card movement.
    pub async fn record_exchange(
        &self,
        participant: ParticipantId,
        amount: Money,
        fee: Money,
        status: ExchangeStatus,
        ts: TimeMs,
    ) -> Result<ExchangeId, LedgerError> {
        let result = sqlx::query(
            "INSERT INTO exchanges (participant_id, amount, fee, status, ts_ms) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(participant.as_i64())
        .bind(amount.to_canonical_string())
        .bind(fee.to_canonical_string())
        .bind(status.as_str())
        .bind(ts.as_i64())
        .execute(self.pool())
        .await?;
        Ok(ExchangeId::new(result.last_insert_rowid()))
    }

    pub async fn exchanges_in_window(
        &self,
        from: TimeMs,
        to: TimeMs,
    ) -> Result<Vec<Exchange>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM exchanges WHERE ts_ms >= ? AND ts_ms < ? ORDER BY id ASC",
        )
        .bind(from.as_i64())
        .bind(to.as_i64())
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let amount: String = row.get("amount");
                let fee: String = row.get("fee");
                let status: String = row.get("status");
                Ok(Exchange {
                    id: ExchangeId::new(row.get("id")),
                    participant_id: ParticipantId::new(row.get("participant_id")),
                    amount: parse_money(&amount, "exchanges.amount")?,
                    fee: parse_money(&fee, "exchanges.fee")?,
                    status: ExchangeStatus::parse(&status).ok_or_else(|| {
                        LedgerError::Corrupt(format!("unknown exchange status {:?}", status))
                    })?,
                    ts_ms: TimeMs::new(row.get("ts_ms")),
                })
            })
            .collect()
    }

    /// Seed a participant's balance with an already-settled external credit.
    ///
    /// Records the exchange and posts the matching journal entry so the
    /// balance stays journal-derived.
    pub async fn seed_exchange(
        &self,
        participant: ParticipantId,
        amount: Money,
        ts: TimeMs,
    ) -> Result<(), LedgerError> {
        self.record_exchange(participant, amount, Money::zero(), ExchangeStatus::Succeeded, ts)
            .await?;
        let cash = self.system_account(SystemTag::Cash).await?;
        let credit = self
            .get_or_create_account(AccountOwner::Participant(participant))
            .await?;
        self.post_journal_batch(
            &[JournalLine::new(amount, cash, credit, Reason::Charge)],
            None,
            ts,
        )
        .await
    }
}
