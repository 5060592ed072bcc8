//! Cycle orchestration.
//!
//! A cycle runs in ordered phases behind a stage counter stored on the
//! cycle row, so a crashed run can be resumed by starting again: completed
//! phases are skipped, the interrupted phase reruns from its staging
//! snapshot.

use super::dump;
use crate::db::{CycleRecord, Ledger};
use crate::error::EngineError;
use crate::gateway::HoldGateway;
use crate::notify::{
    ChargeNotification, NotificationEmitter, NOTIFY_ON_FAILURE, NOTIFY_ON_SUCCESS,
};
use crate::domain::{
    AccountOwner, ExchangeStatus, JournalLine, Money, Reason, TeamId, TimeMs,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One run of the settlement cycle.
pub struct Payday {
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) gateway: Arc<dyn HoldGateway>,
    pub(crate) emitter: Arc<dyn NotificationEmitter>,
    pub(crate) hold_workers: usize,
    pub(crate) dump_dir: PathBuf,
    pub(crate) cycle: CycleRecord,
}

impl Payday {
    /// Open a cycle, or pick up the one a crashed run left open.
    pub async fn start(
        ledger: Arc<Ledger>,
        gateway: Arc<dyn HoldGateway>,
        emitter: Arc<dyn NotificationEmitter>,
        hold_workers: usize,
        dump_dir: PathBuf,
    ) -> Result<Self, EngineError> {
        let (cycle, fresh) = ledger.start_cycle(TimeMs::now()).await?;
        if fresh {
            info!(cycle = %cycle.id, "Starting payday");
        } else {
            info!(cycle = %cycle.id, stage = cycle.stage, "Picking up interrupted payday");
        }
        Ok(Payday {
            ledger,
            gateway,
            emitter,
            hold_workers,
            dump_dir,
            cycle,
        })
    }

    pub fn cycle(&self) -> &CycleRecord {
        &self.cycle
    }

    /// Run every remaining phase of the cycle to completion.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        if self.cycle.stage < 1 {
            self.payin().await?;
            self.cycle.stage = self.ledger.mark_stage_done().await?;
        }
        if self.cycle.stage < 2 {
            self.update_stats().await?;
            self.update_cached_amounts().await?;
            self.cycle.stage = self.ledger.mark_stage_done().await?;
        }
        let ts_end = self.ledger.end_cycle(self.cycle.id, TimeMs::now()).await?;
        self.cycle.ts_end = ts_end;
        info!(cycle = %self.cycle.id, "Payday complete");

        self.notify_participants(ts_end).await?;
        Ok(())
    }

    /// The money-moving phase: stage, reconcile holds, settle, post.
    pub(crate) async fn payin(&self) -> Result<(), EngineError> {
        let ts_start = self.cycle.ts_start;
        self.ledger.prepare_staging(ts_start).await?;

        let holds = self.create_card_holds().await?;
        self.process_commitments(ts_start).await?;
        self.transfer_takes().await?;
        self.process_draws().await?;

        // From here on a failure strands captured charges against an
        // unposted staged journal; dump it for the operator before bailing.
        if let Err(e) = self.settle_and_post(&holds).await {
            match self.ledger.staged_journal().await {
                Ok(lines) => {
                    match dump::dump_journal(&self.dump_dir, TimeMs::now(), &lines) {
                        Ok(path) => warn!(path = %path.display(), "Staged journal dumped"),
                        Err(dump_err) => warn!(error = %dump_err, "Staged journal dump failed"),
                    }
                }
                Err(read_err) => warn!(error = %read_err, "Could not read staged journal for dump"),
            }
            return Err(e);
        }

        self.take_over_balances().await?;
        Ok(())
    }

    async fn settle_and_post(
        &self,
        holds: &BTreeMap<i64, crate::domain::Hold>,
    ) -> Result<(), EngineError> {
        self.settle_card_holds(holds).await?;
        self.make_journal_entries().await?;
        self.ledger.self_check().await?;
        Ok(())
    }

    /// Stage a journal line per funded commitment.
    pub(crate) async fn process_commitments(&self, ts_start: TimeMs) -> Result<(), EngineError> {
        let participants = self.ledger.staging_participants().await?;
        let teams = self.ledger.staging_teams().await?;
        let commitments = self.ledger.current_commitments(ts_start).await?;

        let suspicious: BTreeSet<i64> = participants
            .iter()
            .filter(|p| p.is_suspicious)
            .map(|p| p.participant_id.as_i64())
            .collect();
        let staged_participants: BTreeSet<i64> = participants
            .iter()
            .map(|p| p.participant_id.as_i64())
            .collect();
        let team_owner: BTreeMap<i64, i64> = teams
            .iter()
            .map(|t| (t.team_id.as_i64(), t.owner_id.as_i64()))
            .collect();

        let mut nstaged = 0usize;
        for c in &commitments {
            if !staged_participants.contains(&c.participant_id.as_i64()) {
                continue;
            }
            if suspicious.contains(&c.participant_id.as_i64()) {
                continue;
            }
            match team_owner.get(&c.team_id.as_i64()) {
                Some(owner) if !suspicious.contains(owner) => {}
                _ => continue,
            }

            let debit = self
                .ledger
                .get_or_create_account(AccountOwner::Participant(c.participant_id))
                .await?;
            let credit = self
                .ledger
                .get_or_create_account(AccountOwner::Team(c.team_id))
                .await?;
            let line = JournalLine::new(c.amount, debit, credit, Reason::Commitment);
            match self.ledger.stage_journal(&line).await {
                Ok(()) => nstaged += 1,
                // Unfunded commitments are simply not paid this cycle.
                Err(crate::db::LedgerError::NegativeBalance { .. }) => {
                    debug!(
                        participant = %c.participant_id,
                        team = %c.team_id,
                        amount = %c.amount,
                        "Skipping unfunded commitment"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(count = nstaged, "Commitments staged");
        Ok(())
    }

    /// Seam for distributing team balances to non-owner takers.
    ///
    /// Take distribution is switched off platform-wide; the full team
    /// balance flows to the owner through the draw instead.
    pub(crate) async fn transfer_takes(&self) -> Result<(), EngineError> {
        debug!("Take distribution is disabled; leaving balances for the draw");
        Ok(())
    }

    /// Stage each team's remaining balance over to its owner.
    pub(crate) async fn process_draws(&self) -> Result<(), EngineError> {
        let teams = self.ledger.staging_teams().await?;
        for team in &teams {
            if team.is_drained || !team.balance.is_positive() {
                continue;
            }
            // Suspicious or unstaged owners keep nothing this cycle; the
            // team balance carries over untouched.
            match self.ledger.staging_participant(team.owner_id).await? {
                Some(owner) if !owner.is_suspicious => {}
                _ => {
                    debug!(team = %team.slug, "Skipping draw to unavailable owner");
                    continue;
                }
            }
            let debit = self
                .ledger
                .get_or_create_account(AccountOwner::Team(team.team_id))
                .await?;
            let credit = self
                .ledger
                .get_or_create_account(AccountOwner::Participant(team.owner_id))
                .await?;
            let line = JournalLine::new(team.balance, debit, credit, Reason::Draw);
            self.ledger.stage_journal(&line).await?;
            self.ledger.mark_team_drained(team.team_id).await?;
            debug!(team = %team.slug, amount = %team.balance, "Draw staged");
        }
        Ok(())
    }

    /// Post the staged journal against the durable ledger in one batch.
    pub(crate) async fn make_journal_entries(&self) -> Result<(), EngineError> {
        let lines = self.ledger.staged_journal().await?;
        info!(count = lines.len(), "Posting staged journal");
        self.ledger
            .post_journal_batch(&lines, Some(self.cycle.id), TimeMs::now())
            .await?;
        Ok(())
    }

    /// Emit charge notifications for this cycle's exchanges.
    pub(crate) async fn notify_participants(&self, ts_end: TimeMs) -> Result<(), EngineError> {
        let exchanges = self
            .ledger
            .exchanges_in_window(self.cycle.ts_start, ts_end)
            .await?;
        if exchanges.is_empty() {
            return Ok(());
        }

        // Each participant's most-funded team, for the message copy.
        let commitments = self.ledger.current_commitments(self.cycle.ts_start).await?;
        let mut top: BTreeMap<i64, (Money, TeamId)> = BTreeMap::new();
        let mut nfunded: BTreeMap<i64, usize> = BTreeMap::new();
        for c in &commitments {
            let key = c.participant_id.as_i64();
            *nfunded.entry(key).or_insert(0) += 1;
            let replace = match top.get(&key) {
                Some((amount, _)) => *amount < c.amount,
                None => true,
            };
            if replace {
                top.insert(key, (c.amount, c.team_id));
            }
        }

        for exchange in &exchanges {
            let participant = self.ledger.participant(exchange.participant_id).await?;
            let wanted = match exchange.status {
                ExchangeStatus::Succeeded => participant.notify_charge & NOTIFY_ON_SUCCESS != 0,
                ExchangeStatus::Failed => participant.notify_charge & NOTIFY_ON_FAILURE != 0,
            };
            if !wanted {
                continue;
            }
            let top_beneficiary = match top.get(&participant.id.as_i64()) {
                Some((_, team_id)) => Some(self.ledger.team(*team_id).await?.slug),
                None => None,
            };
            self.emitter
                .enqueue_charge_notice(ChargeNotification {
                    participant_id: participant.id,
                    username: participant.username,
                    exchange_id: exchange.id,
                    succeeded: exchange.status == ExchangeStatus::Succeeded,
                    amount: exchange.amount,
                    fee: exchange.fee,
                    funded_teams: nfunded
                        .get(&participant.id.as_i64())
                        .copied()
                        .unwrap_or(0),
                    top_beneficiary,
                })
                .await;
        }
        Ok(())
    }
}
