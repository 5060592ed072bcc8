//! Card hold reconciliation and settlement.
//!
//! All gateway traffic goes through a bounded pool; per-card declines are
//! counted and the batch keeps going, while unexpected gateway failures are
//! propagated only after the whole batch has drained, so no hold is left in
//! an unknown state.

use super::payday::Payday;
use super::pool::{drain_bounded, first_error};
use crate::db::StagingParticipant;
use crate::domain::fees::prep_charge;
use crate::domain::{
    AccountOwner, ExchangeStatus, Hold, JournalLine, Money, ParticipantId, Reason, SystemTag,
    TimeMs,
};
use crate::error::EngineError;
use crate::gateway::GatewayError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// What to do for one candidate during hold reconciliation.
enum HoldPlan {
    /// An existing hold already covers the gross charge.
    Keep(Hold),
    /// Cancel the insufficient hold, if any, and authorize a fresh one.
    Replace {
        stale: Option<Hold>,
        participant: ParticipantId,
        gross: Money,
        net: Money,
        fee: Money,
    },
}

/// Per-candidate outcome of executing a `HoldPlan`.
struct HoldOutcome {
    participant: ParticipantId,
    /// `None` means the card declined.
    hold: Option<Hold>,
    net: Money,
    fee: Money,
}

impl Payday {
    /// Ensure every candidate has a sufficient authorized hold.
    ///
    /// Candidates are staged participants whose balance cannot cover their
    /// giving and who have a usable card. Holds found at the gateway that
    /// belong to nobody in that set are stale leftovers and get cancelled.
    pub(crate) async fn create_card_holds(
        &self,
    ) -> Result<BTreeMap<i64, Hold>, EngineError> {
        let authorized = self.gateway.search_authorized_holds().await?;
        let participants = self.ledger.staging_participants().await?;
        let candidates: Vec<&StagingParticipant> =
            participants.iter().filter(|p| p.needs_hold()).collect();
        let candidate_ids: BTreeSet<i64> = candidates
            .iter()
            .map(|p| p.participant_id.as_i64())
            .collect();

        let mut existing: BTreeMap<i64, Hold> = BTreeMap::new();
        let mut stale: Vec<Hold> = Vec::new();
        for hold in authorized {
            let pid = hold.participant_id.as_i64();
            if candidate_ids.contains(&pid) {
                if let Some(previous) = existing.insert(pid, hold) {
                    stale.push(previous);
                }
            } else {
                stale.push(hold);
            }
        }

        if !stale.is_empty() {
            info!(count = stale.len(), "Cancelling stale holds");
            let results = drain_bounded(stale, self.hold_workers, |hold| {
                let gateway = self.gateway.clone();
                async move { gateway.cancel_hold(&hold).await }
            })
            .await;
            let (_, err) = first_error(results);
            if let Some(e) = err {
                return Err(e.into());
            }
        }

        let mut plans = Vec::with_capacity(candidates.len());
        for p in &candidates {
            let (gross, fee, net) = prep_charge(p.required_net());
            match existing.remove(&p.participant_id.as_i64()) {
                Some(hold) if hold.amount >= gross => plans.push(HoldPlan::Keep(hold)),
                other => plans.push(HoldPlan::Replace {
                    stale: other,
                    participant: p.participant_id,
                    gross,
                    net,
                    fee,
                }),
            }
        }

        let results = drain_bounded(plans, self.hold_workers, |plan| {
            let gateway = self.gateway.clone();
            async move {
                let outcome: Result<HoldOutcome, GatewayError> = match plan {
                    HoldPlan::Keep(hold) => {
                        let participant = hold.participant_id;
                        Ok(HoldOutcome {
                            participant,
                            hold: Some(hold),
                            net: Money::zero(),
                            fee: Money::zero(),
                        })
                    }
                    HoldPlan::Replace {
                        stale,
                        participant,
                        gross,
                        net,
                        fee,
                    } => {
                        if let Some(old) = stale {
                            gateway.cancel_hold(&old).await?;
                        }
                        let hold = gateway.create_hold(participant, gross).await?;
                        Ok(HoldOutcome {
                            participant,
                            hold,
                            net,
                            fee,
                        })
                    }
                };
                outcome
            }
        })
        .await;
        let (outcomes, err) = first_error(results);

        let mut holds = BTreeMap::new();
        let mut ok_ids = Vec::new();
        let mut ndeclined: i64 = 0;
        let now = TimeMs::now();
        for outcome in outcomes {
            match outcome.hold {
                Some(hold) => {
                    holds.insert(outcome.participant.as_i64(), hold);
                    ok_ids.push(outcome.participant);
                }
                None => {
                    warn!(participant = %outcome.participant, "Card declined hold");
                    ndeclined += 1;
                    self.ledger
                        .record_exchange(
                            outcome.participant,
                            outcome.net,
                            outcome.fee,
                            ExchangeStatus::Failed,
                            now,
                        )
                        .await?;
                }
            }
        }

        self.ledger.set_card_hold_ok(&ok_ids).await?;
        self.ledger.set_ncc_failing(ndeclined).await?;
        info!(
            held = ok_ids.len(),
            declined = ndeclined,
            "Card holds reconciled"
        );

        if let Some(e) = err {
            return Err(e.into());
        }
        Ok(holds)
    }

    /// Capture held-back deficits and release everything else.
    ///
    /// Charges post to the durable ledger immediately so the later staged
    /// batch finds the balances it floored against.
    pub(crate) async fn settle_card_holds(
        &self,
        holds: &BTreeMap<i64, Hold>,
    ) -> Result<(), EngineError> {
        let participants = self.ledger.staging_participants().await?;

        struct Capture {
            hold: Hold,
            gross: Money,
            fee: Money,
            net: Money,
        }
        let mut captures: Vec<Capture> = Vec::new();
        let mut leftovers: Vec<Hold> = Vec::new();
        for p in &participants {
            if !p.card_hold_ok {
                continue;
            }
            let hold = match holds.get(&p.participant_id.as_i64()) {
                Some(hold) => hold.clone(),
                None => continue,
            };
            if p.new_balance.is_negative() {
                let (gross, fee, net) = prep_charge(-p.new_balance);
                captures.push(Capture {
                    hold,
                    gross,
                    fee,
                    net,
                });
            } else {
                // The hold turned out not to be needed; release it.
                leftovers.push(hold);
            }
        }

        let results = drain_bounded(captures, self.hold_workers, |capture| {
            let gateway = self.gateway.clone();
            async move {
                match gateway.capture_hold(&capture.hold, capture.gross).await {
                    Ok(()) => Ok(capture),
                    Err(e) => Err((capture, e)),
                }
            }
        })
        .await;

        let cash = self.ledger.system_account(SystemTag::Cash).await?;
        let fee_revenue = self.ledger.system_account(SystemTag::FeeRevenue).await?;
        let now = TimeMs::now();
        let mut first_failure: Option<EngineError> = None;
        let mut ncaptured = 0usize;
        for result in results {
            match result {
                Ok(capture) => {
                    let participant = capture.hold.participant_id;
                    self.ledger
                        .record_exchange(
                            participant,
                            capture.net,
                            capture.fee,
                            ExchangeStatus::Succeeded,
                            now,
                        )
                        .await?;
                    let account = self
                        .ledger
                        .get_or_create_account(AccountOwner::Participant(participant))
                        .await?;
                    self.ledger
                        .post_journal_batch(
                            &[
                                JournalLine::new(capture.net, cash, account, Reason::Charge),
                                JournalLine::new(
                                    capture.fee,
                                    cash,
                                    fee_revenue,
                                    Reason::ChargeFee,
                                ),
                            ],
                            Some(self.cycle.id),
                            now,
                        )
                        .await?;
                    self.ledger
                        .adjust_staging_balance(participant, capture.net)
                        .await?;
                    ncaptured += 1;
                    debug!(participant = %participant, gross = %capture.gross, "Hold captured");
                }
                Err((capture, e)) => {
                    warn!(
                        participant = %capture.hold.participant_id,
                        error = %e,
                        "Hold capture failed"
                    );
                    self.ledger
                        .record_exchange(
                            capture.hold.participant_id,
                            capture.net,
                            capture.fee,
                            ExchangeStatus::Failed,
                            now,
                        )
                        .await?;
                    if first_failure.is_none() {
                        first_failure = Some(e.into());
                    }
                }
            }
        }

        if !leftovers.is_empty() {
            let results = drain_bounded(leftovers, self.hold_workers, |hold| {
                let gateway = self.gateway.clone();
                async move { gateway.cancel_hold(&hold).await }
            })
            .await;
            let (_, err) = first_error(results);
            if let (Some(e), None) = (err, &first_failure) {
                first_failure = Some(e.into());
            }
        }

        info!(captured = ncaptured, "Card holds settled");
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
