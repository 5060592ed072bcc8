//! Post-settlement statistics and cached amounts.

use super::payday::Payday;
use crate::db::CycleStats;
use crate::domain::{ExchangeStatus, Money, Reason, TimeMs};
use crate::error::EngineError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

impl Payday {
    /// Compute this cycle's aggregates and store them on the cycle row.
    ///
    /// Sums run over decimal strings in Rust; pushing them through SQL
    /// aggregate functions would coerce to floating point.
    pub(crate) async fn update_stats(&self) -> Result<(), EngineError> {
        let now = TimeMs::now();
        let rows = self
            .ledger
            .journal_rows_in_window(self.cycle.ts_start, now)
            .await?;
        let exchanges = self
            .ledger
            .exchanges_in_window(self.cycle.ts_start, now)
            .await?;

        let mut stats = CycleStats::default();

        let mut active: BTreeSet<i64> = BTreeSet::new();
        for row in &rows {
            match row.reason {
                Reason::Commitment | Reason::Draw | Reason::TakeOver => {
                    stats.ntransfers += 1;
                    stats.transfer_volume = stats.transfer_volume + row.amount;
                    if let Some(pid) = row.debit_participant {
                        active.insert(pid);
                    }
                    if let Some(pid) = row.credit_participant {
                        active.insert(pid);
                    }
                }
                Reason::Charge | Reason::ChargeFee => {}
            }
        }
        stats.nactive = active.len() as i64;

        for exchange in &exchanges {
            if exchange.status != ExchangeStatus::Succeeded {
                continue;
            }
            if exchange.amount.is_positive() {
                stats.ncharges += 1;
                stats.charge_volume = stats.charge_volume + exchange.amount + exchange.fee;
                stats.charge_fees_volume = stats.charge_fees_volume + exchange.fee;
            } else if exchange.amount.is_negative() {
                stats.ndebits += 1;
                stats.debit_volume = stats.debit_volume + exchange.amount.abs();
                stats.debit_fees_volume = stats.debit_fees_volume + exchange.fee;
            }
        }

        info!(
            nactive = stats.nactive,
            ntransfers = stats.ntransfers,
            transfer_volume = %stats.transfer_volume,
            ncharges = stats.ncharges,
            "Cycle statistics computed"
        );
        self.ledger.store_cycle_stats(self.cycle.id, &stats).await?;
        Ok(())
    }

    /// Recompute the denormalized giving/receiving caches from commitments.
    pub(crate) async fn update_cached_amounts(&self) -> Result<(), EngineError> {
        let commitments = self.ledger.current_commitments(self.cycle.ts_start).await?;
        let teams = self.ledger.approved_teams().await?;
        let participants = self.ledger.claimed_participants().await?;

        let mut giving: BTreeMap<i64, Money> = BTreeMap::new();
        let mut team_receiving: BTreeMap<i64, Money> = BTreeMap::new();
        for c in &commitments {
            let g = giving
                .entry(c.participant_id.as_i64())
                .or_insert_with(Money::zero);
            *g = *g + c.amount;
            let r = team_receiving
                .entry(c.team_id.as_i64())
                .or_insert_with(Money::zero);
            *r = *r + c.amount;
        }

        // A participant's receiving is what the teams they own receive.
        let mut owner_receiving: BTreeMap<i64, Money> = BTreeMap::new();
        for team in &teams {
            let amount = team_receiving
                .get(&team.id.as_i64())
                .copied()
                .unwrap_or_else(Money::zero);
            self.ledger.set_cached_team_receiving(team.id, amount).await?;
            let r = owner_receiving
                .entry(team.owner_id.as_i64())
                .or_insert_with(Money::zero);
            *r = *r + amount;
        }

        for p in &participants {
            let g = giving
                .get(&p.id.as_i64())
                .copied()
                .unwrap_or_else(Money::zero);
            self.ledger.set_cached_giving(p.id, g).await?;
            let r = owner_receiving
                .get(&p.id.as_i64())
                .copied()
                .unwrap_or_else(Money::zero);
            self.ledger.set_cached_receiving(p.id, r).await?;
        }

        Ok(())
    }
}
