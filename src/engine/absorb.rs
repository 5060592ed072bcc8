//! Folding archived balances into their absorbing accounts.

use super::payday::Payday;
use crate::domain::{AccountOwner, JournalLine, Reason, TimeMs};
use crate::error::EngineError;
use tracing::{debug, info};

/// Absorption chains (archived into archived into live) resolve one link
/// per pass; anything deeper than this is a declaration cycle.
const MAX_TAKE_OVER_PASSES: usize = 10;

impl Payday {
    /// Move every archived participant's positive balance to its absorber.
    ///
    /// Runs repeated passes until no balance moves, so chains of absorptions
    /// converge regardless of declaration order. A cycle of declarations
    /// never converges and is reported as an error rather than looping.
    pub(crate) async fn take_over_balances(&self) -> Result<(), EngineError> {
        for pass in 0..MAX_TAKE_OVER_PASSES {
            let mut moved = 0usize;
            for (archived, absorbing) in self.ledger.absorptions().await? {
                let balance = self
                    .ledger
                    .balance_of(AccountOwner::Participant(archived))
                    .await?;
                if !balance.is_positive() {
                    continue;
                }
                let debit = self
                    .ledger
                    .get_or_create_account(AccountOwner::Participant(archived))
                    .await?;
                let credit = self
                    .ledger
                    .get_or_create_account(AccountOwner::Participant(absorbing))
                    .await?;
                self.ledger
                    .post_journal_batch(
                        &[JournalLine::new(balance, debit, credit, Reason::TakeOver)],
                        Some(self.cycle.id),
                        TimeMs::now(),
                    )
                    .await?;
                debug!(
                    archived = %archived,
                    absorbing = %absorbing,
                    amount = %balance,
                    "Balance taken over"
                );
                moved += 1;
            }
            if moved == 0 {
                if pass > 0 {
                    info!(passes = pass, "Take-over converged");
                }
                return Ok(());
            }
        }
        Err(EngineError::AbsorptionLoop(MAX_TAKE_OVER_PASSES))
    }
}
