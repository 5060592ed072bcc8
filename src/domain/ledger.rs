//! Ledger domain types: account ownership, journal lines, holds, exchanges.

use super::{AccountId, ExchangeId, Money, ParticipantId, TeamId, TimeMs};
use serde::{Deserialize, Serialize};

/// The fixed set of system ledger accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemTag {
    Cash,
    AccountsReceivable,
    AccountsPayable,
    FeeRevenue,
    FeeExpense,
    InterestIncome,
    ChargebackExpense,
}

impl SystemTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemTag::Cash => "cash",
            SystemTag::AccountsReceivable => "accounts-receivable",
            SystemTag::AccountsPayable => "accounts-payable",
            SystemTag::FeeRevenue => "fee-revenue",
            SystemTag::FeeExpense => "fee-expense",
            SystemTag::InterestIncome => "interest-income",
            SystemTag::ChargebackExpense => "chargeback-expense",
        }
    }

    pub fn all() -> [SystemTag; 7] {
        [
            SystemTag::Cash,
            SystemTag::AccountsReceivable,
            SystemTag::AccountsPayable,
            SystemTag::FeeRevenue,
            SystemTag::FeeExpense,
            SystemTag::InterestIncome,
            SystemTag::ChargebackExpense,
        ]
    }
}

impl std::fmt::Display for SystemTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exactly one owner per ledger account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountOwner {
    Participant(ParticipantId),
    Team(TeamId),
    System(SystemTag),
}

/// Reason codes recorded on journal entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    /// A standing payment commitment from a participant to a team.
    Commitment,
    /// Distribution of a team's remaining balance to its owner.
    Draw,
    /// Net proceeds of an external card capture.
    Charge,
    /// Processing fee carved out of a card capture.
    ChargeFee,
    /// Residual balance folded into an absorbing account.
    TakeOver,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Commitment => "commitment",
            Reason::Draw => "draw",
            Reason::Charge => "charge",
            Reason::ChargeFee => "charge-fee",
            Reason::TakeOver => "take-over",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One double-entry posting candidate: debits `debit`, credits `credit`.
///
/// Amounts are always positive; direction is carried by the account pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalLine {
    pub amount: Money,
    pub debit: AccountId,
    pub credit: AccountId,
    pub reason: Reason,
}

impl JournalLine {
    pub fn new(amount: Money, debit: AccountId, credit: AccountId, reason: Reason) -> Self {
        JournalLine {
            amount,
            debit,
            credit,
            reason,
        }
    }
}

/// An authorized-but-uncaptured amount on a participant's card.
///
/// External state: the gateway owns the lifecycle, we only hold a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: String,
    pub participant_id: ParticipantId,
    pub amount: Money,
}

/// Terminal status of an external card exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeStatus {
    Succeeded,
    Failed,
}

impl ExchangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeStatus::Succeeded => "succeeded",
            ExchangeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(ExchangeStatus::Succeeded),
            "failed" => Some(ExchangeStatus::Failed),
            _ => None,
        }
    }
}

/// One external card movement as persisted in the `exchanges` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub id: ExchangeId,
    pub participant_id: ParticipantId,
    /// Net amount credited to the participant (gross minus fee).
    pub amount: Money,
    pub fee: Money,
    pub status: ExchangeStatus,
    pub ts_ms: TimeMs,
}
