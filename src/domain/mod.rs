//! Core domain types for the payday engine.

pub mod fees;
pub mod ledger;
pub mod money;
pub mod primitives;

pub use ledger::{AccountOwner, Exchange, ExchangeStatus, Hold, JournalLine, Reason, SystemTag};
pub use money::Money;
pub use primitives::{AccountId, CycleId, ExchangeId, ParticipantId, TeamId, TimeMs};
