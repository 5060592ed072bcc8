//! Persistence: SQLite pool setup, migrations, and the ledger repository.

pub mod ledger;
pub mod migrations;

pub use ledger::{
    CurrentCommitment, CycleRecord, CycleStats, JournalRow, Ledger, LedgerError, NewParticipant,
    Participant, StagingParticipant, StagingTeam, Team,
};
pub use migrations::init_db;
