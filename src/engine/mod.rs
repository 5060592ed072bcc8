//! The payday engine: staged batch settlement over the ledger and gateway.

mod absorb;
mod dump;
mod holds;
pub mod payday;
pub mod pool;
mod stats;

pub use payday::Payday;
pub use pool::DEFAULT_HOLD_WORKERS;
