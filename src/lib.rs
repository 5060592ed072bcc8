pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod notify;

pub use config::Config;
pub use db::{init_db, CycleRecord, CycleStats, Ledger, LedgerError, NewParticipant};
pub use domain::{
    AccountOwner, CycleId, ExchangeStatus, Hold, JournalLine, Money, ParticipantId, Reason,
    SystemTag, TeamId, TimeMs,
};
pub use engine::{Payday, DEFAULT_HOLD_WORKERS};
pub use error::EngineError;
pub use gateway::{GatewayError, HoldGateway, HttpHoldGateway, MockHoldGateway};
pub use notify::{ChargeNotification, NotificationEmitter, RecordingEmitter, TracingEmitter};
