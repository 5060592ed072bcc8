use crate::db::LedgerError;
use crate::gateway::GatewayError;
use thiserror::Error;

/// Top-level errors from running a payday cycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("take-over did not converge after {0} passes")]
    AbsorptionLoop(usize),
    #[error("journal dump failed: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<crate::config::ConfigError> for EngineError {
    fn from(err: crate::config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
