//! Card hold gateway: the engine's only external dependency.
//!
//! All hold state lives on the gateway side; the engine treats holds as
//! opaque references it can search, create, capture, and cancel.

pub mod http;
pub mod mock;

use crate::domain::{Hold, Money, ParticipantId};
use async_trait::async_trait;
use std::fmt;

pub use http::HttpHoldGateway;
pub use mock::MockHoldGateway;

/// Errors from the card hold gateway.
#[derive(Debug)]
pub enum GatewayError {
    /// Network failure after retries were exhausted.
    Network(String),
    /// The gateway answered with an error status.
    Http { status: u16, message: String },
    /// The response body could not be decoded.
    Parse(String),
    /// Too many requests; retried until the backoff budget ran out.
    RateLimited,
    /// The gateway refused the request outright.
    Rejected(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Network(msg) => write!(f, "gateway network error: {}", msg),
            GatewayError::Http { status, message } => {
                write!(f, "gateway HTTP {}: {}", status, message)
            }
            GatewayError::Parse(msg) => write!(f, "gateway response parse error: {}", msg),
            GatewayError::RateLimited => write!(f, "gateway rate limited"),
            GatewayError::Rejected(msg) => write!(f, "gateway rejected request: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Authorize-then-capture card operations.
///
/// `create_hold` distinguishes a decline (`Ok(None)`, an expected per-card
/// outcome) from gateway failure (`Err`, which aborts the batch).
#[async_trait]
pub trait HoldGateway: Send + Sync + fmt::Debug {
    /// All currently authorized holds created by this platform.
    async fn search_authorized_holds(&self) -> Result<Vec<Hold>, GatewayError>;

    /// Authorize a new hold. `Ok(None)` means the card declined.
    async fn create_hold(
        &self,
        participant: ParticipantId,
        amount: Money,
    ) -> Result<Option<Hold>, GatewayError>;

    /// Capture part of an authorized hold.
    async fn capture_hold(&self, hold: &Hold, amount: Money) -> Result<(), GatewayError>;

    /// Release an authorized hold without capturing.
    async fn cancel_hold(&self, hold: &Hold) -> Result<(), GatewayError>;
}
