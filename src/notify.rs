//! Charge outcome notifications.
//!
//! Emission is fire and forget: a lost notification is an annoyance, a
//! failed cycle is not, so the emitter returns nothing and the engine never
//! blocks on delivery.

use crate::domain::{ExchangeId, Money, ParticipantId};
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

/// Bit flags on `participants.notify_charge` selecting which outcomes to send.
pub const NOTIFY_ON_FAILURE: i64 = 1;
pub const NOTIFY_ON_SUCCESS: i64 = 2;

/// One charge outcome to tell a participant about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeNotification {
    pub participant_id: ParticipantId,
    pub username: String,
    pub exchange_id: ExchangeId,
    pub succeeded: bool,
    /// Net amount credited, or the attempted amount for failures.
    pub amount: Money,
    pub fee: Money,
    /// How many teams this participant funds, for message copy.
    pub funded_teams: usize,
    /// Slug of the team this participant funds the most, for message copy.
    pub top_beneficiary: Option<String>,
}

/// Sink for charge notifications.
#[async_trait]
pub trait NotificationEmitter: Send + Sync + std::fmt::Debug {
    async fn enqueue_charge_notice(&self, notice: ChargeNotification);
}

/// Emitter that logs each notice; the default wiring for the binary.
#[derive(Debug, Default)]
pub struct TracingEmitter;

#[async_trait]
impl NotificationEmitter for TracingEmitter {
    async fn enqueue_charge_notice(&self, notice: ChargeNotification) {
        info!(
            participant = %notice.participant_id,
            username = %notice.username,
            succeeded = notice.succeeded,
            amount = %notice.amount,
            "charge notification"
        );
    }
}

/// Test emitter that records every notice.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    notices: Mutex<Vec<ChargeNotification>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<ChargeNotification> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationEmitter for RecordingEmitter {
    async fn enqueue_charge_notice(&self, notice: ChargeNotification) {
        self.notices.lock().unwrap().push(notice);
    }
}
