//! Mock hold gateway for testing.

use super::{GatewayError, HoldGateway};
use crate::domain::{Hold, Money, ParticipantId};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    authorized: Vec<Hold>,
    declining: HashSet<i64>,
    failing_create: HashSet<i64>,
    failing_capture: HashSet<i64>,
    created: Vec<Hold>,
    captured: Vec<(Hold, Money)>,
    cancelled: Vec<Hold>,
}

/// In-memory gateway double with scriptable declines and failures.
#[derive(Debug, Default)]
pub struct MockHoldGateway {
    inner: Mutex<Inner>,
}

impl MockHoldGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed an authorized hold, as left behind by an earlier run.
    pub fn with_authorized_hold(self, participant: ParticipantId, amount: Money) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.authorized.push(Hold {
                id: Uuid::new_v4().to_string(),
                participant_id: participant,
                amount,
            });
        }
        self
    }

    /// Script this participant's card to decline new holds.
    pub fn declining(self, participant: ParticipantId) -> Self {
        self.inner
            .lock()
            .unwrap()
            .declining
            .insert(participant.as_i64());
        self
    }

    /// Script a gateway failure on hold creation for this participant.
    pub fn failing_create(self, participant: ParticipantId) -> Self {
        self.inner
            .lock()
            .unwrap()
            .failing_create
            .insert(participant.as_i64());
        self
    }

    /// Script a gateway failure on capture for this participant's holds.
    pub fn failing_capture_for(self, participant: ParticipantId) -> Self {
        self.inner
            .lock()
            .unwrap()
            .failing_capture
            .insert(participant.as_i64());
        self
    }

    pub fn created_holds(&self) -> Vec<Hold> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn captured_holds(&self) -> Vec<(Hold, Money)> {
        self.inner.lock().unwrap().captured.clone()
    }

    pub fn cancelled_holds(&self) -> Vec<Hold> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    /// Holds still authorized: created or pre-seeded, never settled.
    pub fn outstanding_holds(&self) -> Vec<Hold> {
        self.inner.lock().unwrap().authorized.clone()
    }
}

#[async_trait]
impl HoldGateway for MockHoldGateway {
    async fn search_authorized_holds(&self) -> Result<Vec<Hold>, GatewayError> {
        Ok(self.inner.lock().unwrap().authorized.clone())
    }

    async fn create_hold(
        &self,
        participant: ParticipantId,
        amount: Money,
    ) -> Result<Option<Hold>, GatewayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_create.contains(&participant.as_i64()) {
            return Err(GatewayError::Http {
                status: 500,
                message: "scripted create failure".to_string(),
            });
        }
        if inner.declining.contains(&participant.as_i64()) {
            return Ok(None);
        }
        let hold = Hold {
            id: Uuid::new_v4().to_string(),
            participant_id: participant,
            amount,
        };
        inner.authorized.push(hold.clone());
        inner.created.push(hold.clone());
        Ok(Some(hold))
    }

    async fn capture_hold(&self, hold: &Hold, amount: Money) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_capture.contains(&hold.participant_id.as_i64()) {
            return Err(GatewayError::Http {
                status: 500,
                message: "scripted capture failure".to_string(),
            });
        }
        if !inner.authorized.iter().any(|h| h.id == hold.id) {
            return Err(GatewayError::Rejected(format!(
                "hold {} is not authorized",
                hold.id
            )));
        }
        if amount > hold.amount {
            return Err(GatewayError::Rejected(format!(
                "capture {} exceeds hold {}",
                amount, hold.amount
            )));
        }
        inner.authorized.retain(|h| h.id != hold.id);
        inner.captured.push((hold.clone(), amount));
        Ok(())
    }

    async fn cancel_hold(&self, hold: &Hold) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().unwrap();
        inner.authorized.retain(|h| h.id != hold.id);
        inner.cancelled.push(hold.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money(s: &str) -> Money {
        Money::from_str_canonical(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_capture() {
        let gateway = MockHoldGateway::new();
        let p = ParticipantId::new(1);

        let hold = gateway
            .create_hold(p, money("10.00"))
            .await
            .unwrap()
            .unwrap();
        gateway.capture_hold(&hold, money("9.41")).await.unwrap();

        assert!(gateway.outstanding_holds().is_empty());
        assert_eq!(gateway.captured_holds(), vec![(hold, money("9.41"))]);
    }

    #[tokio::test]
    async fn test_decline_is_none_not_error() {
        let gateway = MockHoldGateway::new().declining(ParticipantId::new(1));
        let result = gateway
            .create_hold(ParticipantId::new(1), money("10.00"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_capture_over_hold_amount_rejected() {
        let gateway = MockHoldGateway::new();
        let hold = gateway
            .create_hold(ParticipantId::new(1), money("10.00"))
            .await
            .unwrap()
            .unwrap();
        let err = gateway.capture_hold(&hold, money("11.00")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
    }
}
