//! HTTP card hold gateway client.

use super::{GatewayError, HoldGateway};
use crate::domain::{Hold, Money, ParticipantId};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Gateway client speaking the processor's hold API over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpHoldGateway {
    client: Client,
    base_url: String,
}

impl HttpHoldGateway {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    async fn post(
        &self,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self
                .client
                .post(&url)
                .json(&payload)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(GatewayError::Network(e.to_string())))?;

            let status = response.status();
            if status == 429 {
                return Err(backoff::Error::transient(GatewayError::RateLimited));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(GatewayError::Http {
                    status: status.as_u16(),
                    message: "Server error".to_string(),
                }));
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(GatewayError::Http {
                    status: status.as_u16(),
                    message,
                }));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| backoff::Error::permanent(GatewayError::Parse(e.to_string())))
        })
        .await
    }

    fn parse_hold(hold_json: &serde_json::Value) -> Result<Hold, GatewayError> {
        let id = hold_json
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::Parse("Missing id field".to_string()))?
            .to_string();
        let participant_id = hold_json
            .get("participant_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| GatewayError::Parse("Missing participant_id field".to_string()))?;
        let amount_str = hold_json
            .get("amount")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::Parse("Missing amount field".to_string()))?;
        let amount = Money::from_str_canonical(amount_str)
            .map_err(|e| GatewayError::Parse(format!("Invalid amount: {}", e)))?;

        Ok(Hold {
            id,
            participant_id: ParticipantId::new(participant_id),
            amount,
        })
    }
}

#[async_trait]
impl HoldGateway for HttpHoldGateway {
    async fn search_authorized_holds(&self) -> Result<Vec<Hold>, GatewayError> {
        debug!("Searching authorized holds");

        let payload = serde_json::json!({ "status": "authorized" });
        let response = self.post("/holds/search", payload).await?;

        let holds_json = response
            .as_array()
            .ok_or_else(|| GatewayError::Parse("Expected array response".to_string()))?;

        holds_json.iter().map(Self::parse_hold).collect()
    }

    async fn create_hold(
        &self,
        participant: ParticipantId,
        amount: Money,
    ) -> Result<Option<Hold>, GatewayError> {
        debug!(
            "Creating hold for participant={} amount={}",
            participant, amount
        );

        let payload = serde_json::json!({
            "participant_id": participant.as_i64(),
            "amount": amount.to_canonical_string(),
        });
        match self.post("/holds", payload).await {
            Ok(response) => Self::parse_hold(&response).map(Some),
            // 402 is the processor's decline answer, an expected outcome.
            Err(GatewayError::Http { status: 402, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn capture_hold(&self, hold: &Hold, amount: Money) -> Result<(), GatewayError> {
        debug!("Capturing hold={} amount={}", hold.id, amount);

        let payload = serde_json::json!({ "amount": amount.to_canonical_string() });
        self.post(&format!("/holds/{}/capture", hold.id), payload)
            .await?;
        Ok(())
    }

    async fn cancel_hold(&self, hold: &Hold) -> Result<(), GatewayError> {
        debug!("Cancelling hold={}", hold.id);

        self.post(&format!("/holds/{}/cancel", hold.id), serde_json::json!({}))
            .await?;
        Ok(())
    }
}
