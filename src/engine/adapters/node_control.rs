// ── Adapter: Node-Control Daemon ───────────────────────────────────────────
// Client for the local (or TLS) node daemon that actually opens/closes
// channels and updates policies. Every mutation carries the decision id as
// an Idempotency-Key header; the daemon deduplicates, so our retries and
// the scheduler's retries are both safe.

use async_trait::async_trait;
use serde_json::json;

use super::{NodeControl, Transport};
use crate::atoms::error::EngineResult;
use crate::atoms::types::ChannelPolicy;

pub struct HttpNodeControl {
    transport: Transport,
    base_url: String,
}

impl HttpNodeControl {
    pub fn new(transport: Transport, base_url: &str) -> Self {
        Self { transport, base_url: base_url.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl NodeControl for HttpNodeControl {
    async fn open_channel(
        &self,
        idempotency_key: &str,
        peer_pubkey: &str,
        amount_sat: u64,
    ) -> EngineResult<()> {
        let url = format!("{}/v1/channels/open", self.base_url);
        let body = json!({ "peer_pubkey": peer_pubkey, "amount_sat": amount_sat });
        self.transport
            .request_json(|| {
                self.transport
                    .client
                    .post(&url)
                    .header("Idempotency-Key", idempotency_key)
                    .json(&body)
            })
            .await?;
        Ok(())
    }

    async fn close_channel(&self, idempotency_key: &str, channel_id: &str) -> EngineResult<()> {
        let url = format!("{}/v1/channels/{}/close", self.base_url, channel_id);
        self.transport
            .request_json(|| {
                self.transport
                    .client
                    .post(&url)
                    .header("Idempotency-Key", idempotency_key)
            })
            .await?;
        Ok(())
    }

    async fn update_policy(
        &self,
        idempotency_key: &str,
        channel_id: &str,
        policy: &ChannelPolicy,
    ) -> EngineResult<()> {
        let url = format!("{}/v1/channels/{}/policy", self.base_url, channel_id);
        let body = json!({
            "base_fee_msat": policy.base_fee_msat,
            "fee_rate_ppm": policy.fee_rate_ppm,
            "time_lock_delta": policy.time_lock_delta,
        });
        self.transport
            .request_json(|| {
                self.transport
                    .client
                    .post(&url)
                    .header("Idempotency-Key", idempotency_key)
                    .json(&body)
            })
            .await?;
        Ok(())
    }
}
