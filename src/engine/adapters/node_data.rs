// ── Adapter: Node-Data Provider ────────────────────────────────────────────
// HTTPS client for the external Lightning data provider. Snapshots and
// channel lists are validated against the structural invariants here, at
// the boundary, so the engine can trust what it holds.

use async_trait::async_trait;
use serde_json::Value;

use super::{NodeDataProvider, Transport};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChannelState, NodeSnapshot};

pub struct HttpNodeDataProvider {
    transport: Transport,
    base_url: String,
}

impl HttpNodeDataProvider {
    pub fn new(transport: Transport, base_url: &str) -> Self {
        Self { transport, base_url: base_url.trim_end_matches('/').to_string() }
    }

    fn parse_snapshot(value: Value) -> EngineResult<NodeSnapshot> {
        let snapshot: NodeSnapshot = serde_json::from_value(value)
            .map_err(|e| EngineError::Permanent(format!("node_data: bad snapshot shape: {}", e)))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

#[async_trait]
impl NodeDataProvider for HttpNodeDataProvider {
    async fn fetch_node_snapshot(&self, node_pubkey: &str) -> EngineResult<NodeSnapshot> {
        let url = format!("{}/v1/nodes/{}", self.base_url, node_pubkey);
        let value = self
            .transport
            .request_json(|| self.transport.client.get(&url))
            .await?;
        Self::parse_snapshot(value)
    }

    async fn fetch_channels(&self, node_pubkey: &str) -> EngineResult<Vec<ChannelState>> {
        let url = format!("{}/v1/nodes/{}/channels", self.base_url, node_pubkey);
        let value = self
            .transport
            .request_json(|| self.transport.client.get(&url))
            .await?;
        let channels: Vec<ChannelState> = serde_json::from_value(value)
            .map_err(|e| EngineError::Permanent(format!("node_data: bad channels shape: {}", e)))?;
        Ok(channels)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
