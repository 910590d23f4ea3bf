//! Typed access to the inventory and health endpoints.

use std::sync::Arc;

use serde_json::Value;

use crate::client::ResilientClient;
use crate::error::FetchError;
use crate::models::{DeviceCount, DeviceDetail, DeviceRecord, HealthEntry};
use crate::pagination::{PagedResult, PaginatedFetcher};
use crate::rate_limiter::WindowRateLimiter;
use crate::transport::ApiRequest;

pub const DEVICE_COUNT_PATH: &str = "/get_device_count";
pub const DEVICE_LIST_PATH: &str = "/get_device_list";
pub const DEVICE_HEALTH_PATH: &str = "/device_health";
pub const DEVICE_DETAIL_PATH: &str = "/device_detail";

#[derive(Debug, Clone)]
pub struct FleetApi {
    client: Arc<ResilientClient>,
    fetcher: PaginatedFetcher,
}

impl FleetApi {
    pub fn new(client: Arc<ResilientClient>, fetcher: PaginatedFetcher) -> Self {
        Self { client, fetcher }
    }

    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }

    pub fn fetcher(&self) -> &PaginatedFetcher {
        &self.fetcher
    }

    pub async fn device_count(&self) -> Result<u64, FetchError> {
        let body = self.client.fetch(&ApiRequest::get(DEVICE_COUNT_PATH)).await?;
        let count: DeviceCount = decode(body)?;
        Ok(count.device_count)
    }

    pub async fn device_list(&self, total: u64) -> PagedResult<DeviceRecord> {
        self.fetcher.fetch_all(DEVICE_LIST_PATH, total).await
    }

    /// Health pages, raw bodies included for the append log.
    pub async fn device_health(&self, total: u64) -> PagedResult<HealthEntry> {
        self.fetcher
            .clone()
            .keep_raw(true)
            .fetch_all(DEVICE_HEALTH_PATH, total)
            .await
    }

    pub async fn device_detail(&self, device_id: &str) -> Result<(DeviceDetail, Value), FetchError> {
        let body = self.client.fetch(&detail_request(device_id)).await?;
        decode_detail(body)
    }

    /// Detail fetch admitted by `limiter` on every attempt.
    pub async fn device_detail_limited(
        &self,
        device_id: &str,
        limiter: &WindowRateLimiter,
    ) -> Result<(DeviceDetail, Value), FetchError> {
        let body = self
            .client
            .fetch_limited(&detail_request(device_id), limiter)
            .await?;
        decode_detail(body)
    }
}

fn detail_request(device_id: &str) -> ApiRequest {
    ApiRequest::get(format!("{DEVICE_DETAIL_PATH}/{device_id}"))
}

fn decode_detail(body: Value) -> Result<(DeviceDetail, Value), FetchError> {
    let detail: DeviceDetail = decode(body.clone())?;
    Ok((detail, body))
}

fn decode<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, FetchError> {
    serde_json::from_value(body)
        .map_err(|e| FetchError::fatal(None, format!("unexpected response shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthState, StaticTokenProvider};
    use crate::client::ClientConfig;
    use crate::mock::{MockReply, MockTransport};
    use crate::models::DeviceStatus;
    use serde_json::json;

    fn api_for(mock: &Arc<MockTransport>) -> FleetApi {
        let auth = Arc::new(AuthState::new(Arc::new(StaticTokenProvider::new("t"))).with_token("t"));
        let client = Arc::new(ResilientClient::new(mock.clone(), auth, ClientConfig::default()));
        let fetcher = PaginatedFetcher::new(client.clone(), 500);
        FleetApi::new(client, fetcher)
    }

    #[tokio::test]
    async fn test_device_count() {
        let mock = Arc::new(MockTransport::new());
        mock.route(DEVICE_COUNT_PATH, |_| MockReply::json(200, json!({ "device_count": 1200 })));
        assert_eq!(api_for(&mock).device_count().await.unwrap(), 1200);
    }

    #[tokio::test]
    async fn test_device_count_wrong_shape_is_fatal() {
        let mock = Arc::new(MockTransport::new());
        mock.route(DEVICE_COUNT_PATH, |_| MockReply::json(200, json!({ "count": "many" })));
        let err = api_for(&mock).device_count().await.unwrap_err();
        assert!(matches!(err, FetchError::Fatal { status: None, .. }));
    }

    #[tokio::test]
    async fn test_device_detail_returns_raw_body() {
        let mock = Arc::new(MockTransport::new());
        mock.route_prefix("/device_detail/", |call| {
            let id = call.path.rsplit('/').next().unwrap_or_default().to_string();
            MockReply::json(200, json!({
                "device_id": id, "status": "DOWN", "signal_strength": -80, "timestamp": "2024-08-19T10:00:00Z"
            }))
        });

        let (detail, raw) = api_for(&mock).device_detail("ap-9").await.unwrap();
        assert_eq!(detail.device_id, "ap-9");
        assert_eq!(detail.status, DeviceStatus::Down);
        assert_eq!(raw["signal_strength"], json!(-80));
        assert_eq!(mock.calls()[0].path, "/device_detail/ap-9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_health_keeps_raw_pages() {
        let mock = Arc::new(MockTransport::new());
        mock.route(DEVICE_HEALTH_PATH, |_| {
            MockReply::json(200, json!({ "devices": [
                { "device_id": "a", "reachabilityHealth": "Unreachable" },
                { "device_id": "b", "reachabilityHealth": "Reachable" }
            ]}))
        });

        let result = api_for(&mock).device_health(2).await;
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].status(), DeviceStatus::Down);
        assert_eq!(result.raw_pages[0].0, 0);
        assert!(result.raw_pages[0].1["devices"].is_array());
    }
}
