//! Sequential offset/limit pagination.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ResilientClient;
use crate::error::FetchError;
use crate::models::{PageEnvelope, PageRequest};
use crate::transport::ApiRequest;

/// Aggregate of one pagination run.
///
/// A failed page only shows up in `failed_offsets`; the run itself never fails.
#[derive(Debug, Clone, PartialEq)]
pub struct PagedResult<T> {
    /// Records from successful pages, in ascending offset order.
    pub records: Vec<T>,
    /// Offset of each successful page with its raw body (`Null` unless the
    /// fetcher keeps raw pages).
    pub raw_pages: Vec<(u64, Value)>,
    pub failed_offsets: Vec<u64>,
    /// Entries dropped from otherwise good pages because they did not decode.
    pub skipped_records: usize,
    /// Iteration stopped early on shutdown.
    pub cancelled: bool,
}

impl<T> Default for PagedResult<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            raw_pages: Vec::new(),
            failed_offsets: Vec::new(),
            skipped_records: 0,
            cancelled: false,
        }
    }
}

impl<T> PagedResult<T> {
    pub fn is_complete(&self) -> bool {
        self.failed_offsets.is_empty() && !self.cancelled
    }
}

/// Walks an endpoint page by page, awaiting each before issuing the next.
#[derive(Debug, Clone)]
pub struct PaginatedFetcher {
    client: Arc<ResilientClient>,
    page_size: u64,
    page_delay: Duration,
    keep_raw: bool,
}

impl PaginatedFetcher {
    pub fn new(client: Arc<ResilientClient>, page_size: u64) -> Self {
        Self {
            client,
            page_size: page_size.max(1),
            page_delay: Duration::from_secs(1),
            keep_raw: false,
        }
    }

    /// Pause between consecutive page requests.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    /// Keep each page's raw JSON in [`PagedResult::raw_pages`].
    pub fn keep_raw(mut self, keep: bool) -> Self {
        self.keep_raw = keep;
        self
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Offsets a run over `total` records will request.
    pub fn offsets(&self, total: u64) -> impl Iterator<Item = u64> + use<> {
        let page_size = self.page_size;
        (0..total.div_ceil(page_size)).map(move |i| i * page_size)
    }

    /// Fetch every page of `endpoint` up to `total` records.
    pub async fn fetch_all<T>(&self, endpoint: &str, total: u64) -> PagedResult<T>
    where
        T: DeserializeOwned,
    {
        let cancel: &CancellationToken = self.client.cancellation();
        let mut result = PagedResult::default();
        let mut first = true;

        for offset in self.offsets(total) {
            if !first && !self.page_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        result.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.page_delay) => {}
                }
            }
            first = false;

            let Some(page) = PageRequest::new(offset, self.page_size) else {
                break;
            };
            let request = ApiRequest::get(endpoint).with_query(page.query());

            match self.client.fetch(&request).await {
                Ok(body) => match serde_json::from_value::<PageEnvelope>(body.clone()) {
                    Ok(envelope) => {
                        let entries = envelope.devices.len();
                        for (index, entry) in envelope.devices.into_iter().enumerate() {
                            match serde_json::from_value::<T>(entry) {
                                Ok(record) => result.records.push(record),
                                Err(e) => {
                                    warn!(endpoint, offset, index, error = %e, "skipping undecodable record");
                                    result.skipped_records += 1;
                                }
                            }
                        }
                        debug!(endpoint, offset, entries, "page fetched");
                        if self.keep_raw {
                            result.raw_pages.push((offset, body));
                        } else {
                            result.raw_pages.push((offset, Value::Null));
                        }
                    }
                    Err(e) => {
                        warn!(endpoint, offset, error = %e, "page did not match the expected shape, skipping");
                        result.failed_offsets.push(offset);
                    }
                },
                Err(FetchError::Cancelled) => {
                    result.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(endpoint, offset, error = %e, "page failed, skipping");
                    result.failed_offsets.push(offset);
                }
            }
        }

        info!(
            endpoint,
            total,
            records = result.records.len(),
            failed_pages = result.failed_offsets.len(),
            skipped_records = result.skipped_records,
            cancelled = result.cancelled,
            "pagination finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthState, StaticTokenProvider};
    use crate::client::ClientConfig;
    use crate::mock::{MockReply, MockTransport};
    use crate::models::{DeviceRecord, HealthEntry};
    use serde_json::json;
    use tokio::time::Instant;

    fn devices_page(offset: u64, count: u64) -> Value {
        let devices: Vec<Value> = (offset..offset + count)
            .map(|i| json!({ "id": format!("d-{i}"), "name": format!("ap-{i}") }))
            .collect();
        json!({ "devices": devices })
    }

    fn fetcher_for(mock: &Arc<MockTransport>, cancel: CancellationToken) -> PaginatedFetcher {
        let auth = Arc::new(AuthState::new(Arc::new(StaticTokenProvider::new("t"))).with_token("t"));
        let client = ResilientClient::new(mock.clone(), auth, ClientConfig::default())
            .with_cancellation(cancel);
        PaginatedFetcher::new(Arc::new(client), 500)
    }

    #[test]
    fn test_offsets() {
        let mock = Arc::new(MockTransport::new());
        let fetcher = fetcher_for(&mock, CancellationToken::new());
        assert_eq!(fetcher.offsets(1200).collect::<Vec<_>>(), vec![0, 500, 1000]);
        assert_eq!(fetcher.offsets(1000).collect::<Vec<_>>(), vec![0, 500]);
        assert_eq!(fetcher.offsets(0).count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_middle_page_is_skipped() {
        let mock = Arc::new(MockTransport::new());
        mock.route("/get_device_list", |call| match call.query_u64("offset") {
            Some(500) => MockReply::status(503),
            Some(offset) => MockReply::json(200, devices_page(offset, if offset == 1000 { 200 } else { 500 })),
            None => MockReply::status(400),
        });
        let fetcher = fetcher_for(&mock, CancellationToken::new()).keep_raw(true);

        let result: PagedResult<DeviceRecord> = fetcher.fetch_all("/get_device_list", 1200).await;

        assert_eq!(result.records.len(), 700);
        assert_eq!(result.records[0].id, "d-0");
        assert_eq!(result.records[500].id, "d-1000");
        assert_eq!(result.failed_offsets, vec![500]);
        assert_eq!(
            result.raw_pages.iter().map(|(o, _)| *o).collect::<Vec<_>>(),
            vec![0, 1000]
        );
        assert!(!result.cancelled);

        let offsets: Vec<u64> = mock
            .calls()
            .iter()
            .filter_map(|c| c.query_u64("offset"))
            .collect();
        assert_eq!(offsets, vec![0, 500, 500, 500, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pages_are_spaced() {
        let mock = Arc::new(MockTransport::new());
        mock.route("/device_health", |call| {
            let offset = call.query_u64("offset").unwrap_or(0);
            MockReply::json(200, json!({ "devices": [{ "device_id": format!("h-{offset}") }] }))
        });
        let fetcher = fetcher_for(&mock, CancellationToken::new());

        let start = Instant::now();
        let result: PagedResult<Value> = fetcher.fetch_all("/device_health", 1500).await;

        assert_eq!(result.records.len(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(result.raw_pages[0].1, Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_page_counts_as_failed() {
        let mock = Arc::new(MockTransport::new());
        mock.route("/get_device_list", |_| MockReply::json(200, json!({ "devices": "nope" })));
        let fetcher = fetcher_for(&mock, CancellationToken::new());

        let result: PagedResult<DeviceRecord> = fetcher.fetch_all("/get_device_list", 10).await;
        assert!(result.records.is_empty());
        assert_eq!(result.failed_offsets, vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_entry_does_not_sink_the_page() {
        let mock = Arc::new(MockTransport::new());
        mock.route("/device_health", |_| {
            MockReply::json(
                200,
                json!({ "devices": [
                    { "device_id": "h-1", "reachabilityHealth": "Reachable" },
                    { "reachabilityHealth": "Unreachable" },
                    { "device_id": "h-3", "reachabilityHealth": "Unreachable" }
                ]}),
            )
        });
        let fetcher = fetcher_for(&mock, CancellationToken::new());

        let result: PagedResult<HealthEntry> = fetcher.fetch_all("/device_health", 3).await;

        let ids: Vec<&str> = result.records.iter().map(|e| e.device_id.as_str()).collect();
        assert_eq!(ids, vec!["h-1", "h-3"]);
        assert_eq!(result.skipped_records, 1);
        assert!(result.failed_offsets.is_empty());
        assert!(result.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_between_pages() {
        let mock = Arc::new(MockTransport::new());
        mock.route("/get_device_list", |call| {
            MockReply::json(200, devices_page(call.query_u64("offset").unwrap_or(0), 500))
        });
        let cancel = CancellationToken::new();
        let fetcher = fetcher_for(&mock, cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let result: PagedResult<DeviceRecord> = fetcher.fetch_all("/get_device_list", 5000).await;
        assert!(result.cancelled);
        assert_eq!(result.records.len(), 1000);
        assert_eq!(mock.calls().len(), 2);
        assert!(!result.is_complete());
    }
}
