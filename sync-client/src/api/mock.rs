//! Mock API client for testing.
//!
//! Responses are scripted per endpoint path and consumed in order.
//! Requests can be paused to keep them in flight while a test inspects
//! deduplication or cancellation.

use super::{ApiClient, ApiError, Endpoint};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// A request seen by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// The endpoint
    pub endpoint: Endpoint,
    /// Issued through `recovery_request`
    pub recovery: bool,
}

/// Mock API client for testing.
#[derive(Debug, Clone)]
pub struct MockApiClient {
    inner: Arc<Mutex<MockApiInner>>,
    paused: Arc<watch::Sender<bool>>,
}

#[derive(Debug, Default)]
struct MockApiInner {
    responses: HashMap<String, VecDeque<Result<Value, ApiError>>>,
    requests: Vec<RecordedRequest>,
    flushes: usize,
    in_flight: usize,
}

impl MockApiClient {
    /// Create a new mock client.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(MockApiInner::default())),
            paused: Arc::new(paused),
        }
    }

    /// Queue a successful response for `path`.
    pub fn respond(&self, path: &str, body: Value) {
        self.push(path, Ok(body));
    }

    /// Queue a failure for `path`.
    pub fn fail(&self, path: &str, error: ApiError) {
        self.push(path, Err(error));
    }

    fn push(&self, path: &str, response: Result<Value, ApiError>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .responses
            .entry(path.to_string())
            .or_default()
            .push_back(response);
    }

    /// Hold every request until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Release held requests.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// All requests seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// Requests seen for `path`.
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.endpoint.path == path)
            .collect()
    }

    /// Number of requests currently held by [`pause`](Self::pause).
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight
    }

    /// Number of `flush_requests_queue()` calls.
    pub fn flush_count(&self) -> usize {
        self.inner.lock().unwrap().flushes
    }

    async fn execute(&self, endpoint: Endpoint, recovery: bool) -> Result<Value, ApiError> {
        let path = endpoint.path.clone();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.requests.push(RecordedRequest { endpoint, recovery });
            inner.in_flight += 1;
        }

        let mut paused = self.paused.subscribe();
        // Sender lives in self, so this only fails if the mock is gone
        let _ = paused.wait_for(|held| !*held).await;

        let mut inner = self.inner.lock().unwrap();
        inner.in_flight -= 1;
        inner
            .responses
            .get_mut(&path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(ApiError::Network(format!("no response scripted for {path}"))))
    }
}

impl Default for MockApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiClient for MockApiClient {
    async fn request(&self, endpoint: Endpoint) -> Result<Value, ApiError> {
        self.execute(endpoint, false).await
    }

    async fn recovery_request(&self, endpoint: Endpoint) -> Result<Value, ApiError> {
        self.execute(endpoint, true).await
    }

    fn flush_requests_queue(&self) {
        self.inner.lock().unwrap().flushes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn endpoint(path: &str) -> Endpoint {
        Endpoint {
            method: super::super::Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
            requires_session: false,
        }
    }

    #[tokio::test]
    async fn scripted_responses_are_consumed_in_order() {
        let api = MockApiClient::new();
        api.respond("a", json!(1));
        api.respond("a", json!(2));

        assert_eq!(api.request(endpoint("a")).await.unwrap(), json!(1));
        assert_eq!(api.request(endpoint("a")).await.unwrap(), json!(2));
        assert!(matches!(
            api.request(endpoint("a")).await,
            Err(ApiError::Network(_))
        ));
        assert_eq!(api.requests_to("a").len(), 3);
    }

    #[tokio::test]
    async fn recovery_requests_are_marked() {
        let api = MockApiClient::new();
        api.respond("sync", json!({}));
        api.recovery_request(endpoint("sync")).await.unwrap();
        assert!(api.requests()[0].recovery);
    }

    #[tokio::test]
    async fn paused_requests_wait_for_resume() {
        let api = MockApiClient::new();
        api.respond("slow", json!("done"));
        api.pause();

        let task = {
            let api = api.clone();
            tokio::spawn(async move { api.request(endpoint("slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(api.in_flight(), 1);
        assert!(!task.is_finished());

        api.resume();
        assert_eq!(task.await.unwrap().unwrap(), json!("done"));
        assert_eq!(api.in_flight(), 0);
    }
}
