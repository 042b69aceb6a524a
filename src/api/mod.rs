pub mod retry;
pub mod types;

pub use retry::RetryPolicy;
pub use types::{ExpirePlotRequest, OrderPlotsResponse, OrderRecord, PlotRecord};

use reqwest::{Method, StatusCode};
use std::time::Instant;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Transport {
        url: String,
        source: reqwest::Error,
    },
    Status {
        url: String,
        status: StatusCode,
    },
    Decode {
        url: String,
        source: reqwest::Error,
    },
    /// The remote has not finished computing the verification hashes yet.
    /// A state, not a failure; callers poll again.
    HashesNotReady,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport { url, source } => write!(f, "request to {url} failed: {source}"),
            Self::Status { url, status } => {
                write!(f, "invalid response received from {url} ({status})")
            }
            Self::Decode { url, source } => {
                write!(f, "failed to decode response from {url}: {source}")
            }
            Self::HashesNotReady => write!(f, "plot verification hashes are not ready"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport { source, .. } | Self::Decode { source, .. } => Some(source),
            Self::Status { .. } | Self::HashesNotReady => None,
        }
    }
}

/// Typed client for the plot-order service. Every call is JSON over HTTP with
/// token auth, retried under the configured policy until a whitelisted status
/// comes back or the retry deadline is spent.
#[derive(Debug, Clone)]
pub struct ApiClient {
    api_url: String,
    api_key: String,
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(api_key: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self::with_policy(api_key, api_url, RetryPolicy::default())
    }

    pub fn with_policy(
        api_key: impl Into<String>,
        api_url: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        let mut api_url = api_url.into();
        while api_url.ends_with('/') {
            api_url.pop();
        }
        Self {
            api_url,
            api_key: api_key.into(),
            http: reqwest::Client::new(),
            policy,
        }
    }

    /// Fetches the order itself.
    pub async fn get_order(&self, order_id: &str) -> Result<OrderRecord> {
        let response = self
            .request(
                Method::GET,
                &format!("plot_orders/{order_id}"),
                None,
                &[StatusCode::OK],
            )
            .await?;
        Self::decode(response).await
    }

    /// Fetches every plot belonging to the order, in the order the remote
    /// lists them.
    pub async fn get_plots_for_order(&self, order_id: &str) -> Result<Vec<PlotRecord>> {
        let response = self
            .request(
                Method::GET,
                &format!("plot_orders/{order_id}"),
                None,
                &[StatusCode::OK],
            )
            .await?;
        let listing: OrderPlotsResponse = Self::decode(response).await?;
        Ok(listing.plots)
    }

    /// Fetches a single plot's current remote state.
    pub async fn get_plot(&self, plot_id: &str) -> Result<PlotRecord> {
        let response = self
            .request(
                Method::GET,
                &format!("plots/{plot_id}"),
                None,
                &[StatusCode::OK],
            )
            .await?;
        Self::decode(response).await
    }

    /// Fetches the chunk hash list for a plot. A 400 from the remote means
    /// the hashes are still being computed and maps to
    /// [`ApiError::HashesNotReady`].
    pub async fn get_hashes_for_plot(&self, plot_id: &str) -> Result<Vec<String>> {
        let response = self
            .request(
                Method::GET,
                &format!("plots/{plot_id}/hashes/"),
                None,
                &[StatusCode::OK, StatusCode::BAD_REQUEST],
            )
            .await?;
        if response.status() == StatusCode::BAD_REQUEST {
            return Err(ApiError::HashesNotReady);
        }
        Self::decode(response).await
    }

    /// Marks the plot expired so the server reclaims its storage. Idempotent
    /// from the client's point of view: expiring an expired plot succeeds.
    pub async fn expire_plot(&self, plot_id: &str) -> Result<PlotRecord> {
        let body = serde_json::to_value(ExpirePlotRequest {
            id: plot_id.to_string(),
            state: "X".to_string(),
            download_state: 2,
        })
        .expect("expire request is always serializable");
        let response = self
            .request(
                Method::PUT,
                &format!("plots/{plot_id}/"),
                Some(body),
                &[StatusCode::OK],
            )
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let url = response.url().to_string();
        response
            .json()
            .await
            .map_err(|source| ApiError::Decode { url, source })
    }

    /// Sends one logical request, retrying under the policy. Any status not
    /// in `accept` counts as a failed attempt, as does a transport error.
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
        accept: &[StatusCode],
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.api_url, endpoint);
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            tracing::debug!(%method, %url, attempt = attempts + 1, "making api request");

            let mut builder = self
                .http
                .request(method.clone(), &url)
                .header("Accept", "application/json")
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Token {}", self.api_key));
            if let Some(body) = &body {
                builder = builder.json(body);
            }

            let error = match builder.send().await {
                Ok(response) if accept.contains(&response.status()) => return Ok(response),
                Ok(response) => ApiError::Status {
                    url: url.clone(),
                    status: response.status(),
                },
                Err(source) => ApiError::Transport {
                    url: url.clone(),
                    source,
                },
            };

            let delay = self.policy.delay_for(attempts);
            attempts += 1;
            if started.elapsed() + delay >= self.policy.deadline {
                return Err(error);
            }
            tracing::debug!(
                %url,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "retrying api request"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FixtureState {
        hash_polls: AtomicU32,
        expire_calls: AtomicU32,
        last_auth: std::sync::Mutex<Option<String>>,
    }

    async fn serve_fixture(state: Arc<FixtureState>) -> String {
        let app = Router::new()
            .route(
                "/api/v1/plot_orders/:id",
                get(|| async {
                    // the documented order response has no top-level id
                    Json(serde_json::json!({
                        "Plots": [
                            {"id": "p1", "progress": 100,
                             "url": "https://dl.example/p1.plot", "state": "D"},
                            {"id": "p2", "progress": 10, "url": "", "state": "R"},
                        ]
                    }))
                }),
            )
            .route(
                "/api/v1/plots/:id",
                get(|headers: HeaderMap, State(s): State<Arc<FixtureState>>| async move {
                    *s.last_auth.lock().expect("auth lock") = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    Json(serde_json::json!({
                        "id": "p1", "progress": 100,
                        "url": "https://dl.example/p1.plot", "state": "D"
                    }))
                }),
            )
            .route(
                "/api/v1/plots/:id/hashes/",
                get(|State(s): State<Arc<FixtureState>>| async move {
                    let polls = s.hash_polls.fetch_add(1, Ordering::SeqCst);
                    if polls < 2 {
                        Err(axum::http::StatusCode::BAD_REQUEST)
                    } else {
                        Ok(Json(serde_json::json!(["aa", "bb"])))
                    }
                }),
            )
            .route(
                "/api/v1/plots/:id/",
                put(
                    |State(s): State<Arc<FixtureState>>,
                     Json(body): Json<serde_json::Value>| async move {
                        s.expire_calls.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(body["state"], "X");
                        assert_eq!(body["DownloadState"], 2);
                        Json(serde_json::json!({"id": body["id"], "state": "X"}))
                    },
                ),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fixture");
        let addr = listener.local_addr().expect("fixture addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve fixture");
        });
        format!("http://{addr}/api/v1")
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            deadline: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn get_order_decodes_a_plots_only_response() {
        let state = Arc::new(FixtureState::default());
        let base = serve_fixture(state).await;
        let client = ApiClient::with_policy("k", base, fast_policy());

        let order = client.get_order("o1").await.expect("get order");
        assert!(order.id.is_empty());

        let plots = client.get_plots_for_order("o1").await.expect("plots");
        assert_eq!(plots.len(), 2);
        assert_eq!(plots[0].id, "p1");
        assert_eq!(plots[1].state, "R");
    }

    #[tokio::test]
    async fn get_plot_sends_token_auth_and_decodes() {
        let state = Arc::new(FixtureState::default());
        let base = serve_fixture(state.clone()).await;
        let client = ApiClient::with_policy("secret-key", base, fast_policy());

        let record = client.get_plot("p1").await.expect("get plot");
        assert_eq!(record.id, "p1");
        assert_eq!(record.state, "D");
        assert_eq!(
            state.last_auth.lock().expect("auth lock").as_deref(),
            Some("Token secret-key")
        );
    }

    #[tokio::test]
    async fn hashes_400_maps_to_not_ready_without_retrying() {
        let state = Arc::new(FixtureState::default());
        let base = serve_fixture(state.clone()).await;
        let client = ApiClient::with_policy("k", base, fast_policy());

        for _ in 0..2 {
            match client.get_hashes_for_plot("p1").await {
                Err(ApiError::HashesNotReady) => {}
                other => panic!("expected HashesNotReady, got {other:?}"),
            }
        }
        // each not-ready poll costs exactly one request
        assert_eq!(state.hash_polls.load(Ordering::SeqCst), 2);

        let hashes = client.get_hashes_for_plot("p1").await.expect("hashes");
        assert_eq!(hashes, vec!["aa".to_string(), "bb".to_string()]);
    }

    #[tokio::test]
    async fn expire_plot_is_idempotent() {
        let state = Arc::new(FixtureState::default());
        let base = serve_fixture(state.clone()).await;
        let client = ApiClient::with_policy("k", base, fast_policy());

        let first = client.expire_plot("p9").await.expect("expire");
        let second = client.expire_plot("p9").await.expect("expire again");
        assert_eq!(first.state, "X");
        assert_eq!(second.state, "X");
        assert_eq!(state.expire_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_remote_returns_last_error_after_deadline() {
        let client = ApiClient::with_policy(
            "k",
            "http://127.0.0.1:1/api/v1",
            RetryPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
                deadline: Duration::from_millis(50),
            },
        );
        match client.get_plot("p1").await {
            Err(ApiError::Transport { .. }) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
