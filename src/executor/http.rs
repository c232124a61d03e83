//! 基于 HTTP 的主执行端
//!
//! `GET {endpoint}/health` 探活，`POST {endpoint}/stories/execute` 提交片段。
//! 传输层错误映射为连接错误（触发重连与降级），非 2xx 状态映射为执行端错误。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::core::RelayError;
use crate::executor::{PrimaryExecutor, TaskOutput};
use crate::story::Fragment;

pub struct HttpPrimaryExecutor {
    client: Client,
}

impl HttpPrimaryExecutor {
    pub fn new(timeout: Duration) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}/{}", endpoint.trim_end_matches('/'), path)
    }
}

fn map_transport(e: reqwest::Error) -> RelayError {
    if e.is_status() {
        RelayError::Executor(e.to_string())
    } else {
        RelayError::Connection(e.to_string())
    }
}

#[async_trait]
impl PrimaryExecutor for HttpPrimaryExecutor {
    async fn health(&self, endpoint: &str) -> Result<(), RelayError> {
        let resp = self
            .client
            .get(Self::url(endpoint, "health"))
            .send()
            .await
            .map_err(map_transport)?;
        if !resp.status().is_success() {
            return Err(RelayError::Connection(format!(
                "health probe returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn execute(&self, endpoint: &str, fragment: &Fragment) -> Result<TaskOutput, RelayError> {
        let resp = self
            .client
            .post(Self::url(endpoint, "stories/execute"))
            .json(fragment)
            .send()
            .await
            .map_err(map_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Executor(format!(
                "HTTP {} executing {}: {}",
                status, fragment.id, body
            )));
        }
        // 传输已成功，响应体无法解析属于执行端错误，不算断开
        resp.json::<TaskOutput>().await.map_err(|e| {
            if e.is_decode() {
                RelayError::Executor(format!("invalid response body for {}: {}", fragment.id, e))
            } else {
                map_transport(e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::{Story, Task};
    use axum::{http::StatusCode, routing::get, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api")
    }

    fn fragment() -> Fragment {
        Fragment::whole(&Story::new("s1", "Story").with_task(Task::new("build")))
    }

    #[tokio::test]
    async fn test_health_and_execute_over_http() {
        let app = Router::new()
            .route("/api/health", get(|| async { "OK" }))
            .route(
                "/api/stories/execute",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({"status": "success", "result": {"echo": body["id"]}}))
                }),
            );
        let endpoint = serve(app).await;
        let executor = HttpPrimaryExecutor::new(Duration::from_secs(5)).unwrap();

        executor.health(&endpoint).await.unwrap();
        let out = executor.execute(&endpoint, &fragment()).await.unwrap();
        assert_eq!(out["result"]["echo"], json!("s1"));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_executor_error() {
        let app = Router::new().route(
            "/api/stories/execute",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let endpoint = serve(app).await;
        let executor = HttpPrimaryExecutor::new(Duration::from_secs(5)).unwrap();

        let err = executor.execute(&endpoint, &fragment()).await.unwrap_err();
        assert!(matches!(err, RelayError::Executor(ref msg) if msg.contains("boom")));
        assert!(!err.is_transient());

        let health = executor.health(&endpoint).await.unwrap_err();
        assert!(matches!(health, RelayError::Connection(_)));
    }

    #[tokio::test]
    async fn test_non_json_body_maps_to_executor_error() {
        let app = Router::new().route("/api/stories/execute", post(|| async { "not json" }));
        let endpoint = serve(app).await;
        let executor = HttpPrimaryExecutor::new(Duration::from_secs(5)).unwrap();

        let err = executor.execute(&endpoint, &fragment()).await.unwrap_err();
        assert!(matches!(err, RelayError::Executor(ref msg) if msg.contains("invalid response body")));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let executor = HttpPrimaryExecutor::new(Duration::from_secs(2)).unwrap();
        let err = executor
            .execute(&format!("http://{addr}/api"), &fragment())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)));
    }
}
