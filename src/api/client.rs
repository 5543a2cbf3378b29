//! REST 编排客户端
//!
//! 连接失败、响应体无法解析都映射为 Transport（可重试）；服务端返回的错误体还原为对应的错误种类。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::dto::{CreateDeploymentRequest, ErrorBody, UpdatePoolRequest};
use crate::api::{HealthStatus, OrchestrationApi};
use crate::core::{OrchestrationError, PoolStatus, Result};
use crate::store::{Deployment, DeploymentFilter, DeploymentSpec, FlowRun, PoolSpec, RunFilter, RunRequest, WorkPool};

/// 编排服务的 HTTP 客户端
#[derive(Clone, Debug)]
pub struct HttpOrchestrationClient {
    base_url: Url,
    http: Client,
}

impl HttpOrchestrationClient {
    /// base_url 如 `http://127.0.0.1:4220`
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| OrchestrationError::Transport(format!("invalid api url '{base_url}': {e}")))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestrationError::Transport(e.to_string()))?;
        Ok(Self { base_url, http })
    }

    /// 拼接路径段（自动转义）；末尾空段产生结尾的 `/`
    fn url(&self, segments: &[&str], query: &[(&str, Option<&str>)]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| OrchestrationError::Transport(format!("api url cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                if let Some(value) = value {
                    pairs.append_pair(key, value);
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<T> {
        tracing::debug!("{} {}", method, url);
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| OrchestrationError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| OrchestrationError::Transport(format!("invalid response body: {e}")));
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(body.into_error()),
            Err(_) => Err(OrchestrationError::Transport(format!("HTTP {status}: {text}"))),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        self.call(Method::GET, url, None::<&()>).await
    }
}

#[async_trait]
impl OrchestrationApi for HttpOrchestrationClient {
    async fn create_pool(&self, spec: PoolSpec) -> Result<WorkPool> {
        let url = self.url(&["api", "work_pools", ""], &[])?;
        self.call(Method::POST, url, Some(&spec)).await
    }

    async fn get_pool(&self, name: &str) -> Result<WorkPool> {
        self.get(self.url(&["api", "work_pools", name], &[])?).await
    }

    async fn list_pools(&self) -> Result<Vec<WorkPool>> {
        self.get(self.url(&["api", "work_pools", ""], &[])?).await
    }

    async fn set_pool_status(&self, name: &str, status: PoolStatus) -> Result<WorkPool> {
        let url = self.url(&["api", "work_pools", name], &[])?;
        self.call(Method::PATCH, url, Some(&UpdatePoolRequest { status })).await
    }

    async fn remove_pool(&self, name: &str) -> Result<WorkPool> {
        let url = self.url(&["api", "work_pools", name], &[])?;
        self.call(Method::DELETE, url, None::<&()>).await
    }

    async fn create_deployment(&self, pool_name: &str, spec: DeploymentSpec) -> Result<Deployment> {
        let url = self.url(&["api", "deployments", ""], &[])?;
        let body = CreateDeploymentRequest::new(pool_name, spec);
        self.call(Method::POST, url, Some(&body)).await
    }

    async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment> {
        self.get(self.url(&["api", "deployments", deployment_id], &[])?).await
    }

    async fn list_deployments(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>> {
        let url = self.url(
            &["api", "deployments", ""],
            &[("work_pool_id", filter.pool_id.as_deref())],
        )?;
        self.get(url).await
    }

    async fn submit_flow(&self, deployment_id: &str, request: RunRequest) -> Result<FlowRun> {
        let url = self.url(&["api", "deployments", deployment_id, "create_flow_run"], &[])?;
        self.call(Method::POST, url, Some(&request)).await
    }

    async fn get_run(&self, run_id: &str) -> Result<FlowRun> {
        self.get(self.url(&["api", "flow_runs", run_id], &[])?).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<FlowRun>> {
        let state = filter.state.map(|s| s.as_str());
        let url = self.url(
            &["api", "flow_runs", ""],
            &[
                ("deployment_id", filter.deployment_id.as_deref()),
                ("work_pool_id", filter.pool_id.as_deref()),
                ("state", state),
            ],
        )?;
        self.get(url).await
    }

    async fn cancel_run(&self, run_id: &str) -> Result<FlowRun> {
        let url = self.url(&["api", "flow_runs", run_id, "cancel"], &[])?;
        self.call(Method::POST, url, None::<&()>).await
    }

    async fn health(&self) -> Result<HealthStatus> {
        self.get(self.url(&["api", "health"], &[])?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = HttpOrchestrationClient::new("http://localhost:4220").unwrap();
        let url = client.url(&["api", "work_pools", ""], &[]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:4220/api/work_pools/");

        let url = client.url(&["api", "work_pools", "gpu pool"], &[]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:4220/api/work_pools/gpu%20pool");

        let url = client
            .url(&["api", "flow_runs", ""], &[("state", Some("FAILED")), ("deployment_id", None)])
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost:4220/api/flow_runs/?state=FAILED");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpOrchestrationClient::new("not a url").unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let client = HttpOrchestrationClient::with_timeout("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = client.get_run("run_1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
