//! HTTP-backed capability clients
//!
//! Wire implementations of the capability seams for deployments where the
//! planner, executor, lattice search, and the local model runtime are
//! separate services. Construction is env-driven; any capability without a
//! configured endpoint falls back to its static stand-in at wiring time.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::types::{CapabilityError, KnowledgeFile, TraceId};

use super::capabilities::{
    ExecutionSummary, GenerateRequest, LanguageModel, LatticeSearch, PlanOutcome, PlanRequest,
    Planner, ToolExecutor,
};

/// Shared connection settings for one upstream service.
#[derive(Debug, Clone)]
pub struct HttpCapabilityConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: std::time::Duration,
}

impl HttpCapabilityConfig {
    /// Read `<PREFIX>_URL` and `<PREFIX>_TOKEN` from the environment.
    pub fn from_env(prefix: &str) -> Option<Self> {
        let base_url = std::env::var(format!("{prefix}_URL")).ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: std::env::var(format!("{prefix}_TOKEN")).ok(),
            timeout: std::time::Duration::from_secs(120),
        })
    }

    fn client(&self) -> Result<reqwest::Client, CapabilityError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| CapabilityError::Failed(format!("client construction failed: {e}")))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
}

/// Map a non-success response onto the capability error taxonomy.
async fn map_error(response: reqwest::Response) -> CapabilityError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<WireError>(&body)
        .map(|e| e.error)
        .unwrap_or_else(|_| body.chars().take(200).collect());

    if reason == "knowledge_projects_disabled" {
        return CapabilityError::KnowledgeProjectsDisabled;
    }
    if status == reqwest::StatusCode::BAD_REQUEST {
        return CapabilityError::BadRequest(reason);
    }
    CapabilityError::Failed(format!("{status}: {reason}"))
}

/// Planner backed by `POST {base}/agi/plan`.
pub struct HttpPlanner {
    config: HttpCapabilityConfig,
}

impl HttpPlanner {
    pub fn new(config: HttpCapabilityConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Deserialize)]
struct WirePlan {
    #[serde(default)]
    plan: serde_json::Value,
    #[serde(default)]
    knowledge: Vec<KnowledgeFile>,
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan(&self, request: PlanRequest) -> Result<PlanOutcome, CapabilityError> {
        let client = self.config.client()?;
        let url = format!("{}/agi/plan", self.config.base_url);
        let response = self
            .config
            .authorize(client.post(&url))
            .json(&json!({
                "question": request.question,
                "traceId": request.trace_id,
                "knowledge": request.knowledge,
            }))
            .send()
            .await
            .map_err(|e| CapabilityError::Failed(format!("planner unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(map_error(response).await);
        }
        let wire: WirePlan = response
            .json()
            .await
            .map_err(|e| CapabilityError::Failed(format!("planner returned bad JSON: {e}")))?;
        Ok(PlanOutcome {
            trace_id: request.trace_id,
            plan: wire.plan,
            knowledge: wire.knowledge,
        })
    }
}

/// Executor backed by `POST {base}/agi/execute/{traceId}`.
pub struct HttpToolExecutor {
    config: HttpCapabilityConfig,
}

impl HttpToolExecutor {
    pub fn new(config: HttpCapabilityConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Deserialize)]
struct WireExecution {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    artifacts: Vec<serde_json::Value>,
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(
        &self,
        trace_id: &TraceId,
        plan: &serde_json::Value,
    ) -> Result<ExecutionSummary, CapabilityError> {
        let client = self.config.client()?;
        let url = format!("{}/agi/execute/{}", self.config.base_url, trace_id);
        let response = self
            .config
            .authorize(client.post(&url))
            .json(&json!({ "plan": plan }))
            .send()
            .await
            .map_err(|e| CapabilityError::Failed(format!("executor unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(map_error(response).await);
        }
        let wire: WireExecution = response
            .json()
            .await
            .map_err(|e| CapabilityError::Failed(format!("executor returned bad JSON: {e}")))?;
        Ok(ExecutionSummary {
            trace_id: trace_id.clone(),
            ok: wire.ok,
            summary: wire.summary,
            artifacts: wire.artifacts,
        })
    }
}

/// Lattice search backed by `GET {base}/lattice/search`.
pub struct HttpLatticeSearch {
    config: HttpCapabilityConfig,
}

impl HttpLatticeSearch {
    pub fn new(config: HttpCapabilityConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Deserialize)]
struct WireSearch {
    #[serde(default)]
    files: Vec<KnowledgeFile>,
}

#[async_trait]
impl LatticeSearch for HttpLatticeSearch {
    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeFile>, CapabilityError> {
        let client = self.config.client()?;
        let url = format!("{}/lattice/search", self.config.base_url);
        let response = self
            .config
            .authorize(client.get(&url))
            .query(&[("q", query), ("limit", &limit.to_string())])
            .send()
            .await
            .map_err(|e| CapabilityError::Failed(format!("search unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(map_error(response).await);
        }
        let wire: WireSearch = response
            .json()
            .await
            .map_err(|e| CapabilityError::Failed(format!("search returned bad JSON: {e}")))?;
        Ok(wire.files)
    }
}

/// The `askLocal` runtime behind `POST {base}/ask-local`.
pub struct HttpLanguageModel {
    config: HttpCapabilityConfig,
}

impl HttpLanguageModel {
    pub fn new(config: HttpCapabilityConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Deserialize)]
struct WireGeneration {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn generate(&self, request: GenerateRequest) -> Result<String, CapabilityError> {
        let client = self.config.client()?;
        let url = format!("{}/ask-local", self.config.base_url);
        let call = self
            .config
            .authorize(client.post(&url))
            .json(&json!({
                "prompt": request.prompt,
                "maxTokens": request.max_tokens,
            }))
            .send();

        let response = tokio::select! {
            response = call => {
                response.map_err(|e| CapabilityError::Failed(format!("model unreachable: {e}")))?
            }
            _ = request.abort.aborted() => return Err(CapabilityError::Aborted),
        };

        if !response.status().is_success() {
            return Err(map_error(response).await);
        }
        let wire: WireGeneration = response
            .json()
            .await
            .map_err(|e| CapabilityError::Failed(format!("model returned bad JSON: {e}")))?;

        // Non-streaming upstream: surface the whole reply as one chunk so
        // the bus view stays complete.
        if let Some(chunks) = &request.chunks {
            let _ = chunks.send(wire.text.clone());
        }
        Ok(wire.text)
    }
}
