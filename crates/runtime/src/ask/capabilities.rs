//! External capability seams
//!
//! The planner, tool executor, code-lattice search, and language model are
//! external collaborators. The orchestrator only sees these traits; wire
//! implementations live in [`super::http`], and the `Static*` variants back
//! tests and development mode.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{CapabilityError, KnowledgeFile, TraceId};

use super::abort::AbortSignal;

/// Planner input
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub question: String,
    pub trace_id: TraceId,
    /// Knowledge context; `None` asks the planner to work without it.
    pub knowledge: Option<Vec<KnowledgeFile>>,
}

/// Planner output
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub trace_id: TraceId,
    pub plan: serde_json::Value,
    /// Knowledge the planner pulled in on its own.
    pub knowledge: Vec<KnowledgeFile>,
}

/// Executor output
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub trace_id: TraceId,
    pub ok: bool,
    pub summary: String,
    pub artifacts: Vec<serde_json::Value>,
}

/// Language-model invocation
pub struct GenerateRequest {
    pub prompt: String,
    pub max_tokens: usize,
    pub abort: AbortSignal,
    /// Streaming sink; providers that stream push partial text here.
    pub chunks: Option<mpsc::UnboundedSender<String>>,
}

/// Decomposes a question into a tool-chain plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: PlanRequest) -> Result<PlanOutcome, CapabilityError>;
}

/// Runs a previously planned tool-chain.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        trace_id: &TraceId,
        plan: &serde_json::Value,
    ) -> Result<ExecutionSummary, CapabilityError>;
}

/// Free-text search over the code lattice.
#[async_trait]
pub trait LatticeSearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize)
        -> Result<Vec<KnowledgeFile>, CapabilityError>;
}

/// The black-box `askLocal` generation capability.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<String, CapabilityError>;
}

/// Planner that echoes the question into a one-step plan.
#[derive(Debug, Default)]
pub struct StaticPlanner;

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, request: PlanRequest) -> Result<PlanOutcome, CapabilityError> {
        Ok(PlanOutcome {
            trace_id: request.trace_id,
            plan: serde_json::json!({
                "steps": [{"tool": "lattice.answer", "question": request.question}],
            }),
            knowledge: request.knowledge.unwrap_or_default(),
        })
    }
}

/// Executor that reports the plan as executed without running anything.
#[derive(Debug, Default)]
pub struct StaticExecutor;

#[async_trait]
impl ToolExecutor for StaticExecutor {
    async fn execute(
        &self,
        trace_id: &TraceId,
        plan: &serde_json::Value,
    ) -> Result<ExecutionSummary, CapabilityError> {
        let steps = plan
            .get("steps")
            .and_then(|s| s.as_array())
            .map(|s| s.len())
            .unwrap_or(0);
        Ok(ExecutionSummary {
            trace_id: trace_id.clone(),
            ok: true,
            summary: format!("Executed {steps} planned step(s)."),
            artifacts: Vec::new(),
        })
    }
}

/// Search capability over a fixed corpus.
#[derive(Debug, Default)]
pub struct StaticSearch {
    pub corpus: Vec<KnowledgeFile>,
}

#[async_trait]
impl LatticeSearch for StaticSearch {
    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeFile>, CapabilityError> {
        let lower = query.to_lowercase();
        Ok(self
            .corpus
            .iter()
            .filter(|file| {
                file.path.to_lowercase().contains(&lower)
                    || file.preview.to_lowercase().contains(&lower)
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Language model that replies with a fixed answer after the `FINAL:`
/// marker, streaming it as one chunk.
#[derive(Debug)]
pub struct StaticLanguageModel {
    pub reply: String,
}

impl Default for StaticLanguageModel {
    fn default() -> Self {
        Self {
            reply: "The gateway is running in offline mode.".to_string(),
        }
    }
}

#[async_trait]
impl LanguageModel for StaticLanguageModel {
    async fn generate(&self, request: GenerateRequest) -> Result<String, CapabilityError> {
        if request.abort.is_aborted() {
            return Err(CapabilityError::Aborted);
        }
        if let Some(chunks) = &request.chunks {
            let _ = chunks.send(self.reply.clone());
        }
        Ok(format!("FINAL:\n{}", self.reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ask::abort::abort_pair;

    #[tokio::test]
    async fn static_planner_echoes_knowledge() {
        let planner = StaticPlanner;
        let outcome = planner
            .plan(PlanRequest {
                question: "q".into(),
                trace_id: TraceId("ask:t".into()),
                knowledge: None,
            })
            .await
            .unwrap();
        assert!(outcome.knowledge.is_empty());
        assert_eq!(outcome.plan["steps"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn static_model_streams_then_returns() {
        let model = StaticLanguageModel {
            reply: "hello".into(),
        };
        let (_handle, abort) = abort_pair();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let text = model
            .generate(GenerateRequest {
                prompt: "p".into(),
                max_tokens: 64,
                abort,
                chunks: Some(tx),
            })
            .await
            .unwrap();

        assert!(text.ends_with("hello"));
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn static_model_honors_abort() {
        let model = StaticLanguageModel::default();
        let (handle, abort) = abort_pair();
        handle.abort();

        let result = model
            .generate(GenerateRequest {
                prompt: "p".into(),
                max_tokens: 64,
                abort,
                chunks: None,
            })
            .await;
        assert!(matches!(result, Err(CapabilityError::Aborted)));
    }
}
