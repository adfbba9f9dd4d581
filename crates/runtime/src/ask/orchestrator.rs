//! Ask orchestrator
//!
//! Drives one Ask end-to-end: interpret, plan, execute or build context
//! and generate, then emit the reply. Every stage publishes a bus event;
//! the abort flag is checked at every suspension point. A cancelled
//! generation with captured stream chunks produces a streamed-fallback
//! reply instead of an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::AskConfig;
use crate::retrieval::{
    build_prompt, decide_format, estimate_tokens, sanitize_reply, ContextBudget, PromptInputs,
};
use crate::store::SessionStore;
use crate::toollog::{EventDraft, EventFilter, ToolLogBus};
use crate::types::{
    AskError, AskMode, CapabilityError, ChatMessage, EnvelopeSection, KnowledgeFile, OwnerId,
    PromptPlan, ReplyEnvelope, ResonanceBundle, ResonanceCollapse, SessionId, ToolStage, TraceId,
};

use super::abort::{abort_pair, AbortSignal};
use super::capabilities::{
    GenerateRequest, LanguageModel, LatticeSearch, PlanOutcome, PlanRequest, Planner, ToolExecutor,
};
use super::intent::{derive_search_queries, is_repo_grounded};
use super::queue::AskGate;

/// Tool name for streamed generation chunks on the bus.
const STREAM_TOOL: &str = "helix.ask.stream";
/// Reply text for a user-stopped run.
const STOPPED_REPLY: &str = "Generation stopped.";

/// One Ask submission
#[derive(Debug, Clone, Default)]
pub struct AskRequest {
    pub question: String,
    pub owner_id: Option<OwnerId>,
    pub session_id: Option<SessionId>,
    pub trace_id: Option<TraceId>,
    pub mode: Option<AskMode>,
    pub max_tokens: Option<usize>,
    pub use_knowledge: Option<bool>,
    pub use_search_fallback: Option<bool>,
    pub debug: bool,
    pub bundle: Option<ResonanceBundle>,
    pub collapse: Option<ResonanceCollapse>,
    pub knowledge: Vec<KnowledgeFile>,
}

/// The orchestrator's answer
#[derive(Debug, Clone)]
pub struct AskReply {
    pub reply_text: String,
    pub envelope: Option<ReplyEnvelope>,
    pub sources: Vec<String>,
    pub trace_id: TraceId,
    pub debug: Option<serde_json::Value>,
    pub streamed_fallback: bool,
}

struct ActiveRun {
    handle: super::abort::AbortHandle,
    user_stopped: Arc<AtomicBool>,
}

/// Removes the active-run entry even when the request future is dropped
/// mid-flight (client disconnect).
struct ActiveGuard<'a> {
    orchestrator: &'a AskOrchestrator,
    trace: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.active.lock().remove(&self.trace);
    }
}

enum GenerationOutcome {
    Complete(String),
    Overflow(String),
    Aborted { timed_out: bool },
    Failed(String),
}

/// Request-scoped pipeline: plan, (optionally) execute, ground, generate.
pub struct AskOrchestrator {
    config: AskConfig,
    bus: Arc<ToolLogBus>,
    sessions: Arc<SessionStore>,
    planner: Arc<dyn Planner>,
    executor: Arc<dyn ToolExecutor>,
    search: Arc<dyn LatticeSearch>,
    model: Arc<dyn LanguageModel>,
    gate: AskGate,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl AskOrchestrator {
    pub fn new(
        config: AskConfig,
        bus: Arc<ToolLogBus>,
        sessions: Arc<SessionStore>,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn ToolExecutor>,
        search: Arc<dyn LatticeSearch>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let gate = AskGate::new(1, config.queue_limit);
        Self {
            config,
            bus,
            sessions,
            planner,
            executor,
            search,
            model,
            gate,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Submissions currently waiting behind the active run.
    pub fn queued(&self) -> usize {
        self.gate.queued()
    }

    /// User-initiated stop. Returns whether a matching run was active.
    pub fn stop(&self, trace_id: &TraceId) -> bool {
        let active = self.active.lock();
        match active.get(trace_id.as_str()) {
            Some(run) => {
                run.user_stopped.store(true, Ordering::SeqCst);
                run.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Process one Ask. Queued behind the active run; rejected when the
    /// queue is full.
    pub async fn ask(&self, request: AskRequest) -> Result<AskReply, AskError> {
        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(AskError::InvalidRequest(
                "question must not be empty".to_string(),
            ));
        }

        let _permit = self.gate.admit().await?;

        let trace_id = request.trace_id.clone().unwrap_or_else(TraceId::for_ask);
        let (handle, abort) = abort_pair();
        let user_stopped = Arc::new(AtomicBool::new(false));
        self.active.lock().insert(
            trace_id.as_str().to_string(),
            ActiveRun {
                handle,
                user_stopped: user_stopped.clone(),
            },
        );

        let _active = ActiveGuard {
            orchestrator: self,
            trace: trace_id.as_str().to_string(),
        };

        let started = Instant::now();
        let result = self
            .run(&request, &question, &trace_id, abort, &user_stopped)
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => self.publish(
                &trace_id,
                request.session_id.as_ref(),
                "helix.ask.end",
                ToolStage::End,
                None,
                Some(true),
                Some(duration_ms),
            ),
            Err(error) => self.publish(
                &trace_id,
                request.session_id.as_ref(),
                "helix.ask.end",
                ToolStage::End,
                Some(error.reason().to_string()),
                Some(false),
                Some(duration_ms),
            ),
        }

        result
    }

    async fn run(
        &self,
        request: &AskRequest,
        question: &str,
        trace_id: &TraceId,
        abort: AbortSignal,
        user_stopped: &Arc<AtomicBool>,
    ) -> Result<AskReply, AskError> {
        let session_id = request.session_id.as_ref();
        self.publish(
            trace_id,
            session_id,
            "helix.ask.start",
            ToolStage::Start,
            Some(question.to_string()),
            None,
            None,
        );

        let mode = request.mode.unwrap_or(self.config.mode);
        let grounded = is_repo_grounded(question);
        self.publish(
            trace_id,
            session_id,
            "helix.ask.interpret",
            ToolStage::End,
            Some(if grounded { "grounded" } else { "general" }.to_string()),
            Some(true),
            None,
        );

        let use_knowledge = request.use_knowledge.unwrap_or(true);
        let mut debug = request.debug.then(serde_json::Map::new);
        if let Some(debug) = debug.as_mut() {
            debug.insert("grounded".into(), json!(grounded));
            debug.insert("mode".into(), json!(mode.to_string()));
        }

        // Execute mode: plan (with knowledge only for grounded asks), run
        // the tool-chain, summarize.
        if mode == AskMode::Execute {
            let knowledge = (grounded && use_knowledge && !request.knowledge.is_empty())
                .then(|| request.knowledge.clone());
            let outcome = self
                .plan_with_retry(question, trace_id, session_id, knowledge, debug.as_mut())
                .await?;
            return self.execute(request, trace_id, outcome, debug.take()).await;
        }

        // Grounded / general generation path.
        let mut knowledge = request.knowledge.clone();
        if request
            .use_search_fallback
            .unwrap_or(self.config.search_fallback)
        {
            let found = self.search_lattice(question, trace_id, session_id).await;
            if let Some(debug) = debug.as_mut() {
                debug.insert("search_hits".into(), json!(found.len()));
            }
            merge_knowledge(&mut knowledge, found);
        }

        let budget = self.budget_for(request);
        let inputs = PromptInputs {
            question: question.to_string(),
            bundle: request.bundle.clone(),
            collapse: request.collapse.clone(),
            knowledge,
            require_match: grounded,
        };

        let context_started = Instant::now();
        let prompt_plan = build_prompt(&inputs, &budget);
        self.publish(
            trace_id,
            session_id,
            "helix.ask.context",
            ToolStage::End,
            Some(
                json!({
                    "sections": prompt_plan.sections.len(),
                    "sources": prompt_plan.sources.len(),
                    "remainingTokens": prompt_plan.remaining_tokens,
                })
                .to_string(),
            ),
            Some(true),
            Some(context_started.elapsed().as_millis() as u64),
        );

        // Capture the stream view from the bus; it is the single source of
        // truth for the fallback reply.
        let mut capture = self
            .bus
            .subscribe(EventFilter::for_trace(trace_id.clone()), Some(0));

        let mut overflow_retry_applied = false;
        let mut effective_plan = prompt_plan;
        let raw = loop {
            let outcome = self
                .generate_once(
                    effective_plan.render(),
                    budget.output_tokens,
                    &abort,
                    trace_id,
                    session_id,
                )
                .await;

            match outcome {
                GenerationOutcome::Complete(raw) => break raw,
                GenerationOutcome::Overflow(message) if !overflow_retry_applied => {
                    overflow_retry_applied = true;
                    let reduced = budget.reduced();
                    self.publish(
                        trace_id,
                        session_id,
                        "helix.ask.reduce-context",
                        ToolStage::End,
                        Some(format!(
                            "prompt budget reduced to {} after: {}",
                            reduced.prompt_budget, message
                        )),
                        Some(true),
                        None,
                    );
                    effective_plan = build_prompt(&inputs, &reduced);
                }
                GenerationOutcome::Overflow(message) => {
                    return Err(AskError::ContextOverflow(message));
                }
                GenerationOutcome::Aborted { timed_out } => {
                    return self.fallback_reply(
                        request,
                        trace_id,
                        &mut capture,
                        &effective_plan,
                        user_stopped,
                        timed_out,
                        debug.take(),
                        overflow_retry_applied,
                    );
                }
                GenerationOutcome::Failed(message) => {
                    return Err(AskError::GenerationFailed(message));
                }
            }
        };

        let format = decide_format(question);
        let reply_text = sanitize_reply(&raw, question, format.stage_tags());

        if let Some(debug) = debug.as_mut() {
            let prompt_tokens = estimate_tokens(&effective_plan.render());
            let claim_gate_ratio = if inputs.knowledge.is_empty() {
                1.0
            } else {
                effective_plan.sources.len() as f64 / inputs.knowledge.len() as f64
            };
            debug.insert("overflow_retry_applied".into(), json!(overflow_retry_applied));
            debug.insert("prompt_tokens".into(), json!(prompt_tokens));
            debug.insert(
                "remaining_tokens".into(),
                json!(effective_plan.remaining_tokens),
            );
            debug.insert("selected_sources".into(), json!(effective_plan.sources));
            debug.insert("claim_gate_ratio".into(), json!(claim_gate_ratio));
            debug.insert("queued".into(), json!(self.gate.queued()));
        }

        let envelope = (!reply_text.is_empty()).then(|| {
            let mut sections = vec![EnvelopeSection::answer(reply_text.clone())];
            if !effective_plan.sources.is_empty() {
                sections.push(EnvelopeSection::details(effective_plan.sources.join("\n")));
            }
            ReplyEnvelope {
                sections,
                ..Default::default()
            }
        });

        let reply = AskReply {
            reply_text: reply_text.clone(),
            envelope,
            sources: effective_plan.sources.clone(),
            trace_id: trace_id.clone(),
            debug: debug.map(serde_json::Value::Object),
            streamed_fallback: false,
        };
        self.persist_exchange(request, question, &reply_text);
        Ok(reply)
    }

    async fn execute(
        &self,
        request: &AskRequest,
        trace_id: &TraceId,
        plan: PlanOutcome,
        debug: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<AskReply, AskError> {
        let session_id = request.session_id.as_ref();
        let started = Instant::now();

        let result = tokio::time::timeout(
            self.config.execute_timeout,
            self.executor.execute(&plan.trace_id, &plan.plan),
        )
        .await;

        let summary = match result {
            Ok(Ok(summary)) => summary,
            Ok(Err(error)) => return Err(AskError::ExecuteFailed(error.to_string())),
            Err(_) => {
                return Err(AskError::ExecuteFailed(format!(
                    "executor timed out after {:?}",
                    self.config.execute_timeout
                )))
            }
        };

        self.publish(
            trace_id,
            session_id,
            "helix.ask.execute",
            ToolStage::End,
            Some(summary.summary.clone()),
            Some(summary.ok),
            Some(started.elapsed().as_millis() as u64),
        );

        let reply = AskReply {
            reply_text: summary.summary.clone(),
            envelope: None,
            sources: Vec::new(),
            trace_id: trace_id.clone(),
            debug: debug.map(serde_json::Value::Object),
            streamed_fallback: false,
        };
        self.persist_exchange(request, &request.question, &summary.summary);
        Ok(reply)
    }

    async fn plan_with_retry(
        &self,
        question: &str,
        trace_id: &TraceId,
        session_id: Option<&SessionId>,
        knowledge: Option<Vec<KnowledgeFile>>,
        mut debug: Option<&mut serde_json::Map<String, serde_json::Value>>,
    ) -> Result<PlanOutcome, AskError> {
        let had_knowledge = knowledge.is_some();
        let first = self
            .call_planner(question, trace_id, knowledge)
            .await;

        let outcome = match first {
            Ok(outcome) => outcome,
            Err(error) if had_knowledge && error.is_knowledge_rejection() => {
                // Exactly one retry, without knowledge context.
                self.publish(
                    trace_id,
                    session_id,
                    "helix.ask.plan-retry",
                    ToolStage::Start,
                    Some(error.to_string()),
                    None,
                    None,
                );
                if let Some(debug) = debug.as_deref_mut() {
                    debug.insert("plan_retry_without_knowledge".into(), json!(true));
                }
                self.call_planner(question, trace_id, None)
                    .await
                    .map_err(|e| AskError::PlanFailed(e.to_string()))?
            }
            Err(error) => return Err(AskError::PlanFailed(error.to_string())),
        };

        self.publish(
            trace_id,
            session_id,
            "helix.ask.plan",
            ToolStage::End,
            None,
            Some(true),
            None,
        );
        Ok(outcome)
    }

    async fn call_planner(
        &self,
        question: &str,
        trace_id: &TraceId,
        knowledge: Option<Vec<KnowledgeFile>>,
    ) -> Result<PlanOutcome, CapabilityError> {
        let request = PlanRequest {
            question: question.to_string(),
            trace_id: trace_id.clone(),
            knowledge,
        };
        match tokio::time::timeout(self.config.plan_timeout, self.planner.plan(request)).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout(self.config.plan_timeout)),
        }
    }

    async fn search_lattice(
        &self,
        question: &str,
        trace_id: &TraceId,
        session_id: Option<&SessionId>,
    ) -> Vec<KnowledgeFile> {
        let queries = derive_search_queries(question, self.config.search_query_limit);
        let mut found: Vec<KnowledgeFile> = Vec::new();

        for query in &queries {
            let result = tokio::time::timeout(
                self.config.context_timeout,
                self.search.search(query, self.config.context_files),
            )
            .await;
            match result {
                Ok(Ok(files)) => merge_knowledge(&mut found, files),
                Ok(Err(error)) => {
                    tracing::warn!(%query, "Lattice search failed: {error}");
                }
                Err(_) => {
                    tracing::warn!(%query, "Lattice search timed out");
                }
            }
        }

        self.publish(
            trace_id,
            session_id,
            "helix.ask.search",
            ToolStage::End,
            Some(format!("{} file(s) from {} quer(ies)", found.len(), queries.len())),
            Some(true),
            None,
        );
        found
    }

    async fn generate_once(
        &self,
        prompt: String,
        max_tokens: usize,
        abort: &AbortSignal,
        trace_id: &TraceId,
        session_id: Option<&SessionId>,
    ) -> GenerationOutcome {
        // Chunks flow through the bus so every observer (and the fallback
        // path) sees the same stream.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let bus = self.bus.clone();
        let chunk_trace = trace_id.clone();
        let chunk_session = session_id.cloned();
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                let mut draft =
                    EventDraft::new(STREAM_TOOL, ToolStage::Chunk).trace(chunk_trace.clone());
                if let Some(session) = &chunk_session {
                    draft = draft.session(session.clone());
                }
                bus.publish(draft.text(chunk));
            }
        });

        let request = GenerateRequest {
            prompt,
            max_tokens,
            abort: abort.clone(),
            chunks: Some(tx),
        };
        let generated = tokio::time::timeout(self.config.generate_timeout, async {
            tokio::select! {
                result = self.model.generate(request) => Some(result),
                _ = abort.aborted() => None,
            }
        })
        .await;

        // The request (and its sender) is gone by now; wait for the
        // forwarder so captured chunks are on the bus before we return.
        let _ = forwarder.await;

        match generated {
            Err(_) => GenerationOutcome::Aborted { timed_out: true },
            Ok(None) => GenerationOutcome::Aborted { timed_out: false },
            Ok(Some(Ok(raw))) => GenerationOutcome::Complete(raw),
            Ok(Some(Err(CapabilityError::Aborted))) => {
                GenerationOutcome::Aborted { timed_out: false }
            }
            Ok(Some(Err(error))) if error.is_context_overflow() => {
                GenerationOutcome::Overflow(error.to_string())
            }
            Ok(Some(Err(error))) => GenerationOutcome::Failed(error.to_string()),
        }
    }

    /// Compose the reply for a cancelled generation.
    #[allow(clippy::too_many_arguments)]
    fn fallback_reply(
        &self,
        request: &AskRequest,
        trace_id: &TraceId,
        capture: &mut crate::toollog::Subscription,
        prompt_plan: &PromptPlan,
        user_stopped: &Arc<AtomicBool>,
        timed_out: bool,
        mut debug: Option<serde_json::Map<String, serde_json::Value>>,
        overflow_retry_applied: bool,
    ) -> Result<AskReply, AskError> {
        let mut streamed = String::new();
        while let Some(event) = capture.try_recv() {
            if event.tool == STREAM_TOOL && event.stage == ToolStage::Chunk {
                if let Some(text) = event.text {
                    streamed.push_str(&text);
                }
            }
        }

        let stopped_by_user = user_stopped.load(Ordering::SeqCst);
        if !stopped_by_user && !streamed.is_empty() {
            if let Some(debug) = debug.as_mut() {
                debug.insert("overflow_retry_applied".into(), json!(overflow_retry_applied));
                debug.insert("streamed_fallback".into(), json!(true));
            }
            let reply_text = streamed.trim().to_string();
            self.persist_exchange(request, &request.question, &reply_text);
            return Ok(AskReply {
                reply_text,
                envelope: None,
                sources: prompt_plan.sources.clone(),
                trace_id: trace_id.clone(),
                debug: debug.map(serde_json::Value::Object),
                streamed_fallback: true,
            });
        }

        if timed_out && !stopped_by_user {
            return Err(AskError::GenerationFailed(format!(
                "generation timed out after {:?}",
                self.config.generate_timeout
            )));
        }

        // Cancellation is not an error.
        Ok(AskReply {
            reply_text: STOPPED_REPLY.to_string(),
            envelope: None,
            sources: Vec::new(),
            trace_id: trace_id.clone(),
            debug: debug.map(serde_json::Value::Object),
            streamed_fallback: false,
        })
    }

    fn budget_for(&self, request: &AskRequest) -> ContextBudget {
        let mut config = self.config.clone();
        if let Some(max_tokens) = request.max_tokens {
            config.output_tokens = max_tokens.min(config.context_tokens);
        }
        ContextBudget::from_config(&config)
    }

    fn persist_exchange(&self, request: &AskRequest, question: &str, reply: &str) {
        let (Some(owner), Some(session_id)) = (&request.owner_id, &request.session_id) else {
            return;
        };
        let appended = self
            .sessions
            .append_message(owner, session_id, ChatMessage::user(question))
            .and_then(|_| {
                self.sessions
                    .append_message(owner, session_id, ChatMessage::assistant(reply))
            });
        if let Err(error) = appended {
            tracing::warn!(session = %session_id, "Failed to persist ask exchange: {error}");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn publish(
        &self,
        trace_id: &TraceId,
        session_id: Option<&SessionId>,
        tool: &str,
        stage: ToolStage,
        text: Option<String>,
        ok: Option<bool>,
        duration_ms: Option<u64>,
    ) {
        let mut draft = EventDraft::new(tool, stage).trace(trace_id.clone());
        if let Some(session) = session_id {
            draft = draft.session(session.clone());
        }
        draft.text = text;
        draft.ok = ok;
        draft.duration_ms = duration_ms;
        self.bus.publish(draft);
    }
}

/// Merge new files into the working set, de-duplicating by path.
fn merge_knowledge(into: &mut Vec<KnowledgeFile>, from: Vec<KnowledgeFile>) {
    for file in from {
        if !into.iter().any(|existing| existing.path == file.path) {
            into.push(file);
        }
    }
}
