//! Helix Gateway Runtime
//!
//! The runtime behind the Helix gateway: it takes natural-language Ask
//! requests, grounds them in a retrieval corpus, optionally runs a
//! tool-chain behind a safety gate, and streams structured progress
//! events to SSE subscribers.

pub mod api;
pub mod ask;
pub mod config;
pub mod retrieval;
pub mod safety;
pub mod store;
pub mod toollog;
pub mod types;

// Re-export commonly used types
pub use api::{AppState, HttpApiServer};
pub use ask::{AskOrchestrator, AskReply, AskRequest};
pub use config::GatewayConfig;
pub use safety::SafetyGate;
pub use store::{SessionStore, TraceStore};
pub use toollog::{EventDraft, EventFilter, ToolLogBus};
pub use types::*;

use std::sync::Arc;
use std::time::Instant;

use ask::{
    HttpCapabilityConfig, HttpLanguageModel, HttpLatticeSearch, HttpPlanner, HttpToolExecutor,
    LanguageModel, LatticeSearch, Planner, StaticExecutor, StaticLanguageModel, StaticPlanner,
    StaticSearch, ToolExecutor,
};

/// External capability set injected into the orchestrator.
pub struct Capabilities {
    pub planner: Arc<dyn Planner>,
    pub executor: Arc<dyn ToolExecutor>,
    pub search: Arc<dyn LatticeSearch>,
    pub model: Arc<dyn LanguageModel>,
}

impl Capabilities {
    /// Wire capabilities from the environment: HTTP clients where
    /// `HELIX_PLANNER_URL` / `HELIX_EXECUTOR_URL` / `HELIX_LATTICE_URL` /
    /// `HELIX_MODEL_URL` are set, static stand-ins otherwise.
    pub fn from_env() -> Self {
        let planner: Arc<dyn Planner> = match HttpCapabilityConfig::from_env("HELIX_PLANNER") {
            Some(config) => Arc::new(HttpPlanner::new(config)),
            None => Arc::new(StaticPlanner),
        };
        let executor: Arc<dyn ToolExecutor> =
            match HttpCapabilityConfig::from_env("HELIX_EXECUTOR") {
                Some(config) => Arc::new(HttpToolExecutor::new(config)),
                None => Arc::new(StaticExecutor),
            };
        let search: Arc<dyn LatticeSearch> = match HttpCapabilityConfig::from_env("HELIX_LATTICE")
        {
            Some(config) => Arc::new(HttpLatticeSearch::new(config)),
            None => Arc::new(StaticSearch::default()),
        };
        let model: Arc<dyn LanguageModel> = match HttpCapabilityConfig::from_env("HELIX_MODEL") {
            Some(config) => Arc::new(HttpLanguageModel::new(config)),
            None => Arc::new(StaticLanguageModel::default()),
        };
        Self {
            planner,
            executor,
            search,
            model,
        }
    }
}

/// The assembled gateway runtime.
#[derive(Clone)]
pub struct GatewayRuntime {
    pub config: Arc<GatewayConfig>,
    pub bus: Arc<ToolLogBus>,
    pub sessions: Arc<SessionStore>,
    pub traces: Arc<TraceStore>,
    pub orchestrator: Arc<AskOrchestrator>,
    pub safety: Arc<SafetyGate>,
}

impl GatewayRuntime {
    /// Build the runtime from configuration and capabilities.
    pub fn new(config: GatewayConfig, capabilities: Capabilities) -> Result<Self, GatewayError> {
        let config = Arc::new(config);
        let bus = Arc::new(ToolLogBus::new(config.bus.clone()));
        let sessions = Arc::new(SessionStore::new());
        let traces = Arc::new(TraceStore::new());
        let safety = Arc::new(SafetyGate::new(traces.clone())?);

        let orchestrator = Arc::new(AskOrchestrator::new(
            config.ask.clone(),
            bus.clone(),
            sessions.clone(),
            capabilities.planner,
            capabilities.executor,
            capabilities.search,
            capabilities.model,
        ));

        Ok(Self {
            config,
            bus,
            sessions,
            traces,
            orchestrator,
            safety,
        })
    }

    /// Serve the HTTP API until the process exits.
    pub async fn serve(&self) -> Result<(), GatewayError> {
        let server = HttpApiServer::new(self.app_state());
        server.start().await
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            config: self.config.clone(),
            bus: self.bus.clone(),
            sessions: self.sessions.clone(),
            traces: self.traces.clone(),
            orchestrator: self.orchestrator.clone(),
            safety: self.safety.clone(),
            started_at: Instant::now(),
        }
    }

    /// Flush subscriptions and stop background work.
    pub fn shutdown(&self) {
        self.bus.shutdown();
        tracing::info!("Gateway runtime shut down");
    }
}
