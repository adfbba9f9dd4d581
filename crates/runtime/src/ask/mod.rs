//! Ask Orchestrator
//!
//! The request-scoped pipeline behind `/api/agi/ask`: intent
//! classification, planning, tool-chain execution, context assembly,
//! generation with overflow retry, cancellation, and the streamed
//! fallback.

pub mod abort;
pub mod capabilities;
pub mod http;
pub mod intent;
pub mod orchestrator;
pub mod queue;

pub use abort::{abort_pair, AbortHandle, AbortSignal};
pub use capabilities::{
    ExecutionSummary, GenerateRequest, LanguageModel, LatticeSearch, PlanOutcome, PlanRequest,
    Planner, StaticExecutor, StaticLanguageModel, StaticPlanner, StaticSearch, ToolExecutor,
};
pub use http::{
    HttpCapabilityConfig, HttpLanguageModel, HttpLatticeSearch, HttpPlanner, HttpToolExecutor,
};
pub use intent::{derive_search_queries, is_repo_grounded};
pub use orchestrator::{AskOrchestrator, AskReply, AskRequest};
pub use queue::{AskGate, AskPermit};
