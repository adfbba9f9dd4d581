//! Append-only training-trace store

use chrono::Utc;
use parking_lot::RwLock;

use crate::types::{Certificate, CheckFailure, TraceId, TrainingTrace, VerdictDelta};

/// A trace record before the store assigns its sequence number.
#[derive(Debug, Clone)]
pub struct TraceDraft {
    pub trace_id: TraceId,
    pub tenant_id: Option<String>,
    pub pass: bool,
    pub deltas: Vec<VerdictDelta>,
    pub first_fail: Option<CheckFailure>,
    pub certificate: Option<Certificate>,
    pub metrics: Option<serde_json::Value>,
    pub payload: Option<serde_json::Value>,
    pub notes: Vec<String>,
}

struct TraceInner {
    next_seq: u64,
    records: Vec<TrainingTrace>,
}

/// Append-only store of training traces, exported in sequence order.
pub struct TraceStore {
    inner: RwLock<TraceInner>,
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TraceInner {
                next_seq: 0,
                records: Vec::new(),
            }),
        }
    }

    /// Append one record; sequence numbers are assigned here and never
    /// reused.
    pub fn append(&self, draft: TraceDraft) -> TrainingTrace {
        let mut inner = self.inner.write();
        inner.next_seq += 1;
        let record = TrainingTrace {
            seq: inner.next_seq,
            trace_id: draft.trace_id,
            tenant_id: draft.tenant_id,
            pass: draft.pass,
            deltas: draft.deltas,
            first_fail: draft.first_fail,
            certificate: draft.certificate,
            metrics: draft.metrics,
            payload: draft.payload,
            notes: draft.notes,
            recorded_at: Utc::now(),
        };
        inner.records.push(record.clone());
        record
    }

    /// Ordered export of records with `seq > since`, capped at `limit`.
    pub fn export_since(&self, since: u64, limit: usize) -> Vec<TrainingTrace> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|record| record.seq > since)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
