//! Adapter safety gate
//!
//! Pre-flight verdict engine for adapter runs. Actions that try to reach
//! actuators are rejected outright; quantitative robotics and constraint
//! checks then decide GREEN or RED before any execution artifact exists.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::store::{TraceDraft, TraceStore};
use crate::types::{
    Certificate, CertificateStatus, CheckFailure, DeltaChange, RunId, SafetyError, Severity,
    TraceId, Verdict, VerdictDelta,
};

use super::certificate::build_certificate;
use super::packs::{collect_telemetry, ConstraintPackRegistry};

/// One action proposed by an adapter run.
///
/// Actions declare intent only; direct motor or actuator commands are a
/// controller-boundary violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterAction {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Quantitative robotics-safety inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoboticsSafetyInput {
    pub collision_margin: f64,
    pub collision_margin_min: f64,
    pub torque_usage: f64,
    pub torque_usage_max: f64,
    pub speed_usage: f64,
    pub speed_usage_max: f64,
    pub stability_margin: f64,
    pub stability_margin_min: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_ok: Option<bool>,
}

/// A structured adapter-run request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterRunRequest {
    #[serde(default)]
    pub trace_id: Option<String>,
    pub actions: Vec<AdapterAction>,
    #[serde(default)]
    pub premeditation: Option<serde_json::Value>,
    #[serde(default)]
    pub robotics_safety: Option<RoboticsSafetyInput>,
    #[serde(default)]
    pub constraint_pack_id: Option<String>,
    #[serde(default)]
    pub telemetry: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub overrides: Option<serde_json::Value>,
}

/// Wire-level run verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunVerdict {
    Pass,
    Fail,
}

/// Final gate outcome handed back to the route layer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterRunOutcome {
    pub trace_id: TraceId,
    pub run_id: RunId,
    pub verdict: RunVerdict,
    pub pass: bool,
    pub first_fail: Option<CheckFailure>,
    pub deltas: Vec<VerdictDelta>,
    pub certificate: Option<Certificate>,
    pub artifacts: Vec<serde_json::Value>,
}

fn actuation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)motor|actuat").unwrap())
}

fn param_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)motor|torque|servo").unwrap())
}

struct CheckOutcome {
    id: String,
    value: f64,
    limit: f64,
    severity: Severity,
    ok: bool,
}

impl CheckOutcome {
    fn delta(&self, previous: Option<f64>) -> VerdictDelta {
        VerdictDelta {
            key: self.id.clone(),
            from: previous,
            to: self.value,
            delta: self.value - previous.unwrap_or(self.limit),
            change: if previous.is_some() {
                DeltaChange::Modified
            } else {
                DeltaChange::Added
            },
        }
    }

    fn failure(&self) -> CheckFailure {
        CheckFailure {
            id: self.id.clone(),
            severity: self.severity,
            status: "fail".to_string(),
            value: self.value,
            limit: self.limit,
            note: None,
        }
    }
}

fn verdict_from_checks(
    mode: &str,
    checks: Vec<CheckOutcome>,
    integrity_ok: bool,
) -> Verdict {
    let first_fail = checks
        .iter()
        .find(|check| !check.ok && check.severity == Severity::Hard)
        .map(CheckOutcome::failure);
    let pass = first_fail.is_none();

    let payload = json!(checks
        .iter()
        .map(|check| {
            json!({
                "id": check.id,
                "value": check.value,
                "limit": check.limit,
                "ok": check.ok,
            })
        })
        .collect::<Vec<_>>());
    let status = if pass {
        CertificateStatus::Green
    } else {
        CertificateStatus::Red
    };
    let certificate = build_certificate(mode, &payload, status, integrity_ok);

    Verdict {
        pass,
        first_fail,
        deltas: checks.iter().map(|check| check.delta(None)).collect(),
        certificate,
    }
}

/// The pre-flight verdict engine.
pub struct SafetyGate {
    packs: ConstraintPackRegistry,
    traces: Arc<TraceStore>,
}

impl SafetyGate {
    pub fn new(traces: Arc<TraceStore>) -> Result<Self, SafetyError> {
        Ok(Self {
            packs: ConstraintPackRegistry::builtin()?,
            traces,
        })
    }

    pub fn with_registry(packs: ConstraintPackRegistry, traces: Arc<TraceStore>) -> Self {
        Self { packs, traces }
    }

    /// Reject any action that issues, or smuggles parameters for, a direct
    /// motor or actuator command.
    pub fn check_forbidden_actuation(actions: &[AdapterAction]) -> Result<(), SafetyError> {
        for action in actions {
            if actuation_re().is_match(&action.kind) {
                return Err(SafetyError::ControllerBoundaryViolation {
                    action_id: action.id.clone(),
                    reason: format!("kind {:?} addresses an actuator", action.kind),
                });
            }
            if let Some(label) = &action.label {
                if actuation_re().is_match(label) {
                    return Err(SafetyError::ControllerBoundaryViolation {
                        action_id: action.id.clone(),
                        reason: format!("label {label:?} addresses an actuator"),
                    });
                }
            }
            for key in action.params.keys() {
                if param_key_re().is_match(key) {
                    return Err(SafetyError::ControllerBoundaryViolation {
                        action_id: action.id.clone(),
                        reason: format!("param {key:?} carries an actuation command"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Evaluate the four HARD robotics checks in their fixed order.
    pub fn evaluate_robotics(&self, input: &RoboticsSafetyInput) -> Verdict {
        let checks = vec![
            CheckOutcome {
                id: "ROBOTICS_SAFETY_COLLISION_MARGIN".to_string(),
                value: input.collision_margin,
                limit: input.collision_margin_min,
                severity: Severity::Hard,
                ok: input.collision_margin >= input.collision_margin_min,
            },
            CheckOutcome {
                id: "ROBOTICS_SAFETY_TORQUE_USAGE".to_string(),
                value: input.torque_usage,
                limit: input.torque_usage_max,
                severity: Severity::Hard,
                ok: input.torque_usage <= input.torque_usage_max,
            },
            CheckOutcome {
                id: "ROBOTICS_SAFETY_SPEED_USAGE".to_string(),
                value: input.speed_usage,
                limit: input.speed_usage_max,
                severity: Severity::Hard,
                ok: input.speed_usage <= input.speed_usage_max,
            },
            CheckOutcome {
                id: "ROBOTICS_SAFETY_STABILITY_MARGIN".to_string(),
                value: input.stability_margin,
                limit: input.stability_margin_min,
                severity: Severity::Hard,
                ok: input.stability_margin >= input.stability_margin_min,
            },
        ];

        verdict_from_checks(
            "robotics-safety",
            checks,
            input.integrity_ok.unwrap_or(true),
        )
    }

    /// Evaluate a named constraint pack against the merged telemetry.
    pub fn evaluate_pack(
        &self,
        pack_id: &str,
        telemetry: &HashMap<String, f64>,
    ) -> Result<Verdict, SafetyError> {
        let pack = self.packs.get(pack_id)?;

        let mut checks = Vec::with_capacity(pack.checks.len());
        for check in &pack.checks {
            let value = telemetry
                .get(&check.key)
                .copied()
                .ok_or_else(|| SafetyError::TelemetryMissing {
                    key: check.key.clone(),
                })?;
            checks.push(CheckOutcome {
                id: check.key.clone(),
                value,
                limit: check.threshold,
                severity: check.severity,
                ok: check.op.evaluate(value, check.threshold),
            });
        }

        Ok(verdict_from_checks(pack_id, checks, true))
    }

    /// Run the full pre-flight pipeline for an adapter request.
    ///
    /// A controller-boundary violation aborts before any record exists; a
    /// completed evaluation (pass or veto) always appends one training
    /// trace.
    pub fn run(&self, request: &AdapterRunRequest) -> Result<AdapterRunOutcome, SafetyError> {
        Self::check_forbidden_actuation(&request.actions)?;

        let trace_id = request
            .trace_id
            .clone()
            .map(TraceId)
            .unwrap_or_else(TraceId::for_ask);
        let run_id = RunId::new();

        let mut deltas: Vec<VerdictDelta> = Vec::new();
        let mut first_fail: Option<CheckFailure> = None;
        let mut certificate: Option<Certificate> = None;
        let mut notes: Vec<String> = Vec::new();

        if let Some(robotics) = &request.robotics_safety {
            let verdict = self.evaluate_robotics(robotics);
            deltas.extend(verdict.deltas.iter().cloned());
            certificate = Some(verdict.certificate.clone());
            if !verdict.pass {
                first_fail = verdict.first_fail.clone();
                notes.push("robotics safety veto".to_string());
            }
        }

        if first_fail.is_none() {
            if let Some(pack_id) = &request.constraint_pack_id {
                let telemetry = collect_telemetry(request.telemetry.as_ref());
                let verdict = self.evaluate_pack(pack_id, &telemetry)?;
                deltas.extend(verdict.deltas.iter().cloned());
                if certificate.is_none() {
                    certificate = Some(verdict.certificate.clone());
                }
                if !verdict.pass {
                    first_fail = verdict.first_fail.clone();
                    notes.push(format!("constraint pack {pack_id} veto"));
                }
            }
        }

        let pass = first_fail.is_none();
        let artifacts = if pass {
            vec![json!({
                "kind": "adapter-plan",
                "actionCount": request.actions.len(),
                "premeditated": request.premeditation.is_some(),
            })]
        } else {
            Vec::new()
        };

        self.traces.append(TraceDraft {
            trace_id: trace_id.clone(),
            tenant_id: request.tenant_id.clone(),
            pass,
            deltas: deltas.clone(),
            first_fail: first_fail.clone(),
            certificate: certificate.clone(),
            metrics: request
                .telemetry
                .as_ref()
                .map(|t| json!(t)),
            payload: request.premeditation.clone(),
            notes,
        });

        if pass {
            tracing::info!(trace_id = %trace_id, "Adapter run cleared the safety gate");
        } else {
            tracing::warn!(
                trace_id = %trace_id,
                reason = first_fail.as_ref().map(|f| f.id.as_str()).unwrap_or("unknown"),
                "Adapter run vetoed"
            );
        }

        Ok(AdapterRunOutcome {
            trace_id,
            run_id,
            verdict: if pass { RunVerdict::Pass } else { RunVerdict::Fail },
            pass,
            first_fail,
            deltas,
            certificate,
            artifacts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> (SafetyGate, Arc<TraceStore>) {
        let traces = Arc::new(TraceStore::new());
        (SafetyGate::new(traces.clone()).unwrap(), traces)
    }

    fn action(kind: &str) -> AdapterAction {
        AdapterAction {
            id: "a".to_string(),
            kind: kind.to_string(),
            label: None,
            params: serde_json::Map::new(),
        }
    }

    fn failing_robotics() -> RoboticsSafetyInput {
        RoboticsSafetyInput {
            collision_margin: 0.01,
            collision_margin_min: 0.05,
            torque_usage: 0.7,
            torque_usage_max: 0.8,
            speed_usage: 0.6,
            speed_usage_max: 0.9,
            stability_margin: 0.4,
            stability_margin_min: 0.3,
            integrity_ok: None,
        }
    }

    #[test]
    fn motor_kind_is_a_boundary_violation_with_no_trace_row() {
        let (gate, traces) = gate();
        let mut forbidden = action("motor.spin");
        forbidden
            .params
            .insert("torque".to_string(), serde_json::json!(1.0));

        let request = AdapterRunRequest {
            trace_id: None,
            actions: vec![forbidden],
            premeditation: None,
            robotics_safety: None,
            constraint_pack_id: None,
            telemetry: None,
            tenant_id: None,
            overrides: None,
        };

        assert!(matches!(
            gate.run(&request),
            Err(SafetyError::ControllerBoundaryViolation { .. })
        ));
        assert!(traces.is_empty());
    }

    #[test]
    fn param_keys_are_checked_even_on_benign_kinds() {
        let mut benign = action("navigate.path");
        benign
            .params
            .insert("servoAngle".to_string(), serde_json::json!(30));
        assert!(SafetyGate::check_forbidden_actuation(&[benign]).is_err());

        let clean = action("navigate.path");
        assert!(SafetyGate::check_forbidden_actuation(&[clean]).is_ok());
    }

    #[test]
    fn collision_margin_fails_first_and_certificate_goes_red() {
        let (gate, traces) = gate();
        let request = AdapterRunRequest {
            trace_id: Some("ask:s4".to_string()),
            actions: vec![action("plan.move")],
            premeditation: None,
            robotics_safety: Some(failing_robotics()),
            constraint_pack_id: None,
            telemetry: None,
            tenant_id: None,
            overrides: None,
        };

        let outcome = gate.run(&request).unwrap();
        assert_eq!(outcome.verdict, RunVerdict::Fail);
        assert!(!outcome.pass);
        assert_eq!(
            outcome.first_fail.as_ref().unwrap().id,
            "ROBOTICS_SAFETY_COLLISION_MARGIN"
        );
        let certificate = outcome.certificate.unwrap();
        assert_eq!(certificate.status, CertificateStatus::Red);
        assert!(outcome.artifacts.is_empty());

        let rows = traces.export_since(0, 10);
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].pass);
    }

    #[test]
    fn passing_robotics_yields_green_and_one_artifact() {
        let (gate, traces) = gate();
        let mut input = failing_robotics();
        input.collision_margin = 0.5;

        let request = AdapterRunRequest {
            trace_id: None,
            actions: vec![action("plan.move")],
            premeditation: Some(serde_json::json!({"goal": "dock"})),
            robotics_safety: Some(input),
            constraint_pack_id: None,
            telemetry: None,
            tenant_id: None,
            overrides: None,
        };

        let outcome = gate.run(&request).unwrap();
        assert!(outcome.pass);
        assert_eq!(outcome.certificate.unwrap().status, CertificateStatus::Green);
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(traces.len(), 1);
        assert!(traces.export_since(0, 1)[0].pass);
    }

    #[test]
    fn robotics_verdict_is_deterministic() {
        let (gate, _) = gate();
        let input = failing_robotics();
        let a = gate.evaluate_robotics(&input);
        let b = gate.evaluate_robotics(&input);
        assert_eq!(a.certificate.certificate_hash, b.certificate.certificate_hash);
        assert_eq!(a.certificate.certificate_id, b.certificate.certificate_id);
        assert_eq!(
            a.first_fail.as_ref().unwrap().id,
            b.first_fail.as_ref().unwrap().id
        );
        assert_eq!(a.deltas.len(), b.deltas.len());
    }

    #[test]
    fn soft_pack_failures_do_not_veto() {
        let (gate, _) = gate();
        let mut telemetry = HashMap::new();
        telemetry.insert("tool_calls_total".to_string(), 50.0);
        telemetry.insert("tool_failure_ratio".to_string(), 0.5); // SOFT fail
        telemetry.insert("wall_clock_ms".to_string(), 1_000.0);

        let verdict = gate.evaluate_pack("tool-use-budget", &telemetry).unwrap();
        assert!(verdict.pass);
        assert_eq!(verdict.deltas.len(), 3);
    }

    #[test]
    fn hard_pack_failures_veto_with_first_fail() {
        let (gate, _) = gate();
        let mut telemetry = HashMap::new();
        telemetry.insert("tool_calls_total".to_string(), 500.0); // HARD fail
        telemetry.insert("tool_failure_ratio".to_string(), 0.0);
        telemetry.insert("wall_clock_ms".to_string(), 1_000.0);

        let verdict = gate.evaluate_pack("tool-use-budget", &telemetry).unwrap();
        assert!(!verdict.pass);
        assert_eq!(verdict.first_fail.unwrap().id, "tool_calls_total");
    }

    #[test]
    fn custom_registry_packs_are_evaluated() {
        let registry = super::super::packs::ConstraintPackRegistry::from_yaml(
            "packs:\n  - id: smoke\n    checks:\n      - key: latency_ms\n        op: \"<\"\n        threshold: 100\n        severity: HARD\n",
        )
        .unwrap();
        let gate = SafetyGate::with_registry(registry, Arc::new(TraceStore::new()));

        let mut telemetry = HashMap::new();
        telemetry.insert("latency_ms".to_string(), 250.0);
        let verdict = gate.evaluate_pack("smoke", &telemetry).unwrap();
        assert!(!verdict.pass);
    }

    #[test]
    fn missing_telemetry_is_reported_by_key() {
        let (gate, _) = gate();
        let telemetry = HashMap::new();
        assert!(matches!(
            gate.evaluate_pack("audit-safety", &telemetry),
            Err(SafetyError::TelemetryMissing { .. })
        ));
    }
}
