//! Constraint packs
//!
//! Named sets of quantitative checks evaluated against run telemetry.
//! The registry is parsed once at startup from the embedded definitions
//! and never mutated afterwards. HARD failures veto execution; SOFT
//! failures only show up in the delta record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{SafetyError, Severity};

/// Embedded pack definitions.
const DEFAULT_PACKS_YAML: &str = r#"
packs:
  - id: repo-convergence
    label: Repository convergence
    checks:
      - key: open_drift_findings
        op: "<="
        threshold: 0
        severity: HARD
      - key: spec_coverage_ratio
        op: ">="
        threshold: 0.85
        severity: SOFT
      - key: failing_check_count
        op: "=="
        threshold: 0
        severity: HARD

  - id: tool-use-budget
    label: Tool-use budget
    checks:
      - key: tool_calls_total
        op: "<="
        threshold: 120
        severity: HARD
      - key: tool_failure_ratio
        op: "<="
        threshold: 0.2
        severity: SOFT
      - key: wall_clock_ms
        op: "<"
        threshold: 600000
        severity: SOFT

  - id: audit-safety
    label: Audit safety
    checks:
      - key: unresolved_criticals
        op: "=="
        threshold: 0
        severity: HARD
      - key: audit_gap_ms
        op: "<="
        threshold: 5000
        severity: SOFT
      - key: checksum_algo_id
        op: "!="
        threshold: 0
        severity: HARD
"#;

/// Comparison operator of a metric check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckOp {
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CheckOp {
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            CheckOp::Le => value <= threshold,
            CheckOp::Lt => value < threshold,
            CheckOp::Ge => value >= threshold,
            CheckOp::Gt => value > threshold,
            CheckOp::Eq => value == threshold,
            CheckOp::Ne => value != threshold,
        }
    }
}

impl std::fmt::Display for CheckOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            CheckOp::Le => "<=",
            CheckOp::Lt => "<",
            CheckOp::Ge => ">=",
            CheckOp::Gt => ">",
            CheckOp::Eq => "==",
            CheckOp::Ne => "!=",
        };
        write!(f, "{symbol}")
    }
}

/// One metric check inside a pack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricCheck {
    pub key: String,
    pub op: CheckOp,
    pub threshold: f64,
    pub severity: Severity,
}

/// A named constraint pack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintPack {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub checks: Vec<MetricCheck>,
}

#[derive(Debug, Deserialize)]
struct PackFile {
    packs: Vec<ConstraintPack>,
}

/// Immutable registry of constraint packs, loaded once at startup.
pub struct ConstraintPackRegistry {
    packs: HashMap<String, ConstraintPack>,
}

impl ConstraintPackRegistry {
    /// Parse the embedded pack definitions.
    pub fn builtin() -> Result<Self, SafetyError> {
        Self::from_yaml(DEFAULT_PACKS_YAML)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, SafetyError> {
        let file: PackFile = serde_yaml::from_str(yaml)
            .map_err(|e| SafetyError::InvalidPack(format!("failed to parse packs: {e}")))?;

        let mut packs = HashMap::new();
        for pack in file.packs {
            if pack.checks.is_empty() {
                return Err(SafetyError::InvalidPack(format!(
                    "pack {} declares no checks",
                    pack.id
                )));
            }
            packs.insert(pack.id.clone(), pack);
        }
        Ok(Self { packs })
    }

    pub fn get(&self, id: &str) -> Result<&ConstraintPack, SafetyError> {
        self.packs.get(id).ok_or_else(|| SafetyError::UnknownPack {
            id: id.to_string(),
        })
    }

    /// Pack ids in sorted order.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.packs.keys().map(String::as_str).collect();
        ids.sort();
        ids
    }
}

/// Merge request-supplied telemetry over auto-collected values.
///
/// Auto-collection reads `HELIX_METRIC_<KEY>` environment variables and,
/// when `HELIX_REPORTS_DIR` points at a directory, the top-level numeric
/// fields of every `*.json` report in it.
pub fn collect_telemetry(supplied: Option<&HashMap<String, f64>>) -> HashMap<String, f64> {
    let mut telemetry = HashMap::new();

    if let Ok(dir) = std::env::var("HELIX_REPORTS_DIR") {
        if let Ok(entries) = std::fs::read_dir(&dir) {
            let mut paths: Vec<_> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            paths.sort();
            for path in paths {
                let Ok(raw) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
                    tracing::warn!("Skipping unparseable report {}", path.display());
                    continue;
                };
                if let Some(map) = value.as_object() {
                    for (key, field) in map {
                        if let Some(number) = field.as_f64() {
                            telemetry.insert(key.clone(), number);
                        }
                    }
                }
            }
        }
    }

    for (name, raw) in std::env::vars() {
        if let Some(key) = name.strip_prefix("HELIX_METRIC_") {
            if let Ok(number) = raw.parse::<f64>() {
                telemetry.insert(key.to_lowercase(), number);
            }
        }
    }

    if let Some(supplied) = supplied {
        for (key, value) in supplied {
            telemetry.insert(key.clone(), *value);
        }
    }

    telemetry
}
