//! Prompt assembly
//!
//! Lays the selected evidence into sections, clips everything to the token
//! budget, and derives the stable citation list. Section order is fixed:
//! resonance patch, knowledge projects, instruction block.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{
    KnowledgeFile, PromptPlan, PromptSection, ResonanceBundle, ResonanceCollapse, ResonancePatch,
};

use super::query::{derive_query, estimate_tokens};
use super::scoring::{select_files, select_patch, ScoredFile};
use super::ContextBudget;

/// Citation list cap.
const MAX_SOURCES: usize = 12;

/// Shape the model is asked to answer in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerFormat {
    /// Numbered steps tagged with scientific-method stages.
    StagedSteps,
    /// Numbered steps, no stage tags.
    Steps,
    /// Side-by-side comparison.
    Compare,
    /// One short paragraph.
    Brief,
}

impl AnswerFormat {
    /// Whether replies in this format carry stage tags.
    pub fn stage_tags(&self) -> bool {
        matches!(self, AnswerFormat::StagedSteps)
    }
}

fn method_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"scientific method|methodology|\bmethod\b").unwrap())
}

fn steps_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bsteps?\b|step by step|walk me through|\bprocedure\b|\bhow do i\b").unwrap()
    })
}

fn compare_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\bcompare\b|\bversus\b|\bvs\b|\bdifference\b|\bbetter\b|\bworse\b|\badvantages\b|what is|what's|why is|how is",
        )
        .unwrap()
    })
}

/// Decide the answer format from the question text.
pub fn decide_format(question: &str) -> AnswerFormat {
    let lower = question.to_lowercase();
    if method_re().is_match(&lower) {
        AnswerFormat::StagedSteps
    } else if steps_re().is_match(&lower) {
        AnswerFormat::Steps
    } else if compare_re().is_match(&lower) {
        AnswerFormat::Compare
    } else {
        AnswerFormat::Brief
    }
}

/// Everything the builder consumes for one prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub question: String,
    pub bundle: Option<ResonanceBundle>,
    pub collapse: Option<ResonanceCollapse>,
    pub knowledge: Vec<KnowledgeFile>,
    /// Require a positive score for knowledge files to qualify.
    pub require_match: bool,
}

fn render_file(index: usize, path: &str, preview: &str, clip: usize) -> String {
    let clipped: String = preview.chars().take(clip).collect();
    format!("({}) {}\n{}", index, path, clipped)
}

fn instruction_section(format: AnswerFormat) -> PromptSection {
    let shape = match format {
        AnswerFormat::StagedSteps => {
            "Answer in numbered steps. Tag each step with one of (observe|hypothesis|experiment|analysis|explain)."
        }
        AnswerFormat::Steps => "Answer in numbered steps. Do not include stage tags.",
        AnswerFormat::Compare => "Answer as a short comparison of the alternatives.",
        AnswerFormat::Brief => "Answer in one short paragraph.",
    };
    PromptSection {
        title: "Instructions:".to_string(),
        body: format!(
            "Use only the evidence above.\n{shape}\nWrite the final answer after a line starting with FINAL:"
        ),
    }
}

fn section_tokens(section: &PromptSection) -> usize {
    estimate_tokens(&section.title) + estimate_tokens(&section.body)
}

/// Append rendered files to a section body while the budget holds.
///
/// Returns the paths that made it in. The last entry may be clipped at a
/// character boundary when only part of it fits.
fn fill_section(
    title: &str,
    entries: &[(String, String)],
    clip: usize,
    remaining_tokens: usize,
) -> Option<(PromptSection, Vec<String>, usize)> {
    let title_tokens = estimate_tokens(title);
    if title_tokens >= remaining_tokens {
        return None;
    }

    let mut body = String::new();
    let mut used_paths = Vec::new();
    let mut used_tokens = title_tokens;

    for (index, (path, preview)) in entries.iter().enumerate() {
        let rendered = render_file(index + 1, path, preview, clip);
        let cost = estimate_tokens(&rendered) + 1;
        let left = remaining_tokens - used_tokens;

        if cost <= left {
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str(&rendered);
            used_tokens += cost;
            used_paths.push(path.clone());
        } else {
            // Partial fit: trim the preview at a character boundary.
            let header = format!("({}) {}\n", index + 1, path);
            let header_tokens = estimate_tokens(&header) + 1;
            if header_tokens < left {
                let keep_chars = (left - header_tokens) * 4;
                let trimmed: String = preview.chars().take(keep_chars.min(clip)).collect();
                if !trimmed.is_empty() {
                    if !body.is_empty() {
                        body.push_str("\n\n");
                    }
                    body.push_str(&header);
                    body.push_str(&trimmed);
                    used_tokens = remaining_tokens;
                    used_paths.push(path.clone());
                }
            }
            break;
        }
    }

    if used_paths.is_empty() {
        return None;
    }
    Some((
        PromptSection {
            title: title.to_string(),
            body,
        },
        used_paths,
        used_tokens,
    ))
}

/// Stable, de-duplicated citation list: resonance files first, then
/// knowledge files, capped at twelve entries.
pub fn collect_sources(patch_paths: &[String], knowledge_paths: &[String]) -> Vec<String> {
    let mut sources = Vec::new();
    for path in patch_paths {
        let label = format!("resonance: {path}");
        if !sources.contains(&label) {
            sources.push(label);
        }
    }
    for path in knowledge_paths {
        let label = format!("search: {path}");
        if !sources.contains(&label) {
            sources.push(label);
        }
    }
    sources.truncate(MAX_SOURCES);
    sources
}

/// Build the token-budgeted prompt plan.
pub fn build_prompt(inputs: &PromptInputs, budget: &ContextBudget) -> PromptPlan {
    let query = derive_query(&inputs.question);
    let format = decide_format(&inputs.question);

    let patch: Option<&ResonancePatch> = inputs
        .bundle
        .as_ref()
        .and_then(|bundle| select_patch(bundle, inputs.collapse.as_ref(), &query));

    let patch_entries: Vec<(String, String)> = patch
        .map(|p| {
            p.knowledge
                .files
                .iter()
                .take(budget.patch_files)
                .map(|f| (f.path.clone(), f.preview.clone()))
                .collect()
        })
        .unwrap_or_default();

    let knowledge_slots = budget.context_files.saturating_sub(patch_entries.len());
    let selected: Vec<ScoredFile> = select_files(
        &inputs.knowledge,
        &query,
        knowledge_slots,
        inputs.require_match,
    );
    let knowledge_entries: Vec<(String, String)> = selected
        .iter()
        .map(|s| (s.file.path.clone(), s.file.preview.clone()))
        .collect();

    let instructions = instruction_section(format);
    let instruction_cost = section_tokens(&instructions);
    let mut remaining = budget.prompt_budget.saturating_sub(instruction_cost);

    let mut sections = Vec::new();
    let mut patch_paths = Vec::new();
    let mut knowledge_paths = Vec::new();

    if let Some(patch) = patch {
        let title = format!("Resonance patch: {}", patch.summary);
        if let Some((section, used, cost)) =
            fill_section(&title, &patch_entries, budget.context_chars, remaining)
        {
            sections.push(section);
            patch_paths = used;
            remaining -= cost.min(remaining);
        }
    }

    if !knowledge_entries.is_empty() {
        if let Some((section, used, cost)) = fill_section(
            "Knowledge projects:",
            &knowledge_entries,
            budget.context_chars,
            remaining,
        ) {
            sections.push(section);
            knowledge_paths = used;
            remaining -= cost.min(remaining);
        }
    }

    sections.push(instructions);

    PromptPlan {
        sections,
        sources: collect_sources(&patch_paths, &knowledge_paths),
        remaining_tokens: remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AskConfig;
    use crate::types::{PatchFile, PatchKnowledge};

    fn knowledge_file(path: &str, preview: &str) -> KnowledgeFile {
        KnowledgeFile {
            id: path.to_string(),
            project_id: "p".to_string(),
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            preview: preview.to_string(),
            mime: "text/plain".to_string(),
            size: preview.len() as u64,
        }
    }

    fn warp_inputs() -> PromptInputs {
        PromptInputs {
            question: "how does the warp bubble solver work?".to_string(),
            bundle: None,
            collapse: None,
            knowledge: vec![
                knowledge_file("modules/warp/warp-module.ts", "warp shell evolution"),
                knowledge_file("docs/SMOKE.md", "smoke checklist"),
                knowledge_file("client/src/pages/desktop.tsx", "desktop layout"),
            ],
            require_match: true,
        }
    }

    #[test]
    fn format_decision_covers_all_branches() {
        assert_eq!(
            decide_format("explain the scientific method here"),
            AnswerFormat::StagedSteps
        );
        assert_eq!(
            decide_format("walk me through the steps"),
            AnswerFormat::Steps
        );
        assert_eq!(
            decide_format("natario versus alcubierre"),
            AnswerFormat::Compare
        );
        assert_eq!(decide_format("summarize the module"), AnswerFormat::Brief);
    }

    #[test]
    fn warp_selection_and_citations_match_expected_order() {
        let budget = ContextBudget::from_config(&AskConfig::default());
        let plan = build_prompt(&warp_inputs(), &budget);

        assert_eq!(
            plan.sources,
            vec![
                "search: modules/warp/warp-module.ts",
                "search: client/src/pages/desktop.tsx",
            ]
        );
        let rendered = plan.render();
        assert!(rendered.contains("(1) modules/warp/warp-module.ts"));
        assert!(!rendered.contains("SMOKE"));
    }

    #[test]
    fn prompt_fits_budget() {
        let budget = ContextBudget::from_config(&AskConfig::default());
        let long_preview = "lattice ".repeat(4_000);
        let inputs = PromptInputs {
            question: "energy pipeline".to_string(),
            knowledge: (0..60)
                .map(|i| knowledge_file(&format!("modules/energy/file{i}.ts"), &long_preview))
                .collect(),
            ..Default::default()
        };

        let plan = build_prompt(&inputs, &budget);
        let total: usize = plan
            .sections
            .iter()
            .map(|s| estimate_tokens(&s.title) + estimate_tokens(&s.body))
            .sum();
        assert!(total <= budget.prompt_budget);
    }

    #[test]
    fn build_prompt_is_deterministic() {
        let budget = ContextBudget::from_config(&AskConfig::default());
        let a = build_prompt(&warp_inputs(), &budget);
        let b = build_prompt(&warp_inputs(), &budget);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn patch_files_come_first_in_citations_and_reduce_knowledge_slots() {
        let budget = ContextBudget {
            context_files: 2,
            ..ContextBudget::from_config(&AskConfig::default())
        };
        let inputs = PromptInputs {
            question: "how does the warp bubble solver work?".to_string(),
            bundle: Some(ResonanceBundle {
                candidates: vec![ResonancePatch {
                    id: "patch-1".into(),
                    summary: "warp bubble geometry".into(),
                    label: String::new(),
                    mode: String::new(),
                    knowledge: PatchKnowledge {
                        files: vec![PatchFile {
                            path: "modules/warp/theta.ts".into(),
                            name: "theta.ts".into(),
                            preview: "warp wall".into(),
                        }],
                    },
                }],
            }),
            collapse: None,
            knowledge: vec![
                knowledge_file("modules/warp/warp-module.ts", "warp shell"),
                knowledge_file("client/src/pages/desktop.tsx", "desktop"),
            ],
            require_match: true,
        };

        let plan = build_prompt(&inputs, &budget);
        assert_eq!(
            plan.sources,
            vec![
                "resonance: modules/warp/theta.ts",
                "search: modules/warp/warp-module.ts",
            ]
        );
    }

    #[test]
    fn instruction_block_always_closes_the_prompt() {
        let budget = ContextBudget::from_config(&AskConfig::default());
        let plan = build_prompt(&warp_inputs(), &budget);
        let last = plan.sections.last().unwrap();
        assert!(last.body.contains("FINAL:"));
    }
}
