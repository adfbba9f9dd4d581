//! Patch and file scoring
//!
//! Lexical scoring over resonance patches and knowledge files, with a fixed
//! table of path boosts and noise penalties. Selection order is fully
//! deterministic: score descending, path ascending.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{KnowledgeFile, ResonanceBundle, ResonanceCollapse, ResonancePatch};

use super::query::DerivedQuery;

/// Points per token found in a patch's summary/label/mode.
const PATCH_META_WEIGHT: i64 = 2;
/// Points per token found in any of a patch's file fields.
const PATCH_FILE_WEIGHT: i64 = 3;
/// Points per token found in a file's path/name/preview.
const FILE_TOKEN_WEIGHT: i64 = 2;

struct PathBoost {
    pattern: Regex,
    weight: i64,
}

fn boost_table() -> &'static Vec<PathBoost> {
    static TABLE: OnceLock<Vec<PathBoost>> = OnceLock::new();
    TABLE.get_or_init(|| {
        [
            (r"docs/helix-ask-flow\.md", 10),
            (r"HelixAskPill", 8),
            (r"desktop", 6),
            (r"server/routes/agi\.plan", 6),
            (r"server/skills/llm\.local", 4),
            // Noise penalties
            (r"docs/SMOKE\.md", -6),
            (r"\.snap$", -4),
        ]
        .iter()
        .map(|(pattern, weight)| PathBoost {
            pattern: Regex::new(pattern).unwrap(),
            weight: *weight,
        })
        .collect()
    })
}

fn warp_boost_table() -> &'static Vec<PathBoost> {
    static TABLE: OnceLock<Vec<PathBoost>> = OnceLock::new();
    TABLE.get_or_init(|| {
        [
            (r"modules/warp", 8),
            (r"natario-warp|warp-module|warp-theta", 6),
            (r"warp-pipeline|energy-pipeline", 4),
        ]
        .iter()
        .map(|(pattern, weight)| PathBoost {
            pattern: Regex::new(pattern).unwrap(),
            weight: *weight,
        })
        .collect()
    })
}

fn count_token_hits(haystack: &str, tokens: &[String]) -> i64 {
    tokens.iter().filter(|t| haystack.contains(t.as_str())).count() as i64
}

/// Score a knowledge file against the derived query.
pub fn score_file(file: &KnowledgeFile, query: &DerivedQuery) -> i64 {
    let haystack = format!("{} {} {}", file.path, file.name, file.preview).to_lowercase();
    let mut score = FILE_TOKEN_WEIGHT * count_token_hits(&haystack, &query.tokens);

    for boost in boost_table() {
        if boost.pattern.is_match(&file.path) {
            score += boost.weight;
        }
    }
    if query.warp_focus {
        for boost in warp_boost_table() {
            if boost.pattern.is_match(&file.path) {
                score += boost.weight;
            }
        }
    }
    score
}

/// Score a resonance patch: +2 per token in its metadata, +3 per token
/// found in at least one of its files.
pub fn score_patch(patch: &ResonancePatch, query: &DerivedQuery) -> i64 {
    let meta = format!("{} {} {}", patch.summary, patch.label, patch.mode).to_lowercase();
    let files = patch
        .knowledge
        .files
        .iter()
        .map(|f| format!("{} {} {}", f.path, f.name, f.preview).to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");

    PATCH_META_WEIGHT * count_token_hits(&meta, &query.tokens)
        + PATCH_FILE_WEIGHT * count_token_hits(&files, &query.tokens)
}

/// Pick the patch to ground the prompt on.
///
/// The best-scoring candidate wins (smallest id on ties), unless a
/// collapse names a primary patch that itself scores above zero; the
/// explicit selection is then preferred.
pub fn select_patch<'a>(
    bundle: &'a ResonanceBundle,
    collapse: Option<&ResonanceCollapse>,
    query: &DerivedQuery,
) -> Option<&'a ResonancePatch> {
    if let Some(primary_id) = collapse.and_then(|c| c.primary_patch_id.as_deref()) {
        if let Some(primary) = bundle.candidates.iter().find(|p| p.id == primary_id) {
            if score_patch(primary, query) > 0 {
                return Some(primary);
            }
        }
    }

    bundle
        .candidates
        .iter()
        .map(|patch| (patch, score_patch(patch, query)))
        .filter(|(_, score)| *score > 0)
        .max_by(|(a_patch, a), (b_patch, b)| {
            // Ties break toward the lexically smallest patch id.
            a.cmp(b).then_with(|| b_patch.id.cmp(&a_patch.id))
        })
        .map(|(patch, _)| patch)
}

/// A file together with its computed score.
#[derive(Debug, Clone)]
pub struct ScoredFile {
    pub file: KnowledgeFile,
    pub score: i64,
}

/// Select the top-K files by score.
///
/// Files with negative scores never qualify. Zero-score files qualify only
/// when `require_match` is false. Ties break on ascending path so hash-map
/// iteration order can never leak into the output.
pub fn select_files(
    candidates: &[KnowledgeFile],
    query: &DerivedQuery,
    k: usize,
    require_match: bool,
) -> Vec<ScoredFile> {
    let mut scored: Vec<ScoredFile> = candidates
        .iter()
        .map(|file| ScoredFile {
            file: file.clone(),
            score: score_file(file, query),
        })
        .filter(|entry| {
            if require_match {
                entry.score > 0
            } else {
                entry.score >= 0
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.file.path.cmp(&b.file.path))
    });
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::query::derive_query;
    use crate::types::{PatchFile, PatchKnowledge};

    fn file(path: &str, preview: &str) -> KnowledgeFile {
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

    #[test]
    fn warp_question_selects_warp_module_and_desktop_not_smoke() {
        let query = derive_query("how does the warp bubble solver work?");
        let candidates = vec![
            file("modules/warp/warp-module.ts", "the warp shell evolves"),
            file("docs/SMOKE.md", "smoke checklist"),
            file("client/src/pages/desktop.tsx", "desktop layout"),
        ];

        let selected = select_files(&candidates, &query, 48, true);
        let paths: Vec<&str> = selected.iter().map(|s| s.file.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["modules/warp/warp-module.ts", "client/src/pages/desktop.tsx"]
        );
        // modules/warp (+8) + warp-module (+6) + one token hit (+2)
        assert_eq!(selected[0].score, 16);
        assert_eq!(selected[1].score, 6);
    }

    #[test]
    fn noise_penalty_excludes_smoke_doc_even_without_require_match() {
        let query = derive_query("smoke");
        let candidates = vec![file("docs/SMOKE.md", "")];
        // Token hit (+2) does not overcome the -6 penalty.
        assert!(select_files(&candidates, &query, 10, false).is_empty());
    }

    #[test]
    fn patch_scoring_weights_files_over_metadata() {
        let query = derive_query("warp bubble");
        let patch = ResonancePatch {
            id: "patch-1".into(),
            summary: "warp geometry notes".into(),
            label: "".into(),
            mode: "".into(),
            knowledge: PatchKnowledge {
                files: vec![PatchFile {
                    path: "modules/warp/theta.ts".into(),
                    name: "theta.ts".into(),
                    preview: "bubble wall profile".into(),
                }],
            },
        };
        // "warp" in meta (+2) and in a file (+3); "bubble" in a file (+3).
        assert_eq!(score_patch(&patch, &query), 8);
    }

    #[test]
    fn collapse_primary_wins_only_with_positive_score() {
        let query = derive_query("warp bubble");
        let relevant = ResonancePatch {
            id: "relevant".into(),
            summary: "warp bubble study".into(),
            label: String::new(),
            mode: String::new(),
            knowledge: PatchKnowledge::default(),
        };
        let unrelated = ResonancePatch {
            id: "unrelated".into(),
            summary: "billing export".into(),
            label: String::new(),
            mode: String::new(),
            knowledge: PatchKnowledge::default(),
        };
        let bundle = ResonanceBundle {
            candidates: vec![relevant, unrelated],
        };

        // Primary that scores zero is ignored in favor of the best match.
        let collapse = ResonanceCollapse {
            primary_patch_id: Some("unrelated".into()),
        };
        let picked = select_patch(&bundle, Some(&collapse), &query).unwrap();
        assert_eq!(picked.id, "relevant");

        // Primary with a positive score is preferred.
        let collapse = ResonanceCollapse {
            primary_patch_id: Some("relevant".into()),
        };
        let picked = select_patch(&bundle, Some(&collapse), &query).unwrap();
        assert_eq!(picked.id, "relevant");
    }
}
