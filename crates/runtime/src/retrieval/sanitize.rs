//! Reply sanitation
//!
//! Local models echo scaffolding back: the question, the instruction
//! block, stage tags nobody asked for. Everything between the answer
//! markers is kept; the rest is stripped line by line.

use std::sync::OnceLock;

use regex::Regex;

/// Markers delimiting the answer region in raw model output.
const ANSWER_START: &str = "ANSWER_START";
const ANSWER_END: &str = "ANSWER_END";
const FINAL_MARKER: &str = "FINAL:";

/// Line prefixes that are prompt scaffolding, never answer content.
const SCAFFOLD_PREFIXES: &[&str] = &[
    "Use only the evidence",
    "Answer in",
    "Answer as",
    "Do not include stage tags",
    "Write the final answer",
    "Instructions:",
    "Resonance patch:",
    "Knowledge projects:",
];

fn stage_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\s*\((observe|hypothesis|experiment|analysis|explain)\)\s*$").unwrap()
    })
}

/// Extract the answer region from raw output.
fn extract_region(raw: &str) -> &str {
    if let Some(start) = raw.find(ANSWER_START) {
        let after = &raw[start + ANSWER_START.len()..];
        match after.find(ANSWER_END) {
            Some(end) => &after[..end],
            None => after,
        }
    } else if let Some(idx) = raw.find(FINAL_MARKER) {
        &raw[idx + FINAL_MARKER.len()..]
    } else {
        raw
    }
}

/// Clean raw model output into the reply text.
///
/// `stage_tags` tells the sanitizer whether the format decision asked for
/// scientific-method stage tags; when it did not, trailing tags are noise
/// and are removed.
pub fn sanitize_reply(raw: &str, question: &str, stage_tags: bool) -> String {
    let region = extract_region(raw);

    let question_trimmed = question.trim();
    let mut lines: Vec<String> = Vec::new();
    for line in region.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !lines.is_empty() {
                lines.push(String::new());
            }
            continue;
        }
        // Echoed question, with or without the "Question:" prefix.
        if let Some(rest) = trimmed.strip_prefix("Question:") {
            if rest.trim().is_empty() || rest.trim().eq_ignore_ascii_case(question_trimmed) {
                continue;
            }
        }
        if trimmed.eq_ignore_ascii_case(question_trimmed) {
            continue;
        }
        if SCAFFOLD_PREFIXES
            .iter()
            .any(|prefix| trimmed.starts_with(prefix))
        {
            continue;
        }

        let kept = if stage_tags {
            trimmed.to_string()
        } else {
            stage_tag_re().replace(trimmed, "").to_string()
        };
        if !kept.is_empty() {
            lines.push(kept);
        }
    }

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_between_answer_markers() {
        let raw = "noise\nANSWER_START\nThe shell thickens outward.\nANSWER_END\ntrailing";
        assert_eq!(
            sanitize_reply(raw, "how does it work", false),
            "The shell thickens outward."
        );
    }

    #[test]
    fn falls_back_to_final_marker() {
        let raw = "Question: how does it work\nthinking...\nFINAL:\nIt solves the shell profile.";
        assert_eq!(
            sanitize_reply(raw, "how does it work", false),
            "It solves the shell profile."
        );
    }

    #[test]
    fn strips_echoed_question_and_scaffold_lines() {
        let raw = "how does the warp bubble solver work?\nUse only the evidence above.\nAnswer in one short paragraph.\nThe solver integrates the shell.";
        assert_eq!(
            sanitize_reply(raw, "how does the warp bubble solver work?", false),
            "The solver integrates the shell."
        );
    }

    #[test]
    fn removes_stage_tags_when_not_requested() {
        let raw = "1. Inspect the metric (observe)\n2. Integrate the wall (analysis)";
        assert_eq!(
            sanitize_reply(raw, "q", false),
            "1. Inspect the metric\n2. Integrate the wall"
        );
    }

    #[test]
    fn keeps_stage_tags_when_requested() {
        let raw = "1. Inspect the metric (observe)";
        assert_eq!(sanitize_reply(raw, "q", true), "1. Inspect the metric (observe)");
    }
}
