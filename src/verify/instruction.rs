//! Corrective-instruction synthesis from a severe report.

use super::report::{Annotation, VerificationReport};
use crate::prompts::hard_constraints;
use std::collections::HashSet;

pub const MAX_EVIDENCE: usize = 8;
pub const MAX_ANNOTATIONS: usize = 8;
pub const MAX_ITEM_CHARS: usize = 240;

/// Truncate to `max` characters, marking the cut with `…`.
pub fn clip(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn annotation_line(a: &Annotation) -> String {
    let kind = if a.kind.trim().is_empty() {
        "ISSUE".to_string()
    } else {
        a.kind.trim().to_uppercase()
    };
    let line = match a.original_text.as_deref().map(str::trim) {
        Some(original) if !original.is_empty() => {
            format!("{} — {} — \"{}\"", kind, one_line(&a.comment), one_line(original))
        }
        _ => format!("{} — {}", kind, one_line(&a.comment)),
    };
    clip(&line, MAX_ITEM_CHARS)
}

/// Build the follow-up instruction for a re-translation.
///
/// Layout: retry hint, summary, evidence list, annotation list, hard
/// constraints. Every list item is clipped to [`MAX_ITEM_CHARS`].
pub fn build_retry_instruction(report: &VerificationReport, target_language: &str) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(hint) = report.retry_hint.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        sections.push(clip(hint, MAX_ITEM_CHARS * 2));
    }

    let summary = one_line(&report.summary);
    let summary = if summary.is_empty() {
        "The verifier found severe problems in the previous translation.".to_string()
    } else {
        summary
    };
    sections.push(format!("Verifier summary: {}", clip(&summary, MAX_ITEM_CHARS)));

    let mut seen = HashSet::new();
    let evidence: Vec<String> = report
        .evidence
        .iter()
        .map(|e| one_line(e))
        .filter(|e| !e.is_empty() && seen.insert(e.to_lowercase()))
        .take(MAX_EVIDENCE)
        .map(|e| format!("- {}", clip(&e, MAX_ITEM_CHARS)))
        .collect();
    if !evidence.is_empty() {
        sections.push(format!("Evidence:\n{}", evidence.join("\n")));
    }

    let notes: Vec<String> = report
        .annotations
        .iter()
        .filter(|a| !a.comment.trim().is_empty() || a.original_text.is_some())
        .take(MAX_ANNOTATIONS)
        .map(|a| format!("- {}", annotation_line(a)))
        .collect();
    if !notes.is_empty() {
        sections.push(format!("Problems to fix:\n{}", notes.join("\n")));
    }

    sections.push(hard_constraints(target_language));
    sections.join("\n\n")
}
