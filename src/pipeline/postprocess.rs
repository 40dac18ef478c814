//! Post-processing: deterministic cleanup of model-generated translations.
//!
//! Even well-prompted models occasionally wrap their answer in fences,
//! open with "Here is the translation:", or leave Windows line endings and
//! zero-width characters behind. These rules fix such quirks without
//! touching the translated content, so the prompt can stay focused on
//! *what to translate*.
//!
//! ## Rule Order
//!
//! Split off annotations first (the marker must not be mistaken for text),
//! strip fences before the preamble so the preamble check sees the first
//! real line, and run the final-newline pass last.

use crate::prompts::ANNOTATIONS_MARKER;
use crate::verify::Annotation;
use once_cell::sync::Lazy;
use regex::Regex;

/// Split a raw model reply into the translated text and its annotations.
///
/// Annotation lines follow [`ANNOTATIONS_MARKER`] and have the form
/// `TYPE | comment | original text`; the last two fields are optional.
pub fn split_annotations(raw: &str) -> (String, Vec<Annotation>) {
    let Some(idx) = raw.find(ANNOTATIONS_MARKER) else {
        return (raw.to_string(), Vec::new());
    };
    let text = raw[..idx].to_string();
    let annotations = raw[idx + ANNOTATIONS_MARKER.len()..]
        .lines()
        .map(|l| l.trim().trim_start_matches(['-', '*']).trim())
        .filter(|l| !l.is_empty() && !l.starts_with("```"))
        .map(|l| {
            let mut parts = l.splitn(3, '|').map(str::trim);
            let kind = parts.next().unwrap_or_default().to_lowercase();
            let comment = parts.next().unwrap_or_default().to_string();
            let original_text = parts
                .next()
                .map(|o| o.trim_matches('"').to_string())
                .filter(|o| !o.is_empty());
            Annotation {
                kind,
                comment,
                original_text,
            }
        })
        .collect();
    (text, annotations)
}

/// Apply all cleanup rules to a translated page.
///
/// Rules (applied in order):
/// 1. Strip outer fences (```` ```markdown ````, ```` ```text ````, bare)
/// 2. Normalise line endings (CRLF → LF)
/// 3. Drop a leading "Here is the translation:" style preamble
/// 4. Trim trailing whitespace per line
/// 5. Collapse 3+ consecutive blank lines down to 2
/// 6. Insert the missing separator row of a GFM table
/// 7. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 8. Ensure the text ends with exactly one newline
pub fn clean_translation(input: &str) -> String {
    let s = strip_outer_fences(input);
    let s = normalise_line_endings(&s);
    let s = strip_preamble(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = fix_table_separators(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Strip outer fences ───────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```(?:markdown|md|text|plaintext)?[ \t]*\r?\n(.*?)\r?\n```\s*$")
        .expect("static regex")
});

fn strip_outer_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Drop meta preamble ───────────────────────────────────────────────

static RE_PREAMBLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:here is|here's|below is)\b[^\n]{0,80}\btranslat[^\n]*:\s*\n|^\s*translation\s*:\s*\n")
        .expect("static regex")
});

fn strip_preamble(input: &str) -> String {
    RE_PREAMBLE.replace(input, "").to_string()
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

// ── Rule 5: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").expect("static regex"));

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 6: Missing table separator ──────────────────────────────────────────

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.contains('-') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// A table whose first two rows are both content rows gets a separator
/// after the header. Only the first row of each table block is considered.
fn fix_table_separators(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);
    let mut prev_was_table = false;

    for (i, line) in lines.iter().enumerate() {
        out.push(line.to_string());
        let starts_table = is_table_row(line) && !prev_was_table;
        prev_was_table = is_table_row(line);
        if !starts_table || is_separator_row(line) {
            continue;
        }
        let next = lines.get(i + 1).copied().unwrap_or("");
        if is_table_row(next) && !is_separator_row(next) {
            let cols = line.trim().matches('|').count().saturating_sub(1).max(1);
            out.push(format!("|{}", " --- |".repeat(cols)));
        }
    }
    out.join("\n")
}

// ── Rule 7: Remove invisible Unicode characters ──────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

// ── Rule 8: Single final newline ─────────────────────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_with_and_without_language() {
        assert_eq!(strip_outer_fences("```markdown\n# Hi\nthere\n```"), "# Hi\nthere");
        assert_eq!(strip_outer_fences("```text\nplain\n```\n"), "plain");
        assert_eq!(strip_outer_fences("no fences"), "no fences");
    }

    #[test]
    fn drops_preamble_only_at_the_start() {
        let s = strip_preamble("Here is the English translation of the page:\n# Title\nBody");
        assert_eq!(s, "# Title\nBody");
        let s = strip_preamble("Translation:\nBody");
        assert_eq!(s, "Body");
        let body = "The translation committee met:\nagenda follows";
        assert_eq!(strip_preamble(body), body);
    }

    #[test]
    fn inserts_missing_table_separator() {
        let out = fix_table_separators("| A | B |\n| 1 | 2 |\n| 3 | 4 |");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "| --- | --- |");
        assert_eq!(lines[3], "| 3 | 4 |");
    }

    #[test]
    fn leaves_well_formed_table_alone() {
        let input = "| A | B |\n|:--|--:|\n| 1 | 2 |";
        assert_eq!(fix_table_separators(input), input);
    }

    #[test]
    fn removes_invisible_chars() {
        assert_eq!(remove_invisible_chars("a\u{200B}b\u{FEFF}c\u{00AD}d"), "abcd");
    }

    #[test]
    fn empty_output_stays_empty() {
        assert_eq!(clean_translation("  \n\n "), "");
        assert_eq!(ensure_final_newline("x\n\n"), "x\n");
    }

    #[test]
    fn full_pipeline() {
        let input = "```markdown\r\nHere is the translation:\r\n# Title   \r\n\r\n\r\n\r\n\r\nText\u{200B}\r\n```";
        let out = clean_translation(input);
        assert_eq!(out, "# Title\n\n\nText\n");
    }

    #[test]
    fn splits_annotations_block() {
        let raw = "Translated body\n---ANNOTATIONS---\n- illegible | stamp in margin | \"Eing. 3.4.\"\nomission | footnote cut off\n";
        let (text, notes) = split_annotations(raw);
        assert_eq!(text, "Translated body\n");
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].kind, "illegible");
        assert_eq!(notes[0].original_text.as_deref(), Some("Eing. 3.4."));
        assert_eq!(notes[1].comment, "footnote cut off");
        assert_eq!(notes[1].original_text, None);
    }

    #[test]
    fn no_marker_means_no_annotations() {
        let (text, notes) = split_annotations("just text");
        assert_eq!(text, "just text");
        assert!(notes.is_empty());
    }
}
