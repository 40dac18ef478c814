//! Prompts for page translation and quality verification.
//!
//! Every prompt the crate sends lives here so prompt changes touch exactly
//! one file and tests can inspect them without a provider.
//!
//! Callers can override the translation prompt via
//! [`crate::config::TranslationConfig::system_prompt`]; `{target}` and
//! `{source}` placeholders in an override are substituted the same way.

/// Marker separating the translated text from the translator's annotations.
pub const ANNOTATIONS_MARKER: &str = "---ANNOTATIONS---";

/// Default system prompt for translating one scanned page.
pub const TRANSLATION_SYSTEM_PROMPT: &str = r#"You are an expert document translator. You receive an image of one scanned page written in {source}. Translate ALL of its text into {target}.

Follow these rules precisely:

1. COMPLETENESS
   - Translate every heading, paragraph, list item, table cell, caption and footnote
   - Keep the reading order a human would follow on the page
   - Never summarise or shorten

2. STRUCTURE
   - Render the result as Markdown
   - Keep section numbering, list numbering and footnote markers exactly as printed
   - Convert tables to GFM pipe tables

3. UNCERTAINTY
   - Mark illegible spans as [illegible]
   - Do not guess names, numbers or dates you cannot read

4. OUTPUT FORMAT
   - Output ONLY the translated page in {target}
   - Do NOT wrap the output in ```markdown fences
   - Do NOT add commentary, notes or explanations
   - If some spans were uncertain, append a line containing exactly ---ANNOTATIONS--- followed by one line per span: TYPE | comment | original text"#;

/// Build the system prompt for a page, substituting the languages.
pub fn translation_prompt(template: &str, target: &str, source: Option<&str>) -> String {
    template
        .replace("{target}", target)
        .replace("{source}", source.unwrap_or("the source language"))
}

/// Context message carrying the previous page's translation.
pub fn previous_page_context(prior_page: &str) -> String {
    format!(
        "The previous page was translated as follows. Keep terminology, numbering and style consistent with it, and continue any sentence or list that runs over the page break:\n\n\"\"\"{}\"\"\"",
        prior_page
    )
}

/// Wrap an extra instruction (quality retry, operator fix) for the translator.
pub fn extra_instruction_message(instruction: &str) -> String {
    format!(
        "A previous translation of this page had problems. Follow these instructions for this attempt:\n\n{}",
        instruction
    )
}

/// System prompt for the verification pass.
pub const VERIFIER_SYSTEM_PROMPT: &str = r#"You are a meticulous translation reviewer. You receive the original scanned page image, optional strips of the neighbouring pages for context, and a translation of the page into {target}.

Compare the translation against the page and report defects:
- omitted or truncated content (headings, paragraphs, table rows, footnotes)
- mistranslations that change the meaning
- text left in the source language
- broken section or list numbering
- invented content that is not on the page

Respond ONLY with a JSON object of this shape:
{"severity": "ok" | "minor" | "severe", "summary": "one sentence", "evidence": ["short quotes or observations"], "annotations": [{"type": "omission" | "mistranslation" | "untranslated" | "numbering" | "addition" | "illegible", "comment": "what is wrong", "originalText": "source text involved"}], "retryHint": "optional instruction for a re-translation"}

Use "severe" only when the translation must be redone. Text in the neighbouring strips belongs to other pages and must not be expected in this translation."#;

/// Verifier prompt for a target language.
pub fn verifier_prompt(target: &str) -> String {
    VERIFIER_SYSTEM_PROMPT.replace("{target}", target)
}

/// User message accompanying the images in the verification request.
pub fn verifier_user_message(page: usize, translation: &str) -> String {
    format!(
        "Page {} translation to review:\n\n\"\"\"{}\"\"\"",
        page, translation
    )
}

/// Constraints restated at the end of every corrective instruction.
pub fn hard_constraints(target: &str) -> String {
    format!(
        "Hard constraints:\n\
- Correct only the problems listed above.\n\
- Do not omit any heading, paragraph, list item, table row or footnote.\n\
- Preserve the section numbering exactly as printed.\n\
- Do not summarise.\n\
- Mark illegible spans explicitly as [illegible].\n\
- Respond only in {target}, with no meta-commentary."
    )
}

/// Corrective instruction used when the text failed the local language check.
pub fn wrong_language_instruction(target: &str, source: Option<&str>) -> String {
    let found = match source {
        Some(src) => format!("The previous output was still largely in {src}"),
        None => format!("The previous output was not in {target}"),
    };
    format!(
        "{found}. Translate the entire page into {target}; do not copy the original text.\n\n{}",
        hard_constraints(target)
    )
}
