//! Verification reports and their lenient JSON parsing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Quality tier assigned by the verifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Ok,
    Minor,
    Severe,
}

impl Severity {
    /// Map a model-produced severity string. Anything unrecognised is `Minor`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "ok" | "none" | "pass" | "good" => Severity::Ok,
            "severe" | "critical" | "major" | "high" | "fail" => Severity::Severe,
            _ => Severity::Minor,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Ok => "ok",
            Severity::Minor => "minor",
            Severity::Severe => "severe",
        })
    }
}

/// One flagged span of a translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Defect class, e.g. `omission`, `mistranslation`, `illegible`.
    #[serde(rename = "type", alias = "kind", default)]
    pub kind: String,
    #[serde(default)]
    pub comment: String,
    #[serde(
        default,
        alias = "originalText",
        alias = "original",
        skip_serializing_if = "Option::is_none"
    )]
    pub original_text: Option<String>,
}

/// Verifier verdict for one page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub severity: Severity,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_hint: Option<String>,
}

impl VerificationReport {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn is_severe(&self) -> bool {
        self.severity == Severity::Severe
    }

    /// Parse a verifier model's reply.
    ///
    /// Accepts fenced output and surrounding prose: the object between the
    /// first `{` and the last `}` is decoded. Missing fields default, an
    /// unknown severity becomes `minor`, and evidence may be a single string.
    pub fn from_model_output(raw: &str) -> Result<Self, String> {
        let start = raw.find('{').ok_or("no JSON object in verifier response")?;
        let end = raw.rfind('}').ok_or("no JSON object in verifier response")?;
        if end < start {
            return Err("no JSON object in verifier response".to_string());
        }
        let loose: LooseReport =
            serde_json::from_str(&raw[start..=end]).map_err(|e| format!("invalid verifier JSON: {e}"))?;
        Ok(loose.into())
    }
}

/// Per-page verification lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationState {
    #[default]
    Idle,
    Verifying,
    Verified,
    Failed,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct LooseReport {
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    evidence: Option<OneOrMany>,
    #[serde(default)]
    annotations: Vec<Annotation>,
    #[serde(default, alias = "retryHint")]
    retry_hint: Option<String>,
}

impl From<LooseReport> for VerificationReport {
    fn from(loose: LooseReport) -> Self {
        let evidence = match loose.evidence {
            Some(OneOrMany::One(s)) => vec![s],
            Some(OneOrMany::Many(v)) => v,
            None => Vec::new(),
        };
        VerificationReport {
            severity: loose
                .severity
                .as_deref()
                .map(Severity::parse_lenient)
                .unwrap_or(Severity::Minor),
            summary: loose.summary.unwrap_or_default().trim().to_string(),
            evidence,
            annotations: loose.annotations,
            retry_hint: loose
                .retry_hint
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty()),
        }
    }
}
