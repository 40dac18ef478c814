//! Cheap local check that a translation is actually in the target language.
//!
//! Scores the share of tokens that are common function words of the target
//! language. When the source language is declared, the same share for the
//! source language is compared against it, which catches text the model
//! copied instead of translating.

/// Below this many word tokens the text passes unchecked.
const MIN_TOKENS: usize = 20;
/// Minimum share of target-language function words.
const MIN_TARGET_RATIO: f64 = 0.10;
/// Source share that counts as "clearly present".
const SOURCE_PRESENT_RATIO: f64 = 0.10;
/// Source share must exceed the target share by this factor to fail.
const CONTRAST_FACTOR: f64 = 1.5;

const EN: &[&str] = &[
    "the", "of", "and", "to", "in", "is", "that", "for", "it", "as", "was", "with", "be", "by",
    "on", "not", "this", "are", "or", "from", "at", "which", "an", "but", "have", "has", "were",
    "their", "they", "will", "would", "there", "been", "its", "can", "all", "also", "these",
];
const FR: &[&str] = &[
    "le", "la", "les", "de", "des", "du", "et", "est", "un", "une", "en", "que", "qui", "dans",
    "pour", "pas", "sur", "au", "aux", "avec", "ce", "cette", "il", "elle", "sont", "par", "plus",
    "ne", "se", "nous", "vous", "ils", "été", "leur", "mais", "ou", "comme", "où",
];
const DE: &[&str] = &[
    "der", "die", "das", "und", "ist", "nicht", "ein", "eine", "zu", "den", "von", "mit", "sich",
    "des", "auf", "für", "im", "dem", "auch", "es", "an", "werden", "aus", "er", "hat", "dass",
    "sie", "nach", "wird", "bei", "einer", "um", "noch", "wie", "einem", "über", "so", "zum",
];
const ES: &[&str] = &[
    "el", "la", "los", "las", "de", "del", "y", "que", "en", "un", "una", "es", "por", "con",
    "para", "no", "se", "su", "sus", "al", "lo", "como", "más", "pero", "sobre", "este", "esta",
    "entre", "cuando", "muy", "sin", "también", "fue", "ha", "son", "está", "hay", "donde",
];
const IT: &[&str] = &[
    "il", "lo", "la", "gli", "le", "di", "del", "della", "e", "che", "è", "un", "una", "per",
    "non", "in", "con", "su", "sono", "da", "dei", "delle", "nel", "nella", "come", "anche",
    "più", "ma", "questo", "questa", "alla", "al", "si", "ha", "essere", "tra", "stato", "quando",
];
const PT: &[&str] = &[
    "o", "a", "os", "as", "de", "do", "da", "dos", "das", "e", "que", "em", "um", "uma", "para",
    "com", "não", "no", "na", "por", "se", "mais", "como", "mas", "ao", "foi", "são", "pelo",
    "pela", "seu", "sua", "está", "também", "isso", "entre", "quando", "muito", "ou",
];
const NL: &[&str] = &[
    "de", "het", "een", "en", "van", "is", "dat", "op", "te", "in", "voor", "niet", "met", "zijn",
    "er", "aan", "ook", "als", "bij", "door", "maar", "om", "worden", "wordt", "dit", "die",
    "naar", "uit", "hij", "ze", "nog", "werd", "wel", "kan", "tot", "over", "geen", "deze",
];

/// Function-word list for a language code or English name, if known.
pub fn stopwords(language: &str) -> Option<&'static [&'static str]> {
    let lang = language.trim().to_lowercase();
    let primary = lang.split(['-', '_']).next().unwrap_or_default();
    let list = match primary {
        "en" | "eng" | "english" => EN,
        "fr" | "fra" | "fre" | "french" | "français" | "francais" => FR,
        "de" | "deu" | "ger" | "german" | "deutsch" => DE,
        "es" | "spa" | "spanish" | "español" | "espanol" => ES,
        "it" | "ita" | "italian" | "italiano" => IT,
        "pt" | "por" | "portuguese" | "português" | "portugues" => PT,
        "nl" | "nld" | "dut" | "dutch" | "nederlands" => NL,
        _ => return None,
    };
    Some(list)
}

/// Result of [`check_language`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LanguageCheck {
    pub passed: bool,
    pub tokens: usize,
    pub target_ratio: f64,
    pub source_ratio: Option<f64>,
}

impl LanguageCheck {
    fn pass(tokens: usize) -> Self {
        Self {
            passed: true,
            tokens,
            target_ratio: 0.0,
            source_ratio: None,
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphabetic() && c != '\'')
        .map(|t| t.trim_matches('\'').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn ratio(tokens: &[String], words: &[&str]) -> f64 {
    let hits = tokens.iter().filter(|t| words.contains(&t.as_str())).count();
    hits as f64 / tokens.len() as f64
}

/// Does `text` look like it is written in `target`?
///
/// Unknown target languages and short texts pass.
pub fn check_language(text: &str, target: &str, source: Option<&str>) -> LanguageCheck {
    let tokens = tokenize(text);
    let Some(target_words) = stopwords(target) else {
        return LanguageCheck::pass(tokens.len());
    };
    if tokens.len() < MIN_TOKENS {
        return LanguageCheck::pass(tokens.len());
    }

    let target_ratio = ratio(&tokens, target_words);
    let source_ratio = source
        .and_then(stopwords)
        .filter(|words| !std::ptr::eq(*words, target_words))
        .map(|words| ratio(&tokens, words));

    let contrastive_fail = source_ratio
        .is_some_and(|s| s >= SOURCE_PRESENT_RATIO && s > CONTRAST_FACTOR * target_ratio);

    LanguageCheck {
        passed: target_ratio >= MIN_TARGET_RATIO && !contrastive_fail,
        tokens: tokens.len(),
        target_ratio,
        source_ratio,
    }
}
