//! CLI binary for pdftrans.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `TranslationConfig`, runs a session to completion and writes the result.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pdftrans::{
    write_atomic, PageSelection, ProgressCallback, TranslatedDocument, TranslationConfig,
    TranslationProgressCallback, TranslationSession, VerificationReport,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar counting translated pages plus a log line per
/// page event. Pages finish out of order and may be translated more than
/// once, so the bar tracks distinct pages.
struct CliProgress {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    done: Mutex<HashSet<usize>>,
}

impl CliProgress {
    /// Spinner only; [`activate`](Self::activate) sets the page count once
    /// the PDF is open.
    fn new_dynamic() -> Self {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            done: Mutex::new(HashSet::new()),
        }
    }

    fn activate(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Translating");
        self.bar.set_message("");
        self.bar.reset_eta();
    }

    fn elapsed(&self, page_num: usize) -> String {
        let ms = self
            .start_times
            .lock()
            .remove(&page_num)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        dim(&format!("{:.1}s", ms as f64 / 1000.0))
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl TranslationProgressCallback for CliProgress {
    fn on_page_status(&self, page_num: usize, status: &str) {
        self.bar.set_message(format!("page {page_num}: {status}"));
    }

    fn on_page_start(&self, page_num: usize) {
        self.start_times.lock().insert(page_num, Instant::now());
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, text_len: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}  {:<8}  {}",
            green("✓"),
            page_num,
            dim(&format!("{text_len:>5} chars")),
            self.elapsed(page_num),
        ));
        if self.done.lock().insert(page_num) {
            self.bar.inc(1);
        }
    }

    fn on_page_error(&self, page_num: usize, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}  {}  {}",
            red("✗"),
            page_num,
            red(&msg),
            self.elapsed(page_num),
        ));
    }

    fn on_verification(&self, page_num: usize, report: &VerificationReport, queued_for_retry: bool) {
        let mark = match report.severity {
            pdftrans::Severity::Ok => green("◆"),
            pdftrans::Severity::Minor => yellow("◆"),
            pdftrans::Severity::Severe => red("◆"),
        };
        let tail = if queued_for_retry {
            bold("retrying")
        } else {
            dim(&report.summary)
        };
        self.bar.println(format!(
            "  {} Page {:>3}  quality {}  {}",
            mark, page_num, report.severity, tail
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Translate every page to English (stdout)
  pdftrans letters.pdf

  # German source, Markdown file out
  pdftrans --source-lang de --target-lang en letters.pdf -o letters.en.md

  # First five pages, no quality check
  pdftrans --pages 1-5 --no-quality-check scan.pdf

  # Separate verifier model, up to two automatic retries per page
  pdftrans --verifier-model gpt-4.1-mini --max-auto-retries 2 scan.pdf

  # JSON with per-page verification reports
  pdftrans --json scan.pdf > scan.json

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  MISTRAL_API_KEY         Mistral API key
  EDGEQUAKE_LLM_PROVIDER  Provider when --provider is not given
  PDFIUM_LIB_PATH         Path to libpdfium (default: ./ then system)
  RUST_LOG                Overrides the log filter
"#;

/// Translate scanned PDF pages with Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdftrans",
    version,
    about = "Translate scanned PDF pages with Vision LLMs, with an automatic quality check",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF file to translate.
    input: PathBuf,

    /// Write the result to this file instead of stdout.
    #[arg(short, long, env = "PDFTRANS_OUTPUT")]
    output: Option<PathBuf>,

    /// Target language (ISO code or English name).
    #[arg(short, long = "target-lang", env = "PDFTRANS_TARGET_LANG", default_value = "en")]
    target_lang: String,

    /// Source language; enables the contrastive language check.
    #[arg(short, long = "source-lang", env = "PDFTRANS_SOURCE_LANG")]
    source_lang: Option<String>,

    /// LLM provider: openai, anthropic, gemini, mistral, ollama, …
    #[arg(long, env = "PDFTRANS_PROVIDER")]
    provider: Option<String>,

    /// Primary translation model.
    #[arg(long, env = "PDFTRANS_MODEL")]
    model: Option<String>,

    /// Fallback used while the primary model is cooling down.
    #[arg(long, env = "PDFTRANS_FALLBACK_MODEL")]
    fallback_model: Option<String>,

    /// Last-resort fallback model.
    #[arg(long, env = "PDFTRANS_FAST_MODEL")]
    fast_model: Option<String>,

    /// Model for the verification pass (default: the primary model).
    #[arg(long, env = "PDFTRANS_VERIFIER_MODEL")]
    verifier_model: Option<String>,

    /// Pages translated at the same time (1–4).
    #[arg(short, long, env = "PDFTRANS_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Skip the verification pass.
    #[arg(long, env = "PDFTRANS_NO_QUALITY_CHECK")]
    no_quality_check: bool,

    /// Automatic quality retries per page (0–2).
    #[arg(long, env = "PDFTRANS_MAX_AUTO_RETRIES", default_value_t = 1)]
    max_auto_retries: u32,

    /// Translate pages independently, without the previous page as context.
    #[arg(long, env = "PDFTRANS_NO_CONTEXT")]
    no_context: bool,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "PDFTRANS_PAGES", default_value = "all")]
    pages: String,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDFTRANS_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDFTRANS_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom translation system prompt.
    #[arg(long, env = "PDFTRANS_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Retries per provider call on transient failures.
    #[arg(long, env = "PDFTRANS_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Deadline for one page attempt, in seconds.
    #[arg(long, env = "PDFTRANS_PAGE_TIMEOUT", default_value_t = 180)]
    page_timeout: u64,

    /// Output structured JSON instead of Markdown.
    #[arg(long, env = "PDFTRANS_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "PDFTRANS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFTRANS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFTRANS_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar provides all the feedback that matters, so library
    // logs drop to errors while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    // ── Session ──────────────────────────────────────────────────────────
    let bar = show_progress.then(|| Arc::new(CliProgress::new_dynamic()));
    let callback = bar.clone().map(|b| b as ProgressCallback);
    let config = build_config(&cli, callback).await?;
    let session = match TranslationSession::open(&cli.input, config).await {
        Ok(session) => session,
        Err(e) => {
            if let Some(ref bar) = bar {
                bar.finish();
            }
            return Err(e).context("Failed to start translation");
        }
    };
    session.ensure_ready().await.context("Provider check failed")?;
    if let Some(ref bar) = bar {
        bar.activate(session.selected_pages().len());
    }

    let started = Instant::now();
    let scheduled = session.request_selected();
    if !cli.quiet && !show_progress {
        eprintln!("Translating {} page(s)…", scheduled);
    }
    session.wait_until_settled().await;
    if let Some(ref bar) = bar {
        bar.finish();
    }

    // ── Output ───────────────────────────────────────────────────────────
    let document = TranslatedDocument::from_session(&session, cli.input.display().to_string());
    let rendered = if cli.json {
        document.to_json()?
    } else {
        document.to_markdown()
    };

    match cli.output {
        Some(ref path) => write_atomic(path, &rendered)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(rendered.as_bytes())
                .context("Failed to write to stdout")?;
        }
    }

    // ── Summary ──────────────────────────────────────────────────────────
    if !cli.quiet {
        let stats = &document.stats;
        let ok = stats.missing_pages.is_empty() && stats.severe_pages.is_empty();
        eprintln!(
            "{}  {}/{} pages  {}ms{}",
            if ok { green("✔") } else { yellow("⚠") },
            stats.translated_pages,
            stats.selected_pages,
            started.elapsed().as_millis(),
            cli.output
                .as_ref()
                .map(|p| format!("  →  {}", bold(&p.display().to_string())))
                .unwrap_or_default(),
        );
        eprintln!(
            "   {} tokens in  /  {} tokens out",
            dim(&stats.total_input_tokens.to_string()),
            dim(&stats.total_output_tokens.to_string()),
        );
        if !stats.missing_pages.is_empty() {
            eprintln!("   {} not translated: {:?}", red("✗"), stats.missing_pages);
        }
        if !stats.severe_pages.is_empty() {
            eprintln!("   {} severe quality findings: {:?}", yellow("!"), stats.severe_pages);
        }
    }

    Ok(())
}

/// Map CLI args to `TranslationConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<TranslationConfig> {
    let mut builder = TranslationConfig::builder()
        .target_language(cli.target_lang.as_str())
        .concurrency(cli.concurrency)
        .quality_check(!cli.no_quality_check)
        .max_auto_retries(cli.max_auto_retries)
        .maintain_context(!cli.no_context)
        .pages(parse_pages(&cli.pages)?)
        .dpi(cli.dpi)
        .max_retries(cli.max_retries)
        .page_timeout_secs(cli.page_timeout);

    if let Some(ref lang) = cli.source_lang {
        builder = builder.source_language(lang.as_str());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.as_str());
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.as_str());
    }
    if cli.fallback_model.is_some() {
        builder = builder.secondary_model(cli.fallback_model.clone());
    }
    if cli.fast_model.is_some() {
        builder = builder.fast_model(cli.fast_model.clone());
    }
    if let Some(ref model) = cli.verifier_model {
        builder = builder.verifier_model(model.as_str());
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password.as_str());
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--pages` string into `PageSelection`.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();
    if s == "all" {
        return Ok(PageSelection::All);
    }

    let parts: Vec<&str> = s.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        anyhow::bail!("Empty page selection");
    }
    if let [single] = parts.as_slice() {
        if !single.contains('-') {
            return Ok(PageSelection::Single(parse_page_number(single)?));
        }
        let (start, end) = parse_page_range(single)?;
        return Ok(PageSelection::Range(start, end));
    }

    // "1,3,5-7": expand every range into the set.
    let mut pages = Vec::new();
    for part in parts {
        if part.contains('-') {
            let (start, end) = parse_page_range(part)?;
            pages.extend(start..=end);
        } else {
            pages.push(parse_page_number(part)?);
        }
    }
    Ok(PageSelection::Set(pages))
}

fn parse_page_number(s: &str) -> Result<usize> {
    let page: usize = s
        .trim()
        .parse()
        .with_context(|| format!("Invalid page number: '{}'", s.trim()))?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }
    Ok(page)
}

fn parse_page_range(s: &str) -> Result<(usize, usize)> {
    let (start, end) = s
        .split_once('-')
        .with_context(|| format!("Invalid page range: '{}'", s))?;
    let start = parse_page_number(start)?;
    let end = parse_page_number(end)?;
    if start > end {
        anyhow::bail!("Invalid page range '{}-{}': start must be <= end", start, end);
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_selections() {
        assert!(matches!(parse_pages("all").unwrap(), PageSelection::All));
        assert!(matches!(parse_pages(" 5 ").unwrap(), PageSelection::Single(5)));
        assert!(matches!(parse_pages("3-15").unwrap(), PageSelection::Range(3, 15)));
        match parse_pages("1,3,5-7").unwrap() {
            PageSelection::Set(pages) => assert_eq!(pages, vec![1, 3, 5, 6, 7]),
            other => panic!("expected a set, got {other:?}"),
        }
    }

    #[test]
    fn bad_page_selections() {
        assert!(parse_pages("0").is_err());
        assert!(parse_pages("7-3").is_err());
        assert!(parse_pages("1,x").is_err());
        assert!(parse_pages(",").is_err());
    }
}
