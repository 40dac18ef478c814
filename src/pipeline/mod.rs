//! Pipeline stages for translating one page.
//!
//! Each submodule implements exactly one step, so each is testable on its
//! own and the provider-facing parts sit behind traits.
//!
//! ## Data Flow
//!
//! ```text
//! render ──▶ encode ──▶ llm ──▶ postprocess ──▶ store
//! (pdfium)   (base64)   (VLM)   (cleanup)
//! ```
//!
//! 1. [`render`]: rasterise a page; runs in `spawn_blocking` because pdfium
//!    is not async-safe. Also crops the context strips the verifier sends.
//! 2. [`encode`]: PNG-encode and base64-wrap each `DynamicImage` for the
//!    multimodal request body
//! 3. [`llm`]: the provider calls, with cooldown fallback and
//!    retry/backoff; the only stage with network I/O
//! 4. [`postprocess`]: deterministic cleanup of model quirks and the
//!    annotation block
//! 5. [`processor`]: ties the stages together for one admitted page and
//!    hands the result to the verifier

pub mod encode;
pub mod llm;
pub mod postprocess;
pub mod processor;
pub mod render;
