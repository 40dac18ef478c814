//! PDF rasterisation: render pages to `DynamicImage` via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto a dedicated thread pool
//! thread designed for blocking operations, preventing the Tokio worker
//! threads from stalling during CPU-heavy rendering.
//!
//! ## DPI and the pixel cap
//!
//! Pages are rendered at the configured DPI, but page sizes vary wildly: an
//! A0 poster at 150 DPI would produce a 12,000 × 17,000 px image. The
//! `max_rendered_pixels` cap bounds the longest edge regardless of physical
//! size, keeping memory bounded.
//!
//! ## Context strips
//!
//! The verifier looks at the bottom quarter of the previous page and the top
//! quarter of the next one to judge sentences and tables that cross a page
//! break. [`PageImages::context_image`] crops those strips from the rendered
//! page.

use super::encode::encode_page;
use crate::error::{PageError, TranslateError};
use async_trait::async_trait;
use edgequake_llm::ImageData;
use image::DynamicImage;
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Which part of a rendered page to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSection {
    /// Top quarter.
    Top,
    /// Bottom quarter.
    Bottom,
    Full,
}

/// Source of page images for the processor and the verifier.
#[async_trait]
pub trait PageImages: Send + Sync {
    fn page_count(&self) -> usize;

    /// Rasterise a 1-indexed page.
    async fn render_page(&self, page: usize) -> Result<DynamicImage, PageError>;

    /// Encoded image of a page section, or None if the page does not exist
    /// or cannot be rendered.
    async fn context_image(&self, page: usize, section: ImageSection) -> Option<ImageData> {
        if page == 0 || page > self.page_count() {
            return None;
        }
        let image = self.render_page(page).await.ok()?;
        encode_page(&crop_section(&image, section)).ok()
    }
}

/// Crop a quarter-height strip (or nothing, for `Full`).
pub fn crop_section(image: &DynamicImage, section: ImageSection) -> DynamicImage {
    let (w, h) = (image.width(), image.height());
    let strip = (h / 4).max(1).min(h);
    match section {
        ImageSection::Full => image.clone(),
        ImageSection::Top => image.crop_imm(0, 0, w, strip),
        ImageSection::Bottom => image.crop_imm(0, h - strip, w, strip),
    }
}

/// Pages of one PDF file, rendered on demand and cached.
pub struct PdfPageSource {
    path: PathBuf,
    password: Option<String>,
    dpi: u32,
    max_pixels: u32,
    page_count: usize,
    cache: Mutex<HashMap<usize, DynamicImage>>,
}

impl std::fmt::Debug for PdfPageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfPageSource")
            .field("path", &self.path)
            .field("page_count", &self.page_count)
            .field("dpi", &self.dpi)
            .field("max_pixels", &self.max_pixels)
            .finish()
    }
}

impl PdfPageSource {
    /// Open a PDF and read its page count.
    pub async fn open(
        path: impl AsRef<Path>,
        password: Option<String>,
        dpi: u32,
        max_pixels: u32,
    ) -> Result<Arc<Self>, TranslateError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(TranslateError::FileNotFound { path });
        }

        let probe_path = path.clone();
        let probe_password = password.clone();
        let page_count = tokio::task::spawn_blocking(move || {
            let pdfium = bind_pdfium()?;
            let document = load_document(&pdfium, &probe_path, probe_password.as_deref())?;
            let count = document.pages().len() as usize;
            Ok::<_, TranslateError>(count)
        })
        .await
        .map_err(|e| TranslateError::Internal(format!("Render task panicked: {}", e)))??;

        info!("PDF loaded: {} pages", page_count);
        Ok(Arc::new(Self {
            path,
            password,
            dpi,
            max_pixels,
            page_count,
            cache: Mutex::new(HashMap::new()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PageImages for PdfPageSource {
    fn page_count(&self) -> usize {
        self.page_count
    }

    async fn render_page(&self, page: usize) -> Result<DynamicImage, PageError> {
        if page == 0 || page > self.page_count {
            return Err(PageError::RenderFailed {
                page,
                detail: format!("out of range (document has {} pages)", self.page_count),
            });
        }
        let cached = self.cache.lock().get(&page).cloned();
        if let Some(image) = cached {
            return Ok(image);
        }

        let path = self.path.clone();
        let password = self.password.clone();
        let (dpi, max_pixels) = (self.dpi, self.max_pixels);
        let image = tokio::task::spawn_blocking(move || {
            render_page_blocking(&path, password.as_deref(), dpi, max_pixels, page)
        })
        .await
        .map_err(|e| PageError::RenderFailed {
            page,
            detail: format!("render task panicked: {}", e),
        })??;

        self.cache.lock().insert(page, image.clone());
        Ok(image)
    }
}

/// Bind pdfium: `PDFIUM_LIB_PATH` if set, then a library next to the
/// working directory, then the system library.
fn bind_pdfium() -> Result<Pdfium, TranslateError> {
    let bindings = match std::env::var_os("PDFIUM_LIB_PATH") {
        Some(path) => Pdfium::bind_to_library(&path),
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| TranslateError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

fn load_document<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, TranslateError> {
    pdfium.load_pdf_from_file(path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                TranslateError::WrongPassword {
                    path: path.to_path_buf(),
                }
            } else {
                TranslateError::PasswordRequired {
                    path: path.to_path_buf(),
                }
            }
        } else {
            TranslateError::CorruptPdf {
                path: path.to_path_buf(),
                detail: err_str,
            }
        }
    })
}

/// Blocking implementation of page rendering (1-indexed page).
fn render_page_blocking(
    path: &Path,
    password: Option<&str>,
    dpi: u32,
    max_pixels: u32,
    page: usize,
) -> Result<DynamicImage, PageError> {
    let failed = |detail: String| PageError::RenderFailed { page, detail };

    let pdfium = bind_pdfium().map_err(|e| failed(e.to_string()))?;
    let document = load_document(&pdfium, path, password).map_err(|e| failed(e.to_string()))?;

    let pages = document.pages();
    let pdf_page = pages
        .get((page - 1) as u16)
        .map_err(|e| failed(format!("{:?}", e)))?;

    let (width_px, height_px) = target_size(pdf_page.width().value, pdf_page.height().value, dpi, max_pixels);
    let render_config = PdfRenderConfig::new()
        .set_target_width(width_px)
        .set_maximum_height(height_px);
    let bitmap = pdf_page
        .render_with_config(&render_config)
        .map_err(|e| failed(format!("{:?}", e)))?;

    let image = bitmap.as_image();
    debug!("Rendered page {} → {}x{} px", page, image.width(), image.height());
    Ok(image)
}

/// Pixel size of a page of `width_pt` × `height_pt` points at `dpi`,
/// scaled down so the longest edge fits `max_pixels`.
fn target_size(width_pt: f32, height_pt: f32, dpi: u32, max_pixels: u32) -> (i32, i32) {
    let scale = dpi as f32 / 72.0;
    let (w, h) = (width_pt * scale, height_pt * scale);
    let longest = w.max(h).max(1.0);
    let shrink = (max_pixels as f32 / longest).min(1.0);
    (
        ((w * shrink).round() as i32).max(1),
        ((h * shrink).round() as i32).max(1),
    )
}
