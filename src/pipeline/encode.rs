//! Image encoding: `DynamicImage` → base64 PNG wrapped in `ImageData`.
//!
//! Provider APIs take images as base64 payloads inside the JSON request
//! body. PNG keeps scanned glyphs crisp; JPEG artefacts around small print
//! are a common source of misread characters, which then show up as
//! mistranslations. Both the translator and the verifier request
//! `detail: "high"` so fine print survives the provider's tiling.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rendered page (or a strip of one) for a multimodal request.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&png);
    debug!(
        "Encoded {}x{} image → {} bytes base64",
        img.width(),
        img.height(),
        b64.len()
    );

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}
