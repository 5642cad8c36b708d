//! Reading a selected diagram into memory.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use image::RgbaImage;

use crate::error::{AppError, Result};

/// A decoded diagram together with the bytes that get sent to the model.
#[derive(Clone)]
pub struct UploadedImage {
    source: PathBuf,
    mime_type: &'static str,
    bytes: Vec<u8>,
    pixels: RgbaImage,
}

impl std::fmt::Debug for UploadedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadedImage")
            .field("source", &self.source)
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.bytes.len())
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

impl UploadedImage {
    /// Decode `bytes` read from `source`.
    pub fn from_bytes(source: impl Into<PathBuf>, bytes: Vec<u8>) -> Result<Self> {
        let source = source.into();
        let decode_err = |reason: String| AppError::Decode {
            path: source.clone(),
            reason,
        };
        let format = image::guess_format(&bytes).map_err(|e| decode_err(e.to_string()))?;
        let pixels = image::load_from_memory_with_format(&bytes, format)
            .map_err(|e| decode_err(e.to_string()))?
            .to_rgba8();
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(decode_err("image has no pixels".to_string()));
        }
        Ok(Self {
            mime_type: format.to_mime_type(),
            source,
            bytes,
            pixels,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Standard base64 of the original file bytes.
    pub fn base64_data(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

/// Load the first path of `selection`. An empty selection is not an error and yields `None`.
pub async fn acquire(selection: &[PathBuf]) -> Result<Option<UploadedImage>> {
    let Some(path) = selection.first() else {
        return Ok(None);
    };
    if selection.len() > 1 {
        tracing::debug!(ignored = selection.len() - 1, "only the first selected file is used");
    }

    let bytes = tokio::fs::read(path).await.map_err(|e| AppError::Decode {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "read image file");

    let source = path.clone();
    let image = tokio::task::spawn_blocking(move || UploadedImage::from_bytes(source, bytes))
        .await
        .map_err(|e| AppError::Decode {
            path: path.clone(),
            reason: format!("decoder task failed: {e}"),
        })??;

    tracing::info!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        mime = image.mime_type(),
        "image loaded"
    );
    Ok(Some(image))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use image::{ImageFormat, Rgba};
    use std::io::Cursor;

    /// PNG-encoded solid image.
    pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([40, 120, 60, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    pub fn uploaded(width: u32, height: u32) -> UploadedImage {
        UploadedImage::from_bytes("diagram.png", png_bytes(width, height)).unwrap()
    }
}
