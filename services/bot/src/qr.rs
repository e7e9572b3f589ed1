use image::{GrayImage, ImageFormat, Luma};
use qrcode::{Color, EcLevel, QrCode};
use std::io::Cursor;
use thiserror::Error;

/// Pixels per QR module
const MODULE_PX: u32 = 10;
/// Light border around the code, in modules
const QUIET_ZONE: u32 = 4;

#[derive(Error, Debug)]
pub enum QrError {
    #[error("Nothing to encode")]
    Empty,

    #[error("Text does not fit in a QR code: {0}")]
    Encode(#[from] qrcode::types::QrError),

    #[error("PNG encoding failed: {0}")]
    Png(#[from] image::ImageError),

    #[error("Rendering task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Render `text` as a black-on-white PNG QR code
pub fn render_png(text: &str) -> Result<Vec<u8>, QrError> {
    if text.trim().is_empty() {
        return Err(QrError::Empty);
    }

    let code = QrCode::with_error_correction_level(text.as_bytes(), EcLevel::L)?;
    let width = code.width() as u32;
    let colors = code.to_colors();
    let side = (width + 2 * QUIET_ZONE) * MODULE_PX;

    let image = GrayImage::from_fn(side, side, |x, y| {
        let (mx, my) = (x / MODULE_PX, y / MODULE_PX);
        let inside = (QUIET_ZONE..QUIET_ZONE + width).contains(&mx)
            && (QUIET_ZONE..QUIET_ZONE + width).contains(&my);
        let dark = inside
            && colors[((my - QUIET_ZONE) * width + (mx - QUIET_ZONE)) as usize] == Color::Dark;
        Luma([if dark { 0 } else { 255 }])
    });

    let mut png = Cursor::new(Vec::new());
    image.write_to(&mut png, ImageFormat::Png)?;
    Ok(png.into_inner())
}

/// `render_png` on the blocking pool
pub async fn render_png_blocking(text: String) -> Result<Vec<u8>, QrError> {
    tokio::task::spawn_blocking(move || render_png(&text)).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_renders_png_with_quiet_zone() {
        let png = render_png("https://telegram.org").unwrap();
        assert!(png.starts_with(PNG_MAGIC));

        let decoded = image::load_from_memory(&png).unwrap().to_luma8();
        let side = decoded.width();
        assert_eq!(decoded.height(), side);
        assert_eq!(side % MODULE_PX, 0);

        // Border is light, the finder pattern corner right after it is dark
        let edge = QUIET_ZONE * MODULE_PX;
        assert_eq!(decoded.get_pixel(0, 0).0, [255]);
        assert_eq!(decoded.get_pixel(edge - 1, edge - 1).0, [255]);
        assert_eq!(decoded.get_pixel(edge, edge).0, [0]);
    }

    #[test]
    fn test_unicode_text() {
        assert!(render_png("Привет, мир!").is_ok());
    }

    #[test]
    fn test_empty_text_is_rejected() {
        assert!(matches!(render_png("   "), Err(QrError::Empty)));
    }

    #[test]
    fn test_oversized_text_is_rejected() {
        let text = "x".repeat(8000);
        assert!(matches!(render_png(&text), Err(QrError::Encode(_))));
    }

    #[tokio::test]
    async fn test_blocking_render() {
        let png = render_png_blocking("hello".to_string()).await.unwrap();
        assert!(png.starts_with(PNG_MAGIC));
    }
}
