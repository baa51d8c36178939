//! QR decode boundary.
//!
//! The flow only needs `decode(pixels, width, height) -> Option<String>`.
//! [`RqrrDecoder`] fills that role with the `rqrr` crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("frame buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },
    #[error("QR decode failed: {0}")]
    Decode(String),
}

/// Decodes a QR symbol from an 8-bit grayscale image.
pub trait QrDecoder: Send + Sync {
    fn decode(&self, pixels: &[u8], width: u32, height: u32)
        -> Result<Option<String>, DecodeError>;
}

/// Decoder backed by `rqrr`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RqrrDecoder;

impl QrDecoder for RqrrDecoder {
    fn decode(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<String>, DecodeError> {
        let (w, h) = (width as usize, height as usize);
        if pixels.len() < w * h {
            return Err(DecodeError::BufferTooShort {
                expected: w * h,
                actual: pixels.len(),
            });
        }

        let mut prepared =
            rqrr::PreparedImage::prepare_from_greyscale(w, h, |x, y| pixels[y * w + x]);
        let grids = prepared.detect_grids();

        let mut last_err = None;
        for grid in grids {
            match grid.decode() {
                Ok((_, content)) => return Ok(Some(content)),
                Err(e) => {
                    tracing::debug!(error = ?e, "grid decode failed");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(DecodeError::Decode(format!("{e:?}"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrcode::{Color, QrCode};

    /// Render `text` as a grayscale QR image with a four-module quiet zone.
    fn render(text: &str, scale: usize) -> (Vec<u8>, u32) {
        let code = QrCode::new(text.as_bytes()).unwrap();
        let modules = code.width();
        let colors = code.to_colors();
        let quiet = 4;
        let side = (modules + 2 * quiet) * scale;

        let mut pixels = vec![255u8; side * side];
        for y in 0..side {
            for x in 0..side {
                let (mx, my) = (x / scale, y / scale);
                let inside = (quiet..quiet + modules).contains(&mx)
                    && (quiet..quiet + modules).contains(&my);
                if inside && colors[(my - quiet) * modules + (mx - quiet)] == Color::Dark {
                    pixels[y * side + x] = 0;
                }
            }
        }
        (pixels, side as u32)
    }

    #[test]
    fn test_decodes_rendered_badge() {
        let (pixels, side) = render("BADGE123", 6);
        let decoded = RqrrDecoder.decode(&pixels, side, side).unwrap();
        assert_eq!(decoded.as_deref(), Some("BADGE123"));
    }

    #[test]
    fn test_decodes_badge_inside_larger_frame() {
        let (symbol, side) = render("EMP-0042/visitor", 4);
        let (w, h) = (side as usize + 120, side as usize + 80);
        let mut pixels = vec![200u8; w * h];
        for row in 0..side as usize {
            let dst = (row + 40) * w + 60;
            pixels[dst..dst + side as usize]
                .copy_from_slice(&symbol[row * side as usize..(row + 1) * side as usize]);
        }
        let decoded = RqrrDecoder.decode(&pixels, w as u32, h as u32).unwrap();
        assert_eq!(decoded.as_deref(), Some("EMP-0042/visitor"));
    }

    #[test]
    fn test_blank_image_has_no_code() {
        let pixels = vec![255u8; 64 * 64];
        assert!(RqrrDecoder.decode(&pixels, 64, 64).unwrap().is_none());
    }

    #[test]
    fn test_short_buffer() {
        let err = RqrrDecoder.decode(&[0u8; 10], 8, 8).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::BufferTooShort {
                expected: 64,
                actual: 10
            }
        ));
    }
}
