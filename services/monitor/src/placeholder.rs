//! Labelled stand-in frames for streams with nothing to show.

use crate::capture::Frame;
use crate::mjpeg::{self, EncodeError};
use bytes::Bytes;
use font8x8::legacy::BASIC_LEGACY;
use image::Rgb;

const GLYPH: u32 = 8;

/// Placeholder shown while the camera cannot be reached.
pub const CAMERA_DISCONNECTED: &str = "CAMERA DISCONNECTED";

/// Placeholder shown while a mobile session has not pushed a frame yet.
pub const WAITING_FOR_MOBILE: &str = "WAITING FOR MOBILE...";

/// A pre-encoded placeholder, ready to be sent as-is.
#[derive(Debug, Clone)]
pub struct Placeholder {
    jpeg: Bytes,
    part: Bytes,
}

impl Placeholder {
    pub fn new(width: u32, height: u32, text: &str, quality: u8) -> Result<Self, EncodeError> {
        let jpeg = mjpeg::encode_jpeg(&render(width, height, text), quality)?;
        let part = mjpeg::encode_part(&jpeg);
        Ok(Self { jpeg, part })
    }

    pub fn jpeg(&self) -> Bytes {
        self.jpeg.clone()
    }

    /// The placeholder framed as a multipart part.
    pub fn part(&self) -> Bytes {
        self.part.clone()
    }
}

/// Black frame with `text` in white, scaled up and centred.
pub fn render(width: u32, height: u32, text: &str) -> Frame {
    let mut frame = Frame::new(width.max(1), height.max(1));
    let chars = text.chars().count() as u32;
    if chars == 0 {
        return frame;
    }

    // Largest integer scale that fits 80% of the width and a quarter of the height
    let scale = ((width * 8 / 10) / (chars * GLYPH))
        .min(height / 4 / GLYPH)
        .max(1);
    let text_width = chars * GLYPH * scale;
    let text_height = GLYPH * scale;
    let left = width.saturating_sub(text_width) / 2;
    let top = height.saturating_sub(text_height) / 2;

    for (i, ch) in text.chars().enumerate() {
        let glyph = BASIC_LEGACY
            .get(ch as usize)
            .copied()
            .unwrap_or(BASIC_LEGACY[b'?' as usize]);
        let origin_x = left + i as u32 * GLYPH * scale;

        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH {
                if bits & (1 << col) == 0 {
                    continue;
                }
                let x0 = origin_x + col * scale;
                let y0 = top + row as u32 * scale;
                for y in y0..(y0 + scale).min(frame.height()) {
                    for x in x0..(x0 + scale).min(frame.width()) {
                        frame.put_pixel(x, y, Rgb([255, 255, 255]));
                    }
                }
            }
        }
    }

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit_pixels(frame: &Frame) -> usize {
        frame.pixels().filter(|p| p.0 == [255, 255, 255]).count()
    }

    #[test]
    fn test_render_draws_centred_text() {
        let frame = render(640, 480, CAMERA_DISCONNECTED);
        assert_eq!(frame.dimensions(), (640, 480));
        assert!(lit_pixels(&frame) > 0);

        // Corners stay black
        assert_eq!(frame.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(frame.get_pixel(639, 479), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_render_tiny_frame_does_not_panic() {
        let frame = render(4, 4, WAITING_FOR_MOBILE);
        assert_eq!(frame.dimensions(), (4, 4));
    }

    #[test]
    fn test_render_empty_text_is_black() {
        assert_eq!(lit_pixels(&render(32, 32, "")), 0);
    }

    #[test]
    fn test_placeholder_part_wraps_jpeg() {
        let placeholder = Placeholder::new(320, 240, WAITING_FOR_MOBILE, 85).unwrap();
        let jpeg = placeholder.jpeg();
        let part = placeholder.part();
        assert!(part.starts_with(b"--frame\r\n"));
        assert_eq!(part.len(), mjpeg::encode_part(&jpeg).len());
    }
}
