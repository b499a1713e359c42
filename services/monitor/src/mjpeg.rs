//! JPEG encoding and `multipart/x-mixed-replace` framing.

use crate::capture::Frame;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use std::convert::Infallible;
use thiserror::Error;

/// Multipart boundary shared by every continuous stream.
pub const BOUNDARY: &str = "frame";

/// Content type of a continuous stream response.
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Errors that can occur while encoding a frame.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),

    #[error("Encode task failed: {0}")]
    TaskFailed(String),
}

/// Encode a frame as baseline JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Bytes, EncodeError> {
    let mut out = Vec::with_capacity(frame.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(frame)?;
    Ok(Bytes::from(out))
}

/// Downscale frames wider than `max_width`, keeping the aspect ratio.
pub fn downscale(frame: Frame, max_width: u32) -> Frame {
    let (width, height) = frame.dimensions();
    if max_width == 0 || width <= max_width {
        return frame;
    }

    let scaled_height = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;
    imageops::resize(&frame, max_width, scaled_height, FilterType::Triangle)
}

/// Wrap one JPEG as a multipart part.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );

    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Streaming response over a sequence of multipart parts.
pub fn response<S>(parts: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE)),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            ),
            (header::PRAGMA, HeaderValue::from_static("no-cache")),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_part_framing() {
        let part = encode_part(b"JPEG");
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nJPEG\r\n"
        );
    }

    #[test]
    fn test_encode_produces_jpeg() {
        let frame = Frame::from_pixel(16, 8, Rgb([120, 120, 120]));
        let jpeg = encode_jpeg(&frame, 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[test]
    fn test_downscale_wide_frames_only() {
        let wide = Frame::from_pixel(2000, 1000, Rgb([0, 0, 0]));
        assert_eq!(downscale(wide, 1280).dimensions(), (1280, 640));

        let narrow = Frame::from_pixel(640, 480, Rgb([0, 0, 0]));
        assert_eq!(downscale(narrow, 1280).dimensions(), (640, 480));
    }

    #[test]
    fn test_downscale_keeps_at_least_one_row() {
        let strip = Frame::from_pixel(5000, 1, Rgb([0, 0, 0]));
        assert_eq!(downscale(strip, 1280).dimensions(), (1280, 1));
    }
}
