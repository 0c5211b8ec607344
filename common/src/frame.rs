use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb, RgbImage};

/// One uncompressed camera sample: tightly packed 8-bit RGB, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Number of bytes a well-formed frame of these dimensions carries.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl From<RgbImage> for RawFrame {
    fn from(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            pixels: img.into_raw(),
        }
    }
}

/// A JPEG-compressed frame ready to be served.
///
/// The payload is reference counted, so handing a copy to every reader of
/// the frame slot never duplicates the image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub jpeg_data: Bytes,
    /// Capture loop iteration that produced this frame.
    pub seq: u64,
    pub captured_at_ms: i64,
}

impl EncodedFrame {
    pub fn new(jpeg_data: impl Into<Bytes>, seq: u64, captured_at_ms: i64) -> Self {
        Self {
            jpeg_data: jpeg_data.into(),
            seq,
            captured_at_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.jpeg_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg_data.is_empty()
    }
}

/// Compress a raw frame to JPEG at the given quality (0..=100).
///
/// Quality 0 is encoded as 1, the lowest level the JPEG encoder accepts.
pub fn encode_jpeg(raw: &RawFrame, quality: u8) -> Result<Vec<u8>, EncodeError> {
    if raw.width == 0 || raw.height == 0 {
        return Err(EncodeError::EmptyImage {
            width: raw.width,
            height: raw.height,
        });
    }
    if raw.pixels.len() != raw.expected_len() {
        return Err(EncodeError::BufferSize {
            got: raw.pixels.len(),
            expected: raw.expected_len(),
        });
    }

    let img = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(raw.width, raw.height, raw.pixels.as_slice())
        .ok_or(EncodeError::BufferSize {
            got: raw.pixels.len(),
            expected: raw.expected_len(),
        })?;

    let mut jpeg = Vec::with_capacity(raw.pixels.len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode_image(&img)
        .map_err(|e| EncodeError::Jpeg(e.to_string()))?;
    Ok(jpeg)
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("raw frame has zero dimension: {width}x{height}")]
    EmptyImage { width: u32, height: u32 },
    #[error("raw frame buffer has {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
    #[error("JPEG encoding failed: {0}")]
    Jpeg(String),
}
