//! Encoder contract: one face image in, one embedding (or no face) out.

use crate::types::Embedding;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("image decode failed for {source_name}: {reason}")]
    Decode { source_name: String, reason: String },
    #[error("encoder failed: {0}")]
    Failed(String),
    #[error("encoder I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded RGB8 image handed to an encoder.
#[derive(Debug, Clone)]
pub struct FaceImage {
    /// Where the image came from (corpus path, spool file, object key).
    pub source: String,
    pub width: u32,
    pub height: u32,
    /// Packed RGB8 pixels, `width * height * 3` bytes.
    pub rgb: Vec<u8>,
}

impl FaceImage {
    /// Decode an encoded image (JPEG, PNG, ...) into RGB8.
    pub fn decode(source: impl Into<String>, bytes: &[u8]) -> Result<Self, EncoderError> {
        let source = source.into();
        let decoded = image::load_from_memory(bytes).map_err(|e| EncoderError::Decode {
            source_name: source.clone(),
            reason: e.to_string(),
        })?;
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();

        Ok(Self {
            source,
            width,
            height,
            rgb: rgb.into_raw(),
        })
    }
}

/// Result of encoding one image. Finding no face is an expected outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoding {
    Face(Embedding),
    NoFace,
}

/// Turns a face image into an embedding vector.
pub trait Encoder {
    fn encode(&mut self, image: &FaceImage) -> Result<Encoding, EncoderError>;
}

impl<E: Encoder + ?Sized> Encoder for Box<E> {
    fn encode(&mut self, image: &FaceImage) -> Result<Encoding, EncoderError> {
        (**self).encode(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    #[test]
    fn test_decode_png_to_rgb() {
        let img = RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let face = FaceImage::decode("ana/1.png", &bytes).unwrap();
        assert_eq!(face.width, 4);
        assert_eq!(face.height, 3);
        assert_eq!(face.rgb.len(), 4 * 3 * 3);
        assert_eq!(&face.rgb[..3], &[10, 20, 30]);
        assert_eq!(face.source, "ana/1.png");
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let err = FaceImage::decode("ana/broken.jpg", b"not an image").unwrap_err();
        match err {
            EncoderError::Decode { source_name, .. } => assert_eq!(source_name, "ana/broken.jpg"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
