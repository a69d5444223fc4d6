//! Image decoding collaborator.

use image::DynamicImage;
use tracing::debug;

/// Turns accumulated bytes into an image.
///
/// With progressive decoding enabled the decoder is called repeatedly with
/// a growing buffer and `is_final == false`; returning `None` there simply
/// means "not yet decodable". For final data, `None` is a decode failure.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, data: &[u8], is_final: bool) -> Option<DynamicImage>;
}

/// Decoder for every format the `image` crate was built with.
///
/// Partial data is never decoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultImageDecoder;

impl ImageDecoder for DefaultImageDecoder {
    fn decode(&self, data: &[u8], is_final: bool) -> Option<DynamicImage> {
        if !is_final {
            return None;
        }
        match image::load_from_memory(data) {
            Ok(image) => Some(image),
            Err(e) => {
                debug!(len = data.len(), error = %e, "Failed to decode image data");
                None
            }
        }
    }
}
