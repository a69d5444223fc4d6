//! Image processors applied after decoding.
//!
//! Processors run in request order on the decoded image. Each one has an
//! identifier that becomes part of the [`CacheKey`](crate::request::CacheKey),
//! so two requests for the same source with different processing are cached
//! separately but still share one load and one decode.

use std::fmt;
use std::sync::Arc;

use image::imageops::FilterType;
use image::DynamicImage;

use crate::error::ProcessingError;

/// Transforms a decoded image.
pub trait ImageProcessor: Send + Sync {
    /// Stable identifier describing this processor and its parameters.
    ///
    /// Two processors with equal identifiers must produce equal output.
    fn identifier(&self) -> String;

    /// Applies the processor.
    fn process(&self, image: &DynamicImage) -> Result<DynamicImage, ProcessingError>;
}

impl fmt::Debug for dyn ImageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageProcessor({})", self.identifier())
    }
}

/// Scales an image to fit within a target size, preserving aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
    pub filter: FilterType,
}

impl Resize {
    /// Creates a Lanczos resize to fit within `width` x `height`.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            filter: FilterType::Lanczos3,
        }
    }

    /// Uses a different resampling filter.
    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }
}

impl ImageProcessor for Resize {
    fn identifier(&self) -> String {
        format!("resize({}x{},{:?})", self.width, self.height, self.filter)
    }

    fn process(&self, image: &DynamicImage) -> Result<DynamicImage, ProcessingError> {
        if self.width == 0 || self.height == 0 {
            return Err(ProcessingError::new(
                self.identifier(),
                "target size must be non-zero",
            ));
        }
        Ok(image.resize(self.width, self.height, self.filter))
    }
}

/// Crops a rectangle out of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Crop {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl ImageProcessor for Crop {
    fn identifier(&self) -> String {
        format!("crop({},{},{}x{})", self.x, self.y, self.width, self.height)
    }

    fn process(&self, image: &DynamicImage) -> Result<DynamicImage, ProcessingError> {
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        match (right, bottom) {
            (Some(r), Some(b))
                if self.width > 0 && self.height > 0 && r <= image.width() && b <= image.height() =>
            {
                Ok(image.crop_imm(self.x, self.y, self.width, self.height))
            }
            _ => Err(ProcessingError::new(
                self.identifier(),
                format!(
                    "crop rectangle outside {}x{} image",
                    image.width(),
                    image.height()
                ),
            )),
        }
    }
}

/// Gaussian blur with the given standard deviation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianBlur {
    pub sigma: f32,
}

impl GaussianBlur {
    pub fn new(sigma: f32) -> Self {
        Self { sigma }
    }
}

impl ImageProcessor for GaussianBlur {
    fn identifier(&self) -> String {
        format!("blur({})", self.sigma)
    }

    fn process(&self, image: &DynamicImage) -> Result<DynamicImage, ProcessingError> {
        if !self.sigma.is_finite() || self.sigma < 0.0 {
            return Err(ProcessingError::new(self.identifier(), "invalid sigma"));
        }
        Ok(image.blur(self.sigma))
    }
}

type ProcessFn = dyn Fn(&DynamicImage) -> Result<DynamicImage, ProcessingError> + Send + Sync;

/// Processor backed by a closure.
pub struct FnProcessor {
    identifier: String,
    process: Arc<ProcessFn>,
}

impl FnProcessor {
    pub fn new(
        identifier: impl Into<String>,
        process: impl Fn(&DynamicImage) -> Result<DynamicImage, ProcessingError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            process: Arc::new(process),
        }
    }
}

impl fmt::Debug for FnProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor")
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl ImageProcessor for FnProcessor {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    fn process(&self, image: &DynamicImage) -> Result<DynamicImage, ProcessingError> {
        (self.process)(image)
    }
}

/// Forces an image into a flat RGBA8 buffer ready for display.
pub fn decompress(image: &DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageRgba8(_) => image.clone(),
        other => DynamicImage::ImageRgba8(other.to_rgba8()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([10, 20, 30])))
    }

    #[test]
    fn test_resize_preserves_aspect_ratio() {
        let out = Resize::new(50, 50).process(&test_image(200, 100)).unwrap();
        assert_eq!((out.width(), out.height()), (50, 25));
    }

    #[test]
    fn test_resize_rejects_zero_size() {
        let err = Resize::new(0, 10).process(&test_image(4, 4)).unwrap_err();
        assert!(err.processor.starts_with("resize"));
    }

    #[test]
    fn test_identifiers_include_parameters() {
        assert_ne!(
            Resize::new(10, 10).identifier(),
            Resize::new(10, 20).identifier()
        );
        assert_eq!(Crop::new(1, 2, 3, 4).identifier(), "crop(1,2,3x4)");
        assert_eq!(GaussianBlur::new(2.5).identifier(), "blur(2.5)");
    }

    #[test]
    fn test_crop() {
        let out = Crop::new(10, 10, 20, 30).process(&test_image(100, 100)).unwrap();
        assert_eq!((out.width(), out.height()), (20, 30));

        assert!(Crop::new(90, 0, 20, 10).process(&test_image(100, 100)).is_err());
        assert!(Crop::new(0, 0, 0, 10).process(&test_image(100, 100)).is_err());
    }

    #[test]
    fn test_blur_keeps_dimensions() {
        let out = GaussianBlur::new(1.5).process(&test_image(16, 8)).unwrap();
        assert_eq!((out.width(), out.height()), (16, 8));
        assert!(GaussianBlur::new(f32::NAN).process(&test_image(4, 4)).is_err());
    }

    #[test]
    fn test_fn_processor() {
        let flip = FnProcessor::new("flip", |img: &DynamicImage| Ok(img.fliph()));
        assert_eq!(flip.identifier(), "flip");
        let out = flip.process(&test_image(3, 2)).unwrap();
        assert_eq!(out.width(), 3);
    }

    #[test]
    fn test_decompress_converts_to_rgba8() {
        let out = decompress(&test_image(2, 2));
        assert!(matches!(out, DynamicImage::ImageRgba8(_)));
        assert_eq!(out.as_bytes().len(), 2 * 2 * 4);
    }
}
