//! Pipeline artifacts.

use std::fmt;
use std::sync::Arc;

use image::DynamicImage;

/// A decoded (and possibly processed) image.
///
/// The pixel data sits behind an `Arc`, so containers are cheap to clone
/// when one decode result is delivered to several callers.
#[derive(Clone)]
pub struct ImageContainer {
    image: Arc<DynamicImage>,
    is_preview: bool,
}

impl ImageContainer {
    /// Wraps a final image.
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
            is_preview: false,
        }
    }

    /// Wraps a progressive preview decoded from partial data.
    pub fn preview(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
            is_preview: true,
        }
    }

    /// Returns the image.
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    /// Returns a shared handle to the image.
    pub fn shared_image(&self) -> Arc<DynamicImage> {
        Arc::clone(&self.image)
    }

    /// True when this is a partial-data preview.
    pub fn is_preview(&self) -> bool {
        self.is_preview
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Size of the decoded pixel buffer in bytes, used as the cache cost.
    pub fn cost(&self) -> usize {
        self.image.as_bytes().len()
    }

    /// Returns a copy with the image replaced and the preview flag kept.
    pub fn map(&self, image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
            is_preview: self.is_preview,
        }
    }
}

impl fmt::Debug for ImageContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageContainer")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("color", &self.image.color())
            .field("is_preview", &self.is_preview)
            .finish()
    }
}

/// Where a response was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    /// The memory cache fast path.
    Memory,
}

/// Final result of a pipeline request.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub container: ImageContainer,

    /// `Some` when served from a cache instead of the load/decode chain.
    pub cache_type: Option<CacheType>,
}

impl ImageResponse {
    pub fn new(container: ImageContainer, cache_type: Option<CacheType>) -> Self {
        Self {
            container,
            cache_type,
        }
    }

    pub fn image(&self) -> &DynamicImage {
        self.container.image()
    }
}
