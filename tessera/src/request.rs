//! Image requests and the keys derived from them.
//!
//! A request yields three keys of increasing specificity:
//!
//! | Key | Composed of | Used by |
//! |---|---|---|
//! | [`LoadKey`] | source | load task pool |
//! | [`DecodeKey`] | load key + decode options | decode task pool |
//! | [`CacheKey`] | decode key + processor identifiers | memory cache, preheater |
//!
//! Requests that differ only in processing share one load and one decode.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::processing::ImageProcessor;
use crate::task::Priority;

/// Where the image bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageSource {
    /// A URL fetched by the data loader.
    Url(String),
}

impl ImageSource {
    pub fn as_str(&self) -> &str {
        match self {
            ImageSource::Url(url) => url,
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ImageSource {
    fn from(url: &str) -> Self {
        ImageSource::Url(url.to_string())
    }
}

impl From<String> for ImageSource {
    fn from(url: String) -> Self {
        ImageSource::Url(url)
    }
}

/// Cache policy for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Look the result up in the memory cache before loading.
    pub cache_read: bool,

    /// Store the final result in the memory cache.
    pub cache_write: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            cache_read: true,
            cache_write: true,
        }
    }
}

/// Options applied while decoding. Part of the [`DecodeKey`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DecodeOptions {
    /// Downscale the decoded image so neither side exceeds this many pixels.
    pub thumbnail_max_pixel: Option<u32>,
}

/// Key of the load stage: the source only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadKey(pub ImageSource);

/// Key of the decode stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecodeKey {
    pub load: LoadKey,
    pub options: DecodeOptions,
}

/// Key of a final, processed image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub decode: DecodeKey,
    pub processors: Vec<String>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.decode.load.0)?;
        if let Some(max) = self.decode.options.thumbnail_max_pixel {
            write!(f, " [thumb {}]", max)?;
        }
        for p in &self.processors {
            write!(f, " |> {}", p)?;
        }
        Ok(())
    }
}

/// A request for a decoded, processed image.
///
/// Built once and cloned into the pipeline; never mutated afterwards.
///
/// ```
/// use std::time::Duration;
/// use tessera::processing::Resize;
/// use tessera::request::ImageRequest;
/// use tessera::task::Priority;
///
/// let request = ImageRequest::new("https://example.com/a.jpg")
///     .with_processor(Resize::new(64, 64))
///     .with_priority(Priority::HIGH)
///     .with_timeout(Duration::from_secs(10));
///
/// assert_eq!(request.cache_key().processors.len(), 1);
/// ```
#[derive(Clone)]
pub struct ImageRequest {
    source: ImageSource,
    processors: Vec<Arc<dyn ImageProcessor>>,
    priority: Priority,
    options: RequestOptions,
    decode_options: DecodeOptions,
    timeout: Option<Duration>,
    label: Option<String>,
}

impl ImageRequest {
    /// Creates a request with normal priority and default options.
    pub fn new(source: impl Into<ImageSource>) -> Self {
        Self {
            source: source.into(),
            processors: Vec::new(),
            priority: Priority::NORMAL,
            options: RequestOptions::default(),
            decode_options: DecodeOptions::default(),
            timeout: None,
            label: None,
        }
    }

    /// Appends a processor.
    pub fn with_processor(mut self, processor: impl ImageProcessor + 'static) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// Replaces the processor list.
    pub fn with_processors(mut self, processors: Vec<Arc<dyn ImageProcessor>>) -> Self {
        self.processors = processors;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_decode_options(mut self, options: DecodeOptions) -> Self {
        self.decode_options = options;
        self
    }

    /// Fails the request with a timeout error if it has not finished in time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches a label shown in log output.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn processors(&self) -> &[Arc<dyn ImageProcessor>] {
        &self.processors
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn options(&self) -> RequestOptions {
        self.options
    }

    pub fn decode_options(&self) -> DecodeOptions {
        self.decode_options
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn load_key(&self) -> LoadKey {
        LoadKey(self.source.clone())
    }

    pub fn decode_key(&self) -> DecodeKey {
        DecodeKey {
            load: self.load_key(),
            options: self.decode_options,
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            decode: self.decode_key(),
            processors: self.processors.iter().map(|p| p.identifier()).collect(),
        }
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("source", &self.source)
            .field(
                "processors",
                &self
                    .processors
                    .iter()
                    .map(|p| p.identifier())
                    .collect::<Vec<_>>(),
            )
            .field("priority", &self.priority)
            .field("options", &self.options)
            .field("decode_options", &self.decode_options)
            .field("timeout", &self.timeout)
            .field("label", &self.label)
            .finish()
    }
}

impl fmt::Display for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} ({})", label, self.source),
            None => write!(f, "{}", self.source),
        }
    }
}
