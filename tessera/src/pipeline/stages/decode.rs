//! Decode stage: turns loaded bytes into an image.

use std::sync::{Arc, Weak};
use std::time::Instant;

use image::DynamicImage;
use tracing::{debug, trace};

use super::load::make_load_task;
use super::{LoadedData, Upstream};
use crate::error::PipelineError;
use crate::image::ImageContainer;
use crate::pipeline::PipelineInner;
use crate::request::{DecodeOptions, ImageRequest, LoadKey};
use crate::task::{Task, TaskEvent};

pub(super) type DecodeTask = Task<ImageContainer, PipelineError>;

/// Creates the (idle) decode task for `request`'s decode key.
///
/// Decoding runs on whichever thread delivers the final bytes.
pub(super) fn make_decode_task(pipeline: Weak<PipelineInner>, request: ImageRequest) -> DecodeTask {
    Task::new(move |producer| {
        let Some(inner) = pipeline.upgrade() else {
            producer.send_error(PipelineError::Cancelled);
            return;
        };

        let load_key = request.load_key();
        let upstream: Upstream<LoadKey, LoadedData> = Upstream::new();
        let options = request.decode_options();
        let progressive = inner.config.progressive_decoding_enabled;
        let decoder = Arc::clone(&inner.decoder);
        let metrics = Arc::clone(&inner.metrics);
        let load_pool = inner.load_pool.clone();
        drop(inner);

        let forward = producer.clone();
        let binding = upstream.clone();
        let sink_metrics = Arc::clone(&metrics);
        let sink = move |event: TaskEvent<LoadedData, PipelineError>| match event {
            TaskEvent::Progress(progress) => forward.send_progress(progress),
            TaskEvent::Value {
                value,
                is_completed: false,
            } => {
                if !progressive || value.is_final {
                    return;
                }
                if let Some(image) = decoder.decode(&value.data, false) {
                    trace!(bytes = value.data.len(), "Decoded preview");
                    forward.send_value(ImageContainer::preview(thumbnail(image, options)), false);
                }
            }
            TaskEvent::Value {
                value,
                is_completed: true,
            } => {
                binding.release();
                let started = Instant::now();
                match decoder.decode(&value.data, true) {
                    Some(image) => {
                        sink_metrics.decode_completed(started.elapsed().as_micros() as u64);
                        let image = thumbnail(image, options);
                        debug!(width = image.width(), height = image.height(), "Decoded image");
                        forward.send_value(ImageContainer::new(image), true);
                    }
                    None => {
                        sink_metrics.decode_failed();
                        debug!(bytes = value.data.len(), "Failed to decode image");
                        forward.send_error(PipelineError::Decode);
                    }
                }
            }
            TaskEvent::Error(error) => {
                binding.release();
                forward.send_error(error);
            }
            // Only replayed to late subscribers, which joining a pool never produces.
            TaskEvent::Cancelled => binding.release(),
        };

        let mut created = false;
        let source = load_key.0.clone();
        let load = upstream.attach(
            &producer,
            &load_pool,
            load_key,
            || {
                created = true;
                make_load_task(Weak::clone(&pipeline), source.clone())
            },
            sink,
        );
        if created {
            metrics.load_task_created();
        } else {
            metrics.load_task_coalesced();
        }
        trace!(%source, task = %load.id(), created, "Decode task joined load task");
    })
}

/// Downscales `image` so neither side exceeds the configured maximum.
fn thumbnail(image: DynamicImage, options: DecodeOptions) -> DynamicImage {
    match options.thumbnail_max_pixel {
        Some(max) if image.width() > max || image.height() > max => image.thumbnail(max, max),
        _ => image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
    }

    #[test]
    fn test_thumbnail_keeps_aspect_ratio() {
        let options = DecodeOptions {
            thumbnail_max_pixel: Some(50),
        };
        let thumb = thumbnail(image(200, 100), options);
        assert_eq!((thumb.width(), thumb.height()), (50, 25));
    }

    #[test]
    fn test_small_image_is_not_upscaled() {
        let options = DecodeOptions {
            thumbnail_max_pixel: Some(500),
        };
        let thumb = thumbnail(image(20, 10), options);
        assert_eq!((thumb.width(), thumb.height()), (20, 10));
    }

    #[test]
    fn test_no_thumbnail_by_default() {
        let full = thumbnail(image(300, 300), DecodeOptions::default());
        assert_eq!(full.width(), 300);
    }
}
