//! Process stage: applies a request's processors to the decoded image.

use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, trace};

use super::decode::make_decode_task;
use super::Upstream;
use crate::error::{PipelineError, ProcessingError};
use crate::image::ImageContainer;
use crate::pipeline::PipelineInner;
use crate::processing::{decompress, ImageProcessor};
use crate::request::{DecodeKey, ImageRequest};
use crate::task::{Task, TaskEvent};

pub(crate) type ProcessTask = Task<ImageContainer, PipelineError>;

/// Creates the (idle) task producing the final image for `request`'s cache key.
pub(crate) fn make_process_task(pipeline: Weak<PipelineInner>, request: ImageRequest) -> ProcessTask {
    Task::new(move |producer| {
        let Some(inner) = pipeline.upgrade() else {
            producer.send_error(PipelineError::Cancelled);
            return;
        };

        let chain = Chain {
            processors: request.processors().to_vec(),
            decompress: inner.config.decompression_enabled,
        };
        let metrics = Arc::clone(&inner.metrics);
        let decode_pool = inner.decode_pool.clone();
        drop(inner);

        let upstream: Upstream<DecodeKey, ImageContainer> = Upstream::new();
        let forward = producer.clone();
        let binding = upstream.clone();
        let sink_metrics = Arc::clone(&metrics);
        let sink = move |event: TaskEvent<ImageContainer, PipelineError>| match event {
            TaskEvent::Progress(progress) => forward.send_progress(progress),
            TaskEvent::Value {
                value,
                is_completed: false,
            } => match chain.apply(&value, false) {
                Ok(preview) => forward.send_value(preview, false),
                Err(e) => debug!(error = %e, "Skipping preview, processing failed"),
            },
            TaskEvent::Value {
                value,
                is_completed: true,
            } => {
                binding.release();
                let started = Instant::now();
                let result = chain.apply(&value, true);
                sink_metrics.processing_completed(started.elapsed().as_micros() as u64);
                match result {
                    Ok(image) => forward.send_value(image, true),
                    Err(e) => {
                        debug!(error = %e, "Processing failed");
                        forward.send_error(PipelineError::Processing(e));
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
        let decode = upstream.attach(
            &producer,
            &decode_pool,
            request.decode_key(),
            || {
                created = true;
                make_decode_task(Weak::clone(&pipeline), request.clone())
            },
            sink,
        );
        if created {
            metrics.decode_task_created();
        } else {
            metrics.decode_task_coalesced();
        }
        trace!(task = %decode.id(), created, "Process task joined decode task");
    })
}

/// The processors of one cache key, in application order.
struct Chain {
    processors: Vec<Arc<dyn ImageProcessor>>,
    decompress: bool,
}

impl Chain {
    fn apply(
        &self,
        container: &ImageContainer,
        is_final: bool,
    ) -> Result<ImageContainer, ProcessingError> {
        if self.processors.is_empty() && !(is_final && self.decompress) {
            return Ok(container.clone());
        }

        let mut image = container.image().clone();
        for processor in &self.processors {
            image = processor.process(&image)?;
            trace!(processor = %processor.identifier(), "Applied processor");
        }
        if is_final && self.decompress {
            image = decompress(&image);
        }
        Ok(container.map(image))
    }
}
