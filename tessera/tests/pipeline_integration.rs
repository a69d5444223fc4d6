//! Integration tests for the image pipeline.
//!
//! These tests drive the complete flow with in-memory collaborators:
//! - memory cache fast path and write-through
//! - sharing of load and decode work between requests
//! - cancellation and priority propagation down to the data loader
//! - failure broadcast, rate limiting, progressive previews, timeouts
//!
//! Run with: `cargo test --test pipeline_integration`

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use parking_lot::Mutex;

use common::{pipeline, pipeline_with, png, MockLoader, Recorder};
use tessera::config::{PipelineConfig, RateLimiterConfig};
use tessera::decoder::ImageDecoder;
use tessera::error::{PipelineError, ProcessingError, TransportError};
use tessera::image::CacheType;
use tessera::loader::DataLoader;
use tessera::pipeline::{ImageEvent, ImageTask, PipelineBuilder};
use tessera::processing::{FnProcessor, Resize};
use tessera::request::{ImageRequest, RequestOptions};
use tessera::task::Priority;

const SOURCE: &str = "mem://photo.png";

fn loader_with_photo(manual: bool) -> Arc<MockLoader> {
    let loader = if manual {
        MockLoader::manual()
    } else {
        MockLoader::immediate()
    };
    loader.insert(SOURCE, png(16, 16));
    loader
}

// ============================================================================
// Cache
// ============================================================================

#[test]
fn test_miss_then_memory_hit() {
    let loader = loader_with_photo(false);
    let pipeline = pipeline(Arc::clone(&loader));
    let request = ImageRequest::new(SOURCE);

    let first = Recorder::default();
    pipeline.load_image(request.clone(), first.sink());
    let response = first.completion().unwrap().unwrap();
    assert_eq!(response.cache_type, None);
    assert_eq!((response.container.width(), response.container.height()), (16, 16));
    assert_eq!(first.progress_count(), 2);

    let second = Recorder::default();
    let task = pipeline.load_image(request, second.sink());
    assert!(task.is_finished(), "cache hits complete synchronously");
    let response = second.completion().unwrap().unwrap();
    assert_eq!(response.cache_type, Some(CacheType::Memory));
    assert_eq!(loader.load_count(), 1);

    let telemetry = pipeline.telemetry();
    assert_eq!(telemetry.memory_cache_hits, 1);
    assert_eq!(telemetry.memory_cache_misses, 1);
    assert_eq!(telemetry.requests_completed, 2);
}

#[test]
fn test_final_image_is_decompressed_before_caching() {
    let loader = loader_with_photo(false);
    let pipeline = pipeline(loader);
    let request = ImageRequest::new(SOURCE);

    pipeline.load_image(request.clone(), |_| {});

    let cached = pipeline.cached_image(&request).unwrap();
    assert!(matches!(cached.image(), DynamicImage::ImageRgba8(_)));
}

#[test]
fn test_cache_options_are_honoured() {
    let loader = loader_with_photo(false);
    let pipeline = pipeline(Arc::clone(&loader));
    let no_write = ImageRequest::new(SOURCE).with_options(RequestOptions {
        cache_read: true,
        cache_write: false,
    });

    pipeline.load_image(no_write.clone(), |_| {});
    assert!(pipeline.cached_image(&no_write).is_none());

    let request = ImageRequest::new(SOURCE);
    pipeline.load_image(request.clone(), |_| {});
    assert!(pipeline.cached_image(&request).is_some());

    let no_read = request.clone().with_options(RequestOptions {
        cache_read: false,
        cache_write: true,
    });
    let recorder = Recorder::default();
    pipeline.load_image(no_read, recorder.sink());
    assert_eq!(recorder.completion().unwrap().unwrap().cache_type, None);
    assert_eq!(loader.load_count(), 3);

    pipeline.remove_cached_image(&request);
    assert!(pipeline.cached_image(&request).is_none());
}

// ============================================================================
// Sharing
// ============================================================================

#[test]
fn test_different_processing_shares_one_load() {
    let loader = loader_with_photo(true);
    let pipeline = pipeline(Arc::clone(&loader));
    let large = ImageRequest::new(SOURCE).with_processor(Resize::new(8, 8));
    let small = ImageRequest::new(SOURCE).with_processor(Resize::new(4, 4));
    assert_ne!(large.cache_key(), small.cache_key());

    let large_events = Recorder::default();
    let small_events = Recorder::default();
    pipeline.load_image(large.clone(), large_events.sink());
    pipeline.load_image(small.clone(), small_events.sink());

    assert_eq!(loader.load_count(), 1);
    assert_eq!(pipeline.loads_in_flight(), 1);
    assert_eq!(pipeline.decodes_in_flight(), 1);

    assert!(loader.finish(SOURCE));

    let large_image = large_events.completion().unwrap().unwrap();
    let small_image = small_events.completion().unwrap().unwrap();
    assert_eq!(large_image.container.width(), 8);
    assert_eq!(small_image.container.width(), 4);
    assert!(pipeline.cached_image(&large).is_some());
    assert!(pipeline.cached_image(&small).is_some());

    let telemetry = pipeline.telemetry();
    assert_eq!(telemetry.load_tasks_created, 1);
    assert_eq!(telemetry.decode_tasks_created, 1);
    assert_eq!(telemetry.decode_tasks_coalesced, 1);
    assert_eq!(pipeline.loads_in_flight(), 0);
}

#[test]
fn test_cancelling_one_sharer_keeps_the_other() {
    let loader = loader_with_photo(true);
    let pipeline = pipeline(Arc::clone(&loader));
    let large = ImageRequest::new(SOURCE).with_processor(Resize::new(8, 8));
    let small = ImageRequest::new(SOURCE).with_processor(Resize::new(4, 4));

    let large_events = Recorder::default();
    let small_events = Recorder::default();
    let large_task = pipeline.load_image(large.clone(), large_events.sink());
    pipeline.load_image(small, small_events.sink());

    large_task.cancel();
    assert_eq!(loader.cancel_count(), 0);
    assert_eq!(loader.with_pending(SOURCE, |load| load.is_cancelled()), Some(false));

    assert!(loader.finish(SOURCE));

    assert!(large_events.events().is_empty());
    let small_image = small_events.completion().unwrap().unwrap();
    assert_eq!(small_image.container.width(), 4);
    assert!(pipeline.cached_image(&large).is_none());
}

#[test]
fn test_identical_requests_share_everything() {
    let loader = loader_with_photo(true);
    let pipeline = pipeline(Arc::clone(&loader));
    let request = ImageRequest::new(SOURCE).with_processor(Resize::new(8, 8));

    let recorders: Vec<Recorder> = (0..5).map(|_| Recorder::default()).collect();
    for recorder in &recorders {
        pipeline.load_image(request.clone(), recorder.sink());
    }
    assert_eq!(loader.load_count(), 1);
    assert!(loader.finish(SOURCE));

    for recorder in &recorders {
        assert_eq!(recorder.completion_count(), 1);
        assert!(recorder.completion().unwrap().is_ok());
    }
    assert_eq!(pipeline.telemetry().decode_tasks_created, 1);
}

#[test]
fn test_deduplication_can_be_disabled() {
    let loader = loader_with_photo(true);
    let config = PipelineConfig::default()
        .with_rate_limiter(false)
        .with_deduplication(false);
    let pipeline = pipeline_with(Arc::clone(&loader), config);

    pipeline.load_image(ImageRequest::new(SOURCE), |_| {});
    pipeline.load_image(ImageRequest::new(SOURCE), |_| {});

    assert_eq!(loader.load_count(), 2);
    assert_eq!(pipeline.loads_in_flight(), 0);
}

// ============================================================================
// Cancellation and priority
// ============================================================================

#[test]
fn test_cancel_last_request_cancels_transfer() {
    let loader = loader_with_photo(true);
    let pipeline = pipeline(Arc::clone(&loader));

    let recorder = Recorder::default();
    let task = pipeline.load_image(ImageRequest::new(SOURCE), recorder.sink());
    task.cancel();
    task.cancel();

    assert!(task.is_finished());
    assert_eq!(loader.cancel_count(), 1);
    assert_eq!(pipeline.loads_in_flight(), 0);
    assert_eq!(pipeline.decodes_in_flight(), 0);
    assert!(recorder.events().is_empty());

    // A new request after cancellation starts a fresh transfer.
    pipeline.load_image(ImageRequest::new(SOURCE), |_| {});
    assert_eq!(loader.load_count(), 2);
    assert_eq!(pipeline.telemetry().requests_cancelled, 1);
}

#[test]
fn test_concurrent_submit_and_cancel_never_completes() {
    let loader = loader_with_photo(true);
    let pipeline = pipeline(Arc::clone(&loader));
    let completions = Arc::new(AtomicUsize::new(0));

    // Transfers never finish, so the only way to complete is a spurious
    // cancellation picked up from another thread's cancel.
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let pipeline = pipeline.clone();
            let completions = Arc::clone(&completions);
            scope.spawn(move || {
                for _ in 0..2000 {
                    let completions = Arc::clone(&completions);
                    let task = pipeline.load_image(ImageRequest::new(SOURCE), move |event| {
                        if let ImageEvent::Completed(_) = event {
                            completions.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                    task.cancel();
                }
            });
        }
    });

    assert_eq!(completions.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.loads_in_flight(), 0);
    assert_eq!(pipeline.decodes_in_flight(), 0);
    assert_eq!(pipeline.telemetry().requests_cancelled, 8000);
}

#[test]
fn test_priority_follows_highest_request() {
    let loader = loader_with_photo(true);
    let pipeline = pipeline(Arc::clone(&loader));
    let priority = || loader.with_pending(SOURCE, |load| load.priority()).unwrap();

    let low = pipeline.load_image(
        ImageRequest::new(SOURCE).with_priority(Priority::LOW),
        |_| {},
    );
    assert_eq!(priority(), Priority::LOW);

    let high = pipeline.load_image(
        ImageRequest::new(SOURCE)
            .with_processor(Resize::new(4, 4))
            .with_priority(Priority::HIGH),
        |_| {},
    );
    assert_eq!(priority(), Priority::HIGH);

    high.set_priority(Priority::VERY_LOW);
    assert_eq!(priority(), Priority::LOW);

    high.cancel();
    low.set_priority(Priority::VERY_HIGH);
    assert_eq!(priority(), Priority::VERY_HIGH);
}

#[test]
fn test_sink_may_cancel_its_own_request() {
    let loader = loader_with_photo(true);
    let pipeline = pipeline(Arc::clone(&loader));

    let handle: Arc<Mutex<Option<ImageTask>>> = Arc::default();
    let sink_handle = Arc::clone(&handle);
    let recorder = Recorder::default();
    let mut record = recorder.sink();
    let task = pipeline.load_image(ImageRequest::new(SOURCE), move |event| {
        if matches!(event, ImageEvent::Progress(_)) {
            if let Some(task) = sink_handle.lock().as_ref() {
                task.cancel();
            }
        }
        record(event);
    });
    *handle.lock() = Some(task);

    loader.finish(SOURCE);

    assert_eq!(recorder.progress_count(), 1);
    assert_eq!(recorder.completion_count(), 0);
    assert_eq!(loader.cancel_count(), 1);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_transport_failure_is_broadcast() {
    let loader = loader_with_photo(true);
    let pipeline = pipeline(Arc::clone(&loader));
    let recorders: Vec<Recorder> = (0..3).map(|_| Recorder::default()).collect();
    for (i, recorder) in recorders.iter().enumerate() {
        let request = ImageRequest::new(SOURCE).with_processor(Resize::new(2 + i as u32, 2));
        pipeline.load_image(request, recorder.sink());
    }
    assert_eq!(loader.load_count(), 1);

    loader.fail(SOURCE, TransportError::Status(503));

    for recorder in &recorders {
        assert!(matches!(
            recorder.completion(),
            Some(Err(PipelineError::Transport(TransportError::Status(503))))
        ));
    }
    assert_eq!(pipeline.loads_in_flight(), 0);
    assert_eq!(pipeline.telemetry().requests_failed, 3);

    // Failures are not retried; a new request starts over.
    pipeline.load_image(ImageRequest::new(SOURCE), |_| {});
    assert_eq!(loader.load_count(), 2);
}

#[test]
fn test_undecodable_data_fails() {
    let loader = MockLoader::immediate();
    loader.insert(SOURCE, b"definitely not an image".to_vec());
    let pipeline = pipeline(loader);

    let recorder = Recorder::default();
    pipeline.load_image(ImageRequest::new(SOURCE), recorder.sink());

    assert!(matches!(recorder.completion(), Some(Err(PipelineError::Decode))));
    assert_eq!(pipeline.telemetry().decodes_failed, 1);
}

#[test]
fn test_processing_failure_is_reported() {
    let loader = loader_with_photo(false);
    let pipeline = pipeline(loader);
    let request = ImageRequest::new(SOURCE).with_processor(FnProcessor::new("broken", |_: &DynamicImage| {
        Err(ProcessingError::new("broken", "always fails"))
    }));

    let recorder = Recorder::default();
    pipeline.load_image(request.clone(), recorder.sink());

    match recorder.completion() {
        Some(Err(PipelineError::Processing(e))) => assert_eq!(e.processor, "broken"),
        other => panic!("unexpected completion: {:?}", other),
    }
    assert!(pipeline.cached_image(&request).is_none());
}

// ============================================================================
// Rate limiting
// ============================================================================

#[test]
fn test_suspended_limiter_starts_queued_loads_in_order() {
    let loader = MockLoader::immediate();
    let bytes = png(2, 2);
    let sources: Vec<String> = (0..500).map(|i| format!("mem://tile/{}", i)).collect();
    for source in &sources {
        loader.insert(source, bytes.clone());
    }
    let pipeline = pipeline_with(Arc::clone(&loader), PipelineConfig::default());
    let limiter = Arc::clone(pipeline.rate_limiter());
    limiter.suspend();

    let recorders: Vec<Recorder> = sources
        .iter()
        .map(|source| {
            let recorder = Recorder::default();
            pipeline.load_image(ImageRequest::new(source.as_str()), recorder.sink());
            recorder
        })
        .collect();
    assert_eq!(loader.load_count(), 0);
    assert_eq!(limiter.pending_count(), 500);

    limiter.resume();
    assert_eq!(loader.load_count(), 25);
    while limiter.pending_count() > 0 {
        limiter.tick();
    }

    assert_eq!(loader.started(), sources);
    assert!(recorders
        .iter()
        .all(|recorder| matches!(recorder.completion(), Some(Ok(_)))));
}

#[test]
fn test_cancelled_while_queued_never_loads() {
    let loader = loader_with_photo(false);
    let pipeline = pipeline_with(Arc::clone(&loader), PipelineConfig::default());
    let limiter = Arc::clone(pipeline.rate_limiter());
    limiter.suspend();

    let task = pipeline.load_image(ImageRequest::new(SOURCE), |_| {});
    task.cancel();
    let tokens = limiter.available_tokens();
    limiter.resume();

    assert_eq!(loader.load_count(), 0);
    assert_eq!(limiter.available_tokens(), tokens);
}

#[tokio::test]
async fn test_ticker_admits_loads_over_time() {
    let loader = MockLoader::immediate();
    for i in 0..6 {
        loader.insert(&format!("mem://{}", i), png(2, 2));
    }
    let config = PipelineConfig::default().with_rate_limiter_config(RateLimiterConfig {
        capacity: 1,
        tokens_per_tick: 1,
        tick_interval: Duration::from_millis(5),
    });
    let pipeline = pipeline_with(Arc::clone(&loader), config);

    let futures: Vec<_> = (0..6)
        .map(|i| pipeline.image(ImageRequest::new(format!("mem://{}", i))))
        .collect();
    for future in futures {
        assert!(future.await.is_ok());
    }
    assert_eq!(loader.load_count(), 6);
}

// ============================================================================
// Progressive decoding
// ============================================================================

/// Decodes partial data to a 1x1 placeholder.
struct PlaceholderDecoder;

impl ImageDecoder for PlaceholderDecoder {
    fn decode(&self, data: &[u8], is_final: bool) -> Option<DynamicImage> {
        if is_final {
            image::load_from_memory(data).ok()
        } else {
            Some(DynamicImage::new_rgb8(1, 1))
        }
    }
}

#[test]
fn test_progressive_previews_precede_completion() {
    let loader = loader_with_photo(true);
    let pipeline = PipelineBuilder::new(Arc::clone(&loader) as Arc<dyn DataLoader>)
        .config(
            PipelineConfig::default()
                .with_rate_limiter(false)
                .with_progressive_decoding(true),
        )
        .decoder(Arc::new(PlaceholderDecoder))
        .build();

    let recorder = Recorder::default();
    pipeline.load_image(ImageRequest::new(SOURCE), recorder.sink());
    loader.finish(SOURCE);

    let events = recorder.events();
    let previews: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ImageEvent::Preview(response) => Some(response),
            _ => None,
        })
        .collect();
    assert_eq!(previews.len(), 2);
    assert!(previews.iter().all(|preview| preview.container.is_preview()));
    assert!(matches!(events.last(), Some(ImageEvent::Completed(Ok(_)))));
    assert_eq!(pipeline.telemetry().previews_delivered, 2);
}

// ============================================================================
// Async surface and timeouts
// ============================================================================

#[tokio::test]
async fn test_async_image() {
    let loader = loader_with_photo(false);
    let pipeline = pipeline(loader);

    let response = pipeline
        .image(ImageRequest::new(SOURCE).with_processor(Resize::new(4, 4)))
        .await
        .unwrap();
    assert_eq!(response.container.width(), 4);
}

#[tokio::test]
async fn test_timeout_fails_and_cancels_transfer() {
    let loader = loader_with_photo(true);
    let pipeline = pipeline(Arc::clone(&loader));

    let result = pipeline
        .image(ImageRequest::new(SOURCE).with_timeout(Duration::from_millis(20)))
        .await;

    assert!(matches!(result, Err(PipelineError::Timeout)));
    assert_eq!(loader.cancel_count(), 1);
    assert_eq!(pipeline.telemetry().requests_failed, 1);
}

#[tokio::test]
async fn test_dropping_future_cancels_request() {
    let loader = loader_with_photo(true);
    let pipeline = pipeline(Arc::clone(&loader));

    let result = tokio::time::timeout(
        Duration::from_millis(20),
        pipeline.image(ImageRequest::new(SOURCE)),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(loader.cancel_count(), 1);
    assert_eq!(pipeline.loads_in_flight(), 0);
}
