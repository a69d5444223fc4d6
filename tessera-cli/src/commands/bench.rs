//! `tessera bench`: many overlapping requests against an in-memory loader.
//!
//! Requests are spread over a fixed set of sources with a few processing
//! variants and priorities, and a share of them is cancelled right after
//! submission. The summary shows how much work deduplication saved.

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::Args;
use console::style;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use indicatif::ProgressBar;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tessera::config::PipelineConfig;
use tessera::loader::{DataCallbacks, DataLoader, LoadHandle};
use tessera::pipeline::{ImageEvent, PipelineBuilder};
use tessera::processing::Resize;
use tessera::request::{ImageRequest, ImageSource};
use tessera::task::Priority;

use super::COUNT_STYLE;
use crate::error::CliError;

#[derive(Debug, Args)]
pub struct BenchArgs {
    /// Number of requests to issue
    #[arg(long, default_value = "1000")]
    count: usize,

    /// Number of distinct sources the requests are spread over
    #[arg(long, default_value = "100")]
    sources: usize,

    /// Simulated transfer latency in milliseconds
    #[arg(long, default_value = "5")]
    latency_ms: u64,

    /// Cancel every Nth request right after submitting it (0 = never)
    #[arg(long, default_value = "10")]
    cancel_every: usize,
}

/// Serves one generated PNG for every source after a fixed delay.
struct MemoryLoader {
    runtime: Handle,
    data: Bytes,
    latency: Duration,
}

impl MemoryLoader {
    fn new(runtime: Handle, latency: Duration) -> Result<Self, CliError> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(128, 128, |x, y| {
            Rgb([(x * 2) as u8, (y * 2) as u8, 128])
        }));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| CliError::Bench(e.to_string()))?;
        Ok(Self {
            runtime,
            data: Bytes::from(out.into_inner()),
            latency,
        })
    }
}

struct MemoryHandle(CancellationToken);

impl LoadHandle for MemoryHandle {
    fn cancel(&self) {
        self.0.cancel();
    }

    fn set_priority(&self, _priority: Priority) {}
}

impl DataLoader for MemoryLoader {
    fn load(
        &self,
        _source: &ImageSource,
        _priority: Priority,
        callbacks: DataCallbacks,
    ) -> Box<dyn LoadHandle> {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let data = self.data.clone();
        let latency = self.latency;
        self.runtime.spawn(async move {
            let DataCallbacks {
                mut on_data,
                on_completion,
            } = callbacks;
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(latency) => {
                    on_data(data.clone(), Some(data.len() as u64));
                    on_completion(Ok(()));
                }
            }
        });
        Box::new(MemoryHandle(token))
    }
}

fn priority_for(index: usize) -> Priority {
    match index % 4 {
        0 => Priority::LOW,
        1 => Priority::NORMAL,
        2 => Priority::HIGH,
        _ => Priority::VERY_HIGH,
    }
}

/// Runs the bench command.
pub async fn run(args: BenchArgs, config: PipelineConfig) -> Result<(), CliError> {
    if args.sources == 0 {
        return Err(CliError::InvalidArgument("--sources must be at least 1".to_string()));
    }

    let runtime = Handle::current();
    let loader = MemoryLoader::new(runtime.clone(), Duration::from_millis(args.latency_ms))?;
    let pipeline = PipelineBuilder::new(Arc::new(loader))
        .config(config)
        .runtime(runtime)
        .build();
    info!(
        count = args.count,
        sources = args.sources,
        "Starting benchmark"
    );

    let bar = ProgressBar::new(args.count as u64);
    bar.set_style(COUNT_STYLE.clone());
    bar.set_message("requests");

    let started = Instant::now();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut cancelled = 0u64;
    for i in 0..args.count {
        let size = 16u32 << (i % 3);
        let request = ImageRequest::new(format!("mem://bench/{}", i % args.sources))
            .with_processor(Resize::new(size, size))
            .with_priority(priority_for(i))
            .with_timeout(Duration::from_secs(60));
        let tx = tx.clone();
        let task = pipeline.load_image(request, move |event| {
            if let ImageEvent::Completed(result) = event {
                let _ = tx.send(result.is_ok());
            }
        });
        if args.cancel_every > 0 && i % args.cancel_every == args.cancel_every - 1 && !task.is_finished() {
            task.cancel();
            cancelled += 1;
            bar.inc(1);
        }
    }
    drop(tx);

    let (mut succeeded, mut failed) = (0u64, 0u64);
    while let Some(ok) = rx.recv().await {
        if ok {
            succeeded += 1;
        } else {
            failed += 1;
        }
        bar.inc(1);
    }
    let elapsed = started.elapsed();
    bar.finish_with_message("done");
    pipeline.shutdown();

    let telemetry = pipeline.telemetry();
    println!();
    println!(
        "{} requests in {:.2}s ({:.0}/s): {} ok, {} failed, {} cancelled",
        args.count,
        elapsed.as_secs_f64(),
        args.count as f64 / elapsed.as_secs_f64().max(0.001),
        style(succeeded).green(),
        style(failed).red(),
        style(cancelled).yellow()
    );
    println!(
        "Transfers started: {} for {} requests ({:.1}% of load acquisitions coalesced)",
        telemetry.loads_started,
        args.count,
        telemetry.load_coalesce_rate * 100.0
    );
    println!("{}", telemetry);
    Ok(())
}
