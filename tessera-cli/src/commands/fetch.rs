//! `tessera fetch`: load images over HTTP through the pipeline.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Args;
use console::style;
use indicatif::{MultiProgress, ProgressBar};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::info;

use tessera::config::PipelineConfig;
use tessera::error::PipelineError;
use tessera::image::ImageResponse;
use tessera::pipeline::{ImageEvent, Pipeline};
use tessera::processing::{GaussianBlur, Resize};
use tessera::request::{DecodeOptions, ImageRequest};

use super::TRANSFER_STYLE;
use crate::error::CliError;

/// Target size given as `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Dimensions {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .split_once(|c: char| c == 'x' || c == 'X')
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| format!("invalid dimension '{}'", v))
        };
        Ok(Self {
            width: parse(width)?,
            height: parse(height)?,
        })
    }
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Image URLs to fetch
    #[arg(required = true)]
    urls: Vec<String>,

    /// Resize to fit within WIDTHxHEIGHT
    #[arg(long)]
    resize: Option<Dimensions>,

    /// Gaussian blur sigma applied after resizing
    #[arg(long)]
    blur: Option<f32>,

    /// Downscale while decoding so neither side exceeds this many pixels
    #[arg(long)]
    thumbnail: Option<u32>,

    /// Save results as PNG files in this directory
    #[arg(long)]
    output: Option<PathBuf>,

    /// Per-image timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,
}

impl FetchArgs {
    fn request(&self, url: &str) -> ImageRequest {
        let mut request = ImageRequest::new(url)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_label(url)
            .with_decode_options(DecodeOptions {
                thumbnail_max_pixel: self.thumbnail,
            });
        if let Some(size) = self.resize {
            request = request.with_processor(Resize::new(size.width, size.height));
        }
        if let Some(sigma) = self.blur {
            request = request.with_processor(GaussianBlur::new(sigma));
        }
        request
    }
}

struct Pending {
    url: String,
    bar: ProgressBar,
    result: oneshot::Receiver<Result<ImageResponse, PipelineError>>,
}

/// Runs the fetch command.
pub async fn run(args: FetchArgs, config: PipelineConfig) -> Result<(), CliError> {
    if args.blur.is_some_and(|sigma| sigma <= 0.0) {
        return Err(CliError::InvalidArgument("--blur must be positive".to_string()));
    }
    if let Some(dir) = &args.output {
        fs::create_dir_all(dir).map_err(|e| CliError::FileWrite {
            path: dir.clone(),
            error: e.to_string(),
        })?;
    }

    let pipeline = Pipeline::with_http(Handle::current(), config).map_err(CliError::Http)?;
    info!(count = args.urls.len(), "Fetching images");

    let bars = MultiProgress::new();
    let mut pending = Vec::with_capacity(args.urls.len());
    for url in &args.urls {
        let bar = bars.add(ProgressBar::new(0));
        bar.set_style(TRANSFER_STYLE.clone());
        bar.set_message(url.clone());

        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let progress = bar.clone();
        // The request runs until completion; the handle is not needed.
        let _ = pipeline.load_image(args.request(url), move |event| match event {
            ImageEvent::Progress(p) => {
                if p.total > 0 {
                    progress.set_length(p.total);
                }
                progress.set_position(p.completed);
            }
            ImageEvent::Preview(_) => {}
            ImageEvent::Completed(result) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(result);
                }
            }
        });

        pending.push(Pending {
            url: url.clone(),
            bar,
            result: rx,
        });
    }

    let total = pending.len();
    let mut failed = 0;
    for (index, item) in pending.into_iter().enumerate() {
        match item.result.await.unwrap_or(Err(PipelineError::Cancelled)) {
            Ok(response) => {
                let saved = match &args.output {
                    Some(dir) => format!(" -> {}", save(dir, index, &response)?.display()),
                    None => String::new(),
                };
                item.bar.finish_with_message(format!(
                    "{} {}x{}{}",
                    style(&item.url).green(),
                    response.container.width(),
                    response.container.height(),
                    saved
                ));
            }
            Err(e) => {
                failed += 1;
                item.bar
                    .abandon_with_message(format!("{} {}", style(&item.url).red(), e));
            }
        }
    }

    println!();
    println!("{}", pipeline.telemetry());
    pipeline.shutdown();

    if failed > 0 {
        return Err(CliError::Failed { failed, total });
    }
    Ok(())
}

fn save(dir: &Path, index: usize, response: &ImageResponse) -> Result<PathBuf, CliError> {
    let path = dir.join(format!("image-{:03}.png", index));
    response
        .image()
        .save_with_format(&path, image::ImageFormat::Png)
        .map_err(|e| CliError::FileWrite {
            path: path.clone(),
            error: e.to_string(),
        })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dimensions() {
        assert_eq!(
            "640x480".parse::<Dimensions>(),
            Ok(Dimensions {
                width: 640,
                height: 480
            })
        );
        assert!("640".parse::<Dimensions>().is_err());
        assert!("0x10".parse::<Dimensions>().is_err());
        assert!("axb".parse::<Dimensions>().is_err());
    }

    #[test]
    fn test_request_carries_processors() {
        let args = FetchArgs {
            urls: vec!["https://example.com/a.png".to_string()],
            resize: Some(Dimensions {
                width: 10,
                height: 10,
            }),
            blur: Some(1.5),
            thumbnail: None,
            output: None,
            timeout: 5,
        };
        let request = args.request("https://example.com/a.png");
        assert_eq!(request.processors().len(), 2);
        assert_eq!(request.timeout(), Some(Duration::from_secs(5)));
    }
}
