mod download;
mod error;
mod merge;
mod options;
mod pipeline;
mod progress;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::download::segment::Progress;
use crate::download::DownloadClient;
use crate::error::PipelineError;
use crate::merge::{FfmpegTool, MergeStrategy};
use crate::options::Options;
use crate::pipeline::{Pipeline, Source};
use crate::progress::ConsoleProgress;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[clap(value_parser = url_parser)]
    /// playback page or .m3u8 manifest link
    url: String,

    #[clap(short, long, default_value = "output.mp4")]
    /// output file name, relative to the directory
    output: PathBuf,

    #[clap(short, long, default_value = "downloaded_video")]
    /// directory for the output and temporary files
    directory: PathBuf,

    #[clap(short, long, default_value = "10")]
    /// set the maximum number of parallel downloads
    workers: usize,

    #[clap(short, long, default_value = "3")]
    /// set the maximum number of download retries per segment
    retries: u32,

    #[clap(short, long, value_enum, default_value = "concat")]
    /// how downloaded segments are joined
    merge: MergeStrategy,

    #[clap(long, default_value = "ffmpeg")]
    /// ffmpeg binary used by the transcode merge
    ffmpeg: PathBuf,

    #[clap(long, default_value = "15")]
    /// per-request timeout in seconds
    timeout: u64,

    #[clap(short, long)]
    /// do not print per-segment progress
    quiet: bool,

    #[clap(short, long)]
    /// enable debug logging
    verbose: bool,

    #[clap(long)]
    /// print the merge result as JSON on stdout
    json: bool,
}

fn url_parser(url: &str) -> Result<String, String> {
    if url.starts_with("http") {
        Ok(url.to_string())
    } else {
        Err("URL must start with http or https".to_string())
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let options = Options {
        max_parallel_downloads: args.workers,
        max_download_retries: args.retries,
        timeout: Duration::from_secs(args.timeout),
        merge_strategy: args.merge,
        ffmpeg_path: args.ffmpeg,
        work_dir: args.directory,
        output_file: args.output,
        quiet: args.quiet,
        ..Options::default()
    };
    if let Err(err) = options.validate() {
        error!(error = %err, "Invalid options");
        return ExitCode::FAILURE;
    }
    info!(?options, "Starting");

    let source = match Source::detect(&args.url) {
        Ok(source) => source,
        Err(err) => {
            error!(url = %args.url, error = %err, "Invalid URL");
            return ExitCode::FAILURE;
        }
    };

    let client = match DownloadClient::new(options.timeout) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(error = %err, "Cannot build HTTP client");
            return ExitCode::FAILURE;
        }
    };

    let tool = Arc::new(FfmpegTool::new(options.ffmpeg_path.clone()));
    let mut pipeline = match Pipeline::from_options(&options, client, tool) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!(error = %err, "Invalid download settings");
            return ExitCode::FAILURE;
        }
    };
    if !options.quiet {
        let console = ConsoleProgress::new();
        pipeline = pipeline.with_progress(Arc::new(move |progress: Progress| console.report(progress)));
    }

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping downloads");
            ctrl_c.cancel();
        }
    });

    match pipeline.run(source, &token).await {
        Ok(outcome) => {
            info!(
                output = %outcome.output_path.display(),
                bytes = outcome.bytes_written,
                "Finished downloading {}",
                args.url
            );
            if args.json {
                match serde_json::to_string_pretty(&outcome) {
                    Ok(json) => println!("{json}"),
                    Err(err) => {
                        error!(error = %err, "Cannot serialize result");
                        return ExitCode::FAILURE;
                    }
                }
            }
            ExitCode::SUCCESS
        }
        Err(PipelineError::SegmentsMissing(missing)) => {
            error!(count = missing.len(), indices = ?missing, "Segments failed to download, nothing merged");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(stage = %err.stage(), error = %err, "Download failed");
            if let PipelineError::Failed { cause, .. } = &err {
                error!(cause = %cause, "Caused by");
            }
            ExitCode::FAILURE
        }
    }
}
