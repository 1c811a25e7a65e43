use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::download::segment::RetryPolicy;
use crate::merge::MergeStrategy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("at least one parallel download is required")]
    NoWorkers,

    #[error("request timeout must be greater than zero")]
    ZeroTimeout,

    #[error("output file name is empty")]
    EmptyOutput,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub max_parallel_downloads: usize,
    pub max_download_retries: u32,
    /// Per-attempt transport timeout.
    pub timeout: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub merge_strategy: MergeStrategy,
    pub ffmpeg_path: PathBuf,
    /// Directory for the output file and temporary merge files.
    pub work_dir: PathBuf,
    pub output_file: PathBuf,
    /// Suppresses progress output only.
    pub quiet: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_parallel_downloads: 10,
            max_download_retries: 3,
            timeout: Duration::from_secs(15),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            merge_strategy: MergeStrategy::Concat,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            work_dir: PathBuf::from("downloaded_video"),
            output_file: PathBuf::from("output.mp4"),
            quiet: false,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.max_parallel_downloads == 0 {
            return Err(OptionsError::NoWorkers);
        }
        if self.timeout.is_zero() {
            return Err(OptionsError::ZeroTimeout);
        }
        if self.output_file.as_os_str().is_empty() {
            return Err(OptionsError::EmptyOutput);
        }
        Ok(())
    }

    /// Where the merged video is written. An absolute output file ignores the work dir.
    pub fn output_path(&self) -> PathBuf {
        self.work_dir.join(&self.output_file)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_download_retries,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay.max(self.retry_base_delay),
        }
    }
}
