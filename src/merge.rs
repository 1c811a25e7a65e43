use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::download::segment::DownloadResults;
use crate::error::MergeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Write segment bytes back to back, no re-encoding
    Concat,
    /// Let an external tool re-multiplex the segments
    Transcode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub output_path: PathBuf,
    pub bytes_written: u64,
    pub strategy: MergeStrategy,
}

/// External program that turns an ordered list of segment files into one
/// output file. Errors carry the tool's diagnostics.
pub trait TranscodeTool: Send + Sync {
    fn run(&self, list_file: &Path, segments: &[PathBuf], dest: &Path) -> Result<(), String>;
}

/// Uses ffmpeg's concat demuxer with stream copy.
pub struct FfmpegTool {
    program: PathBuf,
}

impl FfmpegTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl TranscodeTool for FfmpegTool {
    fn run(&self, list_file: &Path, _segments: &[PathBuf], dest: &Path) -> Result<(), String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-y", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(list_file)
            .args(["-c", "copy"])
            .arg(dest);
        debug!(?cmd, "Running ffmpeg");

        let output = cmd
            .output()
            .map_err(|err| format!("cannot run {}: {err}", self.program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            return Err(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                if stderr.is_empty() { "no output" } else { stderr }
            ));
        }

        Ok(())
    }
}

/// Joins downloaded segments into one file.
pub struct Merger {
    tool: Arc<dyn TranscodeTool>,
    work_dir: PathBuf,
}

impl Merger {
    /// `work_dir` holds the temporary segment files of a transcode merge.
    pub fn new(tool: Arc<dyn TranscodeTool>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            work_dir: work_dir.into(),
        }
    }

    /// Merges all segments in ascending sequence order.
    ///
    /// All-or-nothing: a single failed segment means nothing is written.
    pub fn merge(
        &self,
        results: &DownloadResults,
        strategy: MergeStrategy,
        output: &Path,
    ) -> Result<MergeOutcome, MergeError> {
        let failed = results.failed_indices();
        if results.is_empty() || !failed.is_empty() {
            return Err(MergeError::IncompleteSegments(failed));
        }

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        info!(
            segments = results.len(),
            ?strategy,
            output = %output.display(),
            "Merging segments"
        );

        let bytes_written = match strategy {
            MergeStrategy::Concat => concat(results, output).inspect_err(|_| {
                // never leave a truncated file behind
                let _ = std::fs::remove_file(output);
            })?,
            MergeStrategy::Transcode => self.transcode(results, output)?,
        };

        info!(bytes = bytes_written, output = %output.display(), "Merge finished");

        Ok(MergeOutcome {
            output_path: output.to_path_buf(),
            bytes_written,
            strategy,
        })
    }

    /// The tool reads the spooled segment files in place; only the list
    /// file is written here.
    fn transcode(&self, results: &DownloadResults, output: &Path) -> Result<u64, MergeError> {
        std::fs::create_dir_all(&self.work_dir)?;

        // removed on drop, which covers every early return below
        let temp = tempfile::Builder::new()
            .prefix("merge-")
            .tempdir_in(&self.work_dir)?;

        let mut segments = Vec::with_capacity(results.len());
        let mut list = String::new();
        for result in results.iter() {
            let Some(segment) = result.segment() else {
                return Err(MergeError::IncompleteSegments(vec![result.sequence_index]));
            };
            // the list is resolved relative to its own directory
            let path = std::fs::canonicalize(&segment.path)?;
            list.push_str(&format!("file '{}'\n", escape_concat_path(&path)));
            segments.push(path);
        }

        let list_file = temp.path().join("filelist.txt");
        std::fs::write(&list_file, list)?;
        debug!(list = %list_file.display(), files = segments.len(), "Wrote concat list");

        self.tool
            .run(&list_file, &segments, output)
            .map_err(MergeError::ExternalToolFailed)?;

        let bytes_written = std::fs::metadata(output)?.len();

        if let Err(err) = temp.close() {
            warn!(error = %err, "Failed to remove temporary merge directory");
            return Err(MergeError::Io(err));
        }

        Ok(bytes_written)
    }
}

fn concat(results: &DownloadResults, output: &Path) -> Result<u64, MergeError> {
    let mut file = BufWriter::new(File::create(output)?);
    let mut written = 0u64;

    for result in results.iter() {
        let Some(segment) = result.segment() else {
            return Err(MergeError::IncompleteSegments(vec![result.sequence_index]));
        };
        let mut input = File::open(&segment.path)?;
        written += io::copy(&mut input, &mut file)?;
    }

    file.flush()?;
    Ok(written)
}

/// Quotes a path for an ffmpeg concat list entry.
fn escape_concat_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").replace('\'', "'\\''")
}
