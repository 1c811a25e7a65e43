use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::download::playlist::SegmentRef;
use crate::download::Fetch;
use crate::error::{DownloadError, TransportError};

/// How failed segment fetches are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt. A segment is fetched at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    /// Delay before the first retry, doubled for every further one.
    pub base_delay: Duration,
    /// Ceiling for the doubled delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given failed attempt (0-indexed): `base * 2^attempt`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// File name of a downloaded segment inside the spool directory.
pub fn spool_file_name(sequence_index: u64) -> String {
    format!("segment_{:08}.ts", sequence_index)
}

/// A segment written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpooledSegment {
    pub path: PathBuf,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub enum SegmentStatus {
    Success(SpooledSegment),
    Failed(TransportError),
}

/// Terminal outcome for one segment. Written exactly once.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub sequence_index: u64,
    pub status: SegmentStatus,
    pub attempts: u32,
}

impl DownloadResult {
    pub fn success(sequence_index: u64, segment: SpooledSegment, attempts: u32) -> Self {
        Self {
            sequence_index,
            status: SegmentStatus::Success(segment),
            attempts,
        }
    }

    pub fn failed(sequence_index: u64, error: TransportError, attempts: u32) -> Self {
        Self {
            sequence_index,
            status: SegmentStatus::Failed(error),
            attempts,
        }
    }

    pub fn segment(&self) -> Option<&SpooledSegment> {
        match &self.status {
            SegmentStatus::Success(segment) => Some(segment),
            SegmentStatus::Failed(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, SegmentStatus::Success(_))
    }
}

/// Results of a download batch keyed by sequence index. Iteration is
/// always in ascending index order, whatever order segments finished in.
///
/// Owns the directory holding the segment files; it is removed once the
/// last clone is dropped.
#[derive(Debug, Clone, Default)]
pub struct DownloadResults {
    results: BTreeMap<u64, DownloadResult>,
    spool: Option<Arc<TempDir>>,
}

impl DownloadResults {
    /// Stores a result. Returns `false` and keeps the existing entry if the
    /// index was already written.
    pub fn insert(&mut self, result: DownloadResult) -> bool {
        match self.results.entry(result.sequence_index) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(result);
                true
            }
        }
    }

    /// Ties the lifetime of the segment files to these results.
    pub fn keep_spool(&mut self, spool: TempDir) {
        self.spool = Some(Arc::new(spool));
    }

    pub fn spool_dir(&self) -> Option<&Path> {
        self.spool.as_deref().map(TempDir::path)
    }

    pub fn get(&self, sequence_index: u64) -> Option<&DownloadResult> {
        self.results.get(&sequence_index)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DownloadResult> {
        self.results.values()
    }

    pub fn failed_indices(&self) -> Vec<u64> {
        self.iter()
            .filter(|result| !result.is_success())
            .map(|result| result.sequence_index)
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.iter()
            .filter_map(DownloadResult::segment)
            .map(|segment| segment.len)
            .sum()
    }
}

impl FromIterator<DownloadResult> for DownloadResults {
    fn from_iter<I: IntoIterator<Item = DownloadResult>>(iter: I) -> Self {
        let mut results = Self::default();
        for result in iter {
            results.insert(result);
        }
        results
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Failed,
}

/// Reported after every terminal segment outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub sequence_index: u64,
    pub outcome: OutcomeKind,
    /// Media seconds downloaded so far, from the `#EXTINF` durations.
    pub downloaded_secs: f64,
    pub total_secs: f64,
}

pub type ProgressFn = dyn Fn(Progress) + Send + Sync;

/// Lifecycle of one segment inside a batch.
///
/// A launched retry is `InFlight` from the moment its task is spawned, so
/// its backoff sleep counts as part of the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    InFlight { attempt: u32 },
    RetryScheduled { attempt: u32, delay: Duration },
    Succeeded,
    Failed,
}

enum Step {
    Done(DownloadResult),
    Retry(Duration),
}

struct SegmentTask {
    segment: Arc<SegmentRef>,
    state: SegmentState,
    attempts: u32,
}

impl SegmentTask {
    fn new(segment: SegmentRef) -> Self {
        Self {
            segment: Arc::new(segment),
            state: SegmentState::Pending,
            attempts: 0,
        }
    }

    /// Moves the segment in flight and returns how long the attempt has to
    /// wait before fetching.
    fn launch(&mut self) -> Duration {
        match self.state {
            SegmentState::Pending => {
                self.state = SegmentState::InFlight { attempt: 1 };
                Duration::ZERO
            }
            SegmentState::RetryScheduled { attempt, delay } => {
                self.state = SegmentState::InFlight { attempt };
                delay
            }
            state => {
                debug_assert!(false, "cannot launch segment in state {state:?}");
                Duration::ZERO
            }
        }
    }

    fn finish(&mut self, result: Result<SpooledSegment, TransportError>, policy: &RetryPolicy) -> Step {
        self.attempts += 1;
        let index = self.segment.sequence_index;

        match result {
            Ok(segment) => {
                self.state = SegmentState::Succeeded;
                Step::Done(DownloadResult::success(index, segment, self.attempts))
            }
            Err(err) if self.attempts <= policy.max_retries => {
                let delay = policy.delay_for_attempt(self.attempts - 1);
                warn!(
                    segment = index,
                    attempt = self.attempts,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying segment"
                );
                self.state = SegmentState::RetryScheduled {
                    attempt: self.attempts + 1,
                    delay,
                };
                Step::Retry(delay)
            }
            Err(err) => {
                error!(segment = index, attempts = self.attempts, error = %err, "Segment failed");
                self.state = SegmentState::Failed;
                Step::Done(DownloadResult::failed(index, err, self.attempts))
            }
        }
    }
}

enum Attempt {
    Stored(SpooledSegment),
    Failed(TransportError),
    /// Fetched, but the local write failed.
    Unwritable(std::io::Error),
}

struct AttemptOutcome {
    sequence_index: u64,
    attempt: Attempt,
}

/// Fetches segment batches with a bounded number of concurrent requests.
///
/// Each segment goes to disk as soon as it arrives, so memory use is bounded
/// by the number of concurrent fetches rather than by the video size.
pub struct SegmentDownloader {
    fetcher: Arc<dyn Fetch>,
    concurrency: usize,
    policy: RetryPolicy,
    spool_root: Option<PathBuf>,
}

impl SegmentDownloader {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        concurrency: usize,
        policy: RetryPolicy,
    ) -> Result<Self, DownloadError> {
        if concurrency < 1 {
            return Err(DownloadError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if policy.base_delay > policy.max_delay {
            return Err(DownloadError::InvalidConfig(format!(
                "base retry delay {:?} exceeds the maximum {:?}",
                policy.base_delay, policy.max_delay
            )));
        }

        Ok(Self {
            fetcher,
            concurrency,
            policy,
            spool_root: None,
        })
    }

    /// Directory in which each batch creates its segment directory. Defaults
    /// to the system temp dir.
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_root = Some(dir.into());
        self
    }

    /// Downloads every segment once, retrying failures per the retry policy.
    ///
    /// Every input segment yields exactly one result. Segments that still
    /// fail after the last retry are returned as failed results rather than
    /// aborting the batch.
    pub async fn download(
        &self,
        segments: &[SegmentRef],
        on_progress: Option<&ProgressFn>,
        token: &CancellationToken,
    ) -> Result<DownloadResults, DownloadError> {
        if segments.is_empty() {
            return Err(DownloadError::EmptyInput);
        }

        let mut tasks: HashMap<u64, SegmentTask> = HashMap::with_capacity(segments.len());
        for segment in segments {
            let index = segment.sequence_index;
            if tasks.insert(index, SegmentTask::new(segment.clone())).is_some() {
                return Err(DownloadError::InvalidConfig(format!(
                    "duplicate sequence index {index}"
                )));
            }
        }

        let spool = self.create_spool()?;
        let total = segments.len();
        let total_secs: f64 = segments.iter().filter_map(|s| s.duration).sum();
        let mut downloaded_secs = 0.0;
        info!(
            segments = total,
            concurrency = self.concurrency,
            spool = %spool.path().display(),
            "Downloading segments"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<AttemptOutcome> = JoinSet::new();
        let mut running: HashMap<Id, u64> = HashMap::with_capacity(total);
        let mut results = DownloadResults::default();

        // launch in manifest order
        for segment in segments {
            if let Some(task) = tasks.get_mut(&segment.sequence_index) {
                let delay = task.launch();
                let segment = Arc::clone(&task.segment);
                self.spawn_attempt(&mut join_set, &mut running, segment, delay, &semaphore, spool.path());
            }
        }

        while results.len() < total {
            let joined = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    join_set.abort_all();
                    info!(completed = results.len(), total, "Segment download cancelled");
                    return Err(DownloadError::Cancelled);
                }
                joined = join_set.join_next_with_id() => joined,
            };

            let Some(joined) = joined else {
                break;
            };

            let (sequence_index, attempt) = match joined {
                Ok((id, outcome)) => {
                    running.remove(&id);
                    (outcome.sequence_index, outcome.attempt)
                }
                Err(err) => {
                    let Some(index) = running.remove(&err.id()) else {
                        continue;
                    };
                    let reason = format!("fetch task ended abnormally: {err}");
                    (index, Attempt::Failed(TransportError::Request { url: String::new(), reason }))
                }
            };

            let result = match attempt {
                Attempt::Stored(segment) => Ok(segment),
                Attempt::Failed(err) => Err(err),
                Attempt::Unwritable(err) => {
                    join_set.abort_all();
                    error!(segment = sequence_index, error = %err, "Cannot write segment file");
                    return Err(DownloadError::Spool(format!("segment {sequence_index}: {err}")));
                }
            };

            let Some(task) = tasks.get_mut(&sequence_index) else {
                continue;
            };

            match task.finish(result, &self.policy) {
                Step::Retry(_) if token.is_cancelled() => {
                    join_set.abort_all();
                    return Err(DownloadError::Cancelled);
                }
                Step::Retry(_) => {
                    let delay = task.launch();
                    let segment = Arc::clone(&task.segment);
                    self.spawn_attempt(&mut join_set, &mut running, segment, delay, &semaphore, spool.path());
                }
                Step::Done(result) => {
                    let outcome = if result.is_success() {
                        downloaded_secs += task.segment.duration.unwrap_or_default();
                        OutcomeKind::Success
                    } else {
                        OutcomeKind::Failed
                    };
                    if !results.insert(result) {
                        warn!(segment = sequence_index, "Ignoring second result for segment");
                        continue;
                    }
                    report(
                        on_progress,
                        Progress {
                            completed: results.len(),
                            total,
                            sequence_index,
                            outcome,
                            downloaded_secs,
                            total_secs,
                        },
                    );
                }
            }
        }

        let failed = results.failed_indices();
        if failed.is_empty() {
            info!(segments = total, bytes = results.total_bytes(), "All segments downloaded");
        } else {
            warn!(failed = failed.len(), total, "Some segments could not be downloaded");
        }

        results.keep_spool(spool);
        Ok(results)
    }

    fn create_spool(&self) -> Result<TempDir, DownloadError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("segments-");

        let spool = match &self.spool_root {
            Some(root) => std::fs::create_dir_all(root).and_then(|_| builder.tempdir_in(root)),
            None => builder.tempdir(),
        };
        spool.map_err(|err| DownloadError::Spool(format!("cannot create segment directory: {err}")))
    }

    fn spawn_attempt(
        &self,
        join_set: &mut JoinSet<AttemptOutcome>,
        running: &mut HashMap<Id, u64>,
        segment: Arc<SegmentRef>,
        delay: Duration,
        semaphore: &Arc<Semaphore>,
        spool: &Path,
    ) {
        let fetcher = Arc::clone(&self.fetcher);
        let semaphore = Arc::clone(semaphore);
        let sequence_index = segment.sequence_index;
        let path = spool.join(spool_file_name(sequence_index));

        let handle = join_set.spawn(async move {
            // backoff happens before taking a permit so waiting retries
            // never occupy a worker slot
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            // the permit also covers the write, which bounds buffered bytes
            let attempt = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    debug!(segment = sequence_index, url = %segment.url, "Fetching segment");
                    match fetcher.fetch(&segment.url, segment.byte_range).await {
                        Ok(bytes) => match tokio::fs::write(&path, &bytes).await {
                            Ok(()) => Attempt::Stored(SpooledSegment {
                                path,
                                len: bytes.len() as u64,
                            }),
                            Err(err) => Attempt::Unwritable(err),
                        },
                        Err(err) => Attempt::Failed(err),
                    }
                }
                Err(_) => Attempt::Failed(TransportError::Request {
                    url: segment.url.to_string(),
                    reason: "worker pool closed".to_string(),
                }),
            };

            AttemptOutcome {
                sequence_index,
                attempt,
            }
        });

        running.insert(handle.id(), sequence_index);
    }
}

fn report(on_progress: Option<&ProgressFn>, progress: Progress) {
    let Some(callback) = on_progress else {
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
        warn!(segment = progress.sequence_index, "Progress callback panicked, ignoring");
    }
}
