//! In-memory collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use url::Url;

use crate::download::playlist::SegmentRef;
use crate::download::range::ByteRange;
use crate::download::Fetch;
use crate::error::TransportError;
use crate::merge::TranscodeTool;

#[derive(Debug, Clone)]
pub enum Reply {
    Body(Bytes),
    Status(u16),
    /// Never answers.
    Hang,
}

impl Reply {
    pub fn body(bytes: &[u8]) -> Self {
        Reply::Body(Bytes::copy_from_slice(bytes))
    }
}

/// Answers each URL from a script of replies; the last reply repeats.
/// Unknown URLs answer 404.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.script(url, vec![Reply::Body(Bytes::from(body.into()))])
    }

    pub fn script(self, url: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into());
        self
    }

    /// Delay applied to every fetch without its own delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn delay_for(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(url) {
            Some(replies) if replies.len() > 1 => replies.pop_front().unwrap_or(Reply::Status(404)),
            Some(replies) => replies.front().cloned().unwrap_or(Reply::Status(404)),
            None => Reply::Status(404),
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetch for ScriptedFetcher {
    async fn fetch(&self, url: &Url, range: Option<ByteRange>) -> Result<Bytes, TransportError> {
        let key = url.as_str();
        *self.calls.lock().unwrap().entry(key.to_string()).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let delay = self.delays.get(key).copied().unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.next_reply(key) {
            Reply::Body(bytes) => match range {
                Some(range) => Ok(bytes.slice(range.offset as usize..range.end() as usize)),
                None => Ok(bytes),
            },
            Reply::Status(code) => Err(TransportError::Status {
                url: key.to_string(),
                status: StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// `count` segments on a fake CDN, numbered from 10 so indices differ from positions.
pub fn segment_refs(count: usize) -> Vec<SegmentRef> {
    (0..count)
        .map(|i| SegmentRef {
            sequence_index: 10 + i as u64,
            url: Url::parse(&format!("https://cdn.example.com/seg{i}.ts")).unwrap(),
            byte_range: None,
            duration: Some(4.0),
        })
        .collect()
}

/// Transcode tool that concatenates the listed segments, or fails on demand.
/// Records the segment paths it was given.
#[derive(Default)]
pub struct RecordingTool {
    pub fail_with: Option<String>,
    pub seen: Mutex<Vec<PathBuf>>,
}

impl TranscodeTool for RecordingTool {
    fn run(&self, _list_file: &Path, segments: &[PathBuf], dest: &Path) -> Result<(), String> {
        self.seen.lock().unwrap().extend(segments.iter().cloned());
        for segment in segments {
            assert!(segment.exists(), "segment {} missing during merge", segment.display());
        }
        if let Some(reason) = &self.fail_with {
            return Err(reason.clone());
        }

        let mut out = Vec::new();
        for segment in segments {
            out.extend(std::fs::read(segment).map_err(|e| e.to_string())?);
        }
        std::fs::write(dest, out).map_err(|e| e.to_string())
    }
}
