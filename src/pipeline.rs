use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::download::playlist::{self, variant, Manifest, SegmentRef};
use crate::download::search::LocatorChain;
use crate::download::segment::{ProgressFn, SegmentDownloader};
use crate::download::Fetch;
use crate::error::{DownloadError, ParseError, PipelineError, Stage, StageError};
use crate::merge::{MergeOutcome, MergeStrategy, Merger, TranscodeTool};
use crate::options::Options;

/// How many master manifests may point at further master manifests.
const MAX_MASTER_DEPTH: usize = 3;

/// What the user pointed us at.
#[derive(Debug, Clone)]
pub enum Source {
    PageUrl(Url),
    ManifestUrl(Url),
    ManifestText { text: String, base_url: Url },
}

impl Source {
    /// Anything mentioning `.m3u8` is taken as a manifest link, everything
    /// else as a playback page.
    pub fn detect(input: &str) -> Result<Self, url::ParseError> {
        let url = Url::parse(input.trim())?;
        if url.as_str().contains(".m3u8") {
            Ok(Source::ManifestUrl(url))
        } else {
            Ok(Source::PageUrl(url))
        }
    }
}

/// Locates, downloads and merges one video.
pub struct Pipeline {
    fetcher: Arc<dyn Fetch>,
    locators: LocatorChain,
    downloader: SegmentDownloader,
    merger: Arc<Merger>,
    strategy: MergeStrategy,
    output: PathBuf,
    progress: Option<Arc<ProgressFn>>,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        downloader: SegmentDownloader,
        merger: Merger,
        strategy: MergeStrategy,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            locators: LocatorChain::standard(Arc::clone(&fetcher)),
            fetcher,
            downloader,
            merger: Arc::new(merger),
            strategy,
            output: output.into(),
            progress: None,
        }
    }

    pub fn from_options(
        options: &Options,
        fetcher: Arc<dyn Fetch>,
        tool: Arc<dyn TranscodeTool>,
    ) -> Result<Self, DownloadError> {
        let downloader = SegmentDownloader::new(
            Arc::clone(&fetcher),
            options.max_parallel_downloads,
            options.retry_policy(),
        )?
        .with_spool_dir(options.work_dir.clone());
        let merger = Merger::new(tool, options.work_dir.clone());

        Ok(Self::new(
            fetcher,
            downloader,
            merger,
            options.merge_strategy,
            options.output_path(),
        ))
    }

    pub fn with_progress(mut self, progress: Arc<ProgressFn>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_locators(mut self, locators: LocatorChain) -> Self {
        self.locators = locators;
        self
    }

    pub async fn run(
        &self,
        source: Source,
        token: &CancellationToken,
    ) -> Result<MergeOutcome, PipelineError> {
        let segments = self.resolve(source, token).await?;

        enter(Stage::Downloading);
        let results = match self
            .downloader
            .download(&segments, self.progress.as_deref(), token)
            .await
        {
            Ok(results) => results,
            Err(DownloadError::Cancelled) => {
                return Err(PipelineError::Cancelled {
                    stage: Stage::Downloading,
                })
            }
            Err(err) => return Err(PipelineError::failed(Stage::Downloading, err)),
        };

        let missing = results.failed_indices();
        if !missing.is_empty() {
            return Err(PipelineError::SegmentsMissing(missing));
        }
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled {
                stage: Stage::Merging,
            });
        }

        enter(Stage::Merging);
        let merger = Arc::clone(&self.merger);
        let strategy = self.strategy;
        let output = self.output.clone();
        let outcome = tokio::task::spawn_blocking(move || merger.merge(&results, strategy, &output))
            .await
            .map_err(|err| PipelineError::failed(Stage::Merging, StageError::Internal(err.to_string())))?
            .map_err(|err| PipelineError::failed(Stage::Merging, err))?;

        enter(Stage::Done);
        Ok(outcome)
    }

    async fn resolve(
        &self,
        source: Source,
        token: &CancellationToken,
    ) -> Result<Vec<SegmentRef>, PipelineError> {
        match source {
            Source::PageUrl(page) => {
                enter(Stage::Locating);
                info!(page = %page, "Analyzing playback page");

                let html = cancellable(token, Stage::Locating, self.fetcher.fetch_text(&page))
                    .await?
                    .map_err(|err| PipelineError::failed(Stage::Locating, err))?;
                let candidates =
                    cancellable(token, Stage::Locating, self.locators.locate(&html, &page)).await?;

                if candidates.is_empty() {
                    return Err(PipelineError::NoManifestFound {
                        page: page.to_string(),
                    });
                }

                let tried = candidates.len();
                for candidate in candidates {
                    match self.load_url(candidate.clone(), token).await {
                        Ok(segments) => return Ok(segments),
                        Err(err @ PipelineError::Cancelled { .. }) => return Err(err),
                        Err(err) => {
                            warn!(candidate = %candidate, error = %err, "Skipping manifest candidate");
                        }
                    }
                }

                Err(PipelineError::AllManifestsUnparsable { tried })
            }
            Source::ManifestUrl(url) => self.load_url(url, token).await,
            Source::ManifestText { text, base_url } => self.load_text(&text, base_url, token).await,
        }
    }

    async fn load_url(
        &self,
        url: Url,
        token: &CancellationToken,
    ) -> Result<Vec<SegmentRef>, PipelineError> {
        let text = self.fetch_manifest(&url, token).await?;
        self.load_text(&text, url, token).await
    }

    /// Parses a manifest, following master manifests to the selected variant.
    async fn load_text(
        &self,
        text: &str,
        base_url: Url,
        token: &CancellationToken,
    ) -> Result<Vec<SegmentRef>, PipelineError> {
        enter(Stage::Parsing);
        let mut manifest = playlist::parse(text, &base_url)
            .map_err(|err| PipelineError::failed(Stage::Parsing, err))?;

        for _ in 0..=MAX_MASTER_DEPTH {
            match manifest {
                Manifest::Media(media) => {
                    info!(
                        segments = media.segments.len(),
                        duration_secs = media.total_duration(),
                        "Parsed media manifest"
                    );
                    return Ok(media.segments);
                }
                Manifest::Master(master) => {
                    enter(Stage::Selecting);
                    info!(variants = master.variants.len(), "Found multiple quality options");
                    let selected = variant::select(&master.variants)
                        .map_err(|err| PipelineError::failed(Stage::Selecting, err))?
                        .manifest_url
                        .clone();

                    let text = self.fetch_manifest(&selected, token).await?;
                    manifest = playlist::parse(&text, &selected)
                        .map_err(|err| PipelineError::failed(Stage::Parsing, err))?;
                }
            }
        }

        Err(PipelineError::failed(
            Stage::Parsing,
            ParseError::Unsupported(format!(
                "master manifests nested deeper than {MAX_MASTER_DEPTH}"
            )),
        ))
    }

    async fn fetch_manifest(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<String, PipelineError> {
        enter(Stage::Parsing);
        info!(url = %url, "Fetching manifest");
        cancellable(token, Stage::Parsing, self.fetcher.fetch_text(url))
            .await?
            .map_err(|err| PipelineError::failed(Stage::Parsing, err))
    }
}

fn enter(stage: Stage) {
    info!(%stage, "Pipeline stage");
}

async fn cancellable<F: Future>(
    token: &CancellationToken,
    stage: Stage,
    future: F,
) -> Result<F::Output, PipelineError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(PipelineError::Cancelled { stage }),
        output = future => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::search::ManifestLocator;
    use crate::download::segment::{Progress, RetryPolicy};
    use crate::testing::{RecordingTool, Reply, ScriptedFetcher};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    const PAGE: &str = "https://videos.example.com/watch/7";
    const MASTER: &str = "https://cdn.example.com/v/master.m3u8";

    struct Harness {
        pipeline: Pipeline,
        fetcher: Arc<ScriptedFetcher>,
        tool: Arc<RecordingTool>,
        output: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn harness(fetcher: ScriptedFetcher, strategy: MergeStrategy, max_retries: u32) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out").join("video.ts");
        let fetcher = Arc::new(fetcher);
        let tool = Arc::new(RecordingTool::default());

        let policy = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        };
        let downloader = SegmentDownloader::new(fetcher.clone(), 4, policy)
            .unwrap()
            .with_spool_dir(dir.path().join("work"));
        let merger = Merger::new(tool.clone(), dir.path().join("work"));
        let pipeline = Pipeline::new(fetcher.clone(), downloader, merger, strategy, &output);

        Harness {
            pipeline,
            fetcher,
            tool,
            output,
            _dir: dir,
        }
    }

    fn media_manifest(count: usize) -> String {
        let mut text = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
        for i in 0..count {
            text.push_str(&format!("#EXTINF:4.0,\nseg{i}.ts\n"));
        }
        text.push_str("#EXT-X-ENDLIST\n");
        text
    }

    fn page_linking(manifest: &str) -> String {
        format!(r#"<html><script>player.load("{manifest}")</script></html>"#)
    }

    #[tokio::test]
    async fn page_to_merged_file_through_master_manifest() {
        let segments: [&[u8]; 4] = [b"aaaa", b"bb", b"cccccc", b"d"];
        let mut fetcher = ScriptedFetcher::new()
            .route(PAGE, page_linking(MASTER))
            .route(
                MASTER,
                "#EXTM3U\n\
                 #EXT-X-STREAM-INF:BANDWIDTH=800,RESOLUTION=640x360\n\
                 low/index.m3u8\n\
                 #EXT-X-STREAM-INF:BANDWIDTH=1200,RESOLUTION=1280x720\n\
                 high/index.m3u8\n",
            )
            .route("https://cdn.example.com/v/high/index.m3u8", media_manifest(4));
        for (i, bytes) in segments.iter().enumerate() {
            fetcher = fetcher.route(&format!("https://cdn.example.com/v/high/seg{i}.ts"), bytes.to_vec());
        }
        let h = harness(fetcher, MergeStrategy::Concat, 2);

        let source = Source::detect(PAGE).unwrap();
        let outcome = h.pipeline.run(source, &CancellationToken::new()).await.unwrap();

        let expected_len: usize = segments.iter().map(|s| s.len()).sum();
        assert_eq!(outcome.strategy, MergeStrategy::Concat);
        assert_eq!(outcome.bytes_written, expected_len as u64);
        assert_eq!(outcome.output_path, h.output);
        assert_eq!(std::fs::read(&h.output).unwrap(), b"aaaabbccccccd");
        assert_eq!(h.fetcher.calls("https://cdn.example.com/v/low/index.m3u8"), 0);
        for i in 0..4 {
            assert_eq!(h.fetcher.calls(&format!("https://cdn.example.com/v/high/seg{i}.ts")), 1);
        }
    }

    #[tokio::test]
    async fn manifest_text_source_skips_locating() {
        let base = Url::parse("https://cdn.example.com/v/index.m3u8").unwrap();
        let fetcher = ScriptedFetcher::new()
            .route("https://cdn.example.com/v/seg0.ts", b"one".to_vec())
            .route("https://cdn.example.com/v/seg1.ts", b"two".to_vec());
        let h = harness(fetcher, MergeStrategy::Transcode, 0);

        let source = Source::ManifestText {
            text: media_manifest(2),
            base_url: base,
        };
        let outcome = h.pipeline.run(source, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.strategy, MergeStrategy::Transcode);
        assert_eq!(std::fs::read(&h.output).unwrap(), b"onetwo");
        assert_eq!(h.tool.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn progress_reaches_the_caller() {
        let fetcher = ScriptedFetcher::new()
            .route("https://cdn.example.com/v/index.m3u8", media_manifest(3))
            .route("https://cdn.example.com/v/seg0.ts", b"0".to_vec())
            .route("https://cdn.example.com/v/seg1.ts", b"1".to_vec())
            .route("https://cdn.example.com/v/seg2.ts", b"2".to_vec());
        let h = harness(fetcher, MergeStrategy::Concat, 0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let pipeline = h
            .pipeline
            .with_progress(Arc::new(move |p: Progress| sink.lock().unwrap().push(p.completed)));

        let source = Source::detect("https://cdn.example.com/v/index.m3u8").unwrap();
        pipeline.run(source, &CancellationToken::new()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), [1, 2, 3]);
    }

    fn work_entries(h: &Harness) -> usize {
        std::fs::read_dir(h._dir.path().join("work"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn segment_files_are_removed_after_merge() {
        let fetcher = ScriptedFetcher::new()
            .route(MASTER, media_manifest(2))
            .route("https://cdn.example.com/v/seg0.ts", b"ab".to_vec())
            .route("https://cdn.example.com/v/seg1.ts", b"cd".to_vec());
        let h = harness(fetcher, MergeStrategy::Transcode, 0);

        h.pipeline
            .run(Source::detect(MASTER).unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        let seen = h.tool.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| !p.exists()));
        assert_eq!(std::fs::read(&h.output).unwrap(), b"abcd");
        assert_eq!(work_entries(&h), 0);
    }

    struct FixedLocator(Url);

    #[async_trait::async_trait]
    impl ManifestLocator for FixedLocator {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn locate(&self, _html: &str, _page_url: &Url) -> Vec<Url> {
            vec![self.0.clone()]
        }
    }

    #[tokio::test]
    async fn custom_locators_replace_the_standard_chain() {
        let fetcher = ScriptedFetcher::new()
            .route(PAGE, "<html>the player builds its URL at runtime</html>")
            .route("https://cdn.example.com/hidden/index.m3u8", media_manifest(1))
            .route("https://cdn.example.com/hidden/seg0.ts", b"z".to_vec());
        let h = harness(fetcher, MergeStrategy::Concat, 0);
        let locator = FixedLocator(Url::parse("https://cdn.example.com/hidden/index.m3u8").unwrap());
        let pipeline = h
            .pipeline
            .with_locators(LocatorChain::new(vec![Box::new(locator)]));

        let outcome = pipeline
            .run(Source::detect(PAGE).unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.bytes_written, 1);
        assert_eq!(std::fs::read(&h.output).unwrap(), b"z");
    }

    #[tokio::test]
    async fn page_without_manifest_is_reported() {
        let fetcher = ScriptedFetcher::new().route(PAGE, "<html><body>no video here</body></html>");
        let h = harness(fetcher, MergeStrategy::Concat, 0);

        let err = h
            .pipeline
            .run(Source::detect(PAGE).unwrap(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::NoManifestFound { .. }));
        assert_eq!(err.stage(), Stage::Locating);
    }

    #[tokio::test]
    async fn unreachable_page_fails_while_locating() {
        let h = harness(ScriptedFetcher::new(), MergeStrategy::Concat, 0);

        let err = h
            .pipeline
            .run(Source::detect(PAGE).unwrap(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Failed {
                stage: Stage::Locating,
                cause: StageError::Transport(_)
            }
        ));
    }

    #[tokio::test]
    async fn candidates_are_tried_in_order() {
        let page = r#"<script>
            var a = "https://cdn.example.com/broken.m3u8";
            var b = "https://cdn.example.com/missing.m3u8";
            var c = "https://cdn.example.com/good.m3u8";
        </script>"#;
        let fetcher = ScriptedFetcher::new()
            .route(PAGE, page)
            .route("https://cdn.example.com/broken.m3u8", "<html>not a playlist</html>")
            .route("https://cdn.example.com/good.m3u8", media_manifest(1))
            .route("https://cdn.example.com/seg0.ts", b"x".to_vec());
        let h = harness(fetcher, MergeStrategy::Concat, 0);

        let outcome = h
            .pipeline
            .run(Source::detect(PAGE).unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.bytes_written, 1);
        assert_eq!(h.fetcher.calls("https://cdn.example.com/broken.m3u8"), 1);
        assert_eq!(h.fetcher.calls("https://cdn.example.com/missing.m3u8"), 1);
    }

    #[tokio::test]
    async fn all_candidates_unparsable() {
        let page = r#"<a href="https://cdn.example.com/a.m3u8"></a><a href="https://cdn.example.com/b.m3u8"></a>"#;
        let fetcher = ScriptedFetcher::new()
            .route(PAGE, page)
            .route("https://cdn.example.com/a.m3u8", "#EXTM3U\n")
            .route("https://cdn.example.com/b.m3u8", "garbage");
        let h = harness(fetcher, MergeStrategy::Concat, 0);

        let err = h
            .pipeline
            .run(Source::detect(PAGE).unwrap(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::AllManifestsUnparsable { tried: 2 }));
    }

    #[tokio::test]
    async fn broken_variant_does_not_fall_back_to_another() {
        let fetcher = ScriptedFetcher::new()
            .route(PAGE, page_linking(MASTER))
            .route(
                MASTER,
                "#EXTM3U\n\
                 #EXT-X-STREAM-INF:BANDWIDTH=800\n\
                 low.m3u8\n\
                 #EXT-X-STREAM-INF:BANDWIDTH=1200\n\
                 high.m3u8\n",
            )
            .route("https://cdn.example.com/v/low.m3u8", media_manifest(1))
            .route("https://cdn.example.com/v/high.m3u8", "#EXTM3U\n#EXTINF:oops,\nseg0.ts\n");
        let h = harness(fetcher, MergeStrategy::Concat, 0);

        let err = h
            .pipeline
            .run(Source::detect(PAGE).unwrap(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::AllManifestsUnparsable { tried: 1 }));
        assert_eq!(h.fetcher.calls("https://cdn.example.com/v/low.m3u8"), 0);
    }

    #[tokio::test]
    async fn direct_manifest_parse_error_keeps_its_cause() {
        let fetcher = ScriptedFetcher::new().route(MASTER, "");
        let h = harness(fetcher, MergeStrategy::Concat, 0);

        let err = h
            .pipeline
            .run(Source::detect(MASTER).unwrap(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Failed {
                stage: Stage::Parsing,
                cause: StageError::Parse(ParseError::Empty)
            }
        ));
    }

    #[tokio::test]
    async fn failed_segment_prevents_merge() {
        let fetcher = ScriptedFetcher::new()
            .route(MASTER, media_manifest(3))
            .route("https://cdn.example.com/v/seg0.ts", b"0".to_vec())
            .script("https://cdn.example.com/v/seg1.ts", vec![Reply::Status(502)])
            .route("https://cdn.example.com/v/seg2.ts", b"2".to_vec());
        let h = harness(fetcher, MergeStrategy::Transcode, 2);

        let err = h
            .pipeline
            .run(Source::detect(MASTER).unwrap(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            PipelineError::SegmentsMissing(missing) => assert_eq!(missing, [1]),
            other => panic!("expected missing segments, got {other:?}"),
        }
        assert_eq!(h.fetcher.calls("https://cdn.example.com/v/seg1.ts"), 3);
        assert!(!h.output.exists());
        assert_eq!(work_entries(&h), 0);
        assert!(h.tool.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_download_never_merges() {
        let fetcher = ScriptedFetcher::new()
            .route(MASTER, media_manifest(3))
            .route("https://cdn.example.com/v/seg0.ts", b"0".to_vec())
            .script("https://cdn.example.com/v/seg1.ts", vec![Reply::Hang])
            .script("https://cdn.example.com/v/seg2.ts", vec![Reply::Status(500)]);
        let h = harness(fetcher, MergeStrategy::Concat, 1000);

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            h.pipeline.run(Source::detect(MASTER).unwrap(), &token),
        )
        .await
        .expect("run must end after cancellation")
        .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Cancelled {
                stage: Stage::Downloading
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!h.output.exists());
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let h = harness(ScriptedFetcher::new().route(PAGE, page_linking(MASTER)), MergeStrategy::Concat, 0);
        let token = CancellationToken::new();
        token.cancel();

        let err = h
            .pipeline
            .run(Source::detect(PAGE).unwrap(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { stage: Stage::Locating }));
    }

    #[test]
    fn detects_source_kind() {
        assert!(matches!(
            Source::detect("https://cdn.example.com/a/index.m3u8").unwrap(),
            Source::ManifestUrl(_)
        ));
        assert!(matches!(
            Source::detect("https://cdn.example.com/play?src=index.m3u8&x=1").unwrap(),
            Source::ManifestUrl(_)
        ));
        assert!(matches!(
            Source::detect("https://videos.example.com/watch/7").unwrap(),
            Source::PageUrl(_)
        ));
        assert!(Source::detect("not a url").is_err());
    }
}
