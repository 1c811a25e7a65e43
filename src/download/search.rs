use std::sync::{Arc, LazyLock};

use async_recursion::async_recursion;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};
use url::Url;

use crate::download::Fetch;

static ABSOLUTE_MANIFEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s'"<>()\\]+\.m3u8(?:\?[^\s'"<>()\\]*)?"#).unwrap()
});
static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>(.*?)</script>").unwrap());
static QUOTED_MANIFEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["']([^"'\s<>]*\.m3u8[^"'\s<>]*)["']"#).unwrap());
static IFRAME_SRC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<iframe\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).unwrap()
});

/// How deep [`FrameLocator`] follows frames nested inside frames.
pub const MAX_FRAME_DEPTH: usize = 3;

/// One heuristic for finding manifest URLs in a playback page.
#[async_trait]
pub trait ManifestLocator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Candidate manifest URLs in the order they appear.
    async fn locate(&self, html: &str, page_url: &Url) -> Vec<Url>;
}

/// Absolute `http(s)://…m3u8` links anywhere in the page.
pub struct PatternLocator;

#[async_trait]
impl ManifestLocator for PatternLocator {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn locate(&self, html: &str, _page_url: &Url) -> Vec<Url> {
        find_absolute(html)
    }
}

/// Quoted manifest paths inside `<script>` blocks, which may be relative
/// to the page.
pub struct ScriptLocator;

#[async_trait]
impl ManifestLocator for ScriptLocator {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn locate(&self, html: &str, page_url: &Url) -> Vec<Url> {
        find_in_scripts(html, page_url)
    }
}

/// Fetches embedded `<iframe>` pages and scans them like a top-level page.
pub struct FrameLocator {
    fetcher: Arc<dyn Fetch>,
    max_depth: usize,
}

impl FrameLocator {
    pub fn new(fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            fetcher,
            max_depth: MAX_FRAME_DEPTH,
        }
    }
}

#[async_trait]
impl ManifestLocator for FrameLocator {
    fn name(&self) -> &'static str {
        "iframe"
    }

    async fn locate(&self, html: &str, page_url: &Url) -> Vec<Url> {
        scan_frames(self.fetcher.as_ref(), html, page_url, self.max_depth).await
    }
}

#[async_recursion]
async fn scan_frames(fetcher: &dyn Fetch, html: &str, page_url: &Url, depth: usize) -> Vec<Url> {
    if depth == 0 {
        return Vec::new();
    }

    for frame_url in find_frames(html, page_url) {
        info!(frame = %frame_url, "Found iframe, analyzing");

        let frame_html = match fetcher.fetch_text(&frame_url).await {
            Ok(frame_html) => frame_html,
            Err(err) => {
                warn!(frame = %frame_url, error = %err, "Could not fetch iframe");
                continue;
            }
        };

        let mut found = find_absolute(&frame_html);
        if found.is_empty() {
            found = find_in_scripts(&frame_html, &frame_url);
        }
        if found.is_empty() {
            found = scan_frames(fetcher, &frame_html, &frame_url, depth - 1).await;
        }
        if !found.is_empty() {
            return found;
        }
    }

    Vec::new()
}

/// Strategies tried in priority order. The first one that finds anything wins.
pub struct LocatorChain {
    strategies: Vec<Box<dyn ManifestLocator>>,
}

impl LocatorChain {
    pub fn new(strategies: Vec<Box<dyn ManifestLocator>>) -> Self {
        Self { strategies }
    }

    /// Pattern scan, then script scan, then embedded frames.
    pub fn standard(fetcher: Arc<dyn Fetch>) -> Self {
        Self::new(vec![
            Box::new(PatternLocator),
            Box::new(ScriptLocator),
            Box::new(FrameLocator::new(fetcher)),
        ])
    }

    pub async fn locate(&self, html: &str, page_url: &Url) -> Vec<Url> {
        for strategy in &self.strategies {
            let found = strategy.locate(html, page_url).await;
            if !found.is_empty() {
                info!(
                    strategy = strategy.name(),
                    candidates = found.len(),
                    first = %found[0],
                    "Found manifest link"
                );
                return found;
            }
            debug!(strategy = strategy.name(), "No manifest link found");
        }

        Vec::new()
    }
}

/// Pages often embed URLs in JSON with escaped slashes.
fn unescape(html: &str) -> String {
    html.replace("\\/", "/")
}

fn find_absolute(html: &str) -> Vec<Url> {
    let html = unescape(html);
    dedup(
        ABSOLUTE_MANIFEST
            .find_iter(&html)
            .filter_map(|m| Url::parse(m.as_str()).ok()),
    )
}

fn find_in_scripts(html: &str, page_url: &Url) -> Vec<Url> {
    let html = unescape(html);
    dedup(
        SCRIPT_BLOCK
            .captures_iter(&html)
            .filter_map(|script| script.get(1))
            .flat_map(|body| {
                QUOTED_MANIFEST
                    .captures_iter(body.as_str())
                    .filter_map(|quoted| quoted.get(1))
                    .filter_map(|path| page_url.join(path.as_str()).ok())
                    .collect::<Vec<_>>()
            }),
    )
}

fn find_frames(html: &str, page_url: &Url) -> Vec<Url> {
    dedup(
        IFRAME_SRC
            .captures_iter(html)
            .filter_map(|frame| frame.get(1))
            .filter_map(|src| page_url.join(src.as_str().trim()).ok())
            .filter(|url| matches!(url.scheme(), "http" | "https")),
    )
}

fn dedup(urls: impl Iterator<Item = Url>) -> Vec<Url> {
    let mut unique: Vec<Url> = Vec::new();
    for url in urls {
        if !unique.contains(&url) {
            unique.push(url);
        }
    }
    unique
}
