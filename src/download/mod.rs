pub mod playlist;
pub mod range;
pub mod search;
pub mod segment;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, REFERER};
use reqwest::StatusCode;
use tracing::{debug, trace};
use url::Url;

use crate::error::TransportError;
use range::ByteRange;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Byte fetching collaborator. One call is one attempt; retrying is up to
/// the caller.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &Url, range: Option<ByteRange>) -> Result<Bytes, TransportError>;

    async fn fetch_text(&self, url: &Url) -> Result<String, TransportError> {
        let bytes = self.fetch(url, None).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

pub struct DownloadClient {
    client: reqwest::Client,
}

impl DownloadClient {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|err| TransportError::Request {
                url: String::new(),
                reason: format!("cannot build HTTP client: {err}"),
            })?;

        Ok(Self { client })
    }

    fn headers(url: &Url, range: Option<ByteRange>) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // CDNs commonly check that segment requests come from their own site
        let origin = url.origin().ascii_serialization() + "/";
        if let Ok(referer) = HeaderValue::from_str(&origin) {
            headers.insert(REFERER, referer);
        }
        if let Some(range) = range {
            headers.insert(RANGE, range.header_value());
        }

        headers
    }
}

#[async_trait]
impl Fetch for DownloadClient {
    async fn fetch(&self, url: &Url, range: Option<ByteRange>) -> Result<Bytes, TransportError> {
        trace!(%url, ?range, "GET");

        let response = self
            .client
            .get(url.as_str())
            .headers(Self::headers(url, range))
            .send()
            .await
            .map_err(|err| TransportError::from_reqwest(url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::from_reqwest(url, err))?;

        match range {
            // server ignored the Range header and sent the whole resource
            Some(range) if status == StatusCode::OK => {
                debug!(%url, %range, "Server ignored range request, slicing full body");
                slice_range(url, bytes, range)
            }
            _ => Ok(bytes),
        }
    }
}

fn slice_range(url: &Url, bytes: Bytes, range: ByteRange) -> Result<Bytes, TransportError> {
    if (bytes.len() as u64) < range.end() {
        return Err(TransportError::ShortBody {
            url: url.to_string(),
            expected: range.end(),
            actual: bytes.len() as u64,
        });
    }
    Ok(bytes.slice(range.offset as usize..range.end() as usize))
}
