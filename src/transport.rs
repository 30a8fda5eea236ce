use crate::config::DownloadConfig;
use crate::error::DownloadError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use log::debug;
use reqwest::header::{
    HeaderMap, HeaderName, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use reqwest::{Client, StatusCode};
use std::fmt;
use url::Url;

#[cfg(test)]
pub(crate) mod mock;

pub const USER_AGENT: &str = concat!("chunkload/", env!("CARGO_PKG_VERSION"));

/// Half-open byte range `[start, end)`; `end == None` means "to the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Value for the `Range` request header (inclusive end on the wire).
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end.saturating_sub(1)),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// What the capability probe learned about a resource.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeResult {
    pub total_size: Option<u64>,
    pub accepts_ranges: bool,
    pub content_type: Option<String>,
}

pub struct RangeResponse {
    /// 206 when the range was honored, 200 when the full body is coming.
    pub status: u16,
    pub body: BoxStream<'static, Result<Bytes, DownloadError>>,
}

impl RangeResponse {
    pub fn is_partial(&self) -> bool {
        self.status == StatusCode::PARTIAL_CONTENT.as_u16()
    }
}

impl fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// HTTP operations the engine needs. Non-2xx statuses come back as
/// `DownloadError::Http`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError>;

    async fn fetch(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<RangeResponse, DownloadError>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &DownloadConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .pool_idle_timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| DownloadError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        let url = Url::parse(url)?;
        let mut result = ProbeResult::default();
        let mut head_advertises_ranges = false;

        let head = self.client.head(url.clone()).send().await?;
        let status = head.status();
        debug!("[Probe] HEAD {} -> {}", url, status);

        if status.is_success() {
            let headers = head.headers();
            result.total_size = header_u64(headers, CONTENT_LENGTH);
            result.content_type = header_str(headers, CONTENT_TYPE);
            head_advertises_ranges = header_str(headers, ACCEPT_RANGES)
                .map(|v| v.to_ascii_lowercase().contains("bytes"))
                .unwrap_or(false);
        } else if status != StatusCode::FORBIDDEN && status != StatusCode::METHOD_NOT_ALLOWED {
            return Err(DownloadError::Http {
                status: status.as_u16(),
            });
        }

        // HEAD alone is not trusted: some servers advertise ranges and then
        // answer ranged requests with the full body.
        let get = self
            .client
            .get(url.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;
        let status = get.status();
        debug!("[Probe] GET {} bytes=0-0 -> {}", url, status);

        let headers = get.headers();
        if result.content_type.is_none() {
            result.content_type = header_str(headers, CONTENT_TYPE);
        }

        match status {
            StatusCode::PARTIAL_CONTENT => {
                match header_str(headers, CONTENT_RANGE)
                    .as_deref()
                    .and_then(parse_content_range_total)
                {
                    Some(total) => {
                        result.total_size = Some(total);
                        result.accepts_ranges = true;
                    }
                    None => {
                        result.accepts_ranges =
                            head_advertises_ranges && result.total_size.is_some();
                    }
                }
            }
            StatusCode::OK => {
                result.accepts_ranges = false;
                if let Some(length) = header_u64(headers, CONTENT_LENGTH) {
                    result.total_size = Some(length);
                }
            }
            other => {
                return Err(DownloadError::Http {
                    status: other.as_u16(),
                })
            }
        }

        Ok(result)
    }

    async fn fetch(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<RangeResponse, DownloadError> {
        let mut request = self.client.get(Url::parse(url)?);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Http {
                status: status.as_u16(),
            });
        }

        Ok(RangeResponse {
            status: status.as_u16(),
            body: response
                .bytes_stream()
                .map(|piece| piece.map_err(DownloadError::from))
                .boxed(),
        })
    }
}

/// Total length from a `Content-Range: bytes 0-0/N` header; `None` for `*`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// Read from the header itself: `Response::content_length` reports the body
// hint, which is zero for HEAD.
fn header_u64(headers: &HeaderMap, name: HeaderName) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_is_inclusive_on_the_wire() {
        let closed = ByteRange {
            start: 2_621_440,
            end: Some(5_242_880),
        };
        assert_eq!(closed.header_value(), "bytes=2621440-5242879");

        let open = ByteRange {
            start: 512,
            end: None,
        };
        assert_eq!(open.header_value(), "bytes=512-");
    }

    #[test]
    fn parses_content_range_totals() {
        assert_eq!(parse_content_range_total("bytes 0-0/1234"), Some(1234));
        assert_eq!(parse_content_range_total(" bytes 0-0/ 99 "), Some(99));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("items 0-0/5"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }
}
