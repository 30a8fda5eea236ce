use super::{ByteRange, ProbeResult, RangeResponse, Transport};
use crate::error::DownloadError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the mock does with one fetch.
#[derive(Debug, Clone)]
pub(crate) enum Plan {
    Serve,
    Fail(DownloadError),
    /// Serves `n` bytes, then the body ends early.
    Short(usize),
    /// Serves `n` bytes, then the body errors out.
    Cut(usize),
    /// Serves the requested range with every byte inverted.
    Corrupt,
}

type Script = dyn Fn(Option<ByteRange>, usize) -> Plan + Send + Sync;

/// Scripted in-memory transport for driving workers and managers.
pub(crate) struct MockTransport {
    data: Bytes,
    accept_ranges: bool,
    disclose_size: bool,
    content_type: Option<String>,
    piece_size: usize,
    delay: Option<Duration>,
    script: Box<Script>,
    probe_failures: Mutex<VecDeque<DownloadError>>,
    fetches: AtomicUsize,
    probes: AtomicUsize,
    requests: Mutex<Vec<Option<ByteRange>>>,
}

impl MockTransport {
    pub(crate) fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            accept_ranges: true,
            disclose_size: true,
            content_type: Some("application/octet-stream".into()),
            piece_size: 16 * 1024,
            delay: None,
            script: Box::new(|_, _| Plan::Serve),
            probe_failures: Mutex::new(VecDeque::new()),
            fetches: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with `200` and the full body.
    pub(crate) fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    pub(crate) fn without_size(mut self) -> Self {
        self.disclose_size = false;
        self
    }

    pub(crate) fn piece_size(mut self, n: usize) -> Self {
        self.piece_size = n.max(1);
        self
    }

    pub(crate) fn delay(mut self, per_piece: Duration) -> Self {
        self.delay = Some(per_piece);
        self
    }

    pub(crate) fn script(
        mut self,
        script: impl Fn(Option<ByteRange>, usize) -> Plan + Send + Sync + 'static,
    ) -> Self {
        self.script = Box::new(script);
        self
    }

    pub(crate) fn probe_failures(self, failures: Vec<DownloadError>) -> Self {
        *self.probe_failures.lock().unwrap() = failures.into();
        self
    }

    pub(crate) fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub(crate) fn requests(&self) -> Vec<Option<ByteRange>> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn probe(&self, _url: &str) -> Result<ProbeResult, DownloadError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.probe_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(ProbeResult {
            total_size: self.disclose_size.then_some(self.data.len() as u64),
            accepts_ranges: self.accept_ranges,
            content_type: self.content_type.clone(),
        })
    }

    async fn fetch(
        &self,
        _url: &str,
        range: Option<ByteRange>,
    ) -> Result<RangeResponse, DownloadError> {
        let call = self.fetches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(range);

        let plan = (self.script)(range, call);
        if let Plan::Fail(err) = plan {
            return Err(err);
        }

        let len = self.data.len() as u64;
        let (status, body) = match range {
            Some(r) if self.accept_ranges => {
                let start = r.start.min(len) as usize;
                let end = r.end.unwrap_or(len).min(len) as usize;
                (206, self.data.slice(start..end))
            }
            _ => (200, self.data.clone()),
        };

        let (body, trailing_error) = match plan {
            Plan::Short(n) => (body.slice(..n.min(body.len())), None),
            Plan::Cut(n) => (
                body.slice(..n.min(body.len())),
                Some(DownloadError::Network("connection reset by peer".into())),
            ),
            Plan::Corrupt => (body.iter().map(|b| !b).collect::<Bytes>(), None),
            _ => (body, None),
        };

        let mut pieces: Vec<Result<Bytes, DownloadError>> = Vec::new();
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + self.piece_size).min(body.len());
            pieces.push(Ok(body.slice(offset..end)));
            offset = end;
        }
        pieces.extend(trailing_error.map(Err));

        let delay = self.delay;
        let body = stream::iter(pieces)
            .then(move |piece| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                piece
            })
            .boxed();

        Ok(RangeResponse { status, body })
    }
}

/// Deterministic test payload whose bytes depend on their offset.
pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
