use chunkload::config::{DownloadConfigBuilder, RetryConfig};
use chunkload::request::DownloadRequest;
use chunkload::session::PersistenceType;
use chunkload::{DownloadEvent, DownloadRegistry, DownloadStatus};
use mockito::{Matcher, Server};
use std::path::Path;

const CHUNK_RANGE: &str = r"^bytes=(0-[1-9][0-9]*|[1-9][0-9]*-[0-9]+)$";

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn registry(dir: &Path) -> DownloadRegistry {
    let config = DownloadConfigBuilder::new()
        .persistence_type(PersistenceType::JsonFile(dir.join("session.json")))
        .retry(RetryConfig {
            max_retries: 2,
            initial_delay_ms: 1,
            max_delay_ms: 10,
            backoff_factor: 2.0,
        })
        .build()
        .unwrap();
    DownloadRegistry::new(config).unwrap()
}

/// Slice of `data` named by a `bytes=a-b` header.
fn ranged_slice(data: &[u8], header: &str) -> Vec<u8> {
    let range = header.trim_start_matches("bytes=");
    let (start, end) = range.split_once('-').unwrap();
    let start: usize = start.parse().unwrap();
    let end: usize = end.parse().unwrap();
    data[start..=end].to_vec()
}

async fn ranged_server(data: &[u8]) -> (mockito::ServerGuard, Vec<mockito::Mock>) {
    let mut server = Server::new_async().await;
    let head = server
        .mock("HEAD", "/file.bin")
        .with_status(405)
        .create_async()
        .await;
    let probe = server
        .mock("GET", "/file.bin")
        .match_header("range", "bytes=0-0")
        .with_status(206)
        .with_header("content-range", &format!("bytes 0-0/{}", data.len()))
        .with_header("content-type", "application/x-test")
        .with_body(&data[..1])
        .expect(1)
        .create_async()
        .await;

    let body = data.to_vec();
    let chunks = server
        .mock("GET", "/file.bin")
        .match_header("range", Matcher::Regex(CHUNK_RANGE.into()))
        .with_status(206)
        .with_body_from_request(move |request| {
            let header = request.header("range");
            let value = header[0].to_str().unwrap();
            ranged_slice(&body, value)
        })
        .expect(4)
        .create_async()
        .await;

    (server, vec![head, probe, chunks])
}

#[tokio::test]
async fn downloads_in_ranges_after_head_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(100_000);
    let (server, mocks) = ranged_server(&data).await;

    let registry = registry(dir.path());
    let mut events = registry.subscribe();
    let path = dir.path().join("out").join("file.bin");
    let manager = registry
        .add(
            DownloadRequest::builder(format!("{}/file.bin", server.url()), &path)
                .num_threads(4)
                .build(),
        )
        .await
        .unwrap();
    manager.start().await.unwrap();
    manager.settled().await;

    let job = manager.job().await;
    assert_eq!(job.status, DownloadStatus::Completed, "{:?}", job.traceback_info);
    assert_eq!(job.total_size, 100_000);
    assert_eq!(job.chunks.len(), 4);
    assert_eq!(job.content_type, "application/x-test");
    assert_eq!(std::fs::read(&path).unwrap(), data);

    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        if let DownloadEvent::Completed { filename, .. } = event {
            completed = Some(filename);
        }
    }
    assert_eq!(completed.as_deref(), Some("file.bin"));

    for mock in mocks.iter().skip(1) {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn falls_back_to_one_stream_when_ranges_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(50_000);
    let mut server = Server::new_async().await;
    let _head = server
        .mock("HEAD", "/plain")
        .with_status(405)
        .create_async()
        .await;
    let probe = server
        .mock("GET", "/plain")
        .match_header("range", "bytes=0-0")
        .with_status(200)
        .with_body(&data)
        .expect(1)
        .create_async()
        .await;
    let transfer = server
        .mock("GET", "/plain")
        .match_header("range", Matcher::Missing)
        .with_status(200)
        .with_body(&data)
        .expect(1)
        .create_async()
        .await;

    let registry = registry(dir.path());
    let path = dir.path().join("plain.bin");
    let manager = registry
        .add(
            DownloadRequest::builder(format!("{}/plain", server.url()), &path)
                .num_threads(8)
                .build(),
        )
        .await
        .unwrap();
    manager.start().await.unwrap();
    manager.settled().await;

    let job = manager.job().await;
    assert_eq!(job.status, DownloadStatus::Completed, "{:?}", job.traceback_info);
    assert_eq!(job.chunks.len(), 1);
    assert_eq!(std::fs::read(&path).unwrap(), data);
    probe.assert_async().await;
    transfer.assert_async().await;
}

#[tokio::test]
async fn advertised_ranges_are_confirmed_before_splitting() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(100_000);
    let mut server = Server::new_async().await;
    let _head = server
        .mock("HEAD", "/liar")
        .with_status(200)
        .with_header("accept-ranges", "bytes")
        .with_body(&data)
        .create_async()
        .await;
    let full = server
        .mock("GET", "/liar")
        .with_status(200)
        .with_body(&data)
        .expect(2)
        .create_async()
        .await;

    let registry = registry(dir.path());
    let path = dir.path().join("liar.bin");
    let manager = registry
        .add(
            DownloadRequest::builder(format!("{}/liar", server.url()), &path)
                .num_threads(4)
                .build(),
        )
        .await
        .unwrap();
    manager.start().await.unwrap();
    manager.settled().await;

    let job = manager.job().await;
    assert_eq!(job.status, DownloadStatus::Completed, "{:?}", job.traceback_info);
    assert_eq!(job.chunks.len(), 1);
    assert_eq!(job.total_size, 100_000);
    assert_eq!(std::fs::read(&path).unwrap(), data);
    full.assert_async().await;
}

#[tokio::test]
async fn missing_resource_ends_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new_async().await;
    let _head = server
        .mock("HEAD", "/gone")
        .with_status(404)
        .create_async()
        .await;

    let registry = registry(dir.path());
    let mut events = registry.subscribe();
    let manager = registry
        .add(DownloadRequest::builder(format!("{}/gone", server.url()), dir.path().join("gone")).build())
        .await
        .unwrap();
    manager.start().await.unwrap();
    manager.settled().await;

    let job = manager.job().await;
    assert_eq!(job.status, DownloadStatus::Error);
    let traceback = job.traceback_info.unwrap();
    assert!(traceback.contains("404"), "{}", traceback);
    assert!(traceback.contains("/gone"), "{}", traceback);

    let mut errors = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DownloadEvent::Error { .. }) {
            errors += 1;
        }
    }
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn checksum_is_verified_against_the_served_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let data = b"hello world".to_vec();
    let mut server = Server::new_async().await;
    let _head = server
        .mock("HEAD", "/hello.txt")
        .with_status(405)
        .create_async()
        .await;
    let _body = server
        .mock("GET", "/hello.txt")
        .with_status(200)
        .with_body(&data)
        .create_async()
        .await;

    let registry = registry(dir.path());
    let good = registry
        .add(
            DownloadRequest::builder(format!("{}/hello.txt", server.url()), dir.path().join("good.txt"))
                .checksum("5eb63bbbe01eeed093cb22bb8f5acdc3")
                .build(),
        )
        .await
        .unwrap();
    let bad = registry
        .add(
            DownloadRequest::builder(format!("{}/hello.txt", server.url()), dir.path().join("bad.txt"))
                .checksum("00000000000000000000000000000000")
                .build(),
        )
        .await
        .unwrap();
    good.start().await.unwrap();
    bad.start().await.unwrap();
    registry.settled().await;

    assert_eq!(good.status().await, DownloadStatus::Completed);
    assert_eq!(bad.status().await, DownloadStatus::Error);
    let traceback = bad.job().await.traceback_info.unwrap();
    assert!(traceback.contains("checksum mismatch (MD5)"), "{}", traceback);
    // The file stays on disk for inspection.
    assert_eq!(std::fs::read(dir.path().join("bad.txt")).unwrap(), data);
}
