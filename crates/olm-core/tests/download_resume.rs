//! Resumable HTTP downloads against a range-aware mock server.

use std::time::Duration;

use olm_core::CoreError;
use olm_core::config::DownloadSettings;
use olm_core::download::{
    ContentHash, DownloadOutcome, DownloadRequest, HttpDownloader, TaskControl, temp_path,
};
use olm_core::ollama::OllamaClient;
use olm_core::registry::TaskStatus;
use olm_core::tasks::{FileRequest, TaskEvent, TaskManager, TaskOutcome};
use sha2::{Digest, Sha256};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Serves `body`, honouring `Range: bytes=N-`.
struct RangeResponder {
    body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let start = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("bytes="))
            .and_then(|value| value.strip_suffix('-'))
            .and_then(|value| value.parse::<usize>().ok());

        match start {
            Some(start) if start >= self.body.len() => ResponseTemplate::new(416)
                .insert_header("Content-Range", format!("bytes */{}", self.body.len())),
            Some(start) => ResponseTemplate::new(206)
                .insert_header(
                    "Content-Range",
                    format!("bytes {}-{}/{}", start, self.body.len() - 1, self.body.len()),
                )
                .set_body_bytes(self.body[start..].to_vec()),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

/// Answers every ranged request from byte zero, ignoring the requested start.
struct MisalignedRangeResponder {
    body: Vec<u8>,
}

impl Respond for MisalignedRangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if request.headers.get("range").is_some() {
            ResponseTemplate::new(206)
                .insert_header(
                    "Content-Range",
                    format!("bytes 0-{}/{}", self.body.len() - 1, self.body.len()),
                )
                .set_body_bytes(self.body.clone())
        } else {
            ResponseTemplate::new(200).set_body_bytes(self.body.clone())
        }
    }
}

fn payload() -> Vec<u8> {
    (0..100_000u32).map(|i| (i % 251) as u8).collect()
}

fn sha256_of(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn fast_settings() -> DownloadSettings {
    DownloadSettings {
        max_retries: 1,
        retry_backoff_ms: 10,
        ..DownloadSettings::default()
    }
}

fn no_retry_settings() -> DownloadSettings {
    DownloadSettings {
        max_retries: 0,
        ..DownloadSettings::default()
    }
}

fn range_headers(requests: &[Request]) -> Vec<Option<String>> {
    requests
        .iter()
        .map(|r| r.headers.get("range").map(|v| v.to_str().unwrap().to_string()))
        .collect()
}

async fn serve(responder: impl Respond + 'static) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/model.bin"))
        .respond_with(responder)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_resume_matches_fresh_download() {
    let body = payload();
    let server = serve(RangeResponder { body: body.clone() }).await;
    let dir = tempdir().unwrap();
    let downloader = HttpDownloader::new(&fast_settings()).unwrap();

    let fresh = DownloadRequest {
        url: format!("{}/model.bin", server.uri()),
        dest: dir.path().join("fresh.bin"),
        expected_size: Some(body.len() as u64),
        expected_hash: Some(ContentHash::parse(&sha256_of(&body)).unwrap()),
    };
    let outcome = downloader
        .download(&fresh, &TaskControl::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DownloadOutcome::Completed {
            bytes: body.len() as u64
        }
    );

    let resumed = DownloadRequest {
        dest: dir.path().join("resumed.bin"),
        ..fresh.clone()
    };
    std::fs::write(temp_path(&resumed.dest), &body[..40_000]).unwrap();
    downloader
        .download(&resumed, &TaskControl::new(), |_| {})
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(&fresh.dest).unwrap(),
        std::fs::read(&resumed.dest).unwrap()
    );
    assert!(!temp_path(&resumed.dest).exists());

    let requests = server.received_requests().await.unwrap();
    let ranges: Vec<_> = requests
        .iter()
        .filter_map(|r| r.headers.get("range").map(|v| v.to_str().unwrap().to_string()))
        .collect();
    assert_eq!(ranges, vec!["bytes=40000-".to_string()]);
}

#[tokio::test]
async fn test_server_without_ranges_restarts() {
    let body = payload();
    let server = serve(ResponseTemplate::new(200).set_body_bytes(body.clone())).await;
    let dir = tempdir().unwrap();
    let downloader = HttpDownloader::new(&fast_settings()).unwrap();

    let request = DownloadRequest {
        url: format!("{}/model.bin", server.uri()),
        dest: dir.path().join("model.bin"),
        expected_size: None,
        expected_hash: None,
    };
    std::fs::write(temp_path(&request.dest), b"stale bytes from another file").unwrap();

    downloader
        .download(&request, &TaskControl::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(std::fs::read(&request.dest).unwrap(), body);
}

#[tokio::test]
async fn test_partial_file_already_complete() {
    let body = payload();
    let server = serve(RangeResponder { body: body.clone() }).await;
    let dir = tempdir().unwrap();
    let downloader = HttpDownloader::new(&fast_settings()).unwrap();

    let request = DownloadRequest {
        url: format!("{}/model.bin", server.uri()),
        dest: dir.path().join("model.bin"),
        expected_size: Some(body.len() as u64),
        expected_hash: None,
    };
    std::fs::write(temp_path(&request.dest), &body).unwrap();

    let outcome = downloader
        .download(&request, &TaskControl::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DownloadOutcome::Completed {
            bytes: body.len() as u64
        }
    );
    assert_eq!(std::fs::read(&request.dest).unwrap(), body);
}

#[tokio::test]
async fn test_hash_mismatch_discards_file() {
    let body = payload();
    let server = serve(RangeResponder { body: body.clone() }).await;
    let dir = tempdir().unwrap();
    let downloader = HttpDownloader::new(&fast_settings()).unwrap();

    let request = DownloadRequest {
        url: format!("{}/model.bin", server.uri()),
        dest: dir.path().join("model.bin"),
        expected_size: None,
        expected_hash: Some(ContentHash::parse(&sha256_of(b"something else")).unwrap()),
    };

    let err = downloader
        .download(&request, &TaskControl::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::HashMismatch { .. }));
    assert!(!request.dest.exists());
    assert!(!temp_path(&request.dest).exists());
}

#[tokio::test]
async fn test_cancel_before_start_removes_partial() {
    let body = payload();
    let server = serve(RangeResponder { body }).await;
    let dir = tempdir().unwrap();
    let downloader = HttpDownloader::new(&fast_settings()).unwrap();

    let request = DownloadRequest {
        url: format!("{}/model.bin", server.uri()),
        dest: dir.path().join("model.bin"),
        expected_size: None,
        expected_hash: None,
    };
    std::fs::write(temp_path(&request.dest), b"partial").unwrap();

    let control = TaskControl::new();
    control.cancel();
    let outcome = downloader.download(&request, &control, |_| {}).await.unwrap();
    assert_eq!(outcome, DownloadOutcome::Cancelled);
    assert!(!temp_path(&request.dest).exists());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = serve(ResponseTemplate::new(404)).await;
    let dir = tempdir().unwrap();
    let downloader = HttpDownloader::new(&fast_settings()).unwrap();

    let request = DownloadRequest {
        url: format!("{}/model.bin", server.uri()),
        dest: dir.path().join("model.bin"),
        expected_size: None,
        expected_hash: None,
    };
    let err = downloader
        .download(&request, &TaskControl::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::HttpStatus { status: 404, .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_misaligned_range_restarts_without_retry_budget() {
    let body = payload();
    let server = serve(MisalignedRangeResponder { body: body.clone() }).await;
    let dir = tempdir().unwrap();
    let downloader = HttpDownloader::new(&no_retry_settings()).unwrap();

    let request = DownloadRequest {
        url: format!("{}/model.bin", server.uri()),
        dest: dir.path().join("model.bin"),
        expected_size: Some(body.len() as u64),
        expected_hash: Some(ContentHash::parse(&sha256_of(&body)).unwrap()),
    };
    std::fs::write(temp_path(&request.dest), &body[..40_000]).unwrap();

    let outcome = downloader
        .download(&request, &TaskControl::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DownloadOutcome::Completed {
            bytes: body.len() as u64
        }
    );
    assert_eq!(std::fs::read(&request.dest).unwrap(), body);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        range_headers(&requests),
        vec![Some("bytes=40000-".to_string()), None]
    );
}

#[tokio::test]
async fn test_oversized_partial_restarts_without_retry_budget() {
    let body = payload();
    let server = serve(RangeResponder { body: body.clone() }).await;
    let dir = tempdir().unwrap();
    let downloader = HttpDownloader::new(&no_retry_settings()).unwrap();

    let request = DownloadRequest {
        url: format!("{}/model.bin", server.uri()),
        dest: dir.path().join("model.bin"),
        expected_size: None,
        expected_hash: None,
    };
    let mut oversized = body.clone();
    oversized.extend_from_slice(b"trailing bytes from an older build");
    std::fs::write(temp_path(&request.dest), &oversized).unwrap();

    downloader
        .download(&request, &TaskControl::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(std::fs::read(&request.dest).unwrap(), body);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(range_headers(&requests)[1].is_none());
}

#[tokio::test]
async fn test_server_error_is_retried_then_completes() {
    let body = payload();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/model.bin"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/model.bin"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/model.bin"))
        .respond_with(RangeResponder { body: body.clone() })
        .mount(&server)
        .await;

    let downloader = HttpDownloader::new(&DownloadSettings {
        max_retries: 2,
        retry_backoff_ms: 10,
        ..DownloadSettings::default()
    })
    .unwrap();
    let dir = tempdir().unwrap();
    let request = DownloadRequest {
        url: format!("{}/model.bin", server.uri()),
        dest: dir.path().join("model.bin"),
        expected_size: Some(body.len() as u64),
        expected_hash: None,
    };

    downloader
        .download(&request, &TaskControl::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(std::fs::read(&request.dest).unwrap(), body);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_persistent_server_error_fails_resumable_task() {
    let server = serve(ResponseTemplate::new(503)).await;
    let dir = tempdir().unwrap();
    let settings = DownloadSettings {
        max_retries: 2,
        retry_backoff_ms: 10,
        ..DownloadSettings::default()
    };
    let ollama = OllamaClient::with_base_url("http://127.0.0.1:9/api").unwrap();
    let (manager, mut events) =
        TaskManager::open(&dir.path().join("tasks.json"), &settings, ollama).unwrap();

    manager
        .download_file(
            "model",
            FileRequest {
                url: format!("{}/model.bin", server.uri()),
                dest: dir.path().join("model.bin"),
                expected_size: None,
                expected_hash: None,
            },
        )
        .unwrap();

    let outcome = loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let TaskEvent::Finished { outcome, .. } = event {
            break outcome;
        }
    };
    assert!(matches!(outcome, TaskOutcome::Failed { ref reason } if reason.contains("503")));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    let task = manager.get("model").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.can_resume);
    assert!(task.error.as_deref().is_some_and(|e| e.contains("503")));
}

#[tokio::test]
async fn test_pause_during_backoff_stops_waiting() {
    let server = serve(ResponseTemplate::new(503)).await;
    let dir = tempdir().unwrap();
    let downloader = HttpDownloader::new(&DownloadSettings {
        max_retries: 3,
        retry_backoff_ms: 60_000,
        ..DownloadSettings::default()
    })
    .unwrap();
    let request = DownloadRequest {
        url: format!("{}/model.bin", server.uri()),
        dest: dir.path().join("model.bin"),
        expected_size: None,
        expected_hash: None,
    };
    let control = TaskControl::new();

    let pause_after_first_request = async {
        loop {
            if !server.received_requests().await.unwrap().is_empty() {
                control.pause();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    let (outcome, ()) = tokio::time::timeout(
        Duration::from_secs(10),
        async { tokio::join!(downloader.download(&request, &control, |_| {}), pause_after_first_request) },
    )
    .await
    .expect("pause did not interrupt the back-off");

    assert_eq!(outcome.unwrap(), DownloadOutcome::Paused { downloaded: 0 });
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
