use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::{StatusCode, header::RANGE};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, task};

use crate::hash;
use crate::http::{self, http_client};
use crate::progress::{DownloadProgress, DownloadStatus, emit, progress_bar};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("request failed: {0}")]
    Request(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Request(err.to_string())
    }
}

impl From<reqwest_middleware::Error> for DownloadError {
    fn from(err: reqwest_middleware::Error) -> Self {
        DownloadError::Request(err.to_string())
    }
}

/// Stream `url` into `dest`, resuming a previous partial transfer when the
/// server honors byte ranges, and verifying the SHA-256 of the completed
/// file before renaming it into place.
///
/// The transfer lands in `<dest>.part` first; `dest` only ever holds a
/// fully verified file.
pub async fn to_file(
    url: &str,
    dest: &Path,
    expected_sha256: Option<&str>,
) -> Result<(), DownloadError> {
    let filename = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    let part = dest.with_file_name(format!("{filename}.part"));

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    // HEAD is best-effort: servers without it still get a plain GET.
    let info = http::head(url).await.unwrap_or(http::HeadInfo {
        content_length: None,
        supports_ranges: false,
    });

    let mut start = match fs::metadata(&part).await {
        Ok(meta) if info.supports_ranges => meta.len(),
        _ => 0,
    };

    let mut request = http_client().get(url);
    if start > 0 {
        request = request.header(RANGE, format!("bytes={start}-"));
    }
    let response = request.send().await?;

    // A 200 to a ranged request means the server restarted the body.
    if start > 0 && response.status() == StatusCode::OK {
        start = 0;
    }
    let response = response.error_for_status()?;

    let total = info
        .content_length
        .or(response.content_length().map(|len| len + start));

    let pb = progress_bar(filename);
    if let Some(total) = total {
        pb.set_length(total);
        pb.set_position(start);
    }
    emit(DownloadProgress {
        filename: filename.to_string(),
        downloaded: start,
        total,
        status: DownloadStatus::Started,
    });

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(start == 0)
        .append(start > 0)
        .open(&part)
        .await?;

    let mut downloaded = start;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                emit(DownloadProgress {
                    filename: filename.to_string(),
                    downloaded,
                    total,
                    status: DownloadStatus::Failed(err.to_string()),
                });
                return Err(err.into());
            }
        };
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        pb.inc(chunk.len() as u64);
        emit(DownloadProgress {
            filename: filename.to_string(),
            downloaded,
            total,
            status: DownloadStatus::Downloading,
        });
    }
    file.flush().await?;
    drop(file);
    pb.finish_and_clear();

    if let Some(expected) = expected_sha256 {
        // Hash the whole file, never the resumed tail.
        let expected = expected.to_ascii_lowercase();
        let hash_path = part.clone();
        let actual = task::spawn_blocking(move || hash::sha256_file(&hash_path))
            .await
            .map_err(|err| DownloadError::Request(err.to_string()))??;
        if actual != expected {
            fs::remove_file(&part).await?;
            emit(DownloadProgress {
                filename: filename.to_string(),
                downloaded,
                total,
                status: DownloadStatus::Failed("checksum mismatch".to_string()),
            });
            return Err(DownloadError::Checksum {
                path: dest.to_path_buf(),
                expected,
                actual,
            });
        }
    }

    fs::rename(&part, dest).await?;
    emit(DownloadProgress {
        filename: filename.to_string(),
        downloaded,
        total,
        status: DownloadStatus::Completed,
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use tokio::sync::oneshot;

    use super::*;

    #[derive(Clone)]
    struct TestState {
        bytes: Arc<Vec<u8>>,
        supports_ranges: bool,
    }

    async fn head_handler(State(state): State<TestState>) -> impl IntoResponse {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&state.bytes.len().to_string()).expect("valid content length"),
        );
        if state.supports_ranges {
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }
        (StatusCode::OK, headers)
    }

    fn parse_range(headers: &HeaderMap, len: usize) -> Option<(usize, usize)> {
        let range = headers.get(header::RANGE)?.to_str().ok()?;
        let suffix = range.strip_prefix("bytes=")?;
        let (start, end) = suffix.split_once('-')?;
        let start = start.parse::<usize>().ok()?;
        let end = match end {
            "" => len.saturating_sub(1),
            end => end.parse::<usize>().ok()?.min(len.saturating_sub(1)),
        };
        if start > end || start >= len {
            return None;
        }
        Some((start, end))
    }

    async fn get_handler(State(state): State<TestState>, headers: HeaderMap) -> impl IntoResponse {
        if state.supports_ranges
            && let Some((start, end)) = parse_range(&headers, state.bytes.len())
        {
            let chunk = state.bytes[start..=end].to_vec();
            return (StatusCode::PARTIAL_CONTENT, chunk).into_response();
        }
        (StatusCode::OK, state.bytes.to_vec()).into_response()
    }

    async fn start_server(bytes: Vec<u8>, supports_ranges: bool) -> (String, oneshot::Sender<()>) {
        let state = TestState {
            bytes: Arc::new(bytes),
            supports_ranges,
        };
        let app = Router::new()
            .route("/file", get(get_handler).head(head_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("get local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("serve test app");
        });

        (format!("http://{addr}/file"), shutdown_tx)
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(bytes))
    }

    #[tokio::test]
    async fn downloads_and_verifies() {
        let payload = b"0123456789abcdef".to_vec();
        let digest = sha256_hex(&payload);
        let (url, shutdown) = start_server(payload.clone(), true).await;

        let dir = tempfile::tempdir().expect("temp dir");
        let dest = dir.path().join("model.safetensors");
        to_file(&url, &dest, Some(&digest))
            .await
            .expect("download should succeed");

        assert_eq!(std::fs::read(&dest).expect("read dest"), payload);
        assert!(!dest.with_file_name("model.safetensors.part").exists());
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn resumes_partial_transfer() {
        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        let digest = sha256_hex(&payload);
        let (url, shutdown) = start_server(payload.clone(), true).await;

        let dir = tempfile::tempdir().expect("temp dir");
        let dest = dir.path().join("weights.bin");
        std::fs::write(dest.with_file_name("weights.bin.part"), &payload[..9])
            .expect("seed partial file");

        to_file(&url, &dest, Some(&digest))
            .await
            .expect("resumed download should succeed");

        assert_eq!(std::fs::read(&dest).expect("read dest"), payload);
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn restarts_when_server_ignores_ranges() {
        let payload = b"no ranges here".to_vec();
        let digest = sha256_hex(&payload);
        let (url, shutdown) = start_server(payload.clone(), false).await;

        let dir = tempfile::tempdir().expect("temp dir");
        let dest = dir.path().join("weights.bin");
        std::fs::write(dest.with_file_name("weights.bin.part"), b"stale garbage")
            .expect("seed partial file");

        to_file(&url, &dest, Some(&digest))
            .await
            .expect("download should restart from scratch");

        assert_eq!(std::fs::read(&dest).expect("read dest"), payload);
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn checksum_mismatch_removes_partial_file() {
        let payload = b"corrupted on the wire".to_vec();
        let (url, shutdown) = start_server(payload, true).await;

        let dir = tempfile::tempdir().expect("temp dir");
        let dest = dir.path().join("weights.bin");
        let err = to_file(&url, &dest, Some(&"0".repeat(64)))
            .await
            .expect_err("mismatch must fail");

        assert!(matches!(err, DownloadError::Checksum { .. }));
        assert!(!dest.exists());
        assert!(!dest.with_file_name("weights.bin.part").exists());
        let _ = shutdown.send(());
    }
}
