use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use scaleforge_core::hash;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};
use walkdir::WalkDir;

use crate::backend::{Backend, UpscaleOptions};
use crate::db::{JobStatus, JobStore};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp", "tiff", "gif"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand files and directories into the flat list of images to process.
/// Directories are walked recursively; unsupported files are skipped.
pub fn collect_images(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            for entry in WalkDir::new(input)
                .sort_by_file_name()
                .into_iter()
                .filter_map(Result::ok)
            {
                let path = entry.path();
                if path.is_file() && is_supported_image(path) {
                    files.push(path.to_path_buf());
                }
            }
        } else {
            files.push(input.clone());
        }
    }
    files
}

/// One planned unit of work: where the source is and where the result goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub scale: u32,
}

/// Per-job metadata persisted in the `extra` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobExtra {
    model: Option<String>,
    scale: u32,
    dst: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: i64,
    pub src_path: String,
    pub status: JobStatus,
    pub error: Option<String>,
}

static EVENT_TX: Lazy<broadcast::Sender<JobEvent>> = Lazy::new(|| broadcast::channel(256).0);

pub fn subscribe() -> broadcast::Receiver<JobEvent> {
    EVENT_TX.subscribe()
}

fn emit(event: JobEvent) {
    let _ = EVENT_TX.send(event);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueReport {
    pub queued: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub done: u64,
    pub failed: u64,
    pub pending: u64,
}

impl RunSummary {
    pub fn all_done(&self) -> bool {
        self.failed == 0 && self.pending == 0
    }
}

/// Drives persistent jobs through a backend with N workers, retrying
/// transient failures and parking fatal ones.
pub struct JobQueue {
    store: Arc<JobStore>,
    backend: Arc<dyn Backend>,
    concurrency: usize,
    model: Option<String>,
    tile: Option<usize>,
}

impl JobQueue {
    pub fn new(
        store: Arc<JobStore>,
        backend: Arc<dyn Backend>,
        concurrency: usize,
        model: Option<String>,
        tile: Option<usize>,
    ) -> Self {
        Self {
            store,
            backend,
            concurrency: concurrency.max(1),
            model,
            tile,
        }
    }

    /// Register plan items, deduplicating on content + parameters: a file
    /// whose bytes and (backend, model, scale) were seen before is skipped.
    pub fn enqueue(&self, items: &[PlanItem]) -> anyhow::Result<EnqueueReport> {
        let mut report = EnqueueReport::default();
        for item in items {
            let params = serde_json::json!({
                "backend": self.backend.name(),
                "model": self.model,
                "scale": item.scale,
            });
            let fingerprint = hash::fingerprint(&item.src, &params)?;
            let extra = serde_json::to_string(&JobExtra {
                model: self.model.clone(),
                scale: item.scale,
                dst: item.dst.clone(),
            })?;
            match self
                .store
                .enqueue(&item.src.to_string_lossy(), &fingerprint, Some(&extra))?
            {
                Some(_) => report.queued += 1,
                None => report.skipped += 1,
            }
        }
        Ok(report)
    }

    /// Process eligible jobs until the table drains. Returns the final
    /// status counts; callers decide what a leftover `failed` row means.
    pub async fn run(&self) -> anyhow::Result<RunSummary> {
        let workers = (0..self.concurrency)
            .map(|wid| {
                let store = Arc::clone(&self.store);
                let backend = Arc::clone(&self.backend);
                let tile = self.tile;
                tokio::spawn(worker(wid, store, backend, tile))
            })
            .collect::<Vec<_>>();

        for handle in workers {
            handle.await??;
        }

        let counts = self.store.counts()?;
        Ok(RunSummary {
            done: counts.done,
            failed: counts.failed,
            pending: counts.pending + counts.running,
        })
    }
}

async fn worker(
    wid: usize,
    store: Arc<JobStore>,
    backend: Arc<dyn Backend>,
    tile: Option<usize>,
) -> anyhow::Result<()> {
    let mut delay = INITIAL_BACKOFF;
    loop {
        let Some(job) = store.claim_next()? else {
            return Ok(());
        };

        let extra: Option<JobExtra> = job
            .extra
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        let src = PathBuf::from(&job.src_path);
        let scale = extra.as_ref().map(|e| e.scale).unwrap_or(2);
        let dst = extra
            .map(|e| e.dst)
            .unwrap_or_else(|| default_output_path(&src, scale));

        let opts = UpscaleOptions { scale, tile };
        match backend.upscale(&src, &dst, &opts).await {
            Ok(()) => {
                let dimensions = image::image_dimensions(&dst).ok();
                let fmt = dst.extension().and_then(|ext| ext.to_str());
                store.record_output(job.id, "upscaled", &dst.to_string_lossy(), dimensions, fmt)?;
                store.mark_done(job.id)?;
                emit(JobEvent {
                    job_id: job.id,
                    src_path: job.src_path,
                    status: JobStatus::Done,
                    error: None,
                });
                delay = INITIAL_BACKOFF;
            }
            Err(err) if err.is_fatal() => {
                error!(worker = wid, job = job.id, error = %err, "fatal backend error");
                store.mark_failed(job.id, &err.to_string(), true)?;
                emit(JobEvent {
                    job_id: job.id,
                    src_path: job.src_path,
                    status: JobStatus::Failed,
                    error: Some(err.to_string()),
                });
                return Ok(());
            }
            Err(err) => {
                warn!(worker = wid, job = job.id, error = %err, "transient backend error");
                store.mark_failed(job.id, &err.to_string(), false)?;
                emit(JobEvent {
                    job_id: job.id,
                    src_path: job.src_path,
                    status: JobStatus::Failed,
                    error: Some(err.to_string()),
                });
                delay = (delay * 2).min(MAX_BACKOFF);
                let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
                tokio::time::sleep(delay + jitter).await;
            }
        }
    }
}

fn default_output_path(src: &Path, scale: u32) -> PathBuf {
    let stem = src.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    src.with_file_name(format!("{stem}.x{scale}.png"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::backend::BackendError;
    use crate::db::MAX_ATTEMPTS;

    /// Scripted backend: fails the first `failures` calls per source path,
    /// optionally fatally, then succeeds (writing a tiny PNG).
    struct StubBackend {
        calls: AtomicUsize,
        failures: usize,
        fatal: bool,
    }

    impl StubBackend {
        fn succeeding() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures: 0,
                fatal: false,
            }
        }

        fn flaky(failures: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
                fatal: false,
            }
        }

        fn broken() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures: usize::MAX,
                fatal: true,
            }
        }
    }

    #[async_trait]
    impl Backend for StubBackend {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn description(&self) -> String {
            "stub backend".to_string()
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn upscale(
            &self,
            _src: &Path,
            dst: &Path,
            opts: &UpscaleOptions,
        ) -> Result<(), BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return if self.fatal {
                    Err(BackendError::fatal("scripted fatal failure"))
                } else {
                    Err(BackendError::transient("scripted transient failure"))
                };
            }
            image::RgbImage::from_pixel(2 * opts.scale, 2 * opts.scale, image::Rgb([1, 2, 3]))
                .save(dst)
                .map_err(|err| BackendError::fatal(err.to_string()))?;
            Ok(())
        }
    }

    fn plan_in(dir: &Path, names: &[&str]) -> Vec<PlanItem> {
        names
            .iter()
            .map(|name| {
                let src = dir.join(name);
                std::fs::write(&src, format!("image bytes for {name}")).expect("write source");
                PlanItem {
                    src: src.clone(),
                    dst: dir.join(format!("out-{name}")),
                    scale: 2,
                }
            })
            .collect()
    }

    fn queue_with(backend: Arc<dyn Backend>, concurrency: usize) -> JobQueue {
        let store = Arc::new(JobStore::open_in_memory().expect("open store"));
        JobQueue::new(store, backend, concurrency, Some("test-model".into()), None)
    }

    #[tokio::test]
    async fn processes_every_job_and_records_outputs() {
        let dir = tempfile::tempdir().expect("temp dir");
        let queue = queue_with(Arc::new(StubBackend::succeeding()), 2);
        let items = plan_in(dir.path(), &["a.png", "b.png", "c.png"]);

        let report = queue.enqueue(&items).expect("enqueue");
        assert_eq!(report.queued, 3);

        let summary = queue.run().await.expect("run");
        assert_eq!(summary.done, 3);
        assert!(summary.all_done());
        for item in &items {
            assert!(item.dst.exists(), "output missing for {:?}", item.src);
        }
    }

    #[tokio::test]
    async fn enqueue_skips_duplicate_content_and_params() {
        let dir = tempfile::tempdir().expect("temp dir");
        let queue = queue_with(Arc::new(StubBackend::succeeding()), 1);
        let items = plan_in(dir.path(), &["a.png"]);

        assert_eq!(queue.enqueue(&items).expect("enqueue").queued, 1);
        let again = queue.enqueue(&items).expect("enqueue");
        assert_eq!(again.queued, 0);
        assert_eq!(again.skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let dir = tempfile::tempdir().expect("temp dir");
        let backend = Arc::new(StubBackend::flaky(2));
        let store = Arc::new(JobStore::open_in_memory().expect("open store"));
        let queue = JobQueue::new(Arc::clone(&store), backend.clone(), 1, None, None);

        let items = plan_in(dir.path(), &["a.png"]);
        queue.enqueue(&items).expect("enqueue");

        let summary = queue.run().await.expect("run");
        assert_eq!(summary.done, 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_failure_parks_the_job_without_retries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let backend = Arc::new(StubBackend::broken());
        let store = Arc::new(JobStore::open_in_memory().expect("open store"));
        let queue = JobQueue::new(Arc::clone(&store), backend.clone(), 1, None, None);

        let items = plan_in(dir.path(), &["a.png"]);
        queue.enqueue(&items).expect("enqueue");

        let summary = queue.run().await.expect("run");
        assert_eq!(summary.failed, 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1, "no retries after fatal");

        // The queue is drained for good: a second run touches nothing.
        let summary = queue.run().await.expect("run");
        assert_eq!(summary.failed, 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_that_exhaust_attempts_stay_failed() {
        let dir = tempfile::tempdir().expect("temp dir");
        let backend = Arc::new(StubBackend::flaky(usize::MAX - 1));
        let store = Arc::new(JobStore::open_in_memory().expect("open store"));
        let queue = JobQueue::new(Arc::clone(&store), backend.clone(), 1, None, None);

        let items = plan_in(dir.path(), &["a.png"]);
        queue.enqueue(&items).expect("enqueue");

        let summary = queue.run().await.expect("run");
        assert_eq!(summary.failed, 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
    }

    #[test]
    fn collect_images_filters_by_extension() {
        let dir = tempfile::tempdir().expect("temp dir");
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).expect("mkdir");
        std::fs::write(dir.path().join("a.png"), b"x").expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"x").expect("write");
        std::fs::write(nested.join("b.JPG"), b"x").expect("write");

        let files = collect_images(&[dir.path().to_path_buf()]);
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a.png"));
        assert!(names.contains(&"b.JPG"));
    }
}
