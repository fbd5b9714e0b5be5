//! Download worker - streams one task to disk
//!
//! Each worker owns its task's mutable fields: it is the only writer of
//! progress for that id, so per-task updates are strictly ordered. Progress is
//! pushed into the registry after every block; readers poll the registry and
//! never talk to the worker.
//!
//! Cancellation is observed before each block is written. A block that is
//! being read when the signal arrives is discarded, not interrupted.

use crate::dedup::{Classification, DuplicateDetector, PART_SUFFIX};
use crate::error::GrabbitError;
use crate::history::HistoryLog;
use crate::registry::{ProgressUpdate, TaskRegistry};
use chrono::Utc;
use futures::TryStreamExt;
use grabbit_types::{DownloadStatus, DownloadTask, EngineEvent, HistoryEntry};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Minimum spacing between progress events on the broadcast channel
const PROGRESS_EVENT_INTERVAL: Duration = Duration::from_millis(250);

/// Shared handles every worker needs
#[derive(Clone)]
pub struct WorkerContext {
    pub client: Client,
    pub registry: Arc<TaskRegistry>,
    pub history: Arc<HistoryLog>,
    pub detector: Arc<DuplicateDetector>,
    pub event_tx: broadcast::Sender<EngineEvent>,
    pub storage_dir: PathBuf,
    pub block_size: usize,
}

/// One unit of work: a registered task waiting to be streamed
pub struct DownloadWorker {
    id: String,
    url: Url,
    display_name: String,
    cancel: CancellationToken,
    ctx: WorkerContext,
}

impl std::fmt::Debug for DownloadWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadWorker")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .finish()
    }
}

struct Transferred {
    bytes: u64,
    elapsed: Duration,
}

impl DownloadWorker {
    pub fn new(task: &DownloadTask, url: Url, cancel: CancellationToken, ctx: WorkerContext) -> Self {
        Self {
            id: task.id.clone(),
            url,
            display_name: task.display_name.clone(),
            cancel,
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn part_path(&self) -> PathBuf {
        self.ctx.storage_dir.join(format!("{}{}", self.id, PART_SUFFIX))
    }

    /// Run the task to a terminal status; never returns an error
    pub async fn run(self) -> DownloadStatus {
        if self.cancel.is_cancelled() {
            info!(task = %self.id, "Cancelled before the transfer started");
            return self.finish(DownloadStatus::Cancelled, None, |_| {});
        }

        info!(task = %self.id, url = %self.url, "Starting download");
        let part = self.part_path();

        match self.transfer(&part).await {
            Ok(done) => self.complete(&part, done).await,
            Err(GrabbitError::Cancelled) => {
                info!(task = %self.id, "Download cancelled");
                discard_file(&part).await;
                self.finish(DownloadStatus::Cancelled, None, |_| {})
            }
            Err(e) => {
                if e.is_network() {
                    warn!(task = %self.id, "Download failed: {}", e);
                } else {
                    error!(task = %self.id, "Download failed: {}", e);
                }
                discard_file(&part).await;
                self.finish(DownloadStatus::Failed, Some(e.to_string()), |_| {})
            }
        }
    }

    async fn transfer(&self, part: &Path) -> Result<Transferred, GrabbitError> {
        let response = self.ctx.client.get(self.url.as_str()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GrabbitError::HttpStatus {
                status: status.as_u16(),
                url: self.url.to_string(),
            });
        }

        let total = response.content_length();
        let started = self
            .ctx
            .registry
            .transition(&self.id, DownloadStatus::Downloading, |task| {
                task.total_size = total;
            });
        if started.is_none() {
            // Removed (or cancelled) while the request was in flight
            return Err(GrabbitError::Cancelled);
        }
        debug!(task = %self.id, total = ?total, "Response headers received");

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(stream);
        let mut file = File::create(part).await?;
        let mut block = vec![0u8; self.ctx.block_size];

        let start = Instant::now();
        let mut downloaded = 0u64;
        let mut last_event: Option<Instant> = None;

        loop {
            let read = reader.read(&mut block).await.map_err(GrabbitError::Stream)?;
            if read == 0 {
                break;
            }

            if self.cancel.is_cancelled() {
                return Err(GrabbitError::Cancelled);
            }

            file.write_all(&block[..read]).await?;
            downloaded += read as u64;

            let update = progress_sample(downloaded, total, start.elapsed());
            self.ctx.registry.publish_progress(&self.id, update);

            if last_event.map_or(true, |t| t.elapsed() >= PROGRESS_EVENT_INTERVAL) {
                let _ = self.ctx.event_tx.send(EngineEvent::TaskProgress {
                    id: self.id.clone(),
                    downloaded,
                    total,
                    speed: update.speed,
                    eta: update.eta,
                });
                last_event = Some(Instant::now());
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = total {
            if downloaded < expected {
                return Err(GrabbitError::Stream(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("received {} of {} bytes", downloaded, expected),
                )));
            }
        }

        Ok(Transferred {
            bytes: downloaded,
            elapsed: start.elapsed(),
        })
    }

    async fn complete(&self, part: &Path, done: Transferred) -> DownloadStatus {
        let speed = average_speed(done.bytes, done.elapsed);

        match self.ctx.detector.classify(part, &self.id, &self.cancel).await {
            Ok(Classification::Unique { .. }) => {
                // Completion and a concurrent cancel or delete are ordered by the
                // registry lock; whichever comes second sees the other's result
                let completed = self.ctx.registry.transaction(|state| {
                    if self.cancel.is_cancelled() {
                        return None;
                    }
                    state.transition(&self.id, DownloadStatus::Completed, |task| {
                        task.error = None;
                        task.downloaded = done.bytes;
                        task.total_size = Some(done.bytes);
                        task.progress = 100.0;
                        task.speed = speed;
                    })
                });

                match completed {
                    Some(task) => {
                        info!(
                            task = %self.id,
                            bytes = done.bytes,
                            elapsed_ms = done.elapsed.as_millis() as u64,
                            "Download completed"
                        );
                        self.record(DownloadStatus::Completed, Some(task), None)
                    }
                    None => {
                        info!(task = %self.id, "Cancelled while finalizing, discarding file");
                        discard_file(&self.ctx.storage_dir.join(&self.id)).await;
                        self.ctx.detector.forget(&self.id).await;
                        self.finish(DownloadStatus::Cancelled, None, |_| {})
                    }
                }
            }
            Ok(Classification::Duplicate { existing, .. }) => {
                info!(task = %self.id, existing = %existing, "Discarding duplicate download");
                discard_file(part).await;
                self.finish(DownloadStatus::Duplicate, None, |task| {
                    task.downloaded = done.bytes;
                    task.speed = speed;
                })
            }
            Err(GrabbitError::Cancelled) => {
                info!(task = %self.id, "Cancelled before finalizing");
                discard_file(part).await;
                self.finish(DownloadStatus::Cancelled, None, |_| {})
            }
            Err(e) => {
                error!(task = %self.id, "Failed to finalize download: {}", e);
                discard_file(part).await;
                self.finish(DownloadStatus::Failed, Some(e.to_string()), |_| {})
            }
        }
    }

    /// Record the terminal status, append exactly one history entry, notify
    fn finish(
        &self,
        status: DownloadStatus,
        error: Option<String>,
        apply: impl FnOnce(&mut DownloadTask),
    ) -> DownloadStatus {
        let detail = error.clone();
        let updated = self.ctx.registry.transition(&self.id, status, |task| {
            task.error = detail;
            apply(task);
        });
        self.record(status, updated, error)
    }

    fn record(
        &self,
        status: DownloadStatus,
        updated: Option<DownloadTask>,
        error: Option<String>,
    ) -> DownloadStatus {
        let entry = match updated {
            Some(task) => HistoryEntry::from_task(&task),
            None => {
                debug!(task = %self.id, "Task left the registry before finishing");
                HistoryEntry {
                    id: self.id.clone(),
                    display_name: self.display_name.clone(),
                    status,
                    finished_at: Utc::now(),
                    url: self.url.to_string(),
                    bytes: 0,
                }
            }
        };
        self.ctx.history.append(entry);

        let _ = self.ctx.event_tx.send(EngineEvent::TaskFinished {
            id: self.id.clone(),
            status,
            error,
        });
        status
    }
}

/// Throughput and ETA for `downloaded` bytes after `elapsed`
///
/// The ETA stays `None` until a non-zero speed is known.
pub fn progress_sample(downloaded: u64, total: Option<u64>, elapsed: Duration) -> ProgressUpdate {
    let speed = average_speed(downloaded, elapsed);
    let eta = match total {
        Some(total) if speed > 0 => Some(total.saturating_sub(downloaded) / speed),
        _ => None,
    };

    ProgressUpdate {
        downloaded,
        total,
        speed,
        eta,
    }
}

fn average_speed(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        0
    }
}

async fn discard_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Discarded {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to discard {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY_LEN: usize = 64 * 1024;

    struct Harness {
        dir: tempfile::TempDir,
        ctx: WorkerContext,
        server: MockServer,
    }

    async fn harness() -> Harness {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/late.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5u8; BODY_LEN]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (event_tx, _) = broadcast::channel(16);
        let ctx = WorkerContext {
            client: Client::new(),
            registry: Arc::new(TaskRegistry::new()),
            history: Arc::new(HistoryLog::new()),
            detector: Arc::new(DuplicateDetector::open(dir.path().to_path_buf(), None).await),
            event_tx,
            storage_dir: dir.path().to_path_buf(),
            block_size: 8192,
        };
        Harness { dir, ctx, server }
    }

    /// Start `late.bin` with classification stalled, returning once every byte is on disk
    async fn stalled_at_finalize(
        h: &Harness,
    ) -> (CancellationToken, tokio::task::JoinHandle<DownloadStatus>) {
        let token = CancellationToken::new();
        let url = Url::parse(&format!("{}/late.bin", h.server.uri())).unwrap();
        let task = h
            .ctx
            .registry
            .create(
                DownloadTask::new("late.bin".into(), url.to_string(), None),
                token.clone(),
            )
            .unwrap();
        let worker = DownloadWorker::new(&task, url, token.clone(), h.ctx.clone());
        let handle = tokio::spawn(worker.run());

        for _ in 0..1000 {
            let done = h
                .ctx
                .registry
                .get("late.bin")
                .is_some_and(|t| t.downloaded == BODY_LEN as u64);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let task = h.ctx.registry.get("late.bin").unwrap();
        assert_eq!(task.downloaded, BODY_LEN as u64);
        assert_eq!(task.status, DownloadStatus::Downloading);
        (token, handle)
    }

    #[tokio::test]
    async fn removal_during_finalize_leaves_no_file() {
        let h = harness().await;
        let lock = h.ctx.detector.hold().await;
        let (_token, handle) = stalled_at_finalize(&h).await;

        // What delete does to an in-flight task
        h.ctx.registry.remove("late.bin").unwrap();
        drop(lock);

        assert_eq!(handle.await.unwrap(), DownloadStatus::Cancelled);
        assert!(!h.dir.path().join("late.bin").exists());
        assert!(!h.dir.path().join("late.bin.part").exists());
        assert!(h.ctx.registry.get("late.bin").is_none());

        let history = h.ctx.history.snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DownloadStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_during_finalize_wins_over_completion() {
        let h = harness().await;
        let lock = h.ctx.detector.hold().await;
        let (token, handle) = stalled_at_finalize(&h).await;

        assert!(h.ctx.registry.cancel("late.bin"));
        assert!(token.is_cancelled());
        drop(lock);

        assert_eq!(handle.await.unwrap(), DownloadStatus::Cancelled);
        assert_eq!(
            h.ctx.registry.get("late.bin").unwrap().status,
            DownloadStatus::Cancelled
        );
        assert!(std::fs::read_dir(h.dir.path()).unwrap().next().is_none());
        assert_eq!(h.ctx.history.snapshot().len(), 1);
    }

    #[test]
    fn eta_is_calculating_until_speed_is_known() {
        let sample = progress_sample(0, Some(1000), Duration::from_secs(1));
        assert_eq!(sample.speed, 0);
        assert_eq!(sample.eta, None);

        let sample = progress_sample(500, Some(1000), Duration::ZERO);
        assert_eq!(sample.eta, None);
    }

    #[test]
    fn eta_divides_remaining_bytes_by_speed() {
        let sample = progress_sample(400, Some(1000), Duration::from_secs(2));
        assert_eq!(sample.speed, 200);
        assert_eq!(sample.eta, Some(3));
    }

    #[test]
    fn unknown_total_has_no_eta() {
        let sample = progress_sample(4096, None, Duration::from_secs(1));
        assert_eq!(sample.speed, 4096);
        assert_eq!(sample.eta, None);
    }
}
