//! Grabbit Core - Download Engine
//!
//! This crate accepts download requests, streams them to a flat storage
//! directory on a bounded pool of background workers, tracks live progress,
//! detects duplicate content and keeps a history of terminal outcomes.
//!
//! [`GrabbitCore`] is the control surface; presentation layers (the CLI, an
//! HTTP front end) call into it and poll [`GrabbitCore::query_status`].

pub mod config;
mod dedup;
mod engine;
mod error;
mod filename;
mod history;
mod registry;

pub use dedup::*;
pub use engine::*;
pub use error::*;
pub use filename::*;
pub use history::*;
pub use registry::*;

use grabbit_types::{
    DownloadStatus, DownloadTask, EngineEvent, HistoryEntry, Settings, StoredFile,
};
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// The main Grabbit core instance
pub struct GrabbitCore {
    settings: Arc<Settings>,
    /// Live task state, aliases and cancellation tokens
    registry: Arc<TaskRegistry>,
    history: Arc<HistoryLog>,
    detector: Arc<DuplicateDetector>,
    pool: Arc<WorkerPool>,
    client: Client,
    /// Event broadcaster
    event_tx: broadcast::Sender<EngineEvent>,
}

impl GrabbitCore {
    /// Create a new core with its own registry
    pub async fn new(settings: Settings) -> Result<Self, GrabbitError> {
        Self::with_registry(settings, Arc::new(TaskRegistry::new())).await
    }

    /// Create a core around an existing registry
    pub async fn with_registry(
        settings: Settings,
        registry: Arc<TaskRegistry>,
    ) -> Result<Self, GrabbitError> {
        config::validate_settings(&settings)?;
        tokio::fs::create_dir_all(&settings.storage_dir).await?;

        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .read_timeout(Duration::from_secs(settings.read_timeout_secs))
            .build()?;

        let detector = DuplicateDetector::open(
            settings.storage_dir.clone(),
            settings.hash_index_path.clone(),
        )
        .await;

        let (event_tx, _) = broadcast::channel(1000);
        let pool = WorkerPool::new(settings.max_concurrent_downloads as usize);

        info!(
            storage = %settings.storage_dir.display(),
            workers = settings.max_concurrent_downloads,
            "Grabbit core ready"
        );

        Ok(Self {
            settings: Arc::new(settings),
            registry,
            history: Arc::new(HistoryLog::new()),
            detector: Arc::new(detector),
            pool: Arc::new(pool),
            client,
            event_tx,
        })
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Accept a download request and queue it, returning the task id
    ///
    /// The id is the sanitized storage name. It is made unique against live
    /// tasks, stored files and in-progress `.part` files.
    pub async fn start_download(
        &self,
        url: &str,
        alias: Option<&str>,
    ) -> Result<String, GrabbitError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(GrabbitError::InvalidInput("URL is required".to_string()));
        }
        let parsed =
            Url::parse(url).map_err(|e| GrabbitError::InvalidInput(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(GrabbitError::InvalidInput(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        let alias = match alias.map(str::trim).filter(|a| !a.is_empty()) {
            Some(raw) => Some(
                sanitize_filename(raw)
                    .ok_or_else(|| GrabbitError::InvalidInput(format!("unusable alias '{}'", raw)))?,
            ),
            None => None,
        };

        let disposition = self.probe_disposition(&parsed).await;
        let candidate = resolve_filename(&parsed, disposition.as_deref());

        let storage = self.settings.storage_dir.clone();
        let source = parsed.to_string();
        let cancel = CancellationToken::new();
        let task = self.registry.create_unique(
            &candidate,
            |name| storage.join(name).exists() || storage.join(part_name(name)).exists(),
            move |id| DownloadTask::new(id, source, alias),
            cancel.clone(),
        )?;

        self.emit(EngineEvent::TaskAdded { task: task.clone() });

        let worker = DownloadWorker::new(&task, parsed, cancel, self.worker_context());
        if let Err(e) = self.pool.submit(worker) {
            let detail = e.to_string();
            self.registry
                .transition(&task.id, DownloadStatus::Failed, |t| t.error = Some(detail));
            return Err(e);
        }

        info!(task = %task.id, "Download queued");
        Ok(task.id)
    }

    /// Read Content-Disposition from a HEAD probe; any failure means "none"
    async fn probe_disposition(&self, url: &Url) -> Option<String> {
        let probe = self
            .client
            .head(url.as_str())
            .timeout(Duration::from_secs(self.settings.connect_timeout_secs))
            .send()
            .await;

        match probe {
            Ok(response) if response.status().is_success() => response
                .headers()
                .get(CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "HEAD probe rejected");
                None
            }
            Err(e) => {
                debug!(url = %url, "HEAD probe failed: {}", e);
                None
            }
        }
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            client: self.client.clone(),
            registry: self.registry.clone(),
            history: self.history.clone(),
            detector: self.detector.clone(),
            event_tx: self.event_tx.clone(),
            storage_dir: self.settings.storage_dir.clone(),
            block_size: self.settings.block_size,
        }
    }

    /// Consistent snapshot of every task in the registry
    pub fn query_status(&self) -> Vec<DownloadTask> {
        self.registry.snapshot()
    }

    /// Look up a task by id or alias
    pub fn get(&self, name: &str) -> Option<DownloadTask> {
        self.registry.get(&self.resolve_id(name))
    }

    /// Request cancellation; unknown or finished tasks are silently ignored
    ///
    /// Returns whether a signal was delivered.
    pub fn cancel(&self, name: &str) -> bool {
        let id = self.resolve_id(name);
        let signalled = self.registry.cancel(&id);
        if signalled {
            info!(task = %id, "Cancellation requested");
        } else {
            debug!(task = %id, "Cancel ignored, task unknown or finished");
        }
        signalled
    }

    /// Workers queued or running
    pub fn pending_workers(&self) -> usize {
        self.pool.pending()
    }

    /// Workers currently holding a pool slot
    pub fn running_workers(&self) -> usize {
        self.pool.running()
    }

    // ========================================================================
    // Stored File Operations
    // ========================================================================

    /// Rename a stored file together with its registry entry and alias
    ///
    /// The file move and the registry re-key happen under the registry lock.
    /// Returns the sanitized new name.
    pub async fn rename(&self, from: &str, to: &str) -> Result<String, GrabbitError> {
        let from = self.resolve_id(from);
        let source = self.stored_path(&from)?;
        let to = sanitize_filename(to).ok_or_else(|| GrabbitError::InvalidInput(format!("invalid name '{}'", to)))?;
        let target = self.settings.storage_dir.join(&to);
        let target_part = self.settings.storage_dir.join(part_name(&to));

        let renamed = self.registry.transaction(|state| -> Result<bool, GrabbitError> {
            if state.is_active(&from) {
                return Err(GrabbitError::TaskActive(from.clone()));
            }
            if !source.is_file() {
                return Err(GrabbitError::NotFound(from.clone()));
            }
            if from == to {
                return Ok(false);
            }
            if state.contains(&to) || target.exists() || target_part.exists() {
                return Err(GrabbitError::NameConflict(to.clone()));
            }

            std::fs::rename(&source, &target)?;
            if state.contains(&from) {
                state.rekey(&from, &to);
            } else {
                state.move_alias(&from, &to);
            }
            Ok(true)
        })?;

        if renamed {
            self.detector.forget(&from).await;
            info!(from = %from, to = %to, "Renamed stored file");
            self.emit(EngineEvent::TaskRenamed {
                from,
                to: to.clone(),
            });
        }
        Ok(to)
    }

    /// Delete a stored file and every registry entry for it
    ///
    /// An in-flight task is cancelled and forgotten; its worker removes the
    /// partial file. The registry decides what goes under its lock and the
    /// file itself is removed after the lock is released.
    pub async fn delete(&self, name: &str) -> Result<(), GrabbitError> {
        let id = self.resolve_id(name);
        let path = self.stored_path(&id)?;

        let remove_file = self.registry.transaction(|state| -> Result<bool, GrabbitError> {
            let had_entry = state.contains(&id);
            let remove_file = !state.is_active(&id) && path.is_file();
            if !had_entry && !remove_file {
                return Err(GrabbitError::NotFound(id.clone()));
            }
            state.remove(&id);
            Ok(remove_file)
        })?;

        if remove_file {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.detector.forget(&id).await;
        }
        info!(task = %id, file = remove_file, "Deleted");
        self.emit(EngineEvent::TaskRemoved { id });
        Ok(())
    }

    /// Remove every finished task along with its stored file
    ///
    /// Returns the removed tasks; a second call right after returns nothing.
    pub async fn clear_finished(&self) -> Vec<DownloadTask> {
        let cleared = self.registry.clear_finished();

        for task in &cleared {
            if task.status == DownloadStatus::Completed {
                let path = self.settings.storage_dir.join(&task.id);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(task = %task.id, "Failed to remove stored file: {}", e),
                }
                self.detector.forget(&task.id).await;
            }
            self.emit(EngineEvent::TaskRemoved {
                id: task.id.clone(),
            });
        }
        if !cleared.is_empty() {
            info!("Cleared {} finished tasks", cleared.len());
        }
        cleared
    }

    /// List completed files in the storage directory
    pub async fn stored_files(&self) -> Result<Vec<StoredFile>, GrabbitError> {
        let skip = self.detector.index_file_name();
        let mut entries = tokio::fs::read_dir(&self.settings.storage_dir).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PART_SUFFIX) || Some(&name) == skip.as_ref() {
                continue;
            }

            files.push(StoredFile {
                alias: self.registry.alias_of(&name),
                size: meta.len(),
                modified: meta.modified().ok().map(Into::into),
                name,
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Map a storage name or public alias to the stored file's path
    pub fn resolve_stored(&self, name: &str) -> Result<PathBuf, GrabbitError> {
        let id = self.resolve_id(name);
        let path = self.stored_path(&id)?;
        let in_flight = self.registry.get(&id).is_some_and(|t| !t.is_terminal());
        if in_flight || !path.is_file() {
            return Err(GrabbitError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Terminal outcomes, most recent first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.snapshot()
    }

    pub fn clear_history(&self) -> usize {
        self.history.clear()
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Task ids win over aliases; unknown names pass through unchanged
    fn resolve_id(&self, name: &str) -> String {
        if self.registry.contains(name) {
            return name.to_string();
        }
        self.registry
            .resolve_alias(name)
            .unwrap_or_else(|| name.to_string())
    }

    /// Path of `name` inside storage
    ///
    /// Names that would escape the directory, partial transfers and the hash
    /// index are never treated as stored files.
    fn stored_path(&self, name: &str) -> Result<PathBuf, GrabbitError> {
        let reserved = name.ends_with(PART_SUFFIX)
            || self.detector.index_file_name().as_deref() == Some(name);
        match sanitize_filename(name) {
            Some(clean) if clean == name && !reserved => Ok(self.settings.storage_dir.join(name)),
            _ => Err(GrabbitError::NotFound(name.to_string())),
        }
    }
}

impl Clone for GrabbitCore {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            registry: self.registry.clone(),
            history: self.history.clone(),
            detector: self.detector.clone(),
            pool: self.pool.clone(),
            client: self.client.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

fn part_name(name: &str) -> String {
    format!("{}{}", name, PART_SUFFIX)
}
