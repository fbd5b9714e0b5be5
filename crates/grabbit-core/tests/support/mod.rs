//! Shared helpers for engine integration tests.
//!
//! `SlowServer` is a raw TCP server that trickles its body so tests can act
//! while a transfer is still in flight. wiremock delivers bodies in one go,
//! which is too fast to cancel reliably.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use grabbit_core::GrabbitCore;
use grabbit_types::{DownloadTask, HistoryEntry, Settings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Upper bound for any wait in these tests.
pub const WAIT_LIMIT: Duration = Duration::from_secs(30);

pub fn settings_for(dir: &Path, workers: u32) -> Settings {
    Settings {
        storage_dir: dir.to_path_buf(),
        max_concurrent_downloads: workers,
        connect_timeout_secs: 5,
        read_timeout_secs: 10,
        ..Settings::default()
    }
}

pub async fn core_in(dir: &Path) -> GrabbitCore {
    GrabbitCore::new(settings_for(dir, 4))
        .await
        .expect("core should start")
}

/// Poll until the task reaches a terminal status.
pub async fn wait_terminal(core: &GrabbitCore, id: &str) -> DownloadTask {
    wait_for(core, id, |t| t.is_terminal()).await
}

/// Poll until `check` holds for the task.
pub async fn wait_for(
    core: &GrabbitCore,
    id: &str,
    check: impl Fn(&DownloadTask) -> bool,
) -> DownloadTask {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            if let Some(task) = core.get(id) {
                if check(&task) {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting on {id}: {:?}", core.get(id)))
}

/// Poll until a history entry exists for `id`.
pub async fn wait_history(core: &GrabbitCore, id: &str) -> HistoryEntry {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            if let Some(entry) = core.history().into_iter().find(|e| e.id == id) {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no history entry for {id}"))
}

/// HTTP/1.1 server that streams `b'x'` in small, delayed chunks.
pub struct SlowServer {
    pub base_url: String,
    handle: JoinHandle<()>,
}

impl SlowServer {
    /// Serve `total` bytes, all of them.
    pub async fn start(total: usize, chunk: usize, delay: Duration) -> Self {
        Self::spawn(total, total, chunk, delay).await
    }

    /// Declare `declared` bytes but hang up after sending `sent`.
    pub async fn truncated(declared: usize, sent: usize, chunk: usize, delay: Duration) -> Self {
        Self::spawn(declared, sent, chunk, delay).await
    }

    async fn spawn(declared: usize, sent: usize, chunk: usize, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind slow server");
        let addr = listener.local_addr().expect("local addr");

        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, declared, sent, chunk, delay));
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for SlowServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    declared: usize,
    total: usize,
    chunk: usize,
    delay: Duration,
) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {declared}\r\nConnection: close\r\n\r\n"
    );
    if socket.write_all(head.as_bytes()).await.is_err() || request.starts_with(b"HEAD") {
        return;
    }

    let block = vec![b'x'; chunk];
    let mut sent = 0;
    while sent < total {
        let n = chunk.min(total - sent);
        if socket.write_all(&block[..n]).await.is_err() {
            return;
        }
        sent += n;
        tokio::time::sleep(delay).await;
    }
}
