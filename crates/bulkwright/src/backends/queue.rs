use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// 📮 Somewhere to put bytes the processor is done with: invalid items, dead letters,
/// result records.
#[async_trait]
pub trait QueueSink: std::fmt::Debug + Send + Sync {
    async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<()>;
}

/// 📦 Queues that live in RAM. Clone it, hand one copy to the processor, peek with the other.
#[derive(Debug, Default, Clone)]
pub struct InMemoryQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<Vec<u8>>>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self, queue: &str) -> Option<Vec<u8>> {
        self.queues.lock().get_mut(queue).and_then(VecDeque::pop_front)
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, VecDeque::len)
    }

    /// 📋 Everything in `queue`, oldest first, without consuming it.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queues
            .lock()
            .get(queue)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl QueueSink for InMemoryQueue {
    async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        self.queues
            .lock()
            .entry(queue.to_owned())
            .or_default()
            .push_back(payload);
        Ok(())
    }
}

/// 📁 One append-only NDJSON file per queue, under a directory. Survives the process,
/// unlike `InMemoryQueue`.
///
/// Appends to the same queue file are serialized, across clones too: a payload lands in
/// the file whole, never spliced into another worker's.
#[derive(Debug, Clone)]
pub struct FileQueue {
    dir: PathBuf,
    appends: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl FileQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            appends: Arc::default(),
        }
    }

    fn append_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.appends.lock().entry(path.to_path_buf()).or_default())
    }

    pub fn path_for(&self, queue: &str) -> PathBuf {
        self.dir.join(format!("{queue}.ndjson"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl QueueSink for FileQueue {
    async fn push(&self, queue: &str, mut payload: Vec<u8>) -> Result<()> {
        if payload.last().is_some_and(|byte| *byte != b'\n') {
            payload.push(b'\n');
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("💀 Could not create queue directory '{}'. Permissions, disk, or a file squatting on that name.", self.dir.display()))?;
        let path = self.path_for(queue);
        let lock = self.append_lock(&path);
        let _appending = lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("💀 Could not open queue file '{}' for appending.", path.display()))?;
        file.write_all(&payload)
            .await
            .with_context(|| format!("💀 Writing {} bytes to '{}' failed halfway through life.", payload.len(), path.display()))?;
        file.flush().await?;
        debug!("📁 appended {} bytes to {}", payload.len(), path.display());
        Ok(())
    }
}

/// 🎭 Queue backends, picked at startup.
#[derive(Debug, Clone)]
pub enum QueueBackend {
    InMemory(InMemoryQueue),
    File(FileQueue),
}

#[async_trait]
impl QueueSink for QueueBackend {
    async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        match self {
            QueueBackend::InMemory(q) => q.push(queue, payload).await,
            QueueBackend::File(q) => q.push(queue, payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_one_where_the_queue_remembers_the_order() -> Result<()> {
        let queue = InMemoryQueue::new();
        let handle = queue.clone();
        queue.push("invalid", b"first".to_vec()).await?;
        queue.push("invalid", b"second".to_vec()).await?;
        queue.push("dead", b"third".to_vec()).await?;

        assert_eq!(handle.depth("invalid"), 2);
        assert_eq!(handle.queue_names(), vec!["dead".to_string(), "invalid".to_string()]);
        assert_eq!(handle.pop("invalid"), Some(b"first".to_vec()));
        assert_eq!(handle.messages("invalid"), vec![b"second".to_vec()]);
        assert_eq!(handle.depth("nope"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_file_queue_appends_lines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let queue = QueueBackend::File(FileQueue::new(dir.path().join("queues")));
        queue.push("dead_letter_queue", b"{\"a\":1}".to_vec()).await?;
        queue.push("dead_letter_queue", b"{\"b\":2}\n".to_vec()).await?;

        let written = std::fs::read_to_string(dir.path().join("queues/dead_letter_queue.ndjson"))?;
        assert_eq!(written, "{\"a\":1}\n{\"b\":2}\n");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_eight_workers_append_without_splicing() -> Result<()> {
        const PAYLOAD: usize = 3 * 1024 * 1024;
        let dir = tempfile::tempdir()?;
        let queue = FileQueue::new(dir.path());

        let handles: Vec<_> = (0..8u8)
            .map(|worker| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.push("dead_letter_queue", vec![b'a' + worker; PAYLOAD]).await })
            })
            .collect();
        for handle in handles {
            handle.await??;
        }

        let written = std::fs::read(queue.path_for("dead_letter_queue"))?;
        let lines: Vec<&[u8]> = written.split(|byte| *byte == b'\n').filter(|line| !line.is_empty()).collect();
        assert_eq!(lines.len(), 8);
        let mut seen: Vec<u8> = lines
            .iter()
            .map(|line| {
                assert_eq!(line.len(), PAYLOAD);
                assert!(line.iter().all(|byte| *byte == line[0]), "two payloads got spliced together");
                line[0]
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8u8).map(|worker| b'a' + worker).collect::<Vec<_>>());
        Ok(())
    }
}
