//! Persistent chunk store and task tracker.
//!
//! Layout under the cache directory:
//!
//! ```text
//! chunks/<id>.txt        chunk content
//! chunks/<id>.json       chunk metadata
//! summaries/<id>.json    one summary per chunk
//! tasks/<task_id>.json   task progress
//! current_task.json      pointer to the current task
//! ```
//!
//! Every file is written to a temp name and renamed into place. Operations
//! that read-modify-write a task hold the store mutex for their duration.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use toolweave_config::ChunksConfig;
use toolweave_core::error::ChunkError;
use toolweave_core::token::estimate_tokens;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::split::{ChunkSpan, split_text};

const PREVIEW_CHARS: usize = 200;
const ID_HEX_LEN: usize = 16;

/// Metadata for one stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub source: String,
    pub index: usize,
    /// Char range within the source text
    pub start: usize,
    pub end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    pub char_count: usize,
    pub estimated_tokens: usize,
    pub preview: String,
}

/// Progress over an ordered set of chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTask {
    pub id: String,
    pub chunk_ids: Vec<String>,
    pub processed_ids: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl ChunkTask {
    pub fn is_done(&self) -> bool {
        let processed: HashSet<&String> = self.processed_ids.iter().collect();
        self.chunk_ids.iter().all(|id| processed.contains(id))
    }

    /// Chunk ids not yet processed, in chunk order.
    pub fn remaining_ids(&self) -> Vec<&String> {
        self.chunk_ids
            .iter()
            .filter(|id| !self.processed_ids.contains(id))
            .collect()
    }

    /// Record `chunk_id` as processed. Ids outside the task and repeats are
    /// ignored. Returns whether anything changed.
    pub fn mark_processed(&mut self, chunk_id: &str) -> bool {
        let owned = self.chunk_ids.iter().any(|id| id == chunk_id);
        if !owned || self.processed_ids.iter().any(|id| id == chunk_id) {
            return false;
        }
        self.processed_ids.push(chunk_id.to_string());
        true
    }

    pub fn status(&self) -> TaskStatus {
        let total = self.chunk_ids.len();
        let processed = self.processed_ids.len();
        let percent = if total == 0 {
            0.0
        } else {
            (processed as f64 / total as f64 * 1000.0).round() / 10.0
        };
        TaskStatus {
            task_id: self.id.clone(),
            total,
            processed,
            remaining: total - processed,
            percent,
            done: self.is_done(),
        }
    }
}

/// A saved summary for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub chunk_id: String,
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of [`ChunkStore::save_summary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveOutcome {
    pub chunk_id: String,
    /// The task that owns the chunk, if any
    pub task: Option<TaskStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub total: usize,
    pub processed: usize,
    pub remaining: usize,
    /// Rounded to one decimal
    pub percent: f64,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextChunk {
    Pending {
        chunk: Chunk,
        content: String,
        /// 1-based position of this chunk within the task
        position: usize,
        total: usize,
    },
    AllDone,
}

/// Summaries of a task joined in chunk order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedSummaries {
    pub text: String,
    pub count: usize,
    /// Chunk ids that have no summary yet
    pub missing: Vec<String>,
}

/// A freshly split text registered as the current task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ingested {
    pub task_id: String,
    pub chunks: Vec<Chunk>,
}

impl Ingested {
    pub fn total_tokens(&self) -> usize {
        self.chunks.iter().map(|c| c.estimated_tokens).sum()
    }
}

/// Output of [`ChunkStore::split_directory`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectorySplit {
    pub files: Vec<String>,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CurrentTask {
    task_id: String,
}

/// Content-addressed id: a SHA-256 prefix over source, index and content.
pub fn chunk_id(source: &str, index: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update((index as u64).to_le_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..ID_HEX_LEN].to_string()
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Ids and task ids become file names, so only plain tokens are accepted.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A bare extension such as `md` or `.md` means `*.md`; empty means any file.
fn file_pattern(pattern: &str) -> Result<Pattern, ChunkError> {
    let pattern = pattern.trim();
    let expanded = if pattern.is_empty() {
        "*".to_string()
    } else if pattern.contains(['*', '?', '[']) {
        pattern.to_string()
    } else {
        format!("*.{}", pattern.trim_start_matches('.'))
    };
    Pattern::new(&expanded).map_err(|e| ChunkError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.msg.to_string(),
    })
}

pub struct ChunkStore {
    root: PathBuf,
    max_chars: usize,
    lock: Mutex<()>,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>, max_chars: usize) -> Self {
        Self {
            root: root.into(),
            max_chars: max_chars.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &ChunksConfig) -> Self {
        Self::new(config.cache_dir.clone(), config.max_chars_per_chunk)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    fn chunks_dir(&self) -> PathBuf {
        self.root.join("chunks")
    }

    fn summaries_dir(&self) -> PathBuf {
        self.root.join("summaries")
    }

    fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    fn current_path(&self) -> PathBuf {
        self.root.join("current_task.json")
    }

    // ── Chunks ─────────────────────────────────────────────────────────

    /// Split `text` and persist every chunk.
    pub async fn split(&self, text: &str, source: &str) -> Result<Vec<Chunk>, ChunkError> {
        let spans = split_text(text, self.max_chars);
        let mut chunks = Vec::with_capacity(spans.len());
        for (index, span) in spans.into_iter().enumerate() {
            chunks.push(self.persist_chunk(source, index, span).await?);
        }
        info!(source = %source, chunks = chunks.len(), "Text split into chunks");
        Ok(chunks)
    }

    async fn persist_chunk(&self, source: &str, index: usize, span: ChunkSpan) -> Result<Chunk, ChunkError> {
        let chunk = Chunk {
            id: chunk_id(source, index, &span.text),
            source: source.to_string(),
            index,
            start: span.start,
            end: span.end,
            start_line: span.lines.map(|(first, _)| first),
            end_line: span.lines.map(|(_, last)| last),
            char_count: span.char_count(),
            estimated_tokens: estimate_tokens(&span.text),
            preview: preview(&span.text),
        };
        let dir = self.chunks_dir();
        write_atomic(&dir.join(format!("{}.txt", chunk.id)), span.text.as_bytes()).await?;
        write_json(&dir.join(format!("{}.json", chunk.id)), &chunk).await?;
        Ok(chunk)
    }

    /// Split a file's contents, labelled with its path.
    pub async fn split_file(&self, path: &Path) -> Result<Vec<Chunk>, ChunkError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => ChunkError::NotFound(path.display().to_string()),
            _ => ChunkError::from(e),
        })?;
        let text = String::from_utf8_lossy(&bytes);
        self.split(&text, &path.display().to_string()).await
    }

    /// Split every file in `dir` whose name matches `pattern`, in name order.
    ///
    /// `pattern` is a glob over the file name (`*.txt`, `report-??.md`).
    pub async fn split_directory(&self, dir: &Path, pattern: &str) -> Result<DirectorySplit, ChunkError> {
        let pattern = file_pattern(pattern)?;
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => ChunkError::NotFound(dir.display().to_string()),
            _ => ChunkError::from(e),
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if pattern.matches(&name.to_string_lossy()) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut out = DirectorySplit::default();
        for path in paths {
            let chunks = self.split_file(&path).await?;
            out.files.push(path.display().to_string());
            out.chunks.extend(chunks);
        }
        Ok(out)
    }

    /// Content of a stored chunk.
    pub async fn get(&self, chunk_id: &str) -> Result<String, ChunkError> {
        if !is_safe_id(chunk_id) {
            return Err(ChunkError::NotFound(chunk_id.to_string()));
        }
        let path = self.chunks_dir().join(format!("{chunk_id}.txt"));
        tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => ChunkError::NotFound(chunk_id.to_string()),
            _ => ChunkError::from(e),
        })
    }

    /// Metadata of a stored chunk.
    pub async fn chunk(&self, chunk_id: &str) -> Result<Chunk, ChunkError> {
        if !is_safe_id(chunk_id) {
            return Err(ChunkError::NotFound(chunk_id.to_string()));
        }
        read_json(&self.chunks_dir().join(format!("{chunk_id}.json")))
            .await?
            .ok_or_else(|| ChunkError::NotFound(chunk_id.to_string()))
    }

    // ── Tasks ──────────────────────────────────────────────────────────

    /// Register `chunks` as a new task and make it current.
    pub async fn start_task(&self, chunks: &[Chunk], description: &str, source: &str) -> Result<String, ChunkError> {
        let _guard = self.lock.lock().await;
        let mut chunk_ids: Vec<String> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if !chunk_ids.contains(&chunk.id) {
                chunk_ids.push(chunk.id.clone());
            }
        }
        let task = ChunkTask {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            chunk_ids,
            processed_ids: Vec::new(),
            description: description.to_string(),
            source: source.to_string(),
            created_at: Utc::now(),
        };
        self.write_task(&task).await?;
        write_json(&self.current_path(), &CurrentTask { task_id: task.id.clone() }).await?;
        info!(task_id = %task.id, chunks = task.chunk_ids.len(), "Chunk task started");
        Ok(task.id)
    }

    /// Split `text` and start a task over the result.
    pub async fn ingest(&self, text: &str, source: &str, description: &str) -> Result<Ingested, ChunkError> {
        let chunks = self.split(text, source).await?;
        let task_id = self.start_task(&chunks, description, source).await?;
        Ok(Ingested { task_id, chunks })
    }

    pub async fn task(&self, task_id: &str) -> Result<ChunkTask, ChunkError> {
        if !is_safe_id(task_id) {
            return Err(ChunkError::TaskNotFound(task_id.to_string()));
        }
        read_json(&self.task_path(task_id))
            .await?
            .ok_or_else(|| ChunkError::TaskNotFound(task_id.to_string()))
    }

    pub async fn current_task(&self) -> Result<Option<ChunkTask>, ChunkError> {
        let Some(pointer) = read_json::<CurrentTask>(&self.current_path()).await? else {
            return Ok(None);
        };
        match self.task(&pointer.task_id).await {
            Ok(task) => Ok(Some(task)),
            Err(ChunkError::TaskNotFound(_)) => {
                warn!(task_id = %pointer.task_id, "Current task record is missing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// The named task, or the current one when `task_id` is `None`.
    pub async fn resolve_task(&self, task_id: Option<&str>) -> Result<ChunkTask, ChunkError> {
        match task_id {
            Some(id) => self.task(id).await,
            None => self
                .current_task()
                .await?
                .ok_or_else(|| ChunkError::TaskNotFound("no current task".to_string())),
        }
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{task_id}.json"))
    }

    async fn write_task(&self, task: &ChunkTask) -> Result<(), ChunkError> {
        write_json(&self.task_path(&task.id), task).await
    }

    /// Every task whose chunk set contains `chunk_id`. The current task
    /// comes first, the rest newest first.
    ///
    /// Chunk ids are content-addressed, so re-ingesting the same input gives
    /// several tasks the same ids.
    async fn owning_tasks(&self, chunk_id: &str) -> Result<Vec<ChunkTask>, ChunkError> {
        let current_id = read_json::<CurrentTask>(&self.current_path())
            .await?
            .map(|pointer| pointer.task_id);

        let mut entries = match tokio::fs::read_dir(self.tasks_dir()).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut owners: Vec<ChunkTask> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let task: ChunkTask = match read_json(&path).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable task record");
                    continue;
                }
            };
            if task.chunk_ids.iter().any(|id| id == chunk_id) {
                owners.push(task);
            }
        }
        owners.sort_by(|a, b| {
            let a_current = current_id.as_deref() == Some(a.id.as_str());
            let b_current = current_id.as_deref() == Some(b.id.as_str());
            b_current
                .cmp(&a_current)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(owners)
    }

    /// Mark `chunk_id` processed in every task that owns it. Returns the
    /// progress of the preferred owner. Callers hold the store lock.
    async fn mark_in_owners(&self, chunk_id: &str) -> Result<Option<TaskStatus>, ChunkError> {
        let mut preferred = None;
        for mut task in self.owning_tasks(chunk_id).await? {
            if task.mark_processed(chunk_id) {
                self.write_task(&task).await?;
                debug!(task_id = %task.id, chunk_id = %chunk_id, "Chunk marked processed");
            }
            preferred.get_or_insert_with(|| task.status());
        }
        Ok(preferred)
    }

    // ── Summaries ──────────────────────────────────────────────────────

    /// Persist a summary and mark the chunk processed in every task that
    /// owns it.
    pub async fn save_summary(
        &self,
        chunk_id: &str,
        summary: &str,
        key_points: Vec<String>,
    ) -> Result<SaveOutcome, ChunkError> {
        if !is_safe_id(chunk_id) {
            return Err(ChunkError::NotFound(chunk_id.to_string()));
        }
        let _guard = self.lock.lock().await;

        let record = Summary {
            chunk_id: chunk_id.to_string(),
            summary: summary.to_string(),
            key_points,
            created_at: Utc::now(),
        };
        write_json(&self.summaries_dir().join(format!("{chunk_id}.json")), &record).await?;

        let task = self.mark_in_owners(chunk_id).await?;
        if task.is_none() {
            debug!(chunk_id = %chunk_id, "Summary saved for chunk outside any task");
        }

        Ok(SaveOutcome {
            chunk_id: chunk_id.to_string(),
            task,
        })
    }

    /// Mark a chunk processed without saving a summary.
    pub async fn mark_processed(&self, chunk_id: &str) -> Result<TaskStatus, ChunkError> {
        if !is_safe_id(chunk_id) {
            return Err(ChunkError::NotFound(chunk_id.to_string()));
        }
        let _guard = self.lock.lock().await;
        self.mark_in_owners(chunk_id)
            .await?
            .ok_or_else(|| ChunkError::TaskNotFound(format!("no task contains chunk {chunk_id}")))
    }

    pub async fn summary(&self, chunk_id: &str) -> Result<Option<Summary>, ChunkError> {
        if !is_safe_id(chunk_id) {
            return Ok(None);
        }
        read_json(&self.summaries_dir().join(format!("{chunk_id}.json"))).await
    }

    /// The first unprocessed chunk of a task, with its content.
    pub async fn next_unprocessed(&self, task_id: Option<&str>) -> Result<NextChunk, ChunkError> {
        let task = self.resolve_task(task_id).await?;
        let Some(next) = task.remaining_ids().first().map(|id| id.to_string()) else {
            return Ok(NextChunk::AllDone);
        };
        let position = task.chunk_ids.iter().position(|id| *id == next).map_or(0, |p| p + 1);
        Ok(NextChunk::Pending {
            chunk: self.chunk(&next).await?,
            content: self.get(&next).await?,
            position,
            total: task.chunk_ids.len(),
        })
    }

    pub async fn status(&self, task_id: Option<&str>) -> Result<TaskStatus, ChunkError> {
        Ok(self.resolve_task(task_id).await?.status())
    }

    /// Join a task's summaries in chunk order, each under a `【chunk_id】`
    /// header followed by its key points.
    pub async fn merge(&self, task_id: Option<&str>) -> Result<MergedSummaries, ChunkError> {
        let task = self.resolve_task(task_id).await?;
        let mut sections = Vec::new();
        let mut missing = Vec::new();

        for id in &task.chunk_ids {
            match self.summary(id).await? {
                Some(s) => {
                    let mut section = format!("【{id}】\n{}", s.summary);
                    for point in &s.key_points {
                        section.push_str("\n- ");
                        section.push_str(point);
                    }
                    sections.push(section);
                }
                None => missing.push(id.clone()),
            }
        }

        Ok(MergedSummaries {
            count: sections.len(),
            text: sections.join("\n\n"),
            missing,
        })
    }

    /// Delete every chunk, summary and task. Returns the number of files
    /// removed.
    pub async fn clear(&self) -> Result<usize, ChunkError> {
        let _guard = self.lock.lock().await;
        let mut removed = 0;
        for dir in [self.chunks_dir(), self.summaries_dir(), self.tasks_dir()] {
            removed += count_files(&dir).await?;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        match tokio::fs::remove_file(self.current_path()).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(removed, "Chunk cache cleared");
        Ok(removed)
    }
}

async fn count_files(dir: &Path) -> Result<usize, ChunkError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0;
    while entries.next_entry().await?.is_some() {
        count += 1;
    }
    Ok(count)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ChunkError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("record");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ChunkError> {
    let body = serde_json::to_vec_pretty(value).map_err(|e| ChunkError::Storage(e.to_string()))?;
    write_atomic(path, &body).await
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ChunkError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|e| ChunkError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
