//! The `data_processor` service: chunk-store operations exposed as tools so
//! the model can walk a large input one chunk at a time.
//!
//! Schemas are published under the `dataproc_` prefix; the orchestrator maps
//! that prefix back to [`SERVICE`] through its alias table.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use toolweave_core::error::{ChunkError, PluginError};
use toolweave_core::tool::{Plugin, ToolHandler, ToolSchema, ToolTable};

use crate::estimate::EstimateReport;
use crate::store::{Chunk, ChunkStore, NextChunk};

/// Registry name of the chunk-store service.
pub const SERVICE: &str = "data_processor";

/// Tool-name prefix the model sees.
pub const PREFIX: &str = "dataproc";

const DEFAULT_PATTERN: &str = "*.txt";

/// Chunk ids listed in a processing guide before the rest are elided.
const GUIDE_LISTED_IDS: usize = 10;

/// Publishes the chunk store as a plugin.
pub struct DataProcPlugin {
    store: Arc<ChunkStore>,
}

impl DataProcPlugin {
    pub fn new(store: Arc<ChunkStore>) -> Self {
        Self { store }
    }
}

fn schema(function: &str, description: &str, properties: Value, required: &[&str]) -> ToolSchema {
    ToolSchema::new(
        format!("{PREFIX}_{function}"),
        description,
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    )
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn required_str(tool: &str, args: &Value, key: &str) -> Result<String, PluginError> {
    str_arg(args, key).map(str::to_string).ok_or_else(|| PluginError::InvalidArguments {
        tool: format!("{PREFIX}_{tool}"),
        reason: format!("'{key}' must be a string"),
    })
}

fn failed(tool: &str, e: ChunkError) -> PluginError {
    PluginError::invocation(format!("{PREFIX}_{tool}"), e)
}

/// Register an async handler that gets its own handle on the store.
fn add<F, Fut>(table: &mut ToolTable, store: &Arc<ChunkStore>, schema: ToolSchema, handler: F)
where
    F: Fn(Arc<ChunkStore>, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, PluginError>> + Send + 'static,
{
    let function = schema
        .name
        .strip_prefix(&format!("{PREFIX}_"))
        .unwrap_or(&schema.name)
        .to_string();
    let store = Arc::clone(store);
    table.insert(
        function,
        schema,
        ToolHandler::async_fn(move |args| handler(Arc::clone(&store), args)),
    );
}

fn task_arg(args: &Value) -> Option<String> {
    str_arg(args, "task_id").map(str::to_string)
}

/// Step-by-step instructions for walking a freshly chunked task.
fn processing_guide(task_id: &str, chunks: &[Chunk], description: &str) -> String {
    let tokens: usize = chunks.iter().map(|c| c.estimated_tokens).sum();
    let per_chunk = if chunks.is_empty() { 0 } else { tokens / chunks.len() };
    let mut guide = format!(
        "Data split into {} chunk(s), about {tokens} tokens in total ({per_chunk} per chunk), under task {task_id}.\n\n\
         Next steps:\n\
         1. Call {PREFIX}_get_next_chunk to read the next unprocessed chunk.\n\
         2. Analyse it and call {PREFIX}_save_summary with its chunk_id.\n\
         3. Repeat until {PREFIX}_get_next_chunk reports all chunks processed.\n\
         4. Call {PREFIX}_merge_summaries and write the final answer from the merged text.\n\n\
         Chunks:\n",
        chunks.len()
    );
    for chunk in chunks.iter().take(GUIDE_LISTED_IDS) {
        guide.push_str(&format!(
            "- {} ({}, {} tokens)\n",
            chunk.id, chunk.source, chunk.estimated_tokens
        ));
    }
    if chunks.len() > GUIDE_LISTED_IDS {
        guide.push_str(&format!("- ... and {} more\n", chunks.len() - GUIDE_LISTED_IDS));
    }
    let description = if description.is_empty() { "not specified" } else { description };
    guide.push_str(&format!("\nTask: {description}"));
    guide
}

impl Plugin for DataProcPlugin {
    fn register(&self) -> Result<ToolTable, PluginError> {
        let mut table = ToolTable::new();
        let s = &self.store;

        add(
            &mut table,
            s,
            schema(
                "chunk_text",
                "Split a large text into chunks and start a processing task over them",
                json!({
                    "text": {"type": "string", "description": "Text to split"},
                    "source": {"type": "string", "description": "Label for where the text came from", "default": "input"},
                    "description": {"type": "string", "description": "What should be done with the data"}
                }),
                &["text"],
            ),
            |store, args| async move {
                let text = required_str("chunk_text", &args, "text")?;
                let source = str_arg(&args, "source").unwrap_or("input").to_string();
                let description = str_arg(&args, "description").unwrap_or_default().to_string();
                let ingested = store
                    .ingest(&text, &source, &description)
                    .await
                    .map_err(|e| failed("chunk_text", e))?;
                Ok(json!({
                    "success": true,
                    "task_id": ingested.task_id,
                    "total_chunks": ingested.chunks.len(),
                    "total_estimated_tokens": ingested.total_tokens(),
                    "chunks": ingested.chunks,
                }))
            },
        );

        add(
            &mut table,
            s,
            schema(
                "chunk_file",
                "Split a large file into chunks and start a processing task over them",
                json!({
                    "file_path": {"type": "string", "description": "Path of the file"},
                    "description": {"type": "string", "description": "What should be done with the data"}
                }),
                &["file_path"],
            ),
            |store, args| async move {
                let path = PathBuf::from(required_str("chunk_file", &args, "file_path")?);
                let description = str_arg(&args, "description").unwrap_or_default().to_string();
                let chunks = store.split_file(&path).await.map_err(|e| failed("chunk_file", e))?;
                let source = path.display().to_string();
                let task_id = store
                    .start_task(&chunks, &description, &source)
                    .await
                    .map_err(|e| failed("chunk_file", e))?;
                let tokens: usize = chunks.iter().map(|c| c.estimated_tokens).sum();
                Ok(json!({
                    "success": true,
                    "task_id": task_id,
                    "total_chunks": chunks.len(),
                    "total_estimated_tokens": tokens,
                    "chunks": chunks,
                }))
            },
        );

        add(
            &mut table,
            s,
            schema(
                "chunk_directory",
                "Split every matching file in a directory into chunks under one processing task",
                json!({
                    "dir_path": {"type": "string", "description": "Directory path"},
                    "pattern": {"type": "string", "description": "File name glob, e.g. *.txt or *.md", "default": DEFAULT_PATTERN},
                    "description": {"type": "string", "description": "What should be done with the data"}
                }),
                &["dir_path"],
            ),
            |store, args| async move {
                let dir = PathBuf::from(required_str("chunk_directory", &args, "dir_path")?);
                let pattern = str_arg(&args, "pattern").unwrap_or(DEFAULT_PATTERN).to_string();
                let description = str_arg(&args, "description").unwrap_or_default().to_string();
                let split = store
                    .split_directory(&dir, &pattern)
                    .await
                    .map_err(|e| failed("chunk_directory", e))?;
                let task_id = store
                    .start_task(&split.chunks, &description, &dir.display().to_string())
                    .await
                    .map_err(|e| failed("chunk_directory", e))?;
                let tokens: usize = split.chunks.iter().map(|c| c.estimated_tokens).sum();
                Ok(json!({
                    "success": true,
                    "task_id": task_id,
                    "files_processed": split.files.len(),
                    "total_chunks": split.chunks.len(),
                    "total_estimated_tokens": tokens,
                    "chunk_ids": split.chunks.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
                }))
            },
        );

        add(
            &mut table,
            s,
            schema(
                "process_large_data",
                "Chunk a large file or directory that exceeds the context limit and return a step-by-step processing guide",
                json!({
                    "file_path": {"type": "string", "description": "Large file to process"},
                    "dir_path": {"type": "string", "description": "Directory whose matching files are processed together"},
                    "pattern": {"type": "string", "description": "File name glob for dir_path, e.g. *.txt or *.md", "default": DEFAULT_PATTERN},
                    "task_description": {"type": "string", "description": "What analysis should be done on the data"}
                }),
                &[],
            ),
            |store, args| async move {
                let description = str_arg(&args, "task_description").unwrap_or_default().to_string();
                let (chunks, source, files) = if let Some(dir) = str_arg(&args, "dir_path") {
                    let dir = PathBuf::from(dir);
                    let pattern = str_arg(&args, "pattern").unwrap_or(DEFAULT_PATTERN);
                    let split = store
                        .split_directory(&dir, pattern)
                        .await
                        .map_err(|e| failed("process_large_data", e))?;
                    (split.chunks, dir.display().to_string(), split.files.len())
                } else if let Some(file) = str_arg(&args, "file_path") {
                    let path = PathBuf::from(file);
                    let chunks = store
                        .split_file(&path)
                        .await
                        .map_err(|e| failed("process_large_data", e))?;
                    (chunks, path.display().to_string(), 1)
                } else {
                    return Err(PluginError::InvalidArguments {
                        tool: format!("{PREFIX}_process_large_data"),
                        reason: "either 'file_path' or 'dir_path' is required".to_string(),
                    });
                };
                let task_id = store
                    .start_task(&chunks, &description, &source)
                    .await
                    .map_err(|e| failed("process_large_data", e))?;
                let tokens: usize = chunks.iter().map(|c| c.estimated_tokens).sum();
                Ok(json!({
                    "success": true,
                    "task_id": task_id,
                    "files_processed": files,
                    "total_chunks": chunks.len(),
                    "total_estimated_tokens": tokens,
                    "chunk_ids": chunks.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
                    "instructions": processing_guide(&task_id, &chunks, &description),
                }))
            },
        );

        add(
            &mut table,
            s,
            schema(
                "get_chunk",
                "Fetch the full content of one chunk",
                json!({"chunk_id": {"type": "string", "description": "Chunk id"}}),
                &["chunk_id"],
            ),
            |store, args| async move {
                let id = required_str("get_chunk", &args, "chunk_id")?;
                let content = store.get(&id).await.map_err(|e| failed("get_chunk", e))?;
                let info = store.chunk(&id).await.ok();
                Ok(json!({
                    "success": true,
                    "chunk_id": id,
                    "char_count": content.chars().count(),
                    "estimated_tokens": toolweave_core::token::estimate_tokens(&content),
                    "content": content,
                    "info": info,
                }))
            },
        );

        add(
            &mut table,
            s,
            schema(
                "save_summary",
                "Save the summary of one chunk and mark it processed",
                json!({
                    "chunk_id": {"type": "string", "description": "Chunk id"},
                    "summary": {"type": "string", "description": "Summary text"},
                    "key_points": {"type": "array", "items": {"type": "string"}, "description": "Key points"}
                }),
                &["chunk_id", "summary"],
            ),
            |store, args| async move {
                let id = required_str("save_summary", &args, "chunk_id")?;
                let summary = required_str("save_summary", &args, "summary")?;
                let key_points: Vec<String> = args
                    .get("key_points")
                    .and_then(Value::as_array)
                    .map(|points| points.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
                let outcome = store
                    .save_summary(&id, &summary, key_points)
                    .await
                    .map_err(|e| failed("save_summary", e))?;
                let next_step = match &outcome.task {
                    Some(status) if status.done => {
                        format!("All chunks processed. Call {PREFIX}_merge_summaries to build the final report.")
                    }
                    Some(status) => format!(
                        "{} chunk(s) remaining. Call {PREFIX}_get_next_chunk to continue.",
                        status.remaining
                    ),
                    None => "Summary saved; the chunk does not belong to any task.".to_string(),
                };
                Ok(json!({
                    "success": true,
                    "chunk_id": outcome.chunk_id,
                    "progress": outcome.task,
                    "message": next_step,
                }))
            },
        );

        add(
            &mut table,
            s,
            schema(
                "mark_processed",
                "Mark a chunk processed without saving a summary, e.g. when it holds nothing relevant",
                json!({"chunk_id": {"type": "string", "description": "Chunk id"}}),
                &["chunk_id"],
            ),
            |store, args| async move {
                let id = required_str("mark_processed", &args, "chunk_id")?;
                let status = store
                    .mark_processed(&id)
                    .await
                    .map_err(|e| failed("mark_processed", e))?;
                Ok(json!({
                    "success": true,
                    "chunk_id": id,
                    "progress": status,
                    "message": format!("Marked {id} processed; {}/{} done.", status.processed, status.total),
                }))
            },
        );

        add(
            &mut table,
            s,
            schema(
                "get_next_chunk",
                "Fetch the next unprocessed chunk of the current (or given) task",
                json!({"task_id": {"type": "string", "description": "Task id; defaults to the current task"}}),
                &[],
            ),
            |store, args| async move {
                let task_id = task_arg(&args);
                match store
                    .next_unprocessed(task_id.as_deref())
                    .await
                    .map_err(|e| failed("get_next_chunk", e))?
                {
                    NextChunk::Pending {
                        chunk,
                        content,
                        position,
                        total,
                    } => Ok(json!({
                        "success": true,
                        "all_processed": false,
                        "chunk_id": chunk.id,
                        "position": position,
                        "total_chunks": total,
                        "remaining_after_this": total.saturating_sub(position),
                        "content": content,
                        "message": format!(
                            "Chunk {position}/{total}. Summarize it, then call {PREFIX}_save_summary with chunk_id {}.",
                            chunk.id
                        ),
                    })),
                    NextChunk::AllDone => Ok(json!({
                        "success": true,
                        "all_processed": true,
                        "message": format!("All chunks processed. Call {PREFIX}_merge_summaries to build the final report."),
                    })),
                }
            },
        );

        add(
            &mut table,
            s,
            schema(
                "get_status",
                "Progress of the current (or given) chunk task",
                json!({"task_id": {"type": "string", "description": "Task id; defaults to the current task"}}),
                &[],
            ),
            |store, args| async move {
                let task_id = task_arg(&args);
                let task = store
                    .resolve_task(task_id.as_deref())
                    .await
                    .map_err(|e| failed("get_status", e))?;
                Ok(json!({
                    "success": true,
                    "description": task.description,
                    "source": task.source,
                    "status": task.status(),
                    "unprocessed_ids": task.remaining_ids(),
                }))
            },
        );

        add(
            &mut table,
            s,
            schema(
                "merge_summaries",
                "Join every saved summary of the current (or given) task in chunk order",
                json!({"task_id": {"type": "string", "description": "Task id; defaults to the current task"}}),
                &[],
            ),
            |store, args| async move {
                let task_id = task_arg(&args);
                let merged = store
                    .merge(task_id.as_deref())
                    .await
                    .map_err(|e| failed("merge_summaries", e))?;
                Ok(json!({
                    "success": true,
                    "total_summaries": merged.count,
                    "missing": merged.missing,
                    "combined_tokens": toolweave_core::token::estimate_tokens(&merged.text),
                    "combined_text": merged.text,
                }))
            },
        );

        let max_chars = self.store.max_chars();
        add(
            &mut table,
            s,
            schema(
                "estimate_tokens",
                "Estimate the token count of a text and whether it needs chunking",
                json!({"text": {"type": "string", "description": "Text to measure"}}),
                &["text"],
            ),
            move |_, args| async move {
                let text = required_str("estimate_tokens", &args, "text")?;
                let report = EstimateReport::for_text(&text, max_chars);
                serde_json::to_value(report).map_err(|e| PluginError::invocation("dataproc_estimate_tokens", e))
            },
        );

        add(
            &mut table,
            s,
            schema("clear_cache", "Delete every cached chunk, summary and task", json!({}), &[]),
            |store, _| async move {
                let removed = store.clear().await.map_err(|e| failed("clear_cache", e))?;
                Ok(json!({"success": true, "removed_files": removed}))
            },
        );

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(dir: &std::path::Path) -> (Arc<ChunkStore>, ToolTable) {
        let store = Arc::new(ChunkStore::new(dir, 50));
        let table = DataProcPlugin::new(Arc::clone(&store)).register().unwrap();
        (store, table)
    }

    async fn call(table: &ToolTable, function: &str, args: Value) -> Result<Value, PluginError> {
        table.get(function).unwrap().invoke(args).await
    }

    #[test]
    fn publishes_prefixed_schemas() {
        let dir = tempfile::tempdir().unwrap();
        let (_, table) = plugin(dir.path());
        assert_eq!(table.len(), 12);
        for schema in table.schemas() {
            assert!(schema.name.starts_with("dataproc_"), "{}", schema.name);
        }
        assert!(table.get("merge_summaries").is_some());
    }

    #[tokio::test]
    async fn map_reduce_through_tools() {
        let dir = tempfile::tempdir().unwrap();
        let (_, table) = plugin(dir.path());
        let text: String = (0..10).map(|i| format!("entry number {i:02}\n")).collect();

        let chunked = call(&table, "chunk_text", json!({"text": text})).await.unwrap();
        let total = chunked["total_chunks"].as_u64().unwrap();
        assert!(total > 1);

        for _ in 0..total {
            let next = call(&table, "get_next_chunk", json!({})).await.unwrap();
            assert_eq!(next["all_processed"], false);
            let id = next["chunk_id"].as_str().unwrap().to_string();
            call(&table, "save_summary", json!({"chunk_id": id, "summary": "ok"}))
                .await
                .unwrap();
        }

        let done = call(&table, "get_next_chunk", json!({})).await.unwrap();
        assert_eq!(done["all_processed"], true);
        let status = call(&table, "get_status", json!({})).await.unwrap();
        assert_eq!(status["status"]["percent"], 100.0);
        let merged = call(&table, "merge_summaries", json!({})).await.unwrap();
        assert_eq!(merged["total_summaries"].as_u64(), Some(total));
    }

    #[tokio::test]
    async fn process_large_data_chunks_a_directory_and_guides() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir(&data).unwrap();
        std::fs::write(data.join("day1.md"), "notes for monday ".repeat(8)).unwrap();
        std::fs::write(data.join("day2.md"), "notes for tuesday ".repeat(8)).unwrap();
        std::fs::write(data.join("ignore.txt"), "not a report").unwrap();
        let (store, table) = plugin(&dir.path().join("cache"));

        let out = call(
            &table,
            "process_large_data",
            json!({"dir_path": data, "pattern": "*.md", "task_description": "weekly summary"}),
        )
        .await
        .unwrap();
        assert_eq!(out["files_processed"], 2);
        let total = out["total_chunks"].as_u64().unwrap() as usize;
        assert!(total >= 2);
        assert_eq!(out["chunk_ids"].as_array().unwrap().len(), total);

        let guide = out["instructions"].as_str().unwrap();
        assert!(guide.contains("dataproc_get_next_chunk"));
        assert!(guide.contains("dataproc_merge_summaries"));
        assert!(guide.contains("weekly summary"));
        assert!(guide.contains(out["chunk_ids"][0].as_str().unwrap()));

        let current = store.current_task().await.unwrap().unwrap();
        assert_eq!(current.id, out["task_id"].as_str().unwrap());
        assert_eq!(current.description, "weekly summary");

        assert!(matches!(
            call(&table, "process_large_data", json!({})).await,
            Err(PluginError::InvalidArguments { .. })
        ));
    }

    #[tokio::test]
    async fn mark_processed_advances_without_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (store, table) = plugin(dir.path());
        let ingested = store.ingest("short body", "s", "").await.unwrap();
        let id = ingested.chunks[0].id.clone();

        let out = call(&table, "mark_processed", json!({"chunk_id": id})).await.unwrap();
        assert_eq!(out["progress"]["done"], true);
        let next = call(&table, "get_next_chunk", json!({})).await.unwrap();
        assert_eq!(next["all_processed"], true);

        assert!(matches!(
            call(&table, "mark_processed", json!({"chunk_id": "deadbeef"})).await,
            Err(PluginError::InvocationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn chunk_directory_filters_by_glob() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir(&data).unwrap();
        std::fs::write(data.join("a.txt"), "alpha").unwrap();
        std::fs::write(data.join("b.log"), "bravo").unwrap();
        let (_, table) = plugin(&dir.path().join("cache"));

        let txt = call(&table, "chunk_directory", json!({"dir_path": data})).await.unwrap();
        assert_eq!(txt["files_processed"], 1);
        let logs = call(&table, "chunk_directory", json!({"dir_path": data, "pattern": "*.log"}))
            .await
            .unwrap();
        assert_eq!(logs["files_processed"], 1);
        let all = call(&table, "chunk_directory", json!({"dir_path": data, "pattern": "*"}))
            .await
            .unwrap();
        assert_eq!(all["files_processed"], 2);
    }

    #[tokio::test]
    async fn errors_surface_as_plugin_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (_, table) = plugin(dir.path());
        assert!(matches!(
            call(&table, "get_chunk", json!({"chunk_id": "nope"})).await,
            Err(PluginError::InvocationFailed { .. })
        ));
        assert!(matches!(
            call(&table, "get_status", json!({})).await,
            Err(PluginError::InvocationFailed { .. })
        ));
        assert!(matches!(
            call(&table, "chunk_text", json!({"text": 5})).await,
            Err(PluginError::InvalidArguments { .. })
        ));
    }

    #[tokio::test]
    async fn estimate_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let (store, table) = plugin(dir.path());
        let report = call(&table, "estimate_tokens", json!({"text": "abcde"})).await.unwrap();
        assert_eq!(report["estimated_tokens"], 2);
        assert_eq!(report["exceeds_limit"], false);

        store.ingest("some text", "t", "").await.unwrap();
        let cleared = call(&table, "clear_cache", json!({})).await.unwrap();
        assert!(cleared["removed_files"].as_u64().unwrap() > 0);
        assert!(store.current_task().await.unwrap().is_none());
    }
}
