//! `toolweave chunks`: inspect chunk processing tasks from the shell.

use toolweave_chunks::NextChunk;

use super::runtime;

pub async fn status(task: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let store = runtime::store(&runtime::load_config()?);
    let status = store.status(task.as_deref()).await?;
    println!("Task:      {}", status.task_id);
    println!(
        "Progress:  {}/{} chunks ({:.1}%)",
        status.processed, status.total, status.percent
    );
    println!("Remaining: {}", status.remaining);
    println!("Done:      {}", if status.done { "yes" } else { "no" });
    Ok(())
}

pub async fn next(task: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let store = runtime::store(&runtime::load_config()?);
    match store.next_unprocessed(task.as_deref()).await? {
        NextChunk::Pending {
            chunk,
            content,
            position,
            total,
        } => {
            println!("Chunk {position}/{total}: {} ({} chars)", chunk.id, chunk.char_count);
            println!();
            println!("{content}");
        }
        NextChunk::AllDone => println!("All chunks are processed."),
    }
    Ok(())
}

pub async fn merge(task: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let store = runtime::store(&runtime::load_config()?);
    let merged = store.merge(task.as_deref()).await?;
    if !merged.missing.is_empty() {
        eprintln!("  {} chunk(s) have no summary yet", merged.missing.len());
    }
    println!("{}", merged.text);
    Ok(())
}

pub async fn clear() -> Result<(), Box<dyn std::error::Error>> {
    let store = runtime::store(&runtime::load_config()?);
    let removed = store.clear().await?;
    println!("Removed {removed} file(s) from {}", store.root().display());
    Ok(())
}
