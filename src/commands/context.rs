//! Context chunk management commands

use crate::error::{Error, Result};
use crate::meta::{ContentType, ContextChunk, ContextStore, FigureSummary};
use crate::store::VectorIndex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Fields for a new or replaced chunk
#[derive(Debug, Clone)]
pub struct ContextAddOptions {
    pub id: Option<String>,
    pub figure_id: String,
    pub source_name: String,
    pub source_url: Option<String>,
    pub content_type: ContentType,
    pub text: String,
    pub is_manual: bool,
}

/// One record of an import file
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkImport {
    #[serde(default)]
    pub id: Option<String>,
    pub figure_id: String,
    #[serde(default = "default_import_source")]
    pub source_name: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default = "default_import_content_type")]
    pub content_type: ContentType,
    pub text: String,
    #[serde(default)]
    pub is_manual: bool,
}

fn default_import_source() -> String {
    "import".to_string()
}

fn default_import_content_type() -> ContentType {
    ContentType::Bio
}

impl From<ChunkImport> for ContextChunk {
    fn from(record: ChunkImport) -> Self {
        let mut chunk = ContextChunk::new(
            record.id.unwrap_or_default(),
            record.figure_id,
            record.source_name,
            record.content_type,
            record.text,
        )
        .manual(record.is_manual);
        chunk.source_url = record.source_url;
        chunk
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportStats {
    pub imported: usize,
    pub empty_text: usize,
}

/// Store one chunk, replacing any chunk with the same id
pub async fn cmd_context_add(store: &ContextStore, options: ContextAddOptions) -> Result<ContextChunk> {
    let mut chunk = ContextChunk::new(
        options.id.unwrap_or_default(),
        options.figure_id,
        options.source_name,
        options.content_type,
        options.text,
    )
    .manual(options.is_manual);
    chunk.source_url = options.source_url;

    if chunk.is_blank() {
        warn!(id = %chunk.id, "Chunk text is empty; it will not be indexed");
    }

    store.upsert_chunk(&chunk).await?;
    info!(id = %chunk.id, figure = %chunk.figure_id, "Added context chunk");
    Ok(chunk)
}

/// Import chunks from a JSON array file
pub async fn cmd_context_import(store: &ContextStore, path: &Path) -> Result<ImportStats> {
    let content = std::fs::read_to_string(path)?;
    let records: Vec<ChunkImport> = serde_json::from_str(&content)?;
    info!("Importing {} chunks from {}", records.len(), path.display());

    let mut stats = ImportStats::default();
    for record in records {
        let chunk = ContextChunk::from(record);
        if chunk.is_blank() {
            stats.empty_text += 1;
        }
        store.upsert_chunk(&chunk).await?;
        stats.imported += 1;
    }
    Ok(stats)
}

pub async fn cmd_context_list(store: &ContextStore, figure_id: Option<&str>) -> Result<Vec<ContextChunk>> {
    store.list_chunks(figure_id).await
}

pub async fn cmd_context_figures(store: &ContextStore) -> Result<Vec<FigureSummary>> {
    store.list_figures().await
}

/// Delete a chunk and, when an index is given, its entry
pub async fn cmd_context_remove(
    store: &ContextStore,
    index: Option<&dyn VectorIndex>,
    id: &str,
) -> Result<()> {
    if !store.delete_chunk(id).await? {
        return Err(Error::ChunkNotFound(id.to_string()));
    }

    match index {
        Some(index) => index.delete(&[id.to_string()]).await?,
        None => warn!(
            id,
            "Index unavailable; the entry will be pruned on the next full ingest"
        ),
    }
    Ok(())
}

pub fn print_chunks(chunks: &[ContextChunk]) {
    if chunks.is_empty() {
        println!("No context chunks. Use 'chronicler context add' or 'context import'.");
        return;
    }

    for chunk in chunks {
        println!("• {} [{}] {}", chunk.id, chunk.content_type, chunk.figure_id);
        println!("  Source: {}", chunk.source_url.as_deref().unwrap_or(&chunk.source_name));
        println!("  {}", preview(&chunk.text, 160));
    }
}

pub fn print_figures(figures: &[FigureSummary]) {
    if figures.is_empty() {
        println!("No figures yet.");
        return;
    }
    for figure in figures {
        println!("{:<32} {:>6} chunks", figure.figure_id, figure.chunk_count);
    }
}

/// Single-line preview cut at a char boundary
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryIndex;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_import_then_remove() {
        let tmp = TempDir::new().unwrap();
        let store = ContextStore::open(&tmp.path().join("context.db")).await.unwrap();
        let file = tmp.path().join("chunks.json");
        std::fs::write(
            &file,
            r#"[
                {"id": "1", "figure_id": "richard-iii", "text": "Richard III died at Bosworth Field in 1485."},
                {"id": "2", "figure_id": "richard-iii", "content_type": "summary", "text": "Richard III was crowned in 1483."},
                {"figure_id": "anne-boleyn", "source_name": "notes", "is_manual": true, "text": ""}
            ]"#,
        )
        .unwrap();

        let stats = cmd_context_import(&store, &file).await.unwrap();
        assert_eq!(stats.imported, 3);
        assert_eq!(stats.empty_text, 1);

        let richard = cmd_context_list(&store, Some("richard-iii")).await.unwrap();
        assert_eq!(richard.len(), 2);
        assert_eq!(richard[1].content_type, "summary");

        let index = MemoryIndex::new("test", 2);
        cmd_context_remove(&store, Some(&index), "1").await.unwrap();
        assert!(matches!(
            cmd_context_remove(&store, None, "1").await,
            Err(Error::ChunkNotFound(_))
        ));
        assert_eq!(store.count_chunks(None).await.unwrap(), 2);
    }

    #[test]
    fn test_preview_is_char_safe() {
        assert_eq!(preview("Anne\nBoleyn", 40), "Anne Boleyn");
        assert_eq!(preview("ééééé", 3), "ééé...");
    }
}
