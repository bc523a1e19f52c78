//! Status command implementation

use crate::config::Config;
use crate::error::Result;
use crate::meta::{ContextStore, FigureSummary, IngestionRun};
use crate::store::VectorIndex;
use serde::Serialize;
use tracing::{debug, info};

/// Status information
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub db_path: String,
    pub index_backend: String,
    pub collection_name: String,
    pub embedding_model: String,
    pub index_available: bool,
    pub index_entries: usize,
    pub chunk_count: usize,
    pub figures: Vec<FigureSummary>,
    pub last_run: Option<IngestionRun>,
}

/// Get system status; an unavailable index is reported, not an error
pub async fn cmd_status(
    config: &Config,
    store: &ContextStore,
    index: Option<&dyn VectorIndex>,
) -> Result<StatusInfo> {
    info!("Getting status");

    let (index_available, index_entries) = match index {
        Some(index) => match index.count().await {
            Ok(count) => (true, count),
            Err(e) => {
                debug!("Index count error: {:?}", e);
                (false, 0)
            }
        },
        None => (false, 0),
    };

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        index_backend: config.index.backend.clone(),
        collection_name: config.collection_name(),
        embedding_model: config.embedding.active_model().to_string(),
        index_available,
        index_entries,
        chunk_count: store.count_chunks(None).await?,
        figures: store.list_figures().await?,
        last_run: store.get_latest_run().await?,
    })
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 chronicler Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Context store: {}", status.db_path);
    println!("\nIndex:");
    println!("  Backend: {}", status.index_backend);
    println!("  Collection: {}", status.collection_name);
    println!(
        "  Status: {}",
        if status.index_available { "✓ Available" } else { "✗ Unavailable" }
    );
    println!("  Entries: {}", status.index_entries);
    println!("\nEmbedding Model: {}", status.embedding_model);
    println!("\nContext:");
    println!("  Chunks: {}", status.chunk_count);
    println!("  Figures: {}", status.figures.len());

    if let Some(run) = &status.last_run {
        println!("\nLast ingestion ({}):", run.status);
        println!("  Scope: {}", run.scope);
        println!("  Started: {}", run.started_at);
        println!(
            "  Seen: {}, Indexed: {}, Unchanged: {}, Failed: {}, Deleted: {}",
            run.chunks_seen, run.chunks_indexed, run.chunks_unchanged, run.chunks_failed, run.chunks_deleted
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ContentType, ContextChunk};
    use crate::store::MemoryIndex;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_status_without_index() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_base_dir(tmp.path().to_path_buf());
        let store = ContextStore::connect(&config).await.unwrap();
        store
            .upsert_chunk(&ContextChunk::new("1", "anne-boleyn", "notes", ContentType::Bio, "Queen of England."))
            .await
            .unwrap();

        let status = cmd_status(&config, &store, None).await.unwrap();
        assert!(!status.index_available);
        assert_eq!(status.chunk_count, 1);
        assert_eq!(status.figures[0].figure_id, "anne-boleyn");
        assert!(status.last_run.is_none());

        let index = MemoryIndex::new("test", 4);
        let status = cmd_status(&config, &store, Some(&index)).await.unwrap();
        assert!(status.index_available);
        assert_eq!(status.index_entries, 0);
    }
}
