//! Ingestion pipeline: synchronise the context store into the vector index
//!
//! Chunks are read page by page in id order, embedded, and upserted under
//! their own id, so re-running over an unchanged store rewrites nothing and
//! never duplicates entries. A chunk whose embedding fails is logged,
//! counted and skipped; the rest of the run continues.

use crate::config::IngestConfig;
use crate::embed::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::meta::{ChunkScope, ContextChunk, ContextStore, RunCounters, RunStatus};
use crate::progress::{advance_progress, finish_progress, start_progress_bar};
use crate::store::{IndexDocument, Metadata, VectorIndex, FIGURE_ID_KEY};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Index ids deleted per call when pruning
const DELETE_BATCH: usize = 256;

/// What a run covers and how
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub scope: ChunkScope,
    /// Re-embed chunks even when the index already holds identical content
    pub force: bool,
    /// Wipe the collection first (full scope only)
    pub rebuild: bool,
    /// Delete index entries whose chunk no longer exists (full scope only)
    pub prune_orphans: bool,
    /// Chunks per page
    pub batch_size: usize,
    pub show_progress: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

impl IngestOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            scope: ChunkScope::All,
            force: false,
            rebuild: false,
            prune_orphans: config.prune_orphans,
            batch_size: config.batch_size,
            show_progress: false,
        }
    }

    pub fn with_scope(mut self, scope: ChunkScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestStats {
    /// Chunks read from the store
    pub seen: usize,
    /// Entries written for chunks new to the index
    pub created: usize,
    /// Entries rewritten because content or metadata changed
    pub updated: usize,
    /// Chunks already indexed with identical content
    pub unchanged: usize,
    /// Chunks with blank text, never indexed
    pub skipped_empty: usize,
    /// Chunks whose embedding failed
    pub failed: usize,
    /// Stale or orphaned entries removed from the index
    pub deleted: usize,
    pub errors: Vec<String>,
}

impl IngestStats {
    /// Entries written this run
    pub fn indexed(&self) -> usize {
        self.created + self.updated
    }

    fn counters(&self) -> RunCounters {
        RunCounters {
            seen: self.seen,
            indexed: self.indexed(),
            unchanged: self.unchanged,
            failed: self.failed,
            deleted: self.deleted,
        }
    }
}

/// Metadata written alongside a chunk's entry.
///
/// `embedding_model` names the model that produced the vector, so a model
/// switch at the same dimension makes every entry stale.
pub fn chunk_metadata(chunk: &ContextChunk, embedding_model: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(FIGURE_ID_KEY.to_string(), Value::from(chunk.figure_id.clone()));
    metadata.insert("source_name".to_string(), Value::from(chunk.source_name.clone()));
    if let Some(url) = &chunk.source_url {
        metadata.insert("source_url".to_string(), Value::from(url.clone()));
    }
    metadata.insert("content_type".to_string(), Value::from(chunk.content_type.clone()));
    metadata.insert("is_manual".to_string(), Value::from(chunk.is_manual));
    metadata.insert("content_hash".to_string(), Value::from(chunk.content_hash()));
    metadata.insert("embedding_model".to_string(), Value::from(embedding_model));
    metadata
}

/// Copies context chunks into a vector index.
///
/// Runs on one pipeline are serialised; a second `run` waits for the first.
pub struct IngestPipeline {
    store: ContextStore,
    index: Arc<dyn VectorIndex>,
    embedder: EmbeddingProvider,
    write_lock: Mutex<()>,
}

impl IngestPipeline {
    pub fn new(store: ContextStore, index: Arc<dyn VectorIndex>, embedder: EmbeddingProvider) -> Self {
        Self {
            store,
            index,
            embedder,
            write_lock: Mutex::new(()),
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Run one ingestion pass and record it in the store's run history
    pub async fn run(&self, options: &IngestOptions) -> Result<IngestStats> {
        if options.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be positive".to_string()));
        }
        if options.rebuild && !options.scope.is_all() {
            return Err(Error::InvalidArgument(
                "rebuild wipes the whole collection and cannot be limited to a subset".to_string(),
            ));
        }
        if self.embedder.dimension() != self.index.dimension() {
            return Err(Error::DimensionMismatch {
                expected: self.index.dimension(),
                actual: self.embedder.dimension(),
            });
        }

        let _guard = self.write_lock.lock().await;

        let run = self.store.start_ingestion_run(&options.scope).await?;
        info!(
            run = %run.id,
            scope = %options.scope,
            collection = self.index.name(),
            model = self.embedder.model_name(),
            "Starting ingestion"
        );

        let mut stats = IngestStats::default();
        let outcome = self.run_pages(options, &mut stats).await;

        match outcome {
            Ok(()) => {
                self.store
                    .complete_ingestion_run(&run.id, RunStatus::Completed, stats.counters(), &stats.errors)
                    .await?;
                info!(
                    seen = stats.seen,
                    created = stats.created,
                    updated = stats.updated,
                    unchanged = stats.unchanged,
                    skipped_empty = stats.skipped_empty,
                    failed = stats.failed,
                    deleted = stats.deleted,
                    "Ingestion complete"
                );
                Ok(stats)
            }
            Err(e) => {
                stats.errors.push(e.to_string());
                if let Err(record_err) = self
                    .store
                    .complete_ingestion_run(&run.id, RunStatus::Failed, stats.counters(), &stats.errors)
                    .await
                {
                    error!(run = %run.id, error = %record_err, "Could not record failed ingestion run");
                }
                Err(e)
            }
        }
    }

    async fn run_pages(&self, options: &IngestOptions, stats: &mut IngestStats) -> Result<()> {
        if options.rebuild {
            info!(collection = self.index.name(), "Rebuilding collection");
            self.index.reset().await?;
        }

        let total = match &options.scope {
            ChunkScope::All => self.store.count_chunks(None).await?,
            ChunkScope::Figures(_) | ChunkScope::Chunks(_) => 0,
        };
        let progress = if options.show_progress {
            start_progress_bar(total, "Ingesting chunks")
        } else {
            None
        };

        let mut after: Option<String> = None;
        loop {
            let page = self
                .store
                .list_chunks_page(&options.scope, after.as_deref(), options.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());

            self.ingest_page(&page, options.force, stats).await?;
            advance_progress(&progress, page.len() as u64);

            if page.len() < options.batch_size {
                break;
            }
        }
        finish_progress(progress, "Chunks ingested");

        if options.scope.is_all() && options.prune_orphans && !options.rebuild {
            stats.deleted += self.prune_orphans().await?;
        }
        Ok(())
    }

    async fn ingest_page(&self, page: &[ContextChunk], force: bool, stats: &mut IngestStats) -> Result<()> {
        stats.seen += page.len();

        let (blank, chunks): (Vec<&ContextChunk>, Vec<&ContextChunk>) =
            page.iter().partition(|c| c.is_blank());

        if !blank.is_empty() {
            stats.skipped_empty += blank.len();
            let ids: Vec<String> = blank.iter().map(|c| c.id.clone()).collect();
            let stale = self.index.get(&ids).await?;
            if !stale.is_empty() {
                let stale_ids: Vec<String> = stale.into_iter().map(|d| d.id).collect();
                debug!(count = stale_ids.len(), "Removing entries for chunks with empty text");
                self.index.delete(&stale_ids).await?;
                stats.deleted += stale_ids.len();
            }
        }

        if chunks.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let existing: HashMap<String, IndexDocument> = self
            .index
            .get(&ids)
            .await?
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();

        let mut pending = Vec::new();
        for chunk in chunks {
            let metadata = chunk_metadata(chunk, self.embedder.model_name());
            let is_current = existing
                .get(&chunk.id)
                .is_some_and(|d| d.document == chunk.text && d.metadata == metadata);
            if is_current && !force {
                stats.unchanged += 1;
            } else {
                pending.push((chunk, metadata));
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = pending.iter().map(|(c, _)| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await;

        let mut upsert_ids = Vec::with_capacity(pending.len());
        let mut embeddings = Vec::with_capacity(pending.len());
        let mut documents = Vec::with_capacity(pending.len());
        let mut metadatas = Vec::with_capacity(pending.len());

        for ((chunk, metadata), vector) in pending.into_iter().zip(vectors) {
            match vector {
                Ok(vector) => {
                    if existing.contains_key(&chunk.id) {
                        stats.updated += 1;
                    } else {
                        stats.created += 1;
                    }
                    upsert_ids.push(chunk.id.clone());
                    embeddings.push(vector);
                    documents.push(chunk.text.clone());
                    metadatas.push(metadata);
                }
                Err(e) => {
                    warn!(id = %chunk.id, figure = %chunk.figure_id, error = %e, "Skipping chunk");
                    stats.failed += 1;
                    stats.errors.push(format!("{}: {}", chunk.id, e));
                }
            }
        }

        self.index
            .upsert(&upsert_ids, &embeddings, &documents, &metadatas)
            .await?;
        debug!(count = upsert_ids.len(), "Upserted page");
        Ok(())
    }

    /// Delete index entries with no chunk in the store
    async fn prune_orphans(&self) -> Result<usize> {
        let known: HashSet<String> = self.store.list_all_chunk_ids().await?.into_iter().collect();
        let orphans: Vec<String> = self
            .index
            .list_ids()
            .await?
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();

        if orphans.is_empty() {
            return Ok(0);
        }

        info!(count = orphans.len(), "Pruning orphaned index entries");
        for batch in orphans.chunks(DELETE_BATCH) {
            self.index.delete(batch).await?;
        }
        Ok(orphans.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::Embedder;
    use crate::meta::ContentType;
    use crate::store::{IndexMatch, MemoryIndex, MetadataFilter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const DIM: usize = 16;

    /// Bag-of-words hashing embedder; rejects any text containing "poison"
    struct WordEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for WordEmbedder {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(texts.len(), Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(Error::Embedding("rejected".to_string()));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; DIM];
                    for word in t.split_whitespace() {
                        v[blake3::hash(word.as_bytes()).as_bytes()[0] as usize % DIM] += 1.0;
                    }
                    v
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            DIM
        }

        fn model_name(&self) -> &str {
            "words"
        }
    }

    struct Fixture {
        store: ContextStore,
        index: Arc<MemoryIndex>,
        pipeline: IngestPipeline,
        embedder: Arc<WordEmbedder>,
        _tmp: TempDir,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = ContextStore::open(&tmp.path().join("context.db")).await.unwrap();
        let index = Arc::new(MemoryIndex::new("test", DIM));
        let embedder = Arc::new(WordEmbedder {
            calls: AtomicUsize::new(0),
        });
        let pipeline = IngestPipeline::new(
            store.clone(),
            index.clone(),
            EmbeddingProvider::new(embedder.clone(), 8),
        );
        Fixture {
            store,
            index,
            pipeline,
            embedder,
            _tmp: tmp,
        }
    }

    fn chunk(id: &str, figure: &str, text: &str) -> ContextChunk {
        ContextChunk::new(id, figure, "test", ContentType::Bio, text)
    }

    fn options(batch_size: usize) -> IngestOptions {
        IngestOptions {
            batch_size,
            ..IngestOptions::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_pages_and_is_idempotent() {
        let f = fixture().await;
        for i in 0..7 {
            f.store
                .upsert_chunk(&chunk(&format!("{:02}", i), "a", &format!("fact number {}", i)))
                .await
                .unwrap();
        }

        let first = f.pipeline.run(&options(3)).await.unwrap();
        assert_eq!(first.seen, 7);
        assert_eq!(first.created, 7);
        assert_eq!(f.index.count().await.unwrap(), 7);

        let before = f.index.get(&f.index.list_ids().await.unwrap()).await.unwrap();
        let calls = f.embedder.calls.load(Ordering::SeqCst);

        let second = f.pipeline.run(&options(3)).await.unwrap();
        assert_eq!(second.unchanged, 7);
        assert_eq!(second.indexed(), 0);
        assert_eq!(f.embedder.calls.load(Ordering::SeqCst), calls);

        let after = f.index.get(&f.index.list_ids().await.unwrap()).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_force_reembeds_without_duplicating() {
        let f = fixture().await;
        f.store.upsert_chunk(&chunk("1", "a", "some text")).await.unwrap();
        f.pipeline.run(&options(10)).await.unwrap();

        let forced = f
            .pipeline
            .run(&IngestOptions {
                force: true,
                ..options(10)
            })
            .await
            .unwrap();
        assert_eq!(forced.updated, 1);
        assert_eq!(f.index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_chunks_are_counted_and_skipped() {
        let f = fixture().await;
        f.store.upsert_chunk(&chunk("1", "a", "good text")).await.unwrap();
        f.store.upsert_chunk(&chunk("2", "a", "poison text")).await.unwrap();
        f.store.upsert_chunk(&chunk("3", "a", "more good text")).await.unwrap();

        let stats = f.pipeline.run(&options(10)).await.unwrap();

        assert_eq!(stats.created, 2);
        assert_eq!(stats.failed, 1);
        assert!(stats.errors[0].starts_with("2:"));
        assert_eq!(f.index.list_ids().await.unwrap(), vec!["1", "3"]);

        let run = f.store.get_latest_run().await.unwrap().unwrap();
        assert_eq!(run.status, "completed");
        assert_eq!(run.chunks_failed, 1);
    }

    #[tokio::test]
    async fn test_empty_text_is_never_indexed_and_stale_entry_removed() {
        let f = fixture().await;
        f.store.upsert_chunk(&chunk("1", "a", "has text")).await.unwrap();
        f.store.upsert_chunk(&chunk("2", "a", "   ")).await.unwrap();

        let stats = f.pipeline.run(&options(10)).await.unwrap();
        assert_eq!(stats.skipped_empty, 1);
        assert_eq!(f.index.list_ids().await.unwrap(), vec!["1"]);

        f.store.upsert_chunk(&chunk("1", "a", "")).await.unwrap();
        let stats = f.pipeline.run(&options(10)).await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert_eq!(f.index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_orphans_pruned_on_full_runs_only() {
        let f = fixture().await;
        f.store.upsert_chunk(&chunk("1", "a", "first")).await.unwrap();
        f.store.upsert_chunk(&chunk("2", "b", "second")).await.unwrap();
        f.pipeline.run(&options(10)).await.unwrap();

        f.store.delete_chunk("2").await.unwrap();

        let scoped = options(10).with_scope(ChunkScope::Figures(vec!["a".to_string()]));
        f.pipeline.run(&scoped).await.unwrap();
        assert_eq!(f.index.count().await.unwrap(), 2);

        let full = f.pipeline.run(&options(10)).await.unwrap();
        assert_eq!(full.deleted, 1);
        assert_eq!(f.index.list_ids().await.unwrap(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_reingest_overwrites_changed_text() {
        let f = fixture().await;
        f.store.upsert_chunk(&chunk("1", "a", "text A")).await.unwrap();
        f.pipeline.run(&options(10)).await.unwrap();

        f.store.upsert_chunk(&chunk("1", "a", "text B")).await.unwrap();
        let stats = f.pipeline.run(&options(10)).await.unwrap();
        assert_eq!(stats.updated, 1);

        let query = f.pipeline.embedder.embed("text B").await;
        let hits = f
            .index
            .query(&query, &MetadataFilter::figure("a"), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document, "text B");
    }

    /// Same dimension as `WordEmbedder`, but a fixed axis per model
    struct AxisEmbedder {
        name: &'static str,
        axis: usize,
    }

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|_| {
                    let mut v = vec![0.0; DIM];
                    v[self.axis] = 1.0;
                    v
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            DIM
        }

        fn model_name(&self) -> &str {
            self.name
        }
    }

    #[tokio::test]
    async fn test_model_switch_reembeds_at_same_dimension() {
        let f = fixture().await;
        f.store.upsert_chunk(&chunk("1", "a", "Richard III was crowned in 1483.")).await.unwrap();

        let with_model = |name, axis| {
            IngestPipeline::new(
                f.store.clone(),
                f.index.clone(),
                EmbeddingProvider::new(Arc::new(AxisEmbedder { name, axis }), 8),
            )
        };

        let first = with_model("model-a", 0).run(&options(10)).await.unwrap();
        assert_eq!(first.created, 1);

        let model_b = with_model("model-b", 1);
        let switched = model_b.run(&options(10)).await.unwrap();
        assert_eq!(switched.unchanged, 0);
        assert_eq!(switched.updated, 1);

        let query = model_b.embedder.embed("Richard III was crowned in 1483.").await;
        let hits = f
            .index
            .query(&query, &MetadataFilter::figure("a"), 1)
            .await
            .unwrap();
        assert!(hits[0].distance.abs() < 1e-6);
        assert_eq!(hits[0].metadata["embedding_model"], "model-b");

        let again = model_b.run(&options(10)).await.unwrap();
        assert_eq!(again.unchanged, 1);
    }

    /// Drops the run history table, then fails, so recording the failed run fails too
    struct SabotagingIndex {
        store: ContextStore,
    }

    #[async_trait]
    impl VectorIndex for SabotagingIndex {
        fn backend(&self) -> &'static str {
            "sabotaging"
        }
        fn name(&self) -> &str {
            "sabotaging"
        }
        fn dimension(&self) -> usize {
            DIM
        }
        async fn upsert(&self, _: &[String], _: &[Vec<f32>], _: &[String], _: &[Metadata]) -> Result<()> {
            Ok(())
        }
        async fn query(&self, _: &[f32], _: &MetadataFilter, _: usize) -> Result<Vec<IndexMatch>> {
            Ok(Vec::new())
        }
        async fn get(&self, _: &[String]) -> Result<Vec<IndexDocument>> {
            sqlx::query("DROP TABLE ingestion_runs")
                .execute(self.store.pool())
                .await?;
            Err(Error::Index("index went away".to_string()))
        }
        async fn delete(&self, _: &[String]) -> Result<()> {
            Ok(())
        }
        async fn list_ids(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn count(&self) -> Result<usize> {
            Ok(0)
        }
        async fn reset(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pipeline_error_survives_failed_bookkeeping() {
        let f = fixture().await;
        f.store.upsert_chunk(&chunk("1", "a", "text")).await.unwrap();

        let pipeline = IngestPipeline::new(
            f.store.clone(),
            Arc::new(SabotagingIndex {
                store: f.store.clone(),
            }),
            EmbeddingProvider::new(f.embedder.clone(), 8),
        );

        let err = pipeline.run(&options(10)).await.unwrap_err();
        assert!(matches!(err, Error::Index(ref msg) if msg == "index went away"));
    }

    #[tokio::test]
    async fn test_rebuild_resets_collection() {
        let f = fixture().await;
        f.index
            .upsert(
                &["stray".to_string()],
                &[vec![1.0; DIM]],
                &["stray".to_string()],
                &[Metadata::new()],
            )
            .await
            .unwrap();
        f.store.upsert_chunk(&chunk("1", "a", "text")).await.unwrap();

        let stats = f
            .pipeline
            .run(&IngestOptions {
                rebuild: true,
                ..options(10)
            })
            .await
            .unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(f.index.list_ids().await.unwrap(), vec!["1"]);

        let scoped_rebuild = IngestOptions {
            rebuild: true,
            ..options(10).with_scope(ChunkScope::Chunks(vec!["1".to_string()]))
        };
        assert!(f.pipeline.run(&scoped_rebuild).await.is_err());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let store = ContextStore::open(&tmp.path().join("context.db")).await.unwrap();
        let pipeline = IngestPipeline::new(
            store,
            Arc::new(MemoryIndex::new("test", DIM + 1)),
            EmbeddingProvider::new(
                Arc::new(WordEmbedder {
                    calls: AtomicUsize::new(0),
                }),
                8,
            ),
        );

        let err = pipeline.run(&options(10)).await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_serialised() {
        let f = fixture().await;
        for i in 0..20 {
            f.store
                .upsert_chunk(&chunk(&format!("{:02}", i), "a", &format!("entry {}", i)))
                .await
                .unwrap();
        }

        let pipeline = Arc::new(f.pipeline);
        let (opts_a, opts_b) = (options(4), options(4));
        let (a, b) = tokio::join!(pipeline.run(&opts_a), pipeline.run(&opts_b));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.created + b.created, 20);
        assert_eq!(a.unchanged + b.unchanged, 20);
        assert_eq!(f.index.count().await.unwrap(), 20);
    }
}
