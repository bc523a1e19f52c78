//! Context store using SQLite
//!
//! This module holds the corpus the vector index is built from:
//! - Context chunks (per-figure text with source metadata)
//! - Ingestion runs (history and stats)

mod schema;

pub use schema::*;

use crate::config::Config;
use crate::db;
use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Kind of text a chunk holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Bio,
    Summary,
    Rewrite,
    Link,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Bio => write!(f, "bio"),
            ContentType::Summary => write!(f, "summary"),
            ContentType::Rewrite => write!(f, "rewrite"),
            ContentType::Link => write!(f, "link"),
        }
    }
}

impl FromStr for ContentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "bio" => Ok(ContentType::Bio),
            "summary" => Ok(ContentType::Summary),
            "rewrite" => Ok(ContentType::Rewrite),
            "link" => Ok(ContentType::Link),
            _ => Err(Error::InvalidArgument(format!(
                "Unknown content type: {} (expected bio, summary, rewrite or link)",
                s
            ))),
        }
    }
}

/// Ingestion run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(Error::Config(format!("Unknown run status: {}", s))),
        }
    }
}

/// A unit of source text belonging to one figure
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ContextChunk {
    pub id: String,
    pub figure_id: String,
    pub source_name: String,
    pub source_url: Option<String>,
    pub content_type: String,
    pub text: String,
    pub is_manual: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Stable id for a chunk supplied without one: blake3 of figure and text
pub fn derived_chunk_id(figure_id: &str, text: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(figure_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(text.as_bytes());
    hasher.finalize().to_hex().as_str()[..32].to_string()
}

impl ContextChunk {
    /// Create a chunk; a blank `id` is derived from the figure and text, so
    /// adding the same passage twice replaces rather than duplicates it
    pub fn new(
        id: impl Into<String>,
        figure_id: impl Into<String>,
        source_name: impl Into<String>,
        content_type: ContentType,
        text: impl Into<String>,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        let figure_id = figure_id.into();
        let text = text.into();
        let mut id = id.into();
        if id.trim().is_empty() {
            id = derived_chunk_id(&figure_id, &text);
        }
        Self {
            id,
            figure_id,
            source_name: source_name.into(),
            source_url: None,
            content_type: content_type.to_string(),
            text,
            is_manual: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn manual(mut self, is_manual: bool) -> Self {
        self.is_manual = is_manual;
        self
    }

    pub fn get_content_type(&self) -> Result<ContentType> {
        self.content_type.parse()
    }

    /// True when there is nothing to index
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// blake3 hash of the text, used to detect changes between runs
    pub fn content_hash(&self) -> String {
        blake3::hash(self.text.as_bytes()).to_hex().to_string()
    }
}

/// Which chunks an operation covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChunkScope {
    #[default]
    All,
    Figures(Vec<String>),
    Chunks(Vec<String>),
}

impl ChunkScope {
    pub fn is_all(&self) -> bool {
        matches!(self, ChunkScope::All)
    }
}

impl std::fmt::Display for ChunkScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkScope::All => write!(f, "all"),
            ChunkScope::Figures(ids) => write!(f, "figures:{}", ids.join(",")),
            ChunkScope::Chunks(ids) => write!(f, "chunks:{}", ids.join(",")),
        }
    }
}

/// Counters recorded when a run finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub seen: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub deleted: usize,
}

/// An ingestion run record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: String,
    pub scope: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub chunks_seen: i64,
    pub chunks_indexed: i64,
    pub chunks_unchanged: i64,
    pub chunks_failed: i64,
    pub chunks_deleted: i64,
    pub errors_json: Option<String>,
}

impl IngestionRun {
    pub fn new(scope: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            scope,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
            status: RunStatus::Running.to_string(),
            chunks_seen: 0,
            chunks_indexed: 0,
            chunks_unchanged: 0,
            chunks_failed: 0,
            chunks_deleted: 0,
            errors_json: None,
        }
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors_json
            .as_ref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or_default()
    }
}

/// Per-figure chunk count
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FigureSummary {
    pub figure_id: String,
    pub chunk_count: i64,
}

/// Context store handle
#[derive(Clone)]
pub struct ContextStore {
    pool: SqlitePool,
}

impl ContextStore {
    /// Connect to the context database named by the config
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::open(&config.paths.db_file).await
    }

    /// Open the database at `path`, creating the schema if needed
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        let store = Self { pool };

        if !store.is_initialized().await? {
            store.init_schema().await?;
        }

        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing context store schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='context_chunks'",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(result.is_some())
    }

    /// Drop all chunks and run history
    pub async fn reset(&self) -> Result<()> {
        sqlx::query("DELETE FROM context_chunks")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM ingestion_runs")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== Chunk Operations =====

    /// Insert a chunk or replace the one with the same id
    pub async fn upsert_chunk(&self, chunk: &ContextChunk) -> Result<()> {
        chunk.get_content_type()?;
        if chunk.figure_id.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "figure_id must not be empty".to_string(),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO context_chunks (id, figure_id, source_name, source_url, content_type, text, is_manual, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                figure_id = excluded.figure_id,
                source_name = excluded.source_name,
                source_url = excluded.source_url,
                content_type = excluded.content_type,
                text = excluded.text,
                is_manual = excluded.is_manual,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.figure_id)
        .bind(&chunk.source_name)
        .bind(&chunk.source_url)
        .bind(&chunk.content_type)
        .bind(&chunk.text)
        .bind(chunk.is_manual)
        .bind(&chunk.created_at)
        .bind(&chunk.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(id = %chunk.id, figure = %chunk.figure_id, "Stored context chunk");
        Ok(())
    }

    /// Get chunk by ID
    pub async fn get_chunk(&self, id: &str) -> Result<Option<ContextChunk>> {
        let chunk = sqlx::query_as::<_, ContextChunk>("SELECT * FROM context_chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(chunk)
    }

    /// Delete a chunk, returning whether it existed
    pub async fn delete_chunk(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM context_chunks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List chunks, optionally for one figure
    pub async fn list_chunks(&self, figure_id: Option<&str>) -> Result<Vec<ContextChunk>> {
        let chunks = match figure_id {
            Some(figure) => {
                sqlx::query_as::<_, ContextChunk>(
                    "SELECT * FROM context_chunks WHERE figure_id = ? ORDER BY id",
                )
                .bind(figure)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ContextChunk>("SELECT * FROM context_chunks ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(chunks)
    }

    /// One page of chunks in id order, strictly after `after_id`
    pub async fn list_chunks_page(
        &self,
        scope: &ChunkScope,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ContextChunk>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM context_chunks WHERE 1 = 1");

        match scope {
            ChunkScope::All => {}
            ChunkScope::Figures(ids) | ChunkScope::Chunks(ids) => {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let column = if matches!(scope, ChunkScope::Figures(_)) {
                    "figure_id"
                } else {
                    "id"
                };
                qb.push(format!(" AND {} IN (", column));
                let mut separated = qb.separated(", ");
                for id in ids {
                    separated.push_bind(id);
                }
                separated.push_unseparated(")");
            }
        }

        if let Some(after) = after_id {
            qb.push(" AND id > ");
            qb.push_bind(after);
        }

        qb.push(" ORDER BY id LIMIT ");
        qb.push_bind(limit as i64);

        let chunks = qb
            .build_query_as::<ContextChunk>()
            .fetch_all(&self.pool)
            .await?;
        Ok(chunks)
    }

    /// Count chunks, optionally for one figure
    pub async fn count_chunks(&self, figure_id: Option<&str>) -> Result<usize> {
        let count: i64 = match figure_id {
            Some(figure) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM context_chunks WHERE figure_id = ?")
                    .bind(figure)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM context_chunks")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as usize)
    }

    /// List all chunk IDs (for orphan detection)
    pub async fn list_all_chunk_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM context_chunks ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Figures with their chunk counts
    pub async fn list_figures(&self) -> Result<Vec<FigureSummary>> {
        let figures = sqlx::query_as::<_, FigureSummary>(
            r#"
            SELECT figure_id, COUNT(*) AS chunk_count
            FROM context_chunks
            GROUP BY figure_id
            ORDER BY figure_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(figures)
    }

    // ===== Ingestion Run Operations =====

    /// Start a new ingestion run
    pub async fn start_ingestion_run(&self, scope: &ChunkScope) -> Result<IngestionRun> {
        let run = IngestionRun::new(scope.to_string());
        sqlx::query(
            r#"
            INSERT INTO ingestion_runs (id, scope, started_at, status)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.scope)
        .bind(&run.started_at)
        .bind(&run.status)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    /// Complete an ingestion run
    pub async fn complete_ingestion_run(
        &self,
        id: &str,
        status: RunStatus,
        counters: RunCounters,
        errors: &[String],
    ) -> Result<()> {
        let errors_json = if errors.is_empty() {
            None
        } else {
            Some(serde_json::to_string(errors)?)
        };

        sqlx::query(
            r#"
            UPDATE ingestion_runs SET
                completed_at = ?,
                status = ?,
                chunks_seen = ?,
                chunks_indexed = ?,
                chunks_unchanged = ?,
                chunks_failed = ?,
                chunks_deleted = ?,
                errors_json = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(status.to_string())
        .bind(counters.seen as i64)
        .bind(counters.indexed as i64)
        .bind(counters.unchanged as i64)
        .bind(counters.failed as i64)
        .bind(counters.deleted as i64)
        .bind(errors_json)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get the most recent ingestion run
    pub async fn get_latest_run(&self) -> Result<Option<IngestionRun>> {
        let run = sqlx::query_as::<_, IngestionRun>(
            "SELECT * FROM ingestion_runs ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_db() -> (ContextStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.db_file = tmp.path().join("test.db");

        let db = ContextStore::connect(&config).await.unwrap();
        (db, tmp)
    }

    fn chunk(id: &str, figure: &str, text: &str) -> ContextChunk {
        ContextChunk::new(id, figure, "Wikipedia", ContentType::Bio, text)
    }

    #[test]
    fn test_content_type_parse() {
        assert_eq!("Summary".parse::<ContentType>().unwrap(), ContentType::Summary);
        assert_eq!(ContentType::Link.to_string(), "link");
        assert!("essay".parse::<ContentType>().is_err());
    }

    #[test]
    fn test_blank_id_is_derived_from_figure_and_text() {
        let c = ContextChunk::new("  ", "richard-iii", "manual", ContentType::Bio, "x");
        let again = ContextChunk::new("", "richard-iii", "import", ContentType::Summary, "x");
        assert_eq!(c.id.len(), 32);
        assert_eq!(c.id, again.id);
        assert_eq!(c.id, derived_chunk_id("richard-iii", "x"));

        let other_figure = ContextChunk::new("", "anne-boleyn", "manual", ContentType::Bio, "x");
        assert_ne!(c.id, other_figure.id);
        assert_eq!(ContextChunk::new("7", "richard-iii", "manual", ContentType::Bio, "x").id, "7");
    }

    #[test]
    fn test_content_hash_tracks_text() {
        let a = chunk("1", "richard-iii", "Richard III was crowned in 1483.");
        let mut b = a.clone();
        assert_eq!(a.content_hash(), b.content_hash());
        b.text.push('!');
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[tokio::test]
    async fn test_chunk_crud() {
        let (db, _tmp) = setup_test_db().await;

        let c = chunk("1", "richard-iii", "Richard III died at Bosworth Field in 1485.")
            .with_source_url("https://en.wikipedia.org/wiki/Richard_III_of_England")
            .manual(true);
        db.upsert_chunk(&c).await.unwrap();

        let loaded = db.get_chunk("1").await.unwrap().unwrap();
        assert_eq!(loaded, c);

        let mut updated = c.clone();
        updated.text = "Richard III was crowned in 1483.".to_string();
        db.upsert_chunk(&updated).await.unwrap();
        assert_eq!(db.count_chunks(None).await.unwrap(), 1);
        assert_eq!(
            db.get_chunk("1").await.unwrap().unwrap().text,
            "Richard III was crowned in 1483."
        );

        assert!(db.delete_chunk("1").await.unwrap());
        assert!(!db.delete_chunk("1").await.unwrap());
        assert!(db.get_chunk("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_rejects_bad_chunks() {
        let (db, _tmp) = setup_test_db().await;

        let mut bad_type = chunk("1", "richard-iii", "text");
        bad_type.content_type = "essay".to_string();
        assert!(db.upsert_chunk(&bad_type).await.is_err());

        assert!(db.upsert_chunk(&chunk("2", " ", "text")).await.is_err());
    }

    #[tokio::test]
    async fn test_pagination_and_scope() {
        let (db, _tmp) = setup_test_db().await;
        for i in 0..5 {
            db.upsert_chunk(&chunk(&format!("a{}", i), "a", "text"))
                .await
                .unwrap();
        }
        db.upsert_chunk(&chunk("b0", "b", "text")).await.unwrap();

        let first = db.list_chunks_page(&ChunkScope::All, None, 4).await.unwrap();
        assert_eq!(first.len(), 4);
        let rest = db
            .list_chunks_page(&ChunkScope::All, Some(&first[3].id), 4)
            .await
            .unwrap();
        let ids: Vec<&str> = rest.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a4", "b0"]);

        let only_b = db
            .list_chunks_page(&ChunkScope::Figures(vec!["b".to_string()]), None, 10)
            .await
            .unwrap();
        assert_eq!(only_b.len(), 1);

        let picked = db
            .list_chunks_page(
                &ChunkScope::Chunks(vec!["a1".to_string(), "b0".to_string()]),
                None,
                10,
            )
            .await
            .unwrap();
        assert_eq!(picked.len(), 2);

        let figures = db.list_figures().await.unwrap();
        assert_eq!(figures.len(), 2);
        assert_eq!(figures[0].figure_id, "a");
        assert_eq!(figures[0].chunk_count, 5);
    }

    #[tokio::test]
    async fn test_ingestion_run_lifecycle() {
        let (db, _tmp) = setup_test_db().await;

        let run = db.start_ingestion_run(&ChunkScope::All).await.unwrap();
        assert_eq!(run.status, "running");

        let counters = RunCounters {
            seen: 3,
            indexed: 2,
            failed: 1,
            ..RunCounters::default()
        };
        db.complete_ingestion_run(&run.id, RunStatus::Completed, counters, &["3: boom".to_string()])
            .await
            .unwrap();

        let latest = db.get_latest_run().await.unwrap().unwrap();
        assert_eq!(latest.id, run.id);
        assert_eq!(latest.status.parse::<RunStatus>().unwrap(), RunStatus::Completed);
        assert_eq!(latest.chunks_indexed, 2);
        assert_eq!(latest.errors(), vec!["3: boom".to_string()]);
    }
}
