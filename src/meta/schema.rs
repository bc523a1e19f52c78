//! SQLite schema definition

/// SQL schema for the context store database
pub const SCHEMA_SQL: &str = r#"
-- Context chunks: the raw corpus to be indexed
CREATE TABLE IF NOT EXISTS context_chunks (
    id TEXT PRIMARY KEY,
    figure_id TEXT NOT NULL,
    source_name TEXT NOT NULL,
    source_url TEXT,
    content_type TEXT NOT NULL,
    text TEXT NOT NULL,
    is_manual INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Ingestion runs: tracking history
CREATE TABLE IF NOT EXISTS ingestion_runs (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    chunks_seen INTEGER DEFAULT 0,
    chunks_indexed INTEGER DEFAULT 0,
    chunks_unchanged INTEGER DEFAULT 0,
    chunks_failed INTEGER DEFAULT 0,
    chunks_deleted INTEGER DEFAULT 0,
    errors_json TEXT
);

-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_chunks_figure ON context_chunks(figure_id);
CREATE INDEX IF NOT EXISTS idx_runs_started ON ingestion_runs(started_at);
"#;
