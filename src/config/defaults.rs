//! Default values for configuration

/// Default: use the local embedding model
pub fn default_use_openai() -> bool {
    false
}

/// Default local embedding model (all-MiniLM-L6-v2, 384 dims)
pub fn default_local_model() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".to_string()
}

/// Default remote embedding model
pub fn default_openai_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

/// Default environment variable holding the OpenAI API key
pub fn default_openai_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// Default OpenAI-compatible API base URL
pub fn default_openai_base_url() -> String {
    std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1/".to_string())
}

/// Default batch size for embedding
pub fn default_embedding_batch_size() -> usize {
    32
}

/// Default HTTP timeout for remote backends in seconds
pub fn default_http_timeout() -> u64 {
    30
}

/// Default retries for transient remote failures
pub fn default_max_retries() -> usize {
    2
}

/// Default vector index backend
pub fn default_index_backend() -> String {
    "sqlite".to_string()
}

/// Prefix of the per-backend default collection name
pub fn default_collection_prefix() -> &'static str {
    "figure_contexts"
}

/// Default Qdrant gRPC URL for local development (port 6334, not 6333 REST)
pub fn default_qdrant_url() -> String {
    std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://127.0.0.1:6334".to_string())
}

/// Default environment variable name for Qdrant API key
pub fn default_qdrant_api_key_env() -> String {
    "QDRANT_API_KEY".to_string()
}

/// Default page size for ingestion
pub fn default_ingest_batch_size() -> usize {
    64
}

/// Default: prune orphaned index entries on full runs
pub fn default_prune_orphans() -> bool {
    true
}

/// Default number of query results
pub fn default_top_k() -> usize {
    5
}

/// Default maximum query results
pub fn default_max_top_k() -> usize {
    50
}

/// Default chat completion model
pub fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Default sampling temperature
pub fn default_chat_temperature() -> f32 {
    0.7
}

/// Default persona prompt template
pub fn default_persona_template() -> String {
    "You are {name}. Answer as this historical figure.".to_string()
}

/// Default number of context passages injected per chat turn
pub fn default_context_top_k() -> usize {
    5
}
