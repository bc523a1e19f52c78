//! Query command implementation

use crate::commands::preview;
use crate::error::Result;
use crate::retrieve::{RetrievalResult, Retriever};
use serde::Serialize;

/// Query result for CLI display
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub figure_id: String,
    pub results: Vec<RetrievalResult>,
}

pub async fn cmd_query(retriever: &Retriever, figure_id: &str, query: &str, top_k: usize) -> Result<QueryResult> {
    let results = retriever.search(query, figure_id, top_k).await?;
    Ok(QueryResult {
        query: query.to_string(),
        figure_id: figure_id.to_string(),
        results,
    })
}

/// Print query results to console
pub fn print_query_results(result: &QueryResult) {
    println!("\n🔍 {} ← {}\n", result.figure_id, result.query);

    if result.results.is_empty() {
        println!("No matching context.");
        return;
    }

    for (i, r) in result.results.iter().enumerate() {
        let source = r
            .metadata
            .get("source_url")
            .or_else(|| r.metadata.get("source_name"))
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        println!("{}. [distance: {:.3}] {} ({})", i + 1, r.distance, r.id, source);
        println!("   {}\n", preview(&r.content, 200));
    }
}
