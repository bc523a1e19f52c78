//! Ingest command implementation

use crate::error::Result;
use crate::ingest::{IngestOptions, IngestPipeline, IngestStats};

pub async fn cmd_ingest(pipeline: &IngestPipeline, options: &IngestOptions) -> Result<IngestStats> {
    pipeline.run(options).await
}

pub fn print_ingest_stats(stats: &IngestStats) {
    println!("\n✓ Ingestion complete");
    println!("  Chunks seen: {}", stats.seen);
    println!("  Created: {}", stats.created);
    println!("  Updated: {}", stats.updated);
    println!("  Unchanged: {}", stats.unchanged);
    println!("  Empty (skipped): {}", stats.skipped_empty);
    println!("  Deleted: {}", stats.deleted);
    if stats.failed > 0 {
        println!("  Failed: {}", stats.failed);
        for error in &stats.errors {
            println!("    - {}", error);
        }
    }
}
