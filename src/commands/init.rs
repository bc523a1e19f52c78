//! Init command implementation

use crate::config::{Config, IndexBackendKind};
use crate::error::{Error, Result};
use crate::meta::ContextStore;
use crate::store::open_index;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub base_dir: PathBuf,
    pub force: bool,
}

/// What `init` created
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub index_backend: String,
    pub collection: String,
    pub index_ready: bool,
}

/// Write a default config, create the context store, and open the index
pub async fn cmd_init(options: InitOptions) -> Result<InitReport> {
    let config = Config::with_base_dir(options.base_dir);

    if config.paths.config_file.exists() && !options.force {
        return Err(Error::Config(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config.paths.config_file.display()
        )));
    }

    config.validate()?;
    config.save()?;

    let store = ContextStore::connect(&config).await?;
    store.init_schema().await?;
    info!("Created context store at {:?}", config.paths.db_file);

    let dimension = config.embedding.resolved_dimension()?;
    let index_ready = match open_index(&config, dimension).await {
        Ok(index) => {
            info!("Collection '{}' ready", index.name());
            true
        }
        Err(e) if config.index.backend_kind()? == IndexBackendKind::Qdrant => {
            warn!(
                "Could not reach Qdrant at {}: {}. Make sure Qdrant is running.",
                config.index.qdrant_url, e
            );
            false
        }
        Err(e) => return Err(e),
    };

    Ok(InitReport {
        config_path: config.paths.config_file.clone(),
        db_path: config.paths.db_file.clone(),
        index_backend: config.index.backend.clone(),
        collection: config.collection_name(),
        index_ready,
    })
}

pub fn print_init_report(report: &InitReport) {
    println!("✓ chronicler initialized");
    println!("  Config: {}", report.config_path.display());
    println!("  Context store: {}", report.db_path.display());
    println!(
        "  Index: {} collection '{}'{}",
        report.index_backend,
        report.collection,
        if report.index_ready { "" } else { " (not reachable yet)" }
    );
    println!("\nNext steps:");
    println!("  chronicler context import chunks.json         # Load context passages");
    println!("  chronicler ingest                             # Embed and index them");
    println!("  chronicler query richard-iii \"How did you die?\"");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_creates_files_and_refuses_overwrite() {
        let tmp = TempDir::new().unwrap();
        let options = InitOptions {
            base_dir: tmp.path().to_path_buf(),
            force: false,
        };

        let report = cmd_init(options.clone()).await.unwrap();
        assert!(report.config_path.exists());
        assert!(report.db_path.exists());
        assert!(tmp.path().join("vectors.db").exists());
        assert!(report.index_ready);

        assert!(cmd_init(options.clone()).await.is_err());
        assert!(cmd_init(InitOptions {
            force: true,
            ..options
        })
        .await
        .is_ok());
    }
}
