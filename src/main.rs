//! chronicler CLI entry point

use chronicler::{
    chat::{Figure, OpenAiChatModel, PersonaChat},
    commands::{
        cmd_chat_once, cmd_chat_repl, cmd_context_add, cmd_context_figures, cmd_context_import,
        cmd_context_list, cmd_context_remove, cmd_ingest, cmd_init, cmd_query, cmd_status,
        print_chat_turn, print_chunks, print_figures, print_ingest_stats, print_init_report,
        print_query_results, print_status, ContextAddOptions, InitOptions,
    },
    config::Config,
    embed::EmbeddingProvider,
    error::{Error, Result},
    ingest::{IngestOptions, IngestPipeline},
    meta::{ChunkScope, ContentType, ContextStore},
    progress::LogWriterFactory,
    retrieve::Retriever,
    store::{open_index, VectorIndex},
};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "chronicler")]
#[command(version, about = "Context retrieval and persona chat for historical figures", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize chronicler configuration, context store and index
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Manage context chunks
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },

    /// Embed context chunks into the vector index
    Ingest {
        /// Only ingest these figures
        #[arg(long, conflicts_with = "chunk")]
        figure: Option<Vec<String>>,

        /// Only ingest these chunk IDs
        #[arg(long)]
        chunk: Option<Vec<String>>,

        /// Re-embed even unchanged chunks
        #[arg(long)]
        force: bool,

        /// Wipe the collection and rebuild it from the context store
        #[arg(long, conflicts_with_all = ["figure", "chunk"])]
        rebuild: bool,

        /// Keep index entries whose chunk no longer exists
        #[arg(long)]
        skip_prune: bool,
    },

    /// Retrieve the closest context for a figure
    Query {
        /// Figure ID (e.g. richard-iii)
        figure: String,

        /// The search query
        query: String,

        /// Maximum number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// Talk to a figure
    Chat {
        /// Figure ID (e.g. anne-boleyn)
        figure: String,

        /// Display name (defaults to the ID in title case)
        #[arg(long)]
        name: Option<String>,

        /// Send one message and exit instead of starting a session
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show system status
    Status,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Manage the vector index collection
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
}

#[derive(Subcommand)]
enum ContextAction {
    /// Add or replace a single chunk
    Add {
        /// Figure ID the chunk belongs to
        figure: String,

        /// Chunk text
        text: String,

        /// Chunk ID (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Source name
        #[arg(long, default_value = "manual")]
        source: String,

        /// Source URL
        #[arg(long)]
        url: Option<String>,

        /// bio, summary, rewrite or link
        #[arg(long = "type", default_value = "bio")]
        content_type: String,

        /// Mark the chunk as manually written
        #[arg(long)]
        manual: bool,
    },

    /// Import chunks from a JSON array file
    Import {
        /// Path to the JSON file
        path: PathBuf,
    },

    /// List chunks
    List {
        /// Only list chunks of this figure
        #[arg(long)]
        figure: Option<String>,
    },

    /// List figures with their chunk counts
    Figures,

    /// Remove a chunk and its index entry
    Remove {
        /// Chunk ID
        id: String,
    },
}

/// Index management actions
#[derive(Subcommand)]
enum DbAction {
    /// Create the collection if it does not exist
    Init,

    /// Show collection status
    Status,

    /// Reset the collection (delete all entries)
    Reset {
        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory::default()))
        .with(filter)
        .init();

    // init does not need an existing config
    if matches!(cli.command, Commands::Init { .. }) {
        return handle_init(cli).await;
    }

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "chronicler", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let store = ContextStore::connect(&config).await?;

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Context { action } => {
            handle_context(&config, &store, action, cli.json).await?;
        }

        Commands::Ingest {
            figure,
            chunk,
            force,
            rebuild,
            skip_prune,
        } => {
            let scope = match (figure, chunk) {
                (Some(figures), _) => ChunkScope::Figures(figures),
                (None, Some(chunks)) => ChunkScope::Chunks(chunks),
                (None, None) => ChunkScope::All,
            };

            let embedder = EmbeddingProvider::from_config(&config.embedding)?;
            let index = open_index(&config, embedder.dimension()).await?;
            let pipeline = IngestPipeline::new(store, index, embedder);

            let mut options = IngestOptions::from_config(&config.ingest).with_scope(scope);
            options.force = force;
            options.rebuild = rebuild;
            options.prune_orphans = options.prune_orphans && !skip_prune;
            options.show_progress = !cli.json;

            let stats = cmd_ingest(&pipeline, &options).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_ingest_stats(&stats);
            }
        }

        Commands::Query {
            figure,
            query,
            top_k,
        } => {
            let retriever = build_retriever(&config).await?;
            let top_k = top_k.unwrap_or(config.query.default_top_k);
            let results = cmd_query(&retriever, &figure, &query, top_k).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_query_results(&results);
            }
        }

        Commands::Chat {
            figure,
            name,
            message,
        } => {
            let retriever = build_retriever(&config).await?;
            let model = Arc::new(OpenAiChatModel::new(&config.chat)?);
            let chat = PersonaChat::new(retriever, model, &config.chat);
            let figure = match name {
                Some(name) => Figure::new(figure, name),
                None => Figure::from_slug(&figure),
            };

            match message {
                Some(message) => {
                    let turn = cmd_chat_once(&chat, &figure, &message).await?;
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&turn)?);
                    } else {
                        print_chat_turn(&figure, &turn, true);
                    }
                }
                None => cmd_chat_repl(&chat, &figure).await?,
            }
        }

        Commands::Status => {
            let index = try_open_index(&config).await;
            let status = cmd_status(&config, &store, index.as_deref()).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }

        Commands::Db { action } => {
            handle_db_action(&config, action, cli.json).await?;
        }
    }

    Ok(())
}

async fn handle_init(cli: Cli) -> Result<()> {
    let Commands::Init { force } = cli.command else {
        unreachable!()
    };

    // A --config path names either the config file or its directory
    let base_dir = match cli.config {
        Some(path) if path.extension().is_some_and(|e| e == "toml") => path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(Config::default_base_dir),
        Some(path) => path,
        None => Config::default_base_dir(),
    };

    let report = cmd_init(InitOptions { base_dir, force }).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_init_report(&report);
    }
    Ok(())
}

async fn handle_context(config: &Config, store: &ContextStore, action: ContextAction, json: bool) -> Result<()> {
    match action {
        ContextAction::Add {
            figure,
            text,
            id,
            source,
            url,
            content_type,
            manual,
        } => {
            let options = ContextAddOptions {
                id,
                figure_id: figure,
                source_name: source,
                source_url: url,
                content_type: content_type.parse::<ContentType>()?,
                text,
                is_manual: manual,
            };
            let chunk = cmd_context_add(store, options).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&chunk)?);
            } else {
                println!("✓ Stored chunk '{}' for {}", chunk.id, chunk.figure_id);
                println!("  Run 'chronicler ingest' to index it.");
            }
        }

        ContextAction::Import { path } => {
            let stats = cmd_context_import(store, &path).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("✓ Imported {} chunks", stats.imported);
                if stats.empty_text > 0 {
                    println!("  {} have empty text and will not be indexed", stats.empty_text);
                }
            }
        }

        ContextAction::List { figure } => {
            let chunks = cmd_context_list(store, figure.as_deref()).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&chunks)?);
            } else {
                print_chunks(&chunks);
            }
        }

        ContextAction::Figures => {
            let figures = cmd_context_figures(store).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&figures)?);
            } else {
                print_figures(&figures);
            }
        }

        ContextAction::Remove { id } => {
            let index = try_open_index(config).await;
            cmd_context_remove(store, index.as_deref(), &id).await?;

            if json {
                println!(r#"{{"status": "ok", "removed": {}}}"#, serde_json::to_string(&id)?);
            } else {
                println!("✓ Chunk '{}' removed", id);
            }
        }
    }

    Ok(())
}

async fn handle_db_action(config: &Config, action: DbAction, json: bool) -> Result<()> {
    let index = open_index(config, config.embedding.resolved_dimension()?).await?;

    match action {
        DbAction::Init => {
            if json {
                println!(r#"{{"status": "ok", "message": "Collection initialized"}}"#);
            } else {
                println!("✓ Collection '{}' initialized", index.name());
            }
        }
        DbAction::Status => {
            let count = index.count().await?;
            if json {
                println!(
                    r#"{{"backend": "{}", "collection": {}, "dimension": {}, "entries": {}}}"#,
                    index.backend(),
                    serde_json::to_string(index.name())?,
                    index.dimension(),
                    count
                );
            } else {
                println!("Collection Status:");
                println!("  Backend: {}", index.backend());
                println!("  Name: {}", index.name());
                println!("  Dimension: {}", index.dimension());
                println!("  Entries: {}", count);
            }
        }
        DbAction::Reset { yes } => {
            if !yes {
                eprintln!("⚠️  This will delete ALL indexed data!");
                eprintln!("Run with --yes to confirm.");
                std::process::exit(1);
            }
            index.reset().await?;
            if json {
                println!(r#"{{"status": "ok", "message": "Collection reset"}}"#);
            } else {
                println!("✓ Collection reset. Run 'chronicler ingest' to repopulate it.");
            }
        }
    }

    Ok(())
}

async fn build_retriever(config: &Config) -> Result<Retriever> {
    let embedder = EmbeddingProvider::from_config(&config.embedding)?;
    let index = open_index(config, embedder.dimension()).await?;
    Ok(Retriever::new(embedder, index, &config.query))
}

/// Open the index for commands that can run without it
async fn try_open_index(config: &Config) -> Option<Arc<dyn VectorIndex>> {
    let dimension = match config.embedding.resolved_dimension() {
        Ok(dimension) => dimension,
        Err(e) => {
            warn!("{}", e);
            return None;
        }
    };
    match open_index(config, dimension).await {
        Ok(index) => Some(index),
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        eprintln!(
            "Config file not found: {}\nRun 'chronicler init' first.",
            config_path.display()
        );
        return Err(Error::NotInitialized);
    }

    Config::load(&config_path)
}
