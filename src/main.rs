#![allow(clippy::multiple_crate_versions)]

use std::sync::Arc;

use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use tracing_subscriber::EnvFilter;

use ingestd_runtime::config::RuntimeConfig;
use ingestd_runtime::pipeline::stages::{
    HttpEmbeddingModel, LocalFileSource, PlainTextExtractor, SlidingWindowChunker,
};
use ingestd_runtime::pipeline::PipelineCollaborators;
use ingestd_runtime::vector::{QdrantVectorStore, VectorStore};
use ingestd_runtime::{api, IngestRuntime};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("ingestd")
        .version(VERSION)
        .about("Durable document ingestion runtime for a RAG index")
        .subcommand(
            Command::new("serve")
                .about("Start the ingestion workers and the HTTP API")
                .arg(
                    Arg::new("workers")
                        .short('w')
                        .long("workers")
                        .value_name("COUNT")
                        .help("Number of concurrent worker loops")
                        .default_value("4"),
                )
                .arg(
                    Arg::new("file-root")
                        .long("file-root")
                        .value_name("DIR")
                        .help("Directory served as the uploaded-file source")
                        .default_value("./data"),
                )
                .arg(
                    Arg::new("embedding-url")
                        .long("embedding-url")
                        .value_name("URL")
                        .help("Base URL of the embedding API")
                        .default_value("http://localhost:9000/v1"),
                )
                .arg(
                    Arg::new("embedding-model")
                        .long("embedding-model")
                        .value_name("MODEL")
                        .help("Embedding model name")
                        .default_value("text-embedding-3-small"),
                )
                .arg(
                    Arg::new("skip-vector-init")
                        .long("skip-vector-init")
                        .action(ArgAction::SetTrue)
                        .help("Do not create the vector collection on startup"),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration"))
        .get_matches();

    match matches.subcommand() {
        Some(("serve", sub)) => serve(sub).await,
        Some(("config", _)) => {
            let config = RuntimeConfig::from_env().context("loading configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        _ => {
            eprintln!("No command given; try `ingestd serve`.");
            std::process::exit(2);
        }
    }
}

async fn serve(matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let config = RuntimeConfig::from_env().context("loading configuration")?;
    let workers: usize = matches
        .get_one::<String>("workers")
        .map(|raw| raw.parse())
        .transpose()
        .context("parsing --workers")?
        .unwrap_or(4);

    let file_root = matches
        .get_one::<String>("file-root")
        .cloned()
        .unwrap_or_else(|| "./data".to_string());
    let embedding_url = matches
        .get_one::<String>("embedding-url")
        .cloned()
        .unwrap_or_default();
    let embedding_model = matches
        .get_one::<String>("embedding-model")
        .cloned()
        .unwrap_or_default();

    let vector_store = Arc::new(QdrantVectorStore::new(config.vector.clone()));
    if !matches.get_flag("skip-vector-init") {
        vector_store
            .initialize()
            .await
            .context("initializing the vector collection")?;
    }

    let collaborators = PipelineCollaborators {
        file_source: Arc::new(LocalFileSource::new(file_root)),
        extractor: Arc::new(PlainTextExtractor),
        ocr: None,
        chunker: Arc::new(SlidingWindowChunker),
        embedder: Arc::new(HttpEmbeddingModel::new(
            embedding_url,
            std::env::var("EMBEDDING_API_KEY").ok(),
            embedding_model,
        )),
    };

    let vector_store: Arc<dyn VectorStore> = vector_store;
    let runtime = IngestRuntime::new(config.clone(), collaborators, vector_store);
    runtime.start_workers(workers);
    tracing::info!("Started {} ingestion workers", workers);

    let serve_result = api::serve(runtime.clone(), &config.api.bind_addr).await;
    runtime.shutdown().await;
    serve_result.context("HTTP server error")
}
