use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use medrag_core::config::{
    EMBEDDING_KEY_ENV, GENERATION_KEY_ENV, PARSING_KEY_ENV, RERANK_KEY_ENV,
};
use medrag_core::{ingest_folder, QueryRequest, RagPipeline, RagSettings, ServiceConfig};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "medrag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    services: ServiceArgs,

    /// Optional settings file (toml, yaml or json) overriding pipeline policy.
    #[arg(long, env = "MEDRAG_SETTINGS")]
    settings: Option<String>,
}

#[derive(Args)]
struct ServiceArgs {
    /// Embedding service credential.
    #[arg(long, env = EMBEDDING_KEY_ENV, hide_env_values = true)]
    embedding_api_key: Option<String>,

    /// Document parsing credential; without it PDFs are read locally.
    #[arg(long, env = PARSING_KEY_ENV, hide_env_values = true)]
    parsing_api_key: Option<String>,

    /// Chat completion credential, defaults to the embedding credential.
    #[arg(long, env = GENERATION_KEY_ENV, hide_env_values = true)]
    generation_api_key: Option<String>,

    /// Rerank credential, defaults to the embedding credential.
    #[arg(long, env = RERANK_KEY_ENV, hide_env_values = true)]
    rerank_api_key: Option<String>,

    /// Base URL of the embedding, rerank and chat endpoints.
    #[arg(long, env = "INFERENCE_BASE_URL", default_value = "https://api.together.xyz/v1")]
    inference_base_url: String,

    /// Base URL of the document parsing service.
    #[arg(
        long,
        env = "PARSING_BASE_URL",
        default_value = "https://api.cloud.llamaindex.ai/api/parsing"
    )]
    parsing_base_url: String,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = "BAAI/bge-large-en-v1.5")]
    embedding_model: String,

    /// Local tokenizer.json of the embedding model; fetched from the hub when unset.
    #[arg(long, env = "EMBEDDING_TOKENIZER")]
    embedding_tokenizer: Option<PathBuf>,

    #[arg(long, env = "RERANK_MODEL", default_value = "Salesforce/Llama-Rank-v1")]
    rerank_model: String,

    #[arg(
        long,
        env = "CHAT_MODEL",
        default_value = "meta-llama/Llama-3.1-8B-Instruct-Turbo"
    )]
    chat_model: String,

    /// Directory of the local vector store.
    #[arg(long, env = "VECTOR_DB_PATH", default_value = "./vector_db")]
    store_path: PathBuf,

    /// Vector collection name.
    #[arg(long, env = "VECTOR_COLLECTION", default_value = "medical_rag")]
    collection: String,

    /// Qdrant base URL; replaces the local store when set.
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: Option<String>,
}

impl From<ServiceArgs> for ServiceConfig {
    fn from(args: ServiceArgs) -> Self {
        Self {
            embedding_api_key: args.embedding_api_key,
            parsing_api_key: args.parsing_api_key,
            generation_api_key: args.generation_api_key,
            rerank_api_key: args.rerank_api_key,
            inference_base_url: args.inference_base_url,
            parsing_base_url: args.parsing_base_url,
            embedding_model: args.embedding_model,
            embedding_tokenizer: args.embedding_tokenizer,
            rerank_model: args.rerank_model,
            chat_model: args.chat_model,
            store_path: args.store_path,
            collection: args.collection,
            qdrant_url: args.qdrant_url,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one PDF or every PDF under a folder.
    Ingest {
        /// Single PDF to ingest.
        #[arg(long, conflicts_with = "folder", required_unless_present = "folder")]
        file: Option<PathBuf>,
        /// Folder that contains PDFs recursively.
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Answer a question from the indexed collection.
    Query {
        #[arg(long)]
        question: String,
        /// Number of contexts to return.
        #[arg(long)]
        top_k: Option<usize>,
        /// Leave retrieved contexts and citations out of the output.
        #[arg(long)]
        no_context: bool,
    },
    /// Report the vector count of the collection.
    Stats,
    /// Report whether every required credential is present.
    Ready,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let services = ServiceConfig::from(cli.services);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "medrag boot"
    );

    if let Command::Ready = cli.command {
        let missing = services.missing_credentials();
        print_json(&json!({ "ready": missing.is_empty(), "missing_env": missing }))?;
        return Ok(());
    }

    let settings = RagSettings::load(cli.settings.as_deref()).context("loading settings")?;
    let pipeline = RagPipeline::from_config(settings, &services)
        .await
        .context("building pipeline")?;

    match cli.command {
        Command::Ingest { file, folder } => match (file, folder) {
            (Some(file), _) => {
                let report = pipeline
                    .ingest(&file)
                    .await
                    .with_context(|| format!("ingesting {}", file.display()))?;
                print_json(&report)?;
            }
            (None, Some(folder)) => {
                let report = ingest_folder(&pipeline, &folder).await?;
                if !report.skipped_files.is_empty() {
                    warn!(
                        skipped = report.skipped_files.len(),
                        folder = %folder.display(),
                        "some files were skipped"
                    );
                }
                print_json(&report)?;
            }
            (None, None) => bail!("either --file or --folder is required"),
        },
        Command::Query {
            question,
            top_k,
            no_context,
        } => {
            let request = query_request(question, top_k, no_context, pipeline.settings());
            let response = pipeline.query(&request).await;
            print_json(&response)?;
        }
        Command::Stats => {
            let stats = pipeline.stats().await?;
            print_json(&stats)?;
        }
        Command::Ready => {}
    }

    Ok(())
}

fn query_request(
    question: String,
    top_k: Option<usize>,
    no_context: bool,
    settings: &RagSettings,
) -> QueryRequest {
    QueryRequest {
        question,
        top_k: top_k.unwrap_or(settings.default_top_k),
        include_context: !no_context,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_query(args: &[&str]) -> QueryRequest {
        let cli = Cli::try_parse_from(args).expect("arguments parse");
        let Command::Query {
            question,
            top_k,
            no_context,
        } = cli.command
        else {
            panic!("expected the query command");
        };
        query_request(question, top_k, no_context, &RagSettings::default())
    }

    #[test]
    fn query_includes_context_by_default() {
        let request = parse_query(&["medrag", "query", "--question", "what is angina"]);

        assert!(request.include_context);
        assert_eq!(request.top_k, 5);
    }

    #[test]
    fn no_context_flag_drops_contexts() {
        let request = parse_query(&[
            "medrag",
            "query",
            "--question",
            "what is angina",
            "--top-k",
            "3",
            "--no-context",
        ]);

        assert!(!request.include_context);
        assert_eq!(request.top_k, 3);
    }
}
