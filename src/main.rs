use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli_args::{Args, Command, Generate, Ingest, Retrieve};
use local_rag::{
    ingest::{BertEmbedder, BertEmbedderConfig, PreProcessor, WeaviateDocumentStore},
    utils::{setup_logging, LogConfig},
    EmbeddingRetriever, GenerationRequest, IngestionPipeline, InvocationError,
    LocalModelInvocationLayer,
};
use tracing::{error, info, Level};

mod cli_args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_config = LogConfig {
        level: if args.verbose { Level::DEBUG } else { Level::INFO },
        file_path: args.log_file.clone(),
        ..Default::default()
    };
    if let Err(e) = setup_logging(log_config) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let result = match args.command {
        Command::Ingest(args) => ingest(*args).await,
        Command::Retrieve(args) => retrieve(*args).await,
        Command::Generate(args) => tokio::task::spawn_blocking(move || generate(*args))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|result| result),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let caller_error = err
                .downcast_ref::<InvocationError>()
                .is_some_and(InvocationError::is_caller_error);
            // usage errors share clap's exit code
            ExitCode::from(if caller_error { 2 } else { 1 })
        }
    }
}

async fn load_embedder(config: BertEmbedderConfig) -> anyhow::Result<BertEmbedder> {
    let path = config.model_path.clone();
    tokio::task::spawn_blocking(move || BertEmbedder::load(&config))
        .await?
        .with_context(|| format!("failed to load embedding model from {}", path.display()))
}

async fn ingest(args: Ingest) -> anyhow::Result<()> {
    let config = args.ingest_config()?;

    let embedder = load_embedder(config.embedder.clone()).await?;
    let store = WeaviateDocumentStore::connect(config.store.clone())
        .await
        .with_context(|| format!("failed to connect to {}", config.store.base_url()))?;

    let pipeline = IngestionPipeline::new(
        PreProcessor::new(config.preprocessor.clone())?,
        Arc::new(store),
        Arc::new(embedder),
    )?
    .update_existing(config.update_existing_embeddings);

    let report = pipeline.run(&args.paths).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn retrieve(args: Retrieve) -> anyhow::Result<()> {
    let config = args.store.load_config()?;

    let embedder = load_embedder(config.embedder.clone()).await?;
    let store = WeaviateDocumentStore::connect(config.store.clone()).await?;
    let retriever = EmbeddingRetriever::new(Arc::new(store), Arc::new(embedder), args.top_k)?;

    for document in retriever.retrieve(&args.query).await? {
        println!(
            "[{:.4}] {} {}",
            document.score.unwrap_or_default(),
            document.file_path().unwrap_or("-"),
            document.content.replace('\n', " ")
        );
    }
    Ok(())
}

fn generate(args: Generate) -> anyhow::Result<()> {
    let prompt = match (&args.prompt, &args.prompt_file) {
        (Some(prompt), _) => prompt.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("could not read prompt file {}", path.display()))?,
        (None, None) => return Err(InvocationError::MissingPromptError.into()),
    };

    let mut layer = LocalModelInvocationLayer::load(args.model_config())?;
    info!(model = %args.model, "Model loaded");

    let request = GenerationRequest::new(prompt)
        .with_params(args.generation_params())
        .streaming(args.stream);

    let mut stdout = std::io::stdout().lock();
    // the first failed write stops further printing and is reported once generation ends
    let mut write_error = None;
    let texts = layer.invoke_with_handler(request, |fragment| {
        if write_error.is_none() {
            if let Err(e) = print_fragment(&mut stdout, fragment) {
                write_error = Some(e);
            }
        }
    })?;
    if let Some(e) = write_error {
        return Err(e).context("failed to write the completion to stdout");
    }

    if args.stream {
        writeln!(stdout)?;
    } else {
        for text in texts {
            writeln!(stdout, "{text}")?;
        }
    }
    Ok(())
}

fn print_fragment(out: &mut impl Write, fragment: &str) -> std::io::Result<()> {
    write!(out, "{fragment}")?;
    out.flush()
}
