use clap::Parser;
use kairix_synth::config::PipelineConfig;
use kairix_synth::conversation::export::load_chatgpt_export;
use kairix_synth::llm::config::ModelsConfig;
use kairix_synth::llm::{
    Embedder, HashingEmbedder, OpenAiEmbedder, OpenAiSummarizer, PrefixSummarizer, Summarizer,
};
use kairix_synth::memory::{FileGraphStore, GraphStore};
use kairix_synth::pipeline::{PipelineOrchestrator, PipelineRegistry, TracingProgress};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// 把对话导出合成为去重的记忆图
#[derive(Parser)]
#[command(name = "kairix-synth")]
#[command(version)]
#[command(about = "Chunk, summarize, embed and persist conversation exports as a memory graph")]
struct Cli {
    /// ChatGPT conversations.json export
    #[arg(short, long)]
    export: PathBuf,

    /// Pipeline configuration (YAML)
    #[arg(short, long, env = "KAIRIX_CONFIG")]
    config: Option<PathBuf>,

    /// Graph store file
    #[arg(short, long, env = "KAIRIX_STORE", default_value = "~/.kairix/graph.json")]
    store: PathBuf,

    /// Use the local prefix summarizer and hashing embedder instead of HTTP providers
    #[arg(long)]
    offline: bool,

    /// Agent recorded on every shard link
    #[arg(long)]
    agent: Option<String>,

    /// Override max_tokens_per_fragment
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Override worker_pool_size
    #[arg(long)]
    workers: Option<usize>,

    /// Write the run report as JSON to this file as well as stdout
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "kairix_synth=info".into()),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(agent) = cli.agent {
        config = config.agent_name(agent);
    }
    if let Some(max_tokens) = cli.max_tokens {
        config = config.max_tokens_per_fragment(max_tokens);
    }
    if let Some(workers) = cli.workers {
        config = config.worker_pool_size(workers);
    }
    config.validate()?;

    let (summarizer, embedder): (Arc<dyn Summarizer>, Arc<dyn Embedder>) = if cli.offline {
        (
            Arc::new(PrefixSummarizer::default()),
            Arc::new(HashingEmbedder::default()),
        )
    } else {
        let models = ModelsConfig::from_env()?;
        let client = Arc::new(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()?,
        );
        (
            Arc::new(OpenAiSummarizer::from_models(client.clone(), &models)?),
            Arc::new(OpenAiEmbedder::from_models(client, &models)?),
        )
    };
    let store: Arc<dyn GraphStore> = Arc::new(FileGraphStore::new(&cli.store)?);

    let export = load_chatgpt_export(&cli.export)?;
    info!(
        conversations = export.conversations.len(),
        rejected = export.rejected.len(),
        offline = cli.offline,
        "📥 导出加载完成"
    );

    let registry = PipelineRegistry::new(summarizer, embedder, store.clone())
        .with_progress(Arc::new(TracingProgress));
    let orchestrator = PipelineOrchestrator::new(config, registry);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到 Ctrl-C，停止派发新片段");
            on_signal.cancel();
        }
    });

    let report = orchestrator
        .run_with_rejections(&export.conversations, &export.rejected, cancel)
        .await;
    let json = serde_json::to_string_pretty(&report)?;
    println!("{json}");
    if let Some(path) = &cli.report {
        std::fs::write(path, &json)?;
    }

    let stats = store.stats().await?;
    info!(
        shards = stats.shards,
        links = stats.links,
        summaries_created = stats.summaries_created,
        merges = stats.merges,
        "📊 图存储统计"
    );

    if report.failed_overall() {
        std::process::exit(1);
    }
    Ok(())
}
