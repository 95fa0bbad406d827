//! CLI command definitions, routing, and tracing setup.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use contentpipe_core::{
    AnalysisAgent, BridgeConfig, BridgeSummarizer, IndexerAgent, OrchestratorAgent, UrlState,
};
use contentpipe_retrieval::RetrievalAgent;
use contentpipe_shared::{AppConfig, ChangeEvent, init_config, load_config};
use contentpipe_storage::ContentStore;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ContentPipe: fetch, index, and watch web content.
#[derive(Parser)]
#[command(
    name = "contentpipe",
    version,
    about = "Collect URLs, index their content for search, and watch them for changes.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Add URLs to a collection and index them.
    Add {
        /// Collection to add to (created if missing).
        collection: String,

        /// URLs to add.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Tag to attach to every added URL (repeatable).
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },

    /// Fetch and index a single URL now.
    Fetch {
        url: String,
    },

    /// Full-text search over indexed content.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Export indexed content.
    Export {
        /// URL to export. Omit when using --collection.
        url: Option<String>,

        /// Export every indexed URL of a collection instead.
        #[arg(short, long, conflicts_with = "url")]
        collection: Option<String>,

        /// Output format: json or markdown.
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// Summarize indexed content with the configured model bridge.
    Analyze {
        url: String,

        /// Question or instruction for the summary (defaults to config).
        #[arg(short, long)]
        query: Option<String>,
    },

    /// Watch a collection for content changes.
    Watch {
        collection: String,

        /// Run a single sweep and exit.
        #[arg(long)]
        once: bool,
    },

    /// Show the collections and the indexing state of their URLs.
    Status {
        /// Collection to show. Lists all collections when omitted.
        collection: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "contentpipe=info",
        1 => "contentpipe=debug",
        _ => "contentpipe=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Add {
            collection,
            urls,
            tags,
        } => cmd_add(&collection, &urls, tags).await,
        Command::Fetch { url } => cmd_fetch(&url).await,
        Command::Search { query, limit } => cmd_search(&query, limit).await,
        Command::Export {
            url,
            collection,
            format,
        } => cmd_export(url.as_deref(), collection.as_deref(), &format).await,
        Command::Analyze { url, query } => cmd_analyze(&url, query.as_deref()).await,
        Command::Watch { collection, once } => cmd_watch(&collection, once).await,
        Command::Status { collection } => cmd_status(collection.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Open the store and assemble the agents from config.
async fn open_pipeline(config: &AppConfig) -> Result<OrchestratorAgent> {
    let path = config.store.resolved_path()?;
    let store = ContentStore::open(&path, &config.store).await?;
    let retrieval = RetrievalAgent::from_config(&config.retrieval)?;

    let summarizer = Arc::new(BridgeSummarizer::new(BridgeConfig::from(&config.analysis)));
    let analysis = AnalysisAgent::new(summarizer, &config.analysis);
    let auto_query = config
        .analysis
        .enabled
        .then(|| config.analysis.default_query.clone());

    let orchestrator = OrchestratorAgent::builder(retrieval, IndexerAgent::new(store))
        .config(&config.orchestrator)
        .retry(config.retry.clone())
        .analysis(analysis, auto_query)
        .build();
    orchestrator.restore().await?;
    Ok(orchestrator)
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    Ok(spinner)
}

fn print_event(event: &ChangeEvent) {
    println!(
        "{}  {}  {} -> {}",
        event.detected_at.to_rfc3339(),
        event.url,
        short_hash(&event.previous_hash),
        short_hash(&event.new_hash),
    );
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_add(collection: &str, urls: &[String], tags: Vec<String>) -> Result<()> {
    let config = load_config()?;
    let orchestrator = open_pipeline(&config).await?;

    info!(collection, count = urls.len(), "adding urls");
    let added = orchestrator.add_urls(collection, urls).await?;

    if !tags.is_empty() {
        let tags: BTreeSet<String> = tags.into_iter().collect();
        for url in &added {
            orchestrator
                .set_tags(collection, url.as_str(), tags.clone())
                .await?;
        }
    }

    let progress = spinner(&format!("Fetching {} URL(s)", added.len()))?;
    orchestrator.wait_idle().await;
    progress.finish_and_clear();

    println!();
    for url in &added {
        let state = match orchestrator.status(url.as_str()) {
            Some(UrlState::Done) => "indexed".to_string(),
            Some(UrlState::Failed { reason }) => format!("failed: {reason}"),
            Some(other) => format!("{other:?}"),
            None => "unknown".to_string(),
        };
        println!("  {url}  {state}");
    }
    println!();
    Ok(())
}

async fn cmd_fetch(url: &str) -> Result<()> {
    let config = load_config()?;
    let orchestrator = open_pipeline(&config).await?;

    let progress = spinner(&format!("Fetching {url}"))?;
    let result = orchestrator.fetch_and_index(url).await;
    progress.finish_and_clear();
    let outcome = result?;

    println!();
    println!("  URL:      {}", outcome.url);
    println!("  Status:   {:?}", outcome.status);
    println!("  Hash:     {}", outcome.content_hash);
    println!("  Attempts: {}", outcome.attempts);
    println!();
    Ok(())
}

async fn cmd_search(query: &str, limit: usize) -> Result<()> {
    let config = load_config()?;
    let orchestrator = open_pipeline(&config).await?;

    let mut cursor = orchestrator.search(query);
    let mut shown = 0;
    while shown < limit {
        let Some(hit) = cursor.next().await? else {
            break;
        };
        shown += 1;
        println!("{shown:>3}. {}", hit.title);
        println!("     {}", hit.url);
    }
    if shown == 0 {
        println!("No results for {query:?}");
    }
    Ok(())
}

async fn cmd_export(url: Option<&str>, collection: Option<&str>, format: &str) -> Result<()> {
    let config = load_config()?;
    let orchestrator = open_pipeline(&config).await?;

    let output = match (url, collection) {
        (Some(url), None) => orchestrator.export(url, format).await?,
        (None, Some(collection)) => orchestrator.export_collection(collection, format).await?,
        _ => return Err(eyre!("pass either a URL or --collection")),
    };
    println!("{output}");
    Ok(())
}

async fn cmd_analyze(url: &str, query: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let orchestrator = open_pipeline(&config).await?;
    let query = query.unwrap_or(&config.analysis.default_query);

    let progress = spinner("Summarizing")?;
    let result = orchestrator.analyze(url, query).await;
    progress.finish_and_clear();

    println!("{}", result?);
    Ok(())
}

async fn cmd_watch(collection: &str, once: bool) -> Result<()> {
    let config = load_config()?;
    let orchestrator = open_pipeline(&config).await?;
    let snapshot = orchestrator.collection(collection).await?;
    let monitor = orchestrator.monitor(config.monitor.clone());

    if once {
        let events = monitor.check_once(&snapshot).await;
        for event in &events {
            print_event(event);
        }
        println!("{} change(s) across {} URL(s)", events.len(), snapshot.len());
        return Ok(());
    }

    info!(
        collection,
        urls = snapshot.len(),
        interval_ms = config.monitor.poll_interval_ms,
        "watching; press Ctrl-C to stop"
    );
    let mut watch = monitor.watch(&snapshot);
    loop {
        tokio::select! {
            event = watch.next() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                let suspects = watch.suspects();
                if !suspects.is_empty() {
                    println!("Suspect URLs:");
                    for url in suspects {
                        println!("  {url}");
                    }
                }
                break;
            }
        }
    }
    Ok(())
}

async fn cmd_status(collection: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let orchestrator = open_pipeline(&config).await?;

    let ids = match collection {
        Some(id) => vec![id.to_string()],
        None => orchestrator.collection_ids().await,
    };
    if ids.is_empty() {
        println!("No collections yet. Add URLs with `contentpipe add <collection> <url>...`");
        return Ok(());
    }

    let store = orchestrator.indexer().store();
    for id in ids {
        let snapshot = orchestrator.collection(&id).await?;
        println!("{id} ({} URL(s))", snapshot.len());
        for entry in snapshot.entries() {
            let indexed = match store.get(entry.url.as_str()).await {
                Ok(Some(content)) => format!(
                    "indexed {}  {}",
                    content.last_processed.to_rfc3339(),
                    short_hash(&content.content_hash)
                ),
                Ok(None) => "not indexed".to_string(),
                Err(e) => format!("error: {e}"),
            };
            let changes = store
                .change_events(Some(entry.url.as_str()))
                .await
                .map(|events| events.len())
                .unwrap_or(0);
            let tags = if entry.tags.is_empty() {
                String::new()
            } else {
                format!("  [{}]", entry.tags.iter().cloned().collect::<Vec<_>>().join(", "))
            };
            println!("  {}  {indexed}  changes: {changes}{tags}", entry.url);
        }
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
