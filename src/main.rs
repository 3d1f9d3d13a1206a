//! pro CLI: self-tuning n-gram conversational engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use pro_engine::config::EngineConfig;
use pro_engine::daemon::{DaemonConfig, Supervisor};
use pro_engine::datasets::DEFAULT_WEIGHT;
use pro_engine::engine::Engine;
use pro_engine::forecast::ForecastNode;
use pro_engine::paths::ProPaths;

#[derive(Parser)]
#[command(name = "pro", version, about = "Self-tuning n-gram conversational engine")]
struct Cli {
    /// Data directory for persistent state (default: XDG data dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine config file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive conversation with background learning.
    Chat,

    /// Train on a dataset file and save the state.
    Train {
        /// Path to a plain-text dataset.
        dataset: PathBuf,

        /// Training weight for every line of the file.
        #[arg(long, default_value_t = DEFAULT_WEIGHT)]
        weight: f64,
    },

    /// Scan the dataset directory once and retrain what changed.
    Scan,

    /// Print a forecast tree of likely continuations.
    Forecast {
        /// Seed words (comma-separated, e.g. "the,sea").
        #[arg(long)]
        seeds: String,

        /// Expansion depth.
        #[arg(long, default_value = "2")]
        depth: usize,
    },

    /// Show vocabulary sizes and file locations.
    Info,
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => ProPaths::resolve()?.data_dir,
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| ProPaths::rooted(&data_dir).config_file());
    let mut config = if config_path.exists() {
        EngineConfig::load(&config_path)?
    } else {
        EngineConfig::default()
    };
    config.data_dir = Some(data_dir);
    Ok(config)
}

fn print_forecast(node: &ForecastNode, depth: usize) {
    println!(
        "{:indent$}{} (p={:.4}, novelty={:.3})",
        "",
        node.text,
        node.prob,
        node.novelty,
        indent = depth * 2
    );
    for child in &node.children {
        print_forecast(child, depth + 1);
    }
}

async fn chat(engine: Arc<Engine>) -> Result<()> {
    let supervisor = Supervisor::start(Arc::clone(&engine), DaemonConfig::from_engine(&engine));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await.into_diagnostic()?;
        stdout.flush().await.into_diagnostic()?;
        let Some(line) = lines.next_line().await.into_diagnostic()? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }
        let (response, _) = engine.process_message(line).await;
        stdout
            .write_all(format!("{response}\n").as_bytes())
            .await
            .into_diagnostic()?;
    }

    supervisor.shutdown().await;
    engine.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let engine = Arc::new(Engine::new(config)?);

    match cli.command {
        Commands::Chat => chat(engine).await?,
        Commands::Train { dataset, weight } => {
            if !engine.train_file(&dataset, weight).await {
                miette::bail!("nothing learned from {}", dataset.display());
            }
            engine.save_state().await?;
            let stats = engine.stats().await;
            println!(
                "Trained on {} (weight {weight}); vocabulary {} words",
                dataset.display(),
                stats.words
            );
        }
        Commands::Scan => {
            if engine.scan_datasets().await? {
                println!("Datasets changed; model retrained.");
            } else {
                println!("Datasets unchanged.");
            }
        }
        Commands::Forecast { seeds, depth } => {
            let seeds: Vec<String> = seeds
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if seeds.is_empty() {
                miette::bail!("no seed words provided");
            }
            match engine.forecast(&seeds, depth, false).await {
                Some(root) => print_forecast(&root, 0),
                None => miette::bail!("forecast failed"),
            }
        }
        Commands::Info => {
            let stats = engine.stats().await;
            println!("pro-engine {}", env!("CARGO_PKG_VERSION"));
            if let Some(paths) = engine.paths() {
                println!("  data dir:         {}", paths.data_dir.display());
                println!("  datasets:         {}", paths.datasets_dir().display());
                println!("  state:            {}", paths.state_file().display());
            }
            println!("  words:            {}", stats.words);
            println!("  bigram contexts:  {}", stats.bigram_contexts);
            println!("  trigram contexts: {}", stats.trigram_contexts);
            println!("  char n-grams:     {}", stats.char_ngrams);
            println!("  index vocab:      {}", stats.index_vocab);
        }
    }
    Ok(())
}
