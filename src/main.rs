use clap::{Parser, Subcommand};
use prefsync_lib::config::{ConfigError, EngineConfig};
use prefsync_lib::sync::{
    normalize, violations, BackgroundScheduler, ChangeDetector, PreferenceDocument, PreferenceStore,
    SchedulerConfig, SchedulerError, SyncError, SyncState,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "prefsync")]
#[command(about = "Preference sync engine CLI")]
struct Cli {
    /// JSON config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch the stored document and print it normalized
    Pull {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Replace the stored document with the contents of a file
    Push { file: PathBuf },
    /// Print a file repaired to the full document shape
    Normalize { file: PathBuf },
    /// Print the change digest of a file
    Digest { file: PathBuf },
    /// Keep refreshing from the server until interrupted
    Watch {
        #[arg(long, default_value_t = 5)]
        interval_minutes: u64,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("{path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("{path}: not valid JSON: {source}")]
    Json { path: PathBuf, source: serde_json::Error },

    #[error("server unreachable, refusing to continue with local defaults")]
    Offline,
}

fn read_document(path: &Path) -> Result<PreferenceDocument, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn print_document(doc: &PreferenceDocument) {
    match serde_json::to_string_pretty(doc) {
        Ok(text) => println!("{}", text),
        Err(e) => log::error!("Failed to render document: {}", e),
    }
}

async fn connect(config_path: Option<&Path>) -> Result<PreferenceStore, CliError> {
    let config = EngineConfig::load(config_path)?;
    let store = PreferenceStore::connect(&config)?;
    store.load().await;
    if store.state() == SyncState::Offline {
        return Err(CliError::Offline);
    }
    Ok(store)
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = cli.config.as_deref();

    match cli.cmd {
        Command::Pull { out } => {
            let store = connect(config_path).await?;
            let doc = store.document();
            match out {
                Some(path) => {
                    let text = serde_json::to_string_pretty(&doc).map_err(|source| CliError::Json {
                        path: path.clone(),
                        source,
                    })?;
                    std::fs::write(&path, text).map_err(|source| CliError::Io { path, source })?;
                }
                None => print_document(&doc),
            }
        }
        Command::Push { file } => {
            let replacement = read_document(&file)?;
            let store = connect(config_path).await?;
            store.update(|doc| *doc = replacement);
            let outcome = store.save(true).await?;
            if outcome.skipped {
                println!("nothing to save ({:?})", outcome.reason);
            } else {
                println!("saved");
            }
        }
        Command::Normalize { file } => {
            let doc = read_document(&file)?;
            for problem in violations(&doc) {
                eprintln!("repaired: {}", problem);
            }
            print_document(&normalize(&doc));
        }
        Command::Digest { file } => {
            let doc = read_document(&file)?;
            println!("{}", ChangeDetector::new().digest(&normalize(&doc)).as_str());
        }
        Command::Watch { interval_minutes } => {
            let store = connect(config_path).await?;
            let scheduler = BackgroundScheduler::with_config(
                store.clone(),
                SchedulerConfig {
                    enabled: true,
                    interval_minutes,
                    last_run: None,
                },
            );
            store.subscribe(|event| {
                if let Some(doc) = event.document() {
                    log::info!("Document updated ({} job titles)", doc["jobTitles"].as_array().map_or(0, Vec::len));
                }
            });
            scheduler.start().await?;

            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for interrupt: {}", e);
            }
            scheduler.stop().await?;
            store.flush().await;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    prefsync_lib::init_logging();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
