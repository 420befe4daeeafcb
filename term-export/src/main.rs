//! term-export command line.
//!
//! Registers CSV or Parquet files as tables, then runs key discovery or a
//! sharded encrypted export against them. Stage and output prefixes resolve
//! inside a local root directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use datafusion::prelude::{CsvReadOptions, ParquetReadOptions};
use object_store::local::LocalFileSystem;
use tracing::Level;

use term_export::audit::{AuditRepository, InMemoryAuditRepository, JsonLinesAuditRepository};
use term_export::config::{ExportConfig, KeyDiscoveryConfig, PersistPolicy};
use term_export::crypto::{Decryptor, RecipientSecret};
use term_export::logging::setup::{init_logging, LoggingConfig};
use term_export::logging::LogConfig;
use term_export::notify::TracingNotifier;
use term_export::pipeline::{PipelineDeps, PipelineOrchestrator, RunOutcome};
use term_export::selector::KeyColumnSelector;
use term_export::store::{DataFusionStore, TableRef};
use term_export::transfer::ObjectStoreTransfer;

#[derive(Parser)]
#[command(name = "term-export")]
#[command(about = "Sharded multi-recipient encrypted table export")]
#[command(version)]
struct Cli {
    /// Debug-level logging with per-step detail
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "TERM_EXPORT_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a recipient key pair
    Keygen {
        /// Email addresses bound to the key
        #[arg(long = "email")]
        emails: Vec<String>,
        /// Directory receiving <name>.pub and <name>.key
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long, default_value = "recipient")]
        name: String,
    },
    /// Discover a minimal key for a table
    SelectKey {
        #[command(flatten)]
        sources: SourceArgs,
        /// Table to analyze, `[catalog.][schema.]table`
        #[arg(long)]
        table: String,
        #[arg(long, default_value_t = term_export::config::DEFAULT_SAMPLE_FRACTION)]
        sample_fraction: f64,
        #[arg(long, default_value_t = term_export::config::DEFAULT_UNIQUENESS_THRESHOLD)]
        threshold: f64,
        /// Keep earlier audit records for the table
        #[arg(long)]
        append: bool,
        #[command(flatten)]
        audit: AuditArgs,
    },
    /// Run a sharded encrypted export
    Export {
        #[command(flatten)]
        sources: SourceArgs,
        /// JSON export configuration
        #[arg(long)]
        config: PathBuf,
        /// Local directory holding the stage and output prefixes
        #[arg(long, env = "TERM_EXPORT_ROOT")]
        root: PathBuf,
        #[command(flatten)]
        audit: AuditArgs,
    },
    /// Decrypt a file with a recipient secret key
    Decrypt {
        /// Secret key file
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Register a CSV file as a table, `name=path`
    #[arg(long = "csv", value_parser = parse_source)]
    csv: Vec<(String, PathBuf)>,
    /// Register a Parquet file or directory as a table, `name=path`
    #[arg(long = "parquet", value_parser = parse_source)]
    parquet: Vec<(String, PathBuf)>,
}

#[derive(Args)]
struct AuditArgs {
    /// Append audit records to this JSON-lines file
    #[arg(long, env = "TERM_EXPORT_AUDIT_FILE")]
    audit_file: Option<PathBuf>,
}

impl AuditArgs {
    fn repository(&self) -> Arc<dyn AuditRepository> {
        match &self.audit_file {
            Some(path) => Arc::new(JsonLinesAuditRepository::new(path.clone())),
            None => Arc::new(InMemoryAuditRepository::new()),
        }
    }
}

fn parse_source(value: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected name=path, got '{value}'"))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected name=path, got '{value}'"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

fn path_str(path: &Path) -> Result<&str, Box<dyn std::error::Error>> {
    path.to_str()
        .ok_or_else(|| format!("path {} is not valid UTF-8", path.display()).into())
}

async fn open_store(sources: &SourceArgs) -> Result<Arc<DataFusionStore>, Box<dyn std::error::Error>> {
    let store = DataFusionStore::new()?;
    for (name, path) in &sources.csv {
        store
            .context()
            .register_csv(name.as_str(), path_str(path)?, CsvReadOptions::new())
            .await?;
    }
    for (name, path) in &sources.parquet {
        store
            .context()
            .register_parquet(name.as_str(), path_str(path)?, ParquetReadOptions::default())
            .await?;
    }
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let logging = if cli.verbose {
        LoggingConfig::development()
    } else {
        LoggingConfig::default().with_export_level(Level::INFO)
    };
    init_logging(logging.with_json_format(cli.json_logs))?;
    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::balanced()
    };

    match cli.command {
        Command::Keygen {
            emails,
            out_dir,
            name,
        } => {
            std::fs::create_dir_all(&out_dir)?;
            let secret = RecipientSecret::generate(emails);
            let public = secret.recipient()?;
            std::fs::write(out_dir.join(format!("{name}.pub")), public.to_key_file()?)?;
            std::fs::write(
                out_dir.join(format!("{name}.key")),
                secret.to_key_file()?.expose(),
            )?;
            println!("{}", public.fingerprint_id());
        }

        Command::SelectKey {
            sources,
            table,
            sample_fraction,
            threshold,
            append,
            audit,
        } => {
            let store = open_store(&sources).await?;
            let config = KeyDiscoveryConfig::default()
                .with_sample_fraction(sample_fraction)
                .with_uniqueness_threshold(threshold)
                .with_persist_policy(if append {
                    PersistPolicy::Append
                } else {
                    PersistPolicy::Overwrite
                });
            config.validate()?;

            let selector = KeyColumnSelector::new(store, audit.repository())
                .with_config(config)
                .with_log_config(log_config);
            let result = selector
                .select_key_with_defaults(&TableRef::parse(&table)?)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Command::Export {
            sources,
            config,
            root,
            audit,
        } => {
            let store = open_store(&sources).await?;
            let config = ExportConfig::from_json_file(&config)?;
            std::fs::create_dir_all(&root)?;
            let files = Arc::new(LocalFileSystem::new_with_prefix(&root)?);

            let deps = PipelineDeps {
                executor: store.clone(),
                transfer: Arc::new(ObjectStoreTransfer::new(files, store)),
                audit: audit.repository(),
                notifier: Arc::new(TracingNotifier),
            };

            let outcome = PipelineOrchestrator::new(config, deps)
                .with_log_config(log_config)
                .run()
                .await;
            match outcome {
                RunOutcome::Succeeded(summary) => {
                    for file in &summary.files {
                        println!("{file}");
                    }
                    if let Some(manifest) = &summary.manifest {
                        println!("{manifest}");
                    }
                }
                RunOutcome::Failed(failure) => {
                    eprintln!(
                        "export failed during {}: {} ({})",
                        failure.phase,
                        failure.error,
                        failure.error_kind()
                    );
                    std::process::exit(1);
                }
            }
        }

        Command::Decrypt { key, input, output } => {
            let text = std::fs::read_to_string(&key)?;
            let secret = RecipientSecret::parse(&key.display().to_string(), &text)?;
            let bytes = Decryptor::decrypt_file(&input, &output, &secret).await?;
            println!("{bytes} bytes written to {}", output.display());
        }
    }

    Ok(())
}
