use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tenderlens::config::init_tracing;
use tenderlens::ServiceConfig;

#[derive(Parser, Debug)]
#[command(
    name = "tenderlens-ingest",
    about = "Bootstrap the tenderlens schema and load the global reference corpus"
)]
struct IngestCli {
    #[command(flatten)]
    service: ServiceConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the vector extension, tables, and indexes if missing.
    Migrate,
    /// Embed every PDF in a directory as global reference chunks.
    Global {
        /// Directory of reference tender PDFs
        #[arg(long, env = "TENDERLENS_GLOBAL_DIR", default_value = "global-tenders")]
        dir: PathBuf,
    },
    /// Remove sessions older than the configured expiry.
    Cleanup,
    /// Print store counters.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = IngestCli::parse();
    let backends = cli.service.connect_backends().await?;

    match cli.command {
        Command::Migrate => {
            println!("Schema ready in {}.", cli.service.schema);
        }
        Command::Global { dir } => {
            let embedder = cli.service.build_embedder()?;
            let ingestor = cli.service.build_ingestor(embedder, backends.store.clone())?;
            let report = ingestor.ingest_global_directory(&dir).await?;
            for file in &report.ingested {
                println!(
                    "{}: {} chunk{} stored, {} skipped",
                    file.source,
                    file.chunks_stored,
                    if file.chunks_stored == 1 { "" } else { "s" },
                    file.skip_count()
                );
            }
            for name in &report.already_present {
                println!("{name}: already ingested");
            }
            for (name, reason) in &report.failed {
                eprintln!("{name}: failed: {reason}");
            }
            println!(
                "Ingested {} file(s), {} already present, {} failed.",
                report.ingested.len(),
                report.already_present.len(),
                report.failed.len()
            );
        }
        Command::Cleanup => {
            let expiry = chrono::Duration::hours(cli.service.session_expiry_hours as i64);
            let removed = backends
                .store
                .delete_sessions_older_than(Utc::now() - expiry)
                .await?;
            println!("Removed {} expired session(s).", removed.len());
        }
        Command::Stats => {
            let stats = backends.store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}
