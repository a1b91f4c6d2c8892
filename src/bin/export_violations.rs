//! export_violations - print recent persisted violations as JSON

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use rider_watch::storage::{SqliteViolationStore, ViolationStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the violation database.
    #[arg(long, env = "RIDER_WATCH_DB_PATH", default_value = "violations.db")]
    db_path: String,
    /// Maximum number of records, newest first.
    #[arg(long, default_value_t = 50)]
    limit: usize,
    /// Write evidence crops as <id>.jpg into this directory.
    #[arg(long)]
    crops_dir: Option<PathBuf>,
    /// Output file (stdout when omitted).
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let store = SqliteViolationStore::open(&args.db_path)?;
    let records = store.recent(args.limit)?;

    if let Some(dir) = &args.crops_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create crops dir {}", dir.display()))?;
        for record in &records {
            let Some(jpeg) = store.crop_jpeg(record.id)? else {
                log::warn!("record {} has no stored crop", record.id);
                continue;
            };
            let path = dir.join(format!("{}.jpg", record.id));
            std::fs::write(&path, jpeg)
                .with_context(|| format!("write crop {}", path.display()))?;
        }
    }

    let json = serde_json::to_string_pretty(&records)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("write export {}", path.display()))?;
            eprintln!("exported {} violation(s) to {}", records.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
