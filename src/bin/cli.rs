//! filerelay CLI
//!
//! Inspect and repair the tracking store.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use filerelay::config::RelayConfig;
use filerelay::staging::LocalStaging;
use filerelay::storage::TrackingStore;
use filerelay::sync::may_purge;
use filerelay::types::*;

#[derive(Parser)]
#[command(name = "filerelay-cli")]
#[command(about = "Inspect and repair the filerelay tracking store")]
#[command(version)]
struct Cli {
    /// Configuration file (locates the database and staging directory)
    #[arg(
        short,
        long,
        env = "FILERELAY_CONFIG",
        default_value = "~/.config/filerelay/filerelay.toml"
    )]
    config: String,

    /// Database path (overrides the configuration file)
    #[arg(long, env = "FILERELAY_DB_PATH")]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tracked files
    List {
        /// Only files in this state (downloaded, forwarded, deleted)
        #[arg(short, long)]
        state: Option<Lifecycle>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List files waiting to be forwarded
    Pending,
    /// Show one record
    Show {
        /// Relative path of the file
        path: String,
    },
    /// Show record counts
    Stats,
    /// Drop a record so the file is downloaded and forwarded again
    Reacquire {
        /// Relative path of the file
        path: String,
    },
    /// Drop a record from the store
    Forget {
        /// Relative path of the file
        path: String,
        /// Drop it even if the file was not fully processed
        #[arg(long)]
        force: bool,
    },
}

/// Where the store and staging area live
struct Locations {
    db_path: PathBuf,
    staging_dir: Option<PathBuf>,
}

fn locate(cli: &Cli) -> anyhow::Result<Locations> {
    let config_path = shellexpand::tilde(&cli.config).to_string();
    let config = if Path::new(&config_path).exists() {
        Some(
            RelayConfig::load(&config_path)
                .with_context(|| format!("loading configuration from {}", config_path))?,
        )
    } else {
        None
    };

    let db_path = match (&cli.db_path, &config) {
        (Some(db_path), _) => PathBuf::from(shellexpand::tilde(db_path).to_string()),
        (None, Some(config)) => config.local.database.clone(),
        (None, None) => bail!(
            "no database: pass --db-path or provide a configuration file at {}",
            config_path
        ),
    };
    Ok(Locations {
        db_path,
        staging_dir: config.map(|c| c.local.staging_dir),
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let locations = locate(&cli)?;
    let store = TrackingStore::open(&locations.db_path)
        .with_context(|| format!("opening {}", locations.db_path.display()))?;

    match cli.command {
        Commands::List { state, json } => {
            let files = store.list(state)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&files)?);
            } else {
                for file in files {
                    print_row(&file);
                }
            }
        }

        Commands::Pending => {
            for path in store.not_forwarded()? {
                println!("{}", path);
            }
        }

        Commands::Show { path } => {
            let path = RelativePath::new(&path)?;
            match store.get(&path)? {
                Some(file) => println!("{}", serde_json::to_string_pretty(&file)?),
                None => bail!("{} is not tracked", path),
            }
        }

        Commands::Stats => {
            let stats = store.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Reacquire { path } => {
            let path = RelativePath::new(&path)?;
            store.reacquire(&path)?;
            println!(
                "Dropped {}; the next tick downloads it again if the remote still has it",
                path
            );
        }

        Commands::Forget { path, force } => {
            let path = RelativePath::new(&path)?;
            let Some(file) = store.get(&path)? else {
                bail!("{} is not tracked", path);
            };
            if !force {
                let Some(staging_dir) = &locations.staging_dir else {
                    bail!("staging directory unknown; pass --config or --force");
                };
                // destination is irrelevant for the presence check
                let staging = LocalStaging::new(staging_dir.clone(), PathBuf::new());
                if !may_purge(&file, staging.exists_in_staging(&path)) {
                    bail!(
                        "{} is {} and may still be needed; use --force to drop it anyway",
                        path,
                        file.lifecycle()
                    );
                }
            }
            store.remove([&path])?;
            println!("Forgot {}", path);
        }
    }

    store.close()?;
    Ok(())
}

fn print_row(file: &TrackedFile) {
    println!(
        "{:<10} {} {} {}",
        file.lifecycle().to_string(),
        format_time(Some(file.download_time)),
        format_time(file.forward_time),
        file.relative_path
    );
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".repeat(19))
}
