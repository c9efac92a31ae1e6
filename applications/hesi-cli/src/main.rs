/// HesiMusic - music library scanner
use anyhow::Context;
use clap::{Parser, Subcommand};
use hesi_core::{ScanId, ScanOptions, ScanStatus};
use hesi_metadata::{cue, LoftyExtractor, TagDebugger};
use hesi_scanner::ScanCoordinator;
use hesi_storage::SongStore;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "hesi")]
#[command(about = "Scan music folders into the HesiMusic library", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "HESI_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan directories and store what is found
    Scan {
        /// Directories to scan
        #[arg(required = true)]
        roots: Vec<PathBuf>,
        /// Directory prefixes to skip
        #[arg(short, long)]
        exclude: Vec<PathBuf>,
        /// Do not store songs shorter than this
        #[arg(long, default_value_t = 0)]
        min_duration_ms: u64,
        /// Descend into symlinked directories
        #[arg(long)]
        follow_symlinks: bool,
        /// Skip files unchanged since they were last seen
        #[arg(long)]
        skip_unchanged: bool,
    },
    /// Continue an interrupted scan from its checkpoint
    Resume {
        scan_id: String,
    },
    /// Print the status of a scan
    Status {
        scan_id: String,
    },
    /// Print the latest progress of a scan
    Progress {
        scan_id: String,
    },
    /// List known scans
    List,
    /// Parse a CUE sheet and print its tracks
    Cue {
        file: PathBuf,
    },
    /// Show candidate decodings of a file's tag text
    Tags {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hesi_cli=info,hesi_scanner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Scan {
            roots,
            exclude,
            min_duration_ms,
            follow_symlinks,
            skip_unchanged,
        } => {
            let mut excluded = config.excluded_paths.clone();
            excluded.extend(exclude);
            let options = ScanOptions::new(roots)
                .with_excluded_paths(excluded)
                .with_min_duration_ms(min_duration_ms)
                .follow_symlinks(follow_symlinks)
                .skip_unchanged(skip_unchanged);
            scan(&config, options).await?;
        }
        Commands::Resume { scan_id } => {
            resume(&config, ScanId::new(scan_id)).await?;
        }
        Commands::Status { scan_id } => {
            let coordinator = offline_coordinator(&config);
            println!("{}", coordinator.get_status(&ScanId::new(scan_id)));
        }
        Commands::Progress { scan_id } => {
            let coordinator = offline_coordinator(&config);
            let scan_id = ScanId::new(scan_id);
            let progress = coordinator
                .get_progress(&scan_id)
                .with_context(|| format!("No progress recorded for scan {scan_id}"))?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Commands::List => {
            let coordinator = offline_coordinator(&config);
            for scan_id in coordinator.scan_ids() {
                println!("{}\t{}", scan_id, coordinator.get_status(&scan_id));
            }
        }
        Commands::Cue { file } => {
            let sheet = cue::parse_file(&file)?;
            println!("{}", serde_json::to_string_pretty(&sheet)?);
        }
        Commands::Tags { file } => {
            let report = TagDebugger::new().debug(&file);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn open_coordinator(config: &CliConfig) -> anyhow::Result<(ScanCoordinator, SongStore)> {
    if let Some(dir) = sqlite_parent_dir(&config.database_url) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let pool = hesi_storage::create_pool(&config.database_url).await?;
    hesi_storage::run_migrations(&pool).await?;
    let store = SongStore::new(pool);
    tracing::info!("Database connected");

    let extractor = LoftyExtractor::new().repair_charset(config.repair_charset);
    let coordinator = ScanCoordinator::new(
        config.coordinator_config(),
        Arc::new(extractor),
        Arc::new(store.clone()),
    );
    Ok((coordinator, store))
}

/// Coordinator for read-only queries against persisted state
fn offline_coordinator(config: &CliConfig) -> ScanCoordinator {
    struct NoSink;

    #[async_trait::async_trait]
    impl hesi_core::SongSink for NoSink {
        async fn save_batch(&self, _records: &[hesi_core::SongRecord]) -> hesi_core::Result<()> {
            Err(hesi_core::HesiError::storage("read-only coordinator"))
        }
    }

    ScanCoordinator::new(
        config.coordinator_config(),
        Arc::new(LoftyExtractor::new()),
        Arc::new(NoSink),
    )
}

async fn scan(config: &CliConfig, options: ScanOptions) -> anyhow::Result<()> {
    let (coordinator, store) = open_coordinator(config).await?;
    let scan_id = coordinator.start_scan(options)?;
    println!("Scan {scan_id} started");

    follow(&coordinator, &scan_id, &store).await
}

async fn resume(config: &CliConfig, scan_id: ScanId) -> anyhow::Result<()> {
    let (coordinator, store) = open_coordinator(config).await?;
    coordinator.resume_scan(&scan_id)?;
    println!("Scan {scan_id} resumed");

    follow(&coordinator, &scan_id, &store).await
}

/// Show progress until the scan stops; Ctrl+C cancels it
async fn follow(
    coordinator: &ScanCoordinator,
    scan_id: &ScanId,
    store: &SongStore,
) -> anyhow::Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {pos} files {msg}",
    )?);
    pb.enable_steady_tick(Duration::from_millis(120));

    let bar = pb.clone();
    coordinator.set_progress_callback(Arc::new(move |_, progress| {
        bar.set_position(progress.scanned_count);
        bar.set_message(format!("{} songs", progress.found_songs));
    }));

    let status = tokio::select! {
        status = coordinator.wait_for(scan_id) => status,
        _ = tokio::signal::ctrl_c() => {
            pb.set_message("stopping...");
            coordinator.stop_scan(scan_id);
            coordinator.wait_for(scan_id).await
        }
    };
    pb.finish_and_clear();

    let progress = coordinator.get_progress(scan_id).unwrap_or_default();
    println!(
        "Scan {}: {} ({} files, {} songs, {} in library)",
        scan_id,
        status,
        progress.scanned_count,
        progress.found_songs,
        store.count().await?
    );

    match status {
        ScanStatus::Completed => Ok(()),
        ScanStatus::Cancelled => {
            println!("Resume with: hesi resume {scan_id}");
            Ok(())
        }
        _ => {
            let message = coordinator
                .state_store()
                .load_state(scan_id)?
                .and_then(|state| state.error_message)
                .unwrap_or_default();
            anyhow::bail!("Scan {scan_id} ended {status}: {message}")
        }
    }
}

/// Directory holding a file-backed `sqlite://` database
fn sqlite_parent_dir(database_url: &str) -> Option<&Path> {
    let path = database_url.strip_prefix("sqlite://")?;
    if path.starts_with(':') {
        return None;
    }
    Path::new(path).parent().filter(|dir| !dir.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_scan_arguments() {
        let cli = Cli::parse_from([
            "hesi",
            "scan",
            "/music",
            "/more",
            "--exclude",
            "/music/podcasts",
            "--min-duration-ms",
            "30000",
        ]);

        match cli.command {
            Commands::Scan {
                roots,
                exclude,
                min_duration_ms,
                follow_symlinks,
                ..
            } => {
                assert_eq!(roots, vec![PathBuf::from("/music"), PathBuf::from("/more")]);
                assert_eq!(exclude, vec![PathBuf::from("/music/podcasts")]);
                assert_eq!(min_duration_ms, 30_000);
                assert!(!follow_symlinks);
            }
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn database_directory_is_derived_from_url() {
        assert_eq!(
            sqlite_parent_dir("sqlite://./data/hesi.db"),
            Some(Path::new("./data"))
        );
        assert_eq!(sqlite_parent_dir("sqlite::memory:"), None);
        assert_eq!(sqlite_parent_dir("sqlite://hesi.db"), None);
    }
}
