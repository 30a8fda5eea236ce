use chunkload::checksum::ChecksumAlgorithm;
use chunkload::cli::{file_name_from_url, InteractiveMode};
use chunkload::config::{DownloadConfig, DownloadConfigBuilder};
use chunkload::display::{short_id, ProgressDisplay};
use chunkload::error::DownloadError;
use chunkload::events::DownloadEvent;
use chunkload::registry::DownloadRegistry;
use chunkload::request::DownloadRequest;
use chunkload::session::PersistenceType;
use chunkload::status::DownloadStatus;
use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "chunkload")]
#[command(about = "Segmented HTTP downloader with pause, resume and retry", long_about = None)]
struct Cli {
    /// URLs to download
    #[arg(value_name = "URL")]
    urls: Vec<String>,

    #[arg(short, long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Parallel chunks per download
    #[arg(short, long)]
    threads: Option<usize>,

    /// Retry budget per chunk
    #[arg(short, long)]
    retries: Option<u32>,

    /// Expected hex digest (single URL only)
    #[arg(long)]
    checksum: Option<String>,

    #[arg(long, value_name = "MD5|SHA1|SHA256")]
    algorithm: Option<ChecksumAlgorithm>,

    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Session file to resume from and save to
    #[arg(long, value_name = "FILE")]
    session: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<DownloadConfig, DownloadError> {
    let mut config = match &cli.config {
        Some(path) => DownloadConfig::from_file(path)?,
        None => DownloadConfigBuilder::new().build()?,
    };

    if let Some(threads) = cli.threads {
        config.default_threads = threads;
    }
    if let Some(retries) = cli.retries {
        config.retry.max_retries = retries;
    }
    if let Some(algorithm) = cli.algorithm {
        config.checksum_algorithm = algorithm;
    }
    if let Some(session) = &cli.session {
        config.persistence_type = PersistenceType::JsonFile(session.clone());
    }
    config.debug |= cli.verbose;
    config.validate()?;
    Ok(config)
}

/// True once no job is transferring or waiting to be resumed.
async fn all_settled(registry: &DownloadRegistry) -> bool {
    for manager in registry.jobs().await {
        if manager.status().await.is_active() {
            return false;
        }
    }
    true
}

async fn follow_events(registry: Arc<DownloadRegistry>, display: Arc<ProgressDisplay>) {
    let mut events = registry.subscribe();
    if all_settled(&registry).await {
        return;
    }

    loop {
        let settling = match events.recv().await {
            Ok(event) => {
                display.handle(&event);
                match &event {
                    DownloadEvent::Progress(p) => p.status != DownloadStatus::Downloading,
                    DownloadEvent::Completed { .. } => true,
                    DownloadEvent::Error { job_id, message } => {
                        error!("[Job {}] {}", short_id(job_id), message);
                        true
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!("Display fell behind by {} event(s)", skipped);
                true
            }
            Err(RecvError::Closed) => break,
        };

        if settling && all_settled(&registry).await {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), DownloadError> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let log_level = if config.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    let registry = Arc::new(DownloadRegistry::new(config)?);
    let display = Arc::new(ProgressDisplay::new());

    match registry.load_session().await {
        Ok(0) => {}
        Ok(n) => info!("Loaded {} job(s) from the previous session", n),
        Err(e) => warn!("Ignoring unreadable session: {}", e),
    }

    for manager in registry.jobs().await {
        let job = manager.job().await;
        display.register(&job.id, job.file_name());
        if job.status == DownloadStatus::Paused {
            info!("Resuming {} at {} bytes", job.file_name(), job.downloaded_size);
            if let Err(e) = manager.resume().await {
                warn!("[Job {}] {}", short_id(&job.id), e);
            }
        }
    }

    if cli.checksum.is_some() && cli.urls.len() > 1 {
        warn!("--checksum applies to a single URL, ignoring it");
    }
    for url in &cli.urls {
        let file_name = match file_name_from_url(url) {
            Ok(name) => name,
            Err(e) => {
                error!("Skipping {}: {}", url, e);
                continue;
            }
        };

        let mut builder = DownloadRequest::builder(url.clone(), cli.output_dir.join(&file_name));
        if let (Some(checksum), 1) = (&cli.checksum, cli.urls.len()) {
            builder = builder.checksum(checksum.clone());
        }
        let manager = registry.add(builder.build()).await?;
        display.register(manager.id(), file_name);
        manager.start().await?;
        info!("[Job {}] Downloading {}", short_id(manager.id()), url);
    }

    if registry.is_empty() {
        info!("Nothing to download");
        return Ok(());
    }

    let interactive = InteractiveMode::new(Arc::clone(&registry), Arc::clone(&display));
    tokio::select! {
        _ = follow_events(Arc::clone(&registry), Arc::clone(&display)) => {
            info!("All downloads settled");
        }
        _ = interactive.run() => {
            info!("Quit requested, stopping active downloads");
            for manager in registry.jobs().await {
                if manager.status().await == DownloadStatus::Downloading {
                    // Paused jobs keep their chunk offsets in the session.
                    if let Err(e) = manager.pause().await {
                        debug!("[Job {}] {}", short_id(manager.id()), e);
                    }
                }
            }
            registry.settled().await;
        }
    }

    let saved = registry.save_session().await?;
    info!("Session saved ({} job(s))", saved);
    Ok(())
}
