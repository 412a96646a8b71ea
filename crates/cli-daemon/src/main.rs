//! CLI entry point for the recode daemon
//!
//! Loads the daemon configuration plus a JSON library of recordings, video
//! files and encode jobs, enqueues every listed job and supervises them to
//! completion. The HTTP API that normally feeds the manager lives outside
//! this repository; this driver exercises the same code path in batch form.

use clap::Parser;
use recode_daemon::{
    Collaborators, Config, EncodeEvent, EncodeEventBus, EncodeEventEmitter, EncodeManager,
    EncodeRequest, FfmpegProcessManager, MemoryRecordedStore, MemoryVideoFileStore, Recorded,
    StandardVideoUtil, TokioFileSystem, VideoFile, VideoFileStore,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Recode daemon - queue-managed re-encoding of recorded video files
#[derive(Parser, Debug)]
#[command(name = "recode-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Path to the JSON library of recordings, video files and jobs
    #[arg(short, long, default_value = "library.json")]
    library: PathBuf,
}

/// Batch input: the recording metadata and the jobs to run over it.
#[derive(Debug, Deserialize)]
struct Library {
    #[serde(default)]
    recorded: Vec<Recorded>,
    #[serde(default)]
    videos: Vec<VideoFile>,
    #[serde(default)]
    jobs: Vec<EncodeRequest>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("recode-daemon: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(Config::load(&args.config)?);
    let library: Library = serde_json::from_str(&std::fs::read_to_string(&args.library)?)?;
    info!(
        recordings = library.recorded.len(),
        videos = library.videos.len(),
        jobs = library.jobs.len(),
        "library loaded"
    );

    let videos: Arc<dyn VideoFileStore> = Arc::new(MemoryVideoFileStore::new(library.videos));
    let bus = Arc::new(EncodeEventBus::default());
    let mut events = bus.subscribe();

    let manager = EncodeManager::new(
        Arc::clone(&config),
        Collaborators {
            recorded: Arc::new(MemoryRecordedStore::new(library.recorded)),
            videos: Arc::clone(&videos),
            video_util: Arc::new(StandardVideoUtil::new(Arc::clone(&config), videos)),
            fs: Arc::new(TokioFileSystem),
            processes: Arc::new(FfmpegProcessManager::new(config.encode.ffmpeg.clone())),
            events: bus.clone() as Arc<dyn EncodeEventEmitter>,
        },
    );

    for job in library.jobs {
        if let Err(e) = manager.enqueue(job).await {
            warn!(error = %e, "job rejected");
        }
    }

    // Drive until the queue drains, relaying lifecycle events as they come.
    loop {
        while let Ok(event) = events.try_recv() {
            match event {
                EncodeEvent::Added(job_id) => info!(job_id, "job accepted"),
                EncodeEvent::Finished(finished) => info!(
                    mode = %finished.mode,
                    recorded_id = finished.recorded_id,
                    output = ?finished.full_output_path,
                    remove_original = finished.remove_original,
                    "job finished"
                ),
                EncodeEvent::Errored => warn!("a job failed"),
            }
        }

        let (waiting, running) = manager.queue_lengths().await;
        if waiting == 0 && running == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("all jobs drained");
    Ok(())
}
