//! CLI entry point (C13).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing_subscriber::EnvFilter;

use meteor_daq::capture::{Clock, MockCaptureSource, MockImageEncoder, NoMotionMetadata, SystemClock};
use meteor_daq::config::AppConfig;
use meteor_daq::engine::DetectionEngine;
use meteor_daq::ingest::Ingest;
use meteor_daq::push_client::PushClient;
use meteor_daq::stacker::FrameStacker;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "meteor_daq", about = "On-camera meteor detection pipeline")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "meteor_daq.toml")]
    config: PathBuf,

    /// Tracing log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Use the synthetic capture/encode backend. Real vendor SDK integration
    /// is out of scope for this crate; this flag exists so the binary always
    /// has a working backend to run against.
    #[arg(long, default_value_t = true)]
    mock_capture: bool,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = AppConfig::load(&cli.config).unwrap_or_else(|e| {
        tracing::warn!(error = %e, path = %cli.config.display(), "failed to load config, using defaults");
        AppConfig::default()
    });

    if !cli.mock_capture {
        anyhow::bail!("real vendor capture backend is out of scope for this crate; run with --mock-capture");
    }

    let push = Arc::new(PushClient::new(
        config.push.server_ip.clone(),
        config.push.server_port,
        config.push.timeout_ms,
    ));

    let capture = Box::new(MockCaptureSource::new(
        config.detect.detect_w as usize,
        config.detect.detect_h as usize,
        16,
        config.detect.fps,
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let engine = DetectionEngine::start(config.detect.clone(), config.push.clone(), Arc::clone(&push));

    let stacker = FrameStacker::start(
        config.detect.detect_w as usize,
        config.detect.detect_h as usize,
        config.stacker.frames_per_stack,
        config.stacker.jpeg_quality,
        config.push.station_id.clone(),
        PathBuf::from(&config.stacker.stack_tmp_dir),
        config.stacker.dark_frame_path.clone().map(PathBuf::from),
        Arc::clone(&push),
        Arc::new(MockImageEncoder),
        Arc::new(NoMotionMetadata),
    );

    // `_ingest` is kept alive for the process lifetime; its Drop impl signals
    // and joins the engine/stacker worker threads if this scope ever exits.
    // There is no SIGINT handler here (out of scope, see C13) — the process
    // is expected to be stopped externally, the same as the capture/ISP
    // init this crate doesn't own.
    let _ingest = Ingest::start(
        capture,
        clock,
        engine,
        stacker,
        config.detect.detect_w as usize,
        config.detect.detect_h as usize,
    );

    tracing::info!("meteor_daq running");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}
