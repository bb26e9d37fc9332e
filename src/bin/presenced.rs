use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, TryRecvError};
use std::time::{Duration, Instant};

use presence_pipeline::{CameraState, Dashboard, PipelineConfig};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
const LOOP_SLEEP: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run the presence capture and recognition pipeline"
)]
struct Args {
    /// Pipeline config file (TOML, or JSON with a .json extension).
    #[arg(long, env = "PRESENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Use the built-in mock recognition backend.
    #[arg(long)]
    demo: bool,

    /// Stop after this many seconds (runs until Ctrl-C otherwise).
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Viewport size the overlays are mapped into, e.g. 1280x720.
    #[arg(long)]
    viewport: Option<String>,

    /// Print overlays on every health line.
    #[arg(long)]
    print_overlays: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = PipelineConfig::load_from(args.config.as_deref())?;
    if args.demo {
        cfg.backend.demo = true;
    }
    if let Some(viewport) = args.viewport.as_deref() {
        let (width, height) = parse_viewport(viewport)?;
        cfg.viewport.width = width;
        cfg.viewport.height = height;
    }

    let mut dashboard = Dashboard::from_config(&cfg)?;
    log::info!(
        "presenced starting: device={} backend={} interval={}ms demo={}",
        cfg.camera.device,
        cfg.backend.base_url,
        cfg.sampler.interval.as_millis(),
        cfg.backend.demo
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let started = Instant::now();
    let deadline = args.duration_secs.map(|secs| started + Duration::from_secs(secs));
    let mut last_health_log = started;

    dashboard.start_camera(started);
    loop {
        match rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                log::info!("shutdown signal received");
                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        let now = Instant::now();
        if deadline.is_some_and(|deadline| now >= deadline) {
            log::info!("run duration elapsed");
            break;
        }

        dashboard.poll(now);

        let camera = dashboard.camera_state();
        if camera.is_terminal() {
            let message = dashboard
                .camera_error()
                .map(|err| err.to_string())
                .unwrap_or_else(|| camera.describe().to_string());
            dashboard.stop_camera(now);
            return Err(anyhow!("camera unavailable: {}", message));
        }

        if now.duration_since(last_health_log) >= HEALTH_LOG_INTERVAL {
            let status = dashboard.status(now);
            log::info!(
                "health camera={:?} connection={:?} processing={:?} frames={} fps={} latency_ms={:?} detections={}",
                status.camera,
                status.connection,
                status.processing,
                status.frame_count,
                status.fps,
                status.latency_ms,
                status.detections
            );
            if args.print_overlays {
                println!("{}", serde_json::to_string(&dashboard.overlays())?);
            }
            if let Some(event) = dashboard.recent_events().next() {
                log::debug!("latest recognition: {} ({:?})", event.label, event.confidence);
            }
            last_health_log = now;
        }

        std::thread::sleep(LOOP_SLEEP);
    }

    dashboard.stop_camera(Instant::now());
    if dashboard.camera_state() != CameraState::Idle {
        log::warn!("camera did not return to idle on shutdown");
    }
    let stats = dashboard.queue_stats();
    log::info!(
        "presenced stopped: dispatched={} succeeded={} failed={} dropped={}",
        stats.dispatched,
        stats.succeeded,
        stats.failed,
        stats.dropped
    );
    Ok(())
}

fn parse_viewport(value: &str) -> Result<(f64, f64)> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("viewport must look like WIDTHxHEIGHT, got '{}'", value))?;
    let width: f64 = width
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid viewport width '{}'", width))?;
    let height: f64 = height
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid viewport height '{}'", height))?;
    if width <= 0.0 || height <= 0.0 {
        return Err(anyhow!("viewport dimensions must be positive"));
    }
    Ok((width, height))
}
