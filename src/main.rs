//! Keystone - perspective correction by precomputed remap tables
//!
//! Four corner points describe where the canonical frame rectangle should
//! land on the display. A per-pixel scatter table is computed once from the
//! projective transform and then applied to frames with one of several
//! strategies (sequential, parallel, block transfer), which the `bench`
//! command times against each other.

mod apply;
mod bench;
mod canvas;
mod config;
mod output;
mod remap;
mod server;
mod session;
mod transform;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::apply::{hardware_concurrency, BlockIsa, Method, Remapper};
use crate::bench::{BenchReport, Benchmark, FrameSink};
use crate::canvas::{Canvas, SourceFrame};
use crate::config::{Config, CornerSet, Point, Resolution};
use crate::output::VirtualCamera;
use crate::remap::RemapTable;
use crate::server::{AppState, PreviewSink};
use crate::session::{run_calibration, CalibrationSession};

/// Keystone - projective remap benchmark and calibration tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file path (created with defaults if missing)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Time one remap strategy on a still image
    Bench(BenchArgs),
    /// Pick the corners interactively in the web UI
    Calibrate(CalibrateArgs),
    /// List remap strategies and whether this machine supports them
    Methods,
}

#[derive(ClapArgs, Debug)]
struct BenchArgs {
    /// Remap strategy
    #[arg(value_enum)]
    method: Method,

    /// Source image
    image: PathBuf,

    /// Top-left corner (x,y)
    top_left: Point,

    /// Top-right corner (x,y)
    top_right: Point,

    /// Bottom-right corner (x,y)
    bottom_right: Point,

    /// Bottom-left corner (x,y)
    bottom_left: Point,

    #[command(flatten)]
    display: DisplayArgs,

    /// Number of timed iterations
    #[arg(long)]
    repeat: Option<u32>,

    /// Do not start the web preview
    #[arg(long)]
    no_gui: bool,
}

#[derive(ClapArgs, Debug)]
struct CalibrateArgs {
    /// Source image
    image: PathBuf,

    /// Remap strategy used once the corners are picked
    #[arg(long, value_enum)]
    method: Option<Method>,

    #[command(flatten)]
    display: DisplayArgs,
}

/// Options shared by the commands that display frames
#[derive(ClapArgs, Debug)]
struct DisplayArgs {
    /// Processing resolution (WxH)
    #[arg(long)]
    resolution: Option<Resolution>,

    /// Virtual camera device (v4l2loopback, e.g. /dev/video10)
    #[arg(long)]
    output_device: Option<String>,

    /// Web server host
    #[arg(long)]
    host: Option<String>,

    /// Web server port
    #[arg(short, long)]
    port: Option<u16>,
}

impl DisplayArgs {
    /// Apply the CLI values on top of the config file
    fn apply_to(&self, config: &mut Config) {
        if let Some(resolution) = self.resolution {
            config.display.width = resolution.width;
            config.display.height = resolution.height;
        }
        if let Some(device) = &self.output_device {
            config.output.device = Some(device.clone());
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Keystone v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => Config::load_or_create(path)?,
        None => Config::default(),
    };

    match args.command {
        Command::Bench(bench) => run_bench(bench, config, args.config).await,
        Command::Calibrate(calibrate) => run_calibrate(calibrate, config, args.config).await,
        Command::Methods => {
            list_methods();
            Ok(())
        }
    }
}

fn list_methods() {
    println!("Hardware threads: {}", hardware_concurrency());
    println!(
        "Block transfer ISA: {}",
        BlockIsa::detect().map_or("none", |isa| isa.name())
    );
    for method in Method::ALL {
        println!(
            "  {:<24} {:<14} {}",
            method.name(),
            if method.is_available() { "available" } else { "unavailable" },
            method.description()
        );
    }
}

/// Raise `stop` on Ctrl-C
fn spawn_ctrl_c_watcher(stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping");
            stop.store(true, Ordering::SeqCst);
        }
    });
}

fn spawn_server(config: &Config, state: Arc<AppState>) {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting web server at http://{}", addr);

    tokio::spawn(async move {
        if let Err(e) = server::run_server(&addr, state).await {
            tracing::error!("Server error: {}", e);
        }
    });
}

/// Open the virtual camera if one is configured
fn open_output(config: &Config, resolution: Resolution) -> Result<Option<VirtualCamera>> {
    config
        .output
        .device
        .as_deref()
        .map(|device| VirtualCamera::open(device, resolution))
        .transpose()
}

async fn run_bench(args: BenchArgs, mut config: Config, config_path: Option<PathBuf>) -> Result<()> {
    args.display.apply_to(&mut config);
    if let Some(repeat) = args.repeat {
        config.bench.repeat = repeat;
    }
    if args.no_gui {
        config.bench.gui = false;
    }

    let method = args.method;
    let resolution = config.display.resolution();
    let corners = CornerSet::new(args.top_left, args.top_right, args.bottom_right, args.bottom_left);

    method.ensure_available()?;
    if !corners.is_within(resolution) {
        warn!("Corners {} reach outside the {} frame", corners, resolution);
    }

    let source = SourceFrame::load(&args.image, resolution)?;
    info!("Resolution: {}, corners: {}", resolution, corners);

    let stop = Arc::new(AtomicBool::new(false));
    spawn_ctrl_c_watcher(stop.clone());

    let mut sinks: Vec<Box<dyn FrameSink>> = Vec::new();
    if config.bench.gui {
        let state = Arc::new(AppState::new(
            Arc::new(RwLock::new(config.clone())),
            config_path,
            CalibrationSession::fixed(resolution, corners),
            method,
            stop.clone(),
        ));
        spawn_server(&config, state.clone());
        sinks.push(Box::new(PreviewSink::new(state)));
    }
    if let Some(camera) = open_output(&config, resolution)? {
        sinks.push(Box::new(camera));
    }

    let repeat = config.bench.repeat;
    let report = tokio::task::spawn_blocking(move || -> Result<BenchReport> {
        let start = Instant::now();
        let table = RemapTable::from_corners(&corners, resolution)?;
        info!(
            "Remap table built in {} ms ({:.1}% coverage)",
            start.elapsed().as_millis(),
            table.coverage() * 100.0
        );
        if !table.is_injective() {
            info!("Some destinations are hit more than once; parallel results may differ there");
        }

        let canvas = Canvas::new(resolution);
        let remapper = Remapper::new(method, &table, &canvas)
            .with_context(|| format!("Cannot bind the remap table for {}", method))?;

        let mut benchmark = sinks
            .into_iter()
            .fold(Benchmark::new(repeat, stop), |b, sink| b.with_sink(sink));
        Ok(benchmark.run(&remapper, &canvas, source.words()))
    })
    .await
    .context("Benchmark task panicked")??;

    report.log_summary();
    Ok(())
}

async fn run_calibrate(
    args: CalibrateArgs,
    mut config: Config,
    config_path: Option<PathBuf>,
) -> Result<()> {
    args.display.apply_to(&mut config);

    let method = args.method.unwrap_or(config.bench.method);
    let resolution = config.display.resolution();

    method.ensure_available()?;
    let source = SourceFrame::load(&args.image, resolution)?;

    let session = match config.calibration.corners {
        Some(corners) if corners.is_within(resolution) => {
            info!("Using saved corners {}", corners);
            CalibrationSession::with_corners(resolution, corners)
        }
        Some(corners) => {
            warn!("Saved corners {} do not fit {}, picking again", corners, resolution);
            CalibrationSession::new(resolution)
        }
        None => CalibrationSession::new(resolution),
    };

    let stop = Arc::new(AtomicBool::new(false));
    spawn_ctrl_c_watcher(stop.clone());

    let state = Arc::new(AppState::new(
        Arc::new(RwLock::new(config.clone())),
        config_path,
        session,
        method,
        stop,
    ));
    spawn_server(&config, state.clone());

    let mut sinks: Vec<Box<dyn FrameSink>> = vec![Box::new(PreviewSink::new(state.clone()))];
    if let Some(camera) = open_output(&config, resolution)? {
        sinks.push(Box::new(camera));
    }

    tokio::task::spawn_blocking(move || run_calibration(state, source, method, sinks))
        .await
        .context("Calibration task panicked")??;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bench_command() {
        let args = Args::try_parse_from([
            "keystone",
            "bench",
            "parallel-o1",
            "frame.png",
            "100,100",
            "1819,100",
            "1819,979",
            "100,979",
            "--resolution",
            "1920x1080",
            "--repeat",
            "10",
            "--no-gui",
        ])
        .unwrap();

        let Command::Bench(bench) = args.command else {
            panic!("expected bench command");
        };
        assert_eq!(bench.method, Method::ParallelBlockTransfer);
        assert_eq!(bench.top_left, Point::new(100.0, 100.0));
        assert_eq!(bench.bottom_right, Point::new(1819.0, 979.0));
        assert_eq!(bench.display.resolution, Some(Resolution::new(1920, 1080)));
        assert_eq!(bench.repeat, Some(10));
        assert!(bench.no_gui);
    }

    #[test]
    fn test_rejects_bad_corner() {
        let result = Args::try_parse_from([
            "keystone", "bench", "plain", "frame.png", "100;100", "1,1", "2,2", "3,3",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_unknown_method() {
        let result = Args::try_parse_from([
            "keystone", "bench", "fastest", "frame.png", "0,0", "1,0", "1,1", "0,1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::try_parse_from([
            "keystone",
            "-c",
            "keystone.toml",
            "calibrate",
            "frame.png",
            "--resolution",
            "640x480",
            "--port",
            "9000",
            "--output-device",
            "/dev/video10",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("keystone.toml")));

        let Command::Calibrate(calibrate) = args.command else {
            panic!("expected calibrate command");
        };
        let mut config = Config::default();
        calibrate.display.apply_to(&mut config);

        assert_eq!(config.display.resolution(), Resolution::new(640, 480));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.output.device.as_deref(), Some("/dev/video10"));
        assert!(calibrate.method.is_none());
    }
}
