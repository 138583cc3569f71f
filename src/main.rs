//! CLI bootstrap for the microscope control core.
//!
//! Loads the persisted settings and calibration documents, constructs the
//! motion engine and both sensor pipelines (against deterministic mocks,
//! since the real GPIO/PWM/I2C and camera drivers are external collaborators
//! per the crate's scope), and runs a session against newline-delimited
//! JSON commands on stdin, printing events as newline-delimited JSON on
//! stdout. This is the reference host for the dispatcher's abstract
//! command/event channel; a production deployment substitutes a real
//! transport and real hardware drivers behind the same [`PinIo`],
//! [`CameraSensor`], and [`EventSink`] traits.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use microscope_core::axis::{Axis, AxisTag};
use microscope_core::config::{AxisCalibrationDocument, Settings};
use microscope_core::dispatcher::{Command, Event, EventSink, SessionDispatcher};
use microscope_core::error::AppResult;
use microscope_core::motion::MotionEngine;
use microscope_core::pin_io::MockPinIo;
use microscope_core::video::{CameraConfig, CameraSensor, FrameCodec, MockCameraSensor, MockFrameCodec, SensorPipeline};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Networked digital microscope control core.
#[derive(Parser, Debug)]
#[command(name = "microscope_core", version, about)]
struct Cli {
    /// Path to the settings TOML document.
    #[arg(long, default_value = "settings.toml")]
    settings: PathBuf,

    /// Path to the axis calibration TOML document.
    #[arg(long, default_value = "calibration.toml")]
    calibration: PathBuf,

    /// Scratch directory for in-progress recordings.
    #[arg(long, default_value = "/tmp/microscope-scratch")]
    scratch_dir: PathBuf,

    /// Log level filter, e.g. "info", "debug", "microscope_core=trace".
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Writes each event as a JSON line on stdout.
struct StdoutEventSink;

#[async_trait::async_trait]
impl EventSink for StdoutEventSink {
    async fn emit(&self, event: Event) {
        match serde_json::to_string(&event) {
            Ok(line) => {
                let mut stdout = std::io::stdout();
                let _ = writeln!(stdout, "{line}");
            }
            Err(e) => error!(error = %e, "failed to serialize outbound event"),
        }
    }
}

fn build_engine(calibration: &AxisCalibrationDocument, settings: &Settings, pins: Arc<MockPinIo>) -> MotionEngine<MockPinIo> {
    let axes = vec![
        Arc::new(Axis::new(
            AxisTag::X,
            [1, 2, 3, 4],
            calibration.x_sign,
            calibration.x,
            settings.xy_steps_per_mm,
            calibration.backlash_margin_steps,
        )),
        Arc::new(Axis::new(
            AxisTag::Y,
            [5, 6, 7, 8],
            calibration.y_sign,
            calibration.y,
            settings.xy_steps_per_mm,
            calibration.backlash_margin_steps,
        )),
        Arc::new(Axis::new(
            AxisTag::Z,
            [9, 10, 11, 12],
            calibration.z_sign,
            calibration.z,
            settings.z_steps_per_mm,
            calibration.backlash_margin_steps,
        )),
    ];
    MotionEngine::new(axes, pins)
}

async fn run(cli: Cli) -> AppResult<()> {
    let (settings, calibration) = SessionDispatcher::<MockPinIo, StdoutEventSink>::load_documents(&cli.settings, &cli.calibration)?;
    std::fs::create_dir_all(&cli.scratch_dir)?;

    let pins = Arc::new(MockPinIo::new());
    let engine = build_engine(&calibration, &settings, pins.clone());

    let main_pipeline: Arc<SensorPipeline<dyn CameraSensor, dyn FrameCodec>> =
        Arc::new(SensorPipeline::new(Arc::new(MockCameraSensor::new((1920, 1080))), Arc::new(MockFrameCodec), false));
    let secondary_pipeline: Arc<SensorPipeline<dyn CameraSensor, dyn FrameCodec>> =
        Arc::new(SensorPipeline::new(Arc::new(MockCameraSensor::new((1280, 720))), Arc::new(MockFrameCodec), true));
    main_pipeline.start_preview(CameraConfig::default()).await?;

    let dispatcher = Arc::new(SessionDispatcher::new(
        engine,
        pins,
        main_pipeline,
        secondary_pipeline,
        settings,
        cli.settings.clone(),
        cli.calibration.clone(),
        cli.scratch_dir.clone(),
        Arc::new(StdoutEventSink),
    ));
    dispatcher.clone().attach_video_sinks().await;

    let telemetry = tokio::spawn(dispatcher.clone().run_telemetry_loop());

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Command>(&line) {
            Ok(command) => {
                let closing = matches!(command, Command::Close);
                dispatcher.clone().handle_command(command).await;
                if closing {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, line, "failed to parse inbound command");
                dispatcher.report_protocol_error(format!("malformed command: {e}")).await;
            }
        }
    }

    dispatcher.disconnect().await;
    telemetry.abort();
    info!("session ended");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    run(cli).await?;
    Ok(())
}
