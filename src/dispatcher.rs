//! Multiplexes operator commands, periodic telemetry, and binary responses
//! over one persistent session. Grounded on the same
//! `Instrument`/capability-trait independence the teacher's core uses to
//! keep hardware logic free of any particular wire transport: the
//! dispatcher is written against an abstract inbound command stream and an
//! [`EventSink`], never against a socket.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::autofocus::{AutofocusController, FocusOutcome};
use crate::axis::AxisTag;
use crate::config::{load_document, save_document, AxisCalibrationDocument, Settings};
use crate::error::{AppResult, MicroscopeError};
use crate::motion::MotionEngine;
use crate::pin_io::PinIo;
use crate::position::reconcile;
use crate::recorder::{
    MockMotionDetector, MockVideoWriter, MotionGatedRecorder, Recorder, RecorderLock, VideoWriter,
};
use crate::video::{CameraConfig, CameraSensor, FrameCodec, SensorPipeline, VideoFrameSink};

/// Fixed PWM channel for the first LED, from the compile-time pin map (§6.3).
const LED_0_PWM_CHANNEL: u8 = 0;
/// Fixed PWM channel for the second LED.
const LED_1_PWM_CHANNEL: u8 = 1;
/// LED dimming drive frequency.
const LED_PWM_FREQUENCY_HZ: f64 = 20_000.0;
/// Telemetry cadence while any axis is moving.
const TELEMETRY_ACTIVE_HZ: f64 = 5.0;
/// Telemetry cadence while idle.
const TELEMETRY_IDLE_HZ: f64 = 1.0;
/// Default main-recorder frame cap, used when a `start_recording` command
/// does not specify one.
const DEFAULT_MAIN_RECORDER_MAX_FRAMES: u64 = 18_000;
/// Inclusive upper bound on LED PWM duty percent.
const MAX_LED_DUTY_PERCENT: u8 = 100;

/// Rejects a non-finite or non-positive exposure/gain value (§7 protocol errors).
fn validate_positive(field: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(MicroscopeError::Protocol(format!("{field} must be a positive, finite number, got {value}")))
    }
}

/// Rejects an LED duty outside `0..=100` (§6.2 command table).
fn validate_led_duty(value: u8) -> AppResult<()> {
    if value <= MAX_LED_DUTY_PERCENT {
        Ok(())
    } else {
        Err(MicroscopeError::Protocol(format!("led duty must be 0..={MAX_LED_DUTY_PERCENT}, got {value}")))
    }
}

/// Inbound commands, matching the persisted-session command table.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum Command {
    /// Sets exposure time in milliseconds.
    SetExposure { value: f64 },
    /// Sets analogue sensor gain.
    SetGain { value: f64 },
    /// Sets LED channel 0 duty, 0..100.
    SetLed0 { value: u8 },
    /// Sets LED channel 1 duty, 0..100.
    SetLed1 { value: u8 },
    /// Absolute move of X to a target in millimetres.
    SetXPos { value: f64 },
    /// Absolute move of Y to a target in millimetres.
    SetYPos { value: f64 },
    /// Absolute move of Z to a target in millimetres.
    SetZPos { value: f64 },
    /// Relative move of X by a signed step count.
    MoveX { steps: i64 },
    /// Relative move of Y by a signed step count.
    MoveY { steps: i64 },
    /// Relative move of Z by a signed step count.
    MoveZ { steps: i64 },
    /// Preempts any in-flight move and any running focus session.
    StopMove,
    /// Starts an autofocus session on the Z axis.
    FastFocus,
    /// Captures one full-resolution still from the main sensor.
    Capture,
    /// Starts the main-sensor recorder.
    StartRecording {
        /// Inter-frame delay in seconds; omitted means the sensor's nominal rate.
        interval: Option<f64>,
        /// Frame cap; defaults to [`DEFAULT_MAIN_RECORDER_MAX_FRAMES`].
        max_frames: Option<u64>,
    },
    /// Stops the main-sensor recorder.
    StopRecording,
    /// Persists the current settings document.
    SaveConfig {
        /// New default X step size, in steps.
        x_step_size: i64,
        /// New default Y step size, in steps.
        y_step_size: i64,
        /// New default Z step size, in steps.
        z_step_size: i64,
    },
    /// Graceful shutdown of the session.
    Close,
}

/// Severity carried by a `log_message` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Informational, no operator action needed.
    Info,
    /// A fault the operator should notice.
    Error,
}

/// Outbound events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Event {
    /// Echoes the current settings document after a change.
    SettingsUpdate(Settings),
    /// Periodic position/telemetry snapshot.
    MotorPositions {
        /// X position in millimetres.
        x_mm: f64,
        /// Y position in millimetres.
        y_mm: f64,
        /// Z position in millimetres.
        z_mm: f64,
        /// X axis Hall voltage.
        x_volts: f64,
        /// Y axis Hall voltage.
        y_volts: f64,
        /// Z axis Hall voltage.
        z_volts: f64,
        /// True while any axis is actively stepping.
        moving: bool,
    },
    /// A base64-encoded preview JPEG, emitted at half the capture rate.
    VideoFrame {
        /// Which sensor produced the frame.
        sensor: &'static str,
        /// Base64-encoded JPEG bytes.
        jpeg_base64: String,
    },
    /// Result of a completed or aborted autofocus session.
    FocusComplete {
        /// Whether the session converged (or reports a fallback position).
        success: bool,
        /// Final Z position in millimetres, if available.
        position_mm: Option<f64>,
        /// Error description if aborted.
        error: Option<String>,
    },
    /// Result of a `capture` command.
    CaptureResponse {
        /// Whether the capture succeeded.
        success: bool,
        /// Base64-encoded JPEG bytes, if successful.
        jpeg_base64: Option<String>,
        /// Error description if unsuccessful.
        error: Option<String>,
    },
    /// Result of a recording start/stop/cap.
    RecordingResponse {
        /// Whether the operation succeeded.
        success: bool,
        /// Output file path, if a recording completed.
        path: Option<String>,
        /// Output file size in bytes, if a recording completed.
        size_bytes: Option<u64>,
        /// Error description if unsuccessful.
        error: Option<String>,
    },
    /// A free-form operator-facing log line.
    LogMessage {
        /// Severity.
        level: LogLevel,
        /// Message text.
        message: String,
    },
    /// Sent to any pending operation when the session is torn down.
    Closed,
}

/// The decoupling seam between the dispatcher and the persisted-session
/// transport: delivers outbound events without the dispatcher depending on
/// any particular wire format or socket type.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers one outbound event.
    async fn emit(&self, event: Event);
}

/// Owns the three axes, both sensor pipelines, both recorders, and the
/// persisted documents for one session, and mediates every inbound command
/// against them.
///
/// Per the teacher's "no global mutable state" design note, every piece of
/// session state is reached through this one struct rather than through
/// module-level singletons; the only interior synchronisation is on the
/// small set of fields that are genuinely read and written from multiple
/// concurrent tasks (settings, the sink registration, recorder state).
pub struct SessionDispatcher<P: PinIo + 'static, E: EventSink + 'static> {
    engine: MotionEngine<P>,
    pin_io: Arc<P>,
    main_pipeline: Arc<SensorPipeline<dyn CameraSensor, dyn FrameCodec>>,
    secondary_pipeline: Arc<SensorPipeline<dyn CameraSensor, dyn FrameCodec>>,
    settings: RwLock<Settings>,
    settings_path: PathBuf,
    calibration_path: PathBuf,
    sink: Arc<E>,
    connected: AtomicBool,
    recorder_lock: Arc<RecorderLock>,
    main_recorder: Mutex<Option<Arc<Recorder>>>,
    secondary_recorder: Mutex<Option<Arc<MotionGatedRecorder>>>,
    focus_cancel: Mutex<Option<Arc<AtomicBool>>>,
    scratch_dir: PathBuf,
}

/// Forwards a video pipeline's halved-rate preview frames into the
/// dispatcher's event sink, tagged with which sensor produced them.
struct PipelineVideoSink<P: PinIo + 'static, E: EventSink + 'static> {
    dispatcher: Arc<SessionDispatcher<P, E>>,
    sensor: &'static str,
}

#[async_trait]
impl<P: PinIo + 'static, E: EventSink + 'static> VideoFrameSink for PipelineVideoSink<P, E> {
    async fn emit_video_frame(&self, jpeg: Vec<u8>) {
        self.dispatcher
            .sink
            .emit(Event::VideoFrame { sensor: self.sensor, jpeg_base64: BASE64.encode(jpeg) })
            .await;
    }
}

impl<P: PinIo + 'static, E: EventSink + 'static> SessionDispatcher<P, E> {
    /// Registers this dispatcher as the `video_frame` telemetry sink on both
    /// sensor pipelines. Called once after construction, since it needs an
    /// `Arc` to itself.
    pub async fn attach_video_sinks(self: Arc<Self>) {
        self.main_pipeline
            .set_sink(Arc::new(PipelineVideoSink { dispatcher: self.clone(), sensor: "main" }))
            .await;
        self.secondary_pipeline
            .set_sink(Arc::new(PipelineVideoSink { dispatcher: self.clone(), sensor: "secondary" }))
            .await;
    }

    /// Builds a dispatcher over an already-constructed motion engine and
    /// sensor pipelines, loading `settings_path`/`calibration_path` (falling
    /// back to documented defaults if absent).
    pub fn new(
        engine: MotionEngine<P>,
        pin_io: Arc<P>,
        main_pipeline: Arc<SensorPipeline<dyn CameraSensor, dyn FrameCodec>>,
        secondary_pipeline: Arc<SensorPipeline<dyn CameraSensor, dyn FrameCodec>>,
        settings: Settings,
        settings_path: PathBuf,
        calibration_path: PathBuf,
        scratch_dir: PathBuf,
        sink: Arc<E>,
    ) -> Self {
        Self {
            engine,
            pin_io,
            main_pipeline,
            secondary_pipeline,
            settings: RwLock::new(settings),
            settings_path,
            calibration_path,
            sink,
            connected: AtomicBool::new(true),
            recorder_lock: Arc::new(RecorderLock::default()),
            main_recorder: Mutex::new(None),
            secondary_recorder: Mutex::new(None),
            focus_cancel: Mutex::new(None),
            scratch_dir,
        }
    }

    /// Loads both documents from disk, falling back to defaults on a
    /// missing or unreadable file.
    pub fn load_documents(settings_path: &std::path::Path, calibration_path: &std::path::Path) -> AppResult<(Settings, AxisCalibrationDocument)> {
        let settings = load_document::<Settings>(settings_path, "MICROSCOPE_SETTINGS_")?;
        let calibration = load_document::<AxisCalibrationDocument>(calibration_path, "MICROSCOPE_CAL_")?;
        Ok((settings, calibration))
    }

    async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.emit(Event::LogMessage { level, message: message.into() }).await;
    }

    /// Reports a protocol error (malformed command body) that never reached
    /// [`Self::handle_command`] because it failed to deserialize at all.
    /// State is left untouched, matching every other protocol-error path.
    pub async fn report_protocol_error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message).await;
    }

    /// Dispatches one inbound command, emitting whatever response/events
    /// its classification calls for.
    pub async fn handle_command(self: Arc<Self>, command: Command) {
        match command {
            Command::SetExposure { value } => self.set_exposure(value).await,
            Command::SetGain { value } => self.set_gain(value).await,
            Command::SetLed0 { value } => self.set_led(LED_0_PWM_CHANNEL, value).await,
            Command::SetLed1 { value } => self.set_led(LED_1_PWM_CHANNEL, value).await,
            Command::SetXPos { value } => self.move_absolute_mm(AxisTag::X, value).await,
            Command::SetYPos { value } => self.move_absolute_mm(AxisTag::Y, value).await,
            Command::SetZPos { value } => self.move_absolute_mm(AxisTag::Z, value).await,
            Command::MoveX { steps } => self.move_relative_steps(AxisTag::X, steps).await,
            Command::MoveY { steps } => self.move_relative_steps(AxisTag::Y, steps).await,
            Command::MoveZ { steps } => self.move_relative_steps(AxisTag::Z, steps).await,
            Command::StopMove => self.stop_move().await,
            Command::FastFocus => {
                let this = self.clone();
                tokio::spawn(async move { this.fast_focus().await });
            }
            Command::Capture => {
                let this = self.clone();
                tokio::spawn(async move { this.capture().await });
            }
            Command::StartRecording { interval, max_frames } => {
                let this = self.clone();
                tokio::spawn(async move { this.start_recording(interval, max_frames).await });
            }
            Command::StopRecording => self.stop_recording().await,
            Command::SaveConfig { x_step_size, y_step_size, z_step_size } => {
                self.save_config(x_step_size, y_step_size, z_step_size).await
            }
            Command::Close => self.disconnect().await,
        }
    }

    async fn set_exposure(&self, value: f64) {
        if let Err(e) = validate_positive("exposure_value", value) {
            self.log(LogLevel::Error, e.to_string()).await;
            return;
        }
        let mut settings = self.settings.write().await;
        settings.exposure_value = value;
        self.sink.emit(Event::SettingsUpdate(settings.clone())).await;
    }

    async fn set_gain(&self, value: f64) {
        if let Err(e) = validate_positive("gain_value", value) {
            self.log(LogLevel::Error, e.to_string()).await;
            return;
        }
        let mut settings = self.settings.write().await;
        settings.gain_value = value;
        self.sink.emit(Event::SettingsUpdate(settings.clone())).await;
    }

    async fn set_led(&self, channel: u8, duty_percent: u8) {
        if let Err(e) = validate_led_duty(duty_percent) {
            self.log(LogLevel::Error, e.to_string()).await;
            return;
        }
        if let Err(e) = self.pin_io.pwm_configure(channel, LED_PWM_FREQUENCY_HZ, duty_percent).await {
            self.log(LogLevel::Error, format!("led {channel} configure failed: {e}")).await;
        }
    }

    fn steps_per_mm(&self, tag: AxisTag, settings: &Settings) -> f64 {
        match tag {
            AxisTag::Z => settings.z_steps_per_mm,
            AxisTag::X | AxisTag::Y => settings.xy_steps_per_mm,
        }
    }

    async fn move_absolute_mm(&self, tag: AxisTag, target_mm: f64) {
        let steps_per_mm = self.steps_per_mm(tag, &*self.settings.read().await);
        let target_steps = (target_mm * steps_per_mm).round() as i64;
        if let Err(e) = self.engine.move_absolute(tag, target_steps).await {
            self.log(LogLevel::Error, format!("{tag} move failed: {e}")).await;
        }
    }

    async fn move_relative_steps(&self, tag: AxisTag, steps: i64) {
        if let Err(e) = self.engine.move_relative(tag, steps).await {
            self.log(LogLevel::Error, format!("{tag} move failed: {e}")).await;
        }
    }

    async fn stop_move(&self) {
        self.engine.stop_all();
        if let Some(cancel) = self.focus_cancel.lock().await.as_ref() {
            cancel.store(true, Ordering::SeqCst);
        }
    }

    async fn fast_focus(&self) {
        let controller = AutofocusController::new(self.main_pipeline.sharpness_receiver());
        *self.focus_cancel.lock().await = Some(controller.cancel_handle());
        let steps_per_mm = self.settings.read().await.z_steps_per_mm;
        let outcome = controller.run(&self.engine, steps_per_mm).await;
        *self.focus_cancel.lock().await = None;

        let event = match outcome {
            Ok(FocusOutcome::Converged { z_mm, .. }) | Ok(FocusOutcome::Fallback { z_mm, .. }) => {
                Event::FocusComplete { success: true, position_mm: Some(z_mm), error: None }
            }
            Ok(FocusOutcome::Aborted { reason }) => {
                Event::FocusComplete { success: false, position_mm: None, error: Some(reason) }
            }
            Err(e) => Event::FocusComplete { success: false, position_mm: None, error: Some(e.to_string()) },
        };
        self.sink.emit(event).await;
    }

    async fn capture(&self) {
        let response = match self.main_pipeline.capture_still().await {
            Ok(frame) => {
                let jpeg = self.main_pipeline.encode_jpeg(&frame);
                let resumed = self.main_pipeline.resume_preview(CameraConfig::default()).await;
                if let Err(e) = resumed {
                    warn!(error = %e, "failed to resume preview after still capture");
                }
                Event::CaptureResponse { success: true, jpeg_base64: Some(BASE64.encode(jpeg)), error: None }
            }
            Err(e) => Event::CaptureResponse { success: false, jpeg_base64: None, error: Some(e.to_string()) },
        };
        self.sink.emit(response).await;
    }

    async fn start_recording(self: Arc<Self>, interval: Option<f64>, max_frames: Option<u64>) {
        if let Err(e) = self.recorder_lock.try_start_main() {
            self.sink
                .emit(Event::RecordingResponse { success: false, path: None, size_bytes: None, error: Some(e.to_string()) })
                .await;
            return;
        }
        let recorder = Arc::new(Recorder::new());
        *self.main_recorder.lock().await = Some(recorder.clone());

        let path = self.scratch_dir.join(format!("recording-{}.mp4", uuid::Uuid::new_v4()));
        let writer: Box<dyn VideoWriter> = Box::new(MockVideoWriter::new(path));
        let raw_rx = self.main_pipeline.raw_receiver();
        let inter_frame_delay = interval.map(Duration::from_secs_f64);
        let cap = max_frames.unwrap_or(DEFAULT_MAIN_RECORDER_MAX_FRAMES);

        let result = recorder.run(raw_rx, writer, inter_frame_delay, cap).await;
        *self.main_recorder.lock().await = None;
        self.recorder_lock.release_main();

        let event = match result {
            Ok(r) => Event::RecordingResponse {
                success: true,
                path: Some(r.path.display().to_string()),
                size_bytes: Some(r.size_bytes),
                error: None,
            },
            Err(e) => Event::RecordingResponse { success: false, path: None, size_bytes: None, error: Some(e.to_string()) },
        };
        self.sink.emit(event).await;
    }

    async fn stop_recording(&self) {
        if let Some(recorder) = self.main_recorder.lock().await.as_ref() {
            recorder.stop();
        }
        if let Some(recorder) = self.secondary_recorder.lock().await.as_ref() {
            recorder.stop();
        }
    }

    /// Starts the secondary-sensor motion-gated recorder. Not reachable from
    /// the command table directly (the secondary sensor records
    /// automatically whenever armed); exposed so a future supervisory
    /// command can start it without duplicating the mutual-exclusion logic.
    pub async fn start_secondary_recording(self: Arc<Self>) -> AppResult<()> {
        self.recorder_lock.try_start_secondary()?;
        let recorder = Arc::new(MotionGatedRecorder::new());
        *self.secondary_recorder.lock().await = Some(recorder.clone());

        let path = self.scratch_dir.join(format!("motion-{}.mp4", uuid::Uuid::new_v4()));
        let writer: Box<dyn VideoWriter> = Box::new(MockVideoWriter::new(path));
        let raw_rx = self.secondary_pipeline.raw_receiver();
        let detector = Box::new(MockMotionDetector::new());

        let result = recorder.run(raw_rx, writer, detector).await;
        *self.secondary_recorder.lock().await = None;
        self.recorder_lock.release_secondary();
        result.map(|_| ())
    }

    async fn save_config(&self, x_step_size: i64, y_step_size: i64, z_step_size: i64) {
        let mut settings = self.settings.write().await;
        settings.x_step_size = x_step_size;
        settings.y_step_size = y_step_size;
        settings.z_step_size = z_step_size;
        if let Err(e) = save_document(&*settings, &self.settings_path) {
            self.log(LogLevel::Error, format!("failed to persist settings: {e}")).await;
            return;
        }
        self.sink.emit(Event::SettingsUpdate(settings.clone())).await;
    }

    /// Reads one axis's Hall voltage via the pin map's ADC channel.
    async fn axis_volts(&self, tag: AxisTag) -> AppResult<f64> {
        let channel = match tag {
            AxisTag::X => crate::pin_io::AdcChannel::X,
            AxisTag::Y => crate::pin_io::AdcChannel::Y,
            AxisTag::Z => crate::pin_io::AdcChannel::Z,
        };
        self.pin_io.adc_read(channel).await
    }

    /// Runs until `disconnect` clears the connected flag: emits
    /// `motor_positions` at 5Hz while any axis is active, else 1Hz, and runs
    /// the position-estimator reconciliation (§4.4) for any axis that is
    /// currently moving.
    pub async fn run_telemetry_loop(self: Arc<Self>) {
        while self.connected.load(Ordering::SeqCst) {
            let moving = self.engine.axes().any(|a| a.is_active());
            let mut volts = [0.0_f64; 3];
            for (i, tag) in AxisTag::ALL.iter().enumerate() {
                match self.axis_volts(*tag).await {
                    Ok(v) => {
                        volts[i] = v;
                        if let Ok(axis) = self.engine.axis(*tag) {
                            if axis.is_active() {
                                reconcile(axis, v);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(axis = %tag, error = %e, "transient ADC read failure, skipping this tick");
                    }
                }
            }

            let snapshot = |tag: AxisTag| self.engine.axis(tag).map(|a| a.position_mm()).unwrap_or(0.0);
            self.sink
                .emit(Event::MotorPositions {
                    x_mm: snapshot(AxisTag::X),
                    y_mm: snapshot(AxisTag::Y),
                    z_mm: snapshot(AxisTag::Z),
                    x_volts: volts[0],
                    y_volts: volts[1],
                    z_volts: volts[2],
                    moving,
                })
                .await;

            let hz = if moving { TELEMETRY_ACTIVE_HZ } else { TELEMETRY_IDLE_HZ };
            tokio::time::sleep(Duration::from_secs_f64(1.0 / hz)).await;
        }
    }

    /// Tears the session down: clears every axis's `active` flag, stops both
    /// recorders, shuts down both sensors, zeroes both LEDs, and notifies
    /// any pending operation with `closed`. Idempotent.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return; // already torn down
        }
        info!("session disconnecting, tearing down");

        self.engine.stop_all();
        if let Some(cancel) = self.focus_cancel.lock().await.as_ref() {
            cancel.store(true, Ordering::SeqCst);
        }
        self.stop_recording().await;

        if let Err(e) = self.main_pipeline.shutdown().await {
            error!(error = %e, "main sensor shutdown failed");
        }
        if let Err(e) = self.secondary_pipeline.shutdown().await {
            error!(error = %e, "secondary sensor shutdown failed");
        }
        for channel in [LED_0_PWM_CHANNEL, LED_1_PWM_CHANNEL] {
            if let Err(e) = self.pin_io.pwm_configure(channel, LED_PWM_FREQUENCY_HZ, 0).await {
                error!(error = %e, channel, "failed to zero LED duty on disconnect");
            }
        }

        self.sink.emit(Event::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis;
    use crate::config::ArctanCalibration;
    use crate::pin_io::MockPinIo;
    use crate::video::{MockCameraSensor, MockFrameCodec};
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingSink {
        events: Arc<AsyncMutex<Vec<Event>>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&self, event: Event) {
            self.events.lock().await.push(event);
        }
    }

    fn dispatcher() -> (Arc<SessionDispatcher<MockPinIo, RecordingSink>>, Arc<AsyncMutex<Vec<Event>>>) {
        let pins = Arc::new(MockPinIo::new());
        let axes = vec![
            Arc::new(Axis::new(AxisTag::X, [1, 2, 3, 4], 1, ArctanCalibration::default(), 966.67, 35)),
            Arc::new(Axis::new(AxisTag::Y, [5, 6, 7, 8], 1, ArctanCalibration::default(), 966.67, 35)),
            Arc::new(Axis::new(AxisTag::Z, [9, 10, 11, 12], 1, ArctanCalibration::default(), 1450.0, 35)),
        ];
        let engine = MotionEngine::new(axes, pins.clone());
        let main_pipeline: Arc<SensorPipeline<dyn CameraSensor, dyn FrameCodec>> =
            Arc::new(SensorPipeline::new(Arc::new(MockCameraSensor::new((1920, 1080))), Arc::new(MockFrameCodec), false));
        let secondary_pipeline: Arc<SensorPipeline<dyn CameraSensor, dyn FrameCodec>> =
            Arc::new(SensorPipeline::new(Arc::new(MockCameraSensor::new((1280, 720))), Arc::new(MockFrameCodec), true));
        let events = Arc::new(AsyncMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink { events: events.clone() });
        let dispatcher = Arc::new(SessionDispatcher::new(
            engine,
            pins,
            main_pipeline,
            secondary_pipeline,
            Settings::default(),
            PathBuf::from("/tmp/does-not-exist-settings.toml"),
            PathBuf::from("/tmp/does-not-exist-cal.toml"),
            std::env::temp_dir(),
            sink,
        ));
        (dispatcher, events)
    }

    /// S1: a relative +1450 step move at default XY calibration lands at
    /// x_mm within 0.01mm of 1.5.
    #[tokio::test]
    async fn s1_relative_move_then_telemetry_read() {
        let (dispatcher, _events) = dispatcher();
        dispatcher.clone().handle_command(Command::MoveX { steps: 1450 }).await;
        let x_mm = dispatcher.engine.axis(AxisTag::X).expect("axis").position_mm();
        assert!((x_mm - 1.5).abs() < 0.01, "expected ~1.5mm, got {x_mm}");
    }

    /// S2: a 10,000-step Z move stopped after 500ms lands in [200, 400]
    /// steps at the ~125Hz step rate, with a generous band for jitter.
    #[tokio::test(flavor = "multi_thread")]
    async fn s2_preempted_move_lands_in_expected_band() {
        let (dispatcher, _events) = dispatcher();
        let mover = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.handle_command(Command::MoveZ { steps: 10_000 }).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        dispatcher.clone().handle_command(Command::StopMove).await;
        mover.await.expect("mover task");

        let z = dispatcher.engine.axis(AxisTag::Z).expect("axis");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!z.is_active(), "active should clear shortly after stop");
        let steps = z.position_steps();
        assert!((200..=400).contains(&steps), "expected steps in [200, 400], got {steps}");
    }

    /// S6: dropping the session stops recorders, clears active flags, and
    /// zeroes both LEDs, all within a short bound.
    #[tokio::test(flavor = "multi_thread")]
    async fn s6_disconnect_cleans_up_within_bound() {
        let (dispatcher, events) = dispatcher();
        dispatcher.clone().handle_command(Command::SetLed0 { value: 80 }).await;

        let mover = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.handle_command(Command::MoveX { steps: 50_000 }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = std::time::Instant::now();
        dispatcher.disconnect().await;
        mover.await.expect("mover task");
        assert!(start.elapsed() < Duration::from_millis(200));

        assert!(!dispatcher.engine.axis(AxisTag::X).expect("axis").is_active());
        assert_eq!(dispatcher.pin_io.pwm_state(LED_0_PWM_CHANNEL).await.map(|(_, d)| d), Some(0));
        let recorded = events.lock().await;
        assert!(matches!(recorded.last(), Some(Event::Closed)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (dispatcher, events) = dispatcher();
        dispatcher.disconnect().await;
        dispatcher.disconnect().await;
        let recorded = events.lock().await;
        assert_eq!(recorded.iter().filter(|e| matches!(e, Event::Closed)).count(), 1);
    }

    /// Protocol errors leave state untouched and produce a single
    /// `log_message{level:error}`, per §7.
    #[tokio::test]
    async fn out_of_range_led_duty_is_rejected_without_side_effects() {
        let (dispatcher, events) = dispatcher();
        dispatcher.clone().handle_command(Command::SetLed0 { value: 255 }).await;
        assert_eq!(dispatcher.pin_io.pwm_state(LED_0_PWM_CHANNEL).await, None);
        let recorded = events.lock().await;
        assert!(matches!(recorded.last(), Some(Event::LogMessage { level: LogLevel::Error, .. })));
    }

    #[tokio::test]
    async fn non_positive_exposure_is_rejected_without_side_effects() {
        let (dispatcher, events) = dispatcher();
        dispatcher.clone().handle_command(Command::SetExposure { value: -5.0 }).await;
        let recorded = events.lock().await;
        assert!(!recorded.iter().any(|e| matches!(e, Event::SettingsUpdate(_))));
        assert!(matches!(recorded.last(), Some(Event::LogMessage { level: LogLevel::Error, .. })));
    }

    /// Invariant 6: telemetry ticks at 1Hz +/-10% while idle.
    #[tokio::test(start_paused = true)]
    async fn telemetry_idle_cadence_is_1hz_within_tolerance() {
        let (dispatcher, events) = dispatcher();
        let telemetry = tokio::spawn(dispatcher.clone().run_telemetry_loop());
        tokio::time::advance(Duration::from_secs(10)).await;
        dispatcher.disconnect().await;
        telemetry.await.expect("telemetry task");

        let recorded = events.lock().await;
        let ticks = recorded.iter().filter(|e| matches!(e, Event::MotorPositions { .. })).count();
        assert!((9..=11).contains(&ticks), "expected ~10 ticks at 1Hz over 10s, got {ticks}");
    }

    /// Invariant 6: telemetry ticks at 5Hz +/-10% while an axis is active.
    #[tokio::test(start_paused = true)]
    async fn telemetry_active_cadence_is_5hz_within_tolerance() {
        let (dispatcher, events) = dispatcher();
        let mover = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.handle_command(Command::MoveZ { steps: 1_000_000 }).await })
        };
        let telemetry = tokio::spawn(dispatcher.clone().run_telemetry_loop());
        tokio::time::advance(Duration::from_secs(10)).await;
        dispatcher.disconnect().await;
        telemetry.await.expect("telemetry task");
        mover.await.expect("mover task");

        let recorded = events.lock().await;
        let ticks = recorded.iter().filter(|e| matches!(e, Event::MotorPositions { moving: true, .. })).count();
        assert!((45..=55).contains(&ticks), "expected ~50 active ticks at 5Hz over 10s, got {ticks}");
    }

    #[tokio::test]
    async fn save_config_updates_step_sizes_and_emits_settings() {
        let (dispatcher, events) = dispatcher();
        dispatcher
            .clone()
            .handle_command(Command::SaveConfig { x_step_size: 10, y_step_size: 20, z_step_size: 30 })
            .await;
        let recorded = events.lock().await;
        match recorded.last() {
            Some(Event::SettingsUpdate(settings)) => {
                assert_eq!(settings.x_step_size, 10);
                assert_eq!(settings.z_step_size, 30);
            }
            other => panic!("expected a settings_update event, got {other:?}"),
        }
    }
}
