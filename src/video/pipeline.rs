//! The capture-loop task: applies white balance and optional perspective
//! correction, downsamples, encodes a JPEG preview, derives sharpness from
//! its byte length, and publishes all three into single-slot channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::channel::{self, Receiver, Sender};
use crate::error::AppResult;
use crate::video::{CameraConfig, CameraSensor, FrameCodec, RawFrame};

/// Receives every second preview frame as a `video_frame` telemetry event.
/// Implemented by the session dispatcher; decouples the pipeline from any
/// particular transport or event encoding.
#[async_trait]
pub trait VideoFrameSink: Send + Sync {
    /// Called with the JPEG bytes of every second successfully produced
    /// preview frame.
    async fn emit_video_frame(&self, jpeg: Vec<u8>);
}

/// Runs one sensor's preview capture loop and exposes its three output
/// channels. Generic over the sensor and codec traits so tests can swap in
/// deterministic mocks.
pub struct SensorPipeline<S: CameraSensor + ?Sized + 'static, C: FrameCodec + ?Sized + 'static> {
    sensor: Arc<S>,
    codec: Arc<C>,
    perspective_enabled: bool,
    r_gain: Arc<std::sync::atomic::AtomicU64>, // f64 bits, read-mostly
    b_gain: Arc<std::sync::atomic::AtomicU64>,
    preview_size: Arc<Mutex<(u32, u32)>>,
    preview_tx: Sender<Vec<u8>>,
    preview_rx: Receiver<Vec<u8>>,
    raw_tx: Sender<RawFrame>,
    raw_rx: Receiver<RawFrame>,
    sharpness_tx: Sender<f64>,
    sharpness_rx: Receiver<f64>,
    frame_counter: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
    sink: Mutex<Option<Arc<dyn VideoFrameSink>>>,
}

fn gain_to_bits(gain: f64) -> u64 {
    gain.to_bits()
}
fn bits_to_gain(bits: u64) -> f64 {
    f64::from_bits(bits)
}

impl<S: CameraSensor + ?Sized + 'static, C: FrameCodec + ?Sized + 'static> SensorPipeline<S, C> {
    /// Builds a pipeline bound to `sensor`/`codec`. `perspective_enabled`
    /// matches the secondary sensor's off-by-default homography step.
    pub fn new(sensor: Arc<S>, codec: Arc<C>, perspective_enabled: bool) -> Self {
        let (preview_tx, preview_rx) = channel::single_slot();
        let (raw_tx, raw_rx) = channel::single_slot();
        let (sharpness_tx, sharpness_rx) = channel::single_slot();
        Self {
            sensor,
            codec,
            perspective_enabled,
            r_gain: Arc::new(std::sync::atomic::AtomicU64::new(gain_to_bits(1.0))),
            b_gain: Arc::new(std::sync::atomic::AtomicU64::new(gain_to_bits(1.0))),
            preview_size: Arc::new(Mutex::new((640, 480))),
            preview_tx,
            preview_rx,
            raw_tx,
            raw_rx,
            sharpness_tx,
            sharpness_rx,
            frame_counter: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
            sink: Mutex::new(None),
        }
    }

    /// Registers the dispatcher as the `video_frame` telemetry sink.
    pub async fn set_sink(&self, sink: Arc<dyn VideoFrameSink>) {
        *self.sink.lock().await = Some(sink);
    }

    /// Sets white-balance gains applied to every subsequent frame.
    pub fn set_gains(&self, r_gain: f64, b_gain: f64) {
        self.r_gain.store(gain_to_bits(r_gain), Ordering::SeqCst);
        self.b_gain.store(gain_to_bits(b_gain), Ordering::SeqCst);
    }

    /// A clone of the raw-frame receiver, for the recorder.
    pub fn raw_receiver(&self) -> Receiver<RawFrame> {
        self.raw_rx.clone()
    }

    /// A clone of the sharpness receiver, for the autofocus controller.
    pub fn sharpness_receiver(&self) -> Receiver<f64> {
        self.sharpness_rx.clone()
    }

    /// A clone of the preview-JPEG receiver, for a direct binary-stream
    /// subscriber if one is retained alongside telemetry.
    pub fn preview_receiver(&self) -> Receiver<Vec<u8>> {
        self.preview_rx.clone()
    }

    /// `stopped -> preview`: configures the sensor and spawns the capture
    /// loop. Reconfiguring an already-running preview restarts the loop at
    /// the new size/framerate.
    pub async fn start_preview(&self, config: CameraConfig) -> AppResult<()> {
        self.stop_task().await;
        self.sensor.start_preview(config.clone()).await?;
        *self.preview_size.lock().await = (config.width, config.height);

        let sensor = self.sensor.clone();
        let codec = self.codec.clone();
        let perspective_enabled = self.perspective_enabled;
        let r_gain = self.r_gain.clone();
        let b_gain = self.b_gain.clone();
        let preview_size = self.preview_size.clone();
        let preview_tx = self.preview_tx.clone();
        let raw_tx = self.raw_tx.clone();
        let sharpness_tx = self.sharpness_tx.clone();
        let frame_counter = self.frame_counter.clone();
        let sink_slot = self.sink.lock().await.clone();

        let handle = tokio::spawn(async move {
            loop {
                let raw = match sensor.next_frame().await {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(error = %e, "video capture failed, retrying next iteration");
                        continue;
                    }
                };
                let mut processed = raw.clone();
                codec.white_balance(
                    &mut processed,
                    bits_to_gain(r_gain.load(Ordering::SeqCst)),
                    bits_to_gain(b_gain.load(Ordering::SeqCst)),
                );
                if perspective_enabled {
                    codec.perspective_correct(&mut processed);
                }
                let target = *preview_size.lock().await;
                let preview = codec.downsample(&processed, target);
                let jpeg = codec.encode_jpeg(&preview);
                let sharpness = jpeg.len() as f64;

                let _ = raw_tx.try_put(preview.clone()).await;
                let _ = sharpness_tx.try_put(sharpness).await;
                let published = preview_tx.try_put(jpeg.clone()).await;

                let count = frame_counter.fetch_add(1, Ordering::SeqCst) + 1;
                if published && count % 2 == 0 {
                    if let Some(sink) = &sink_slot {
                        sink.emit_video_frame(jpeg).await;
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
        info!("preview capture loop started");
        Ok(())
    }

    /// `preview -> still -> preview`: stops the capture loop, reconfigures
    /// for full sensor resolution, captures one frame, applies the same
    /// gain/perspective pipeline, and returns the frame. The caller is
    /// responsible for encoding and returning to preview mode.
    pub async fn capture_still(&self) -> AppResult<RawFrame> {
        self.stop_task().await;
        self.sensor.start_still().await?;
        let mut frame = self.sensor.next_frame().await?;
        self.codec.white_balance(
            &mut frame,
            bits_to_gain(self.r_gain.load(Ordering::SeqCst)),
            bits_to_gain(self.b_gain.load(Ordering::SeqCst)),
        );
        if self.perspective_enabled {
            self.codec.perspective_correct(&mut frame);
        }
        Ok(frame)
    }

    /// Returns to `preview` after a still capture, at the given config.
    pub async fn resume_preview(&self, config: CameraConfig) -> AppResult<()> {
        self.start_preview(config).await
    }

    /// Encodes `frame` through this pipeline's codec, for callers (e.g. the
    /// dispatcher's `capture` handler) that need a one-off JPEG outside the
    /// capture loop.
    pub fn encode_jpeg(&self, frame: &RawFrame) -> Vec<u8> {
        self.codec.encode_jpeg(frame)
    }

    /// `* -> stopped`: aborts the capture loop and shuts down the sensor.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.stop_task().await;
        self.sensor.stop().await
    }

    async fn stop_task(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}
