//! Per-sensor video state machine: preview/still modes, the capture-to-channel
//! pipeline, and the traits through which the (out-of-scope) camera driver
//! and pixel-processing algorithms are plugged in.

mod mock;
mod pipeline;

pub use mock::{MockCameraSensor, MockFrameCodec};
pub use pipeline::{SensorPipeline, VideoFrameSink};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// An opaque raw pixel buffer, BGR or RGB, with an explicit size.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Packed pixel bytes, 3 bytes per pixel.
    pub pixels: Vec<u8>,
}

impl RawFrame {
    /// Allocates a zeroed frame of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, pixels: vec![0u8; (width * height * 3) as usize] }
    }
}

/// Per-sensor state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorState {
    /// No active capture.
    Stopped,
    /// Continuous low-resolution capture feeding the three channels.
    Preview,
    /// A single full-resolution still is being captured.
    Still,
}

/// Parameters for `start_preview`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Preview frame width in pixels.
    pub width: u32,
    /// Preview frame height in pixels.
    pub height: u32,
    /// Target capture rate in frames per second.
    pub framerate: f64,
    /// Exposure time in microseconds.
    pub exposure_us: u32,
    /// Analogue sensor gain.
    pub analogue_gain: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self { width: 640, height: 480, framerate: 30.0, exposure_us: 20_000, analogue_gain: 1.0 }
    }
}

/// The out-of-scope camera sensor driver's contract: a frame producer with a
/// configure/start/stop lifecycle. Only a deterministic mock
/// ([`MockCameraSensor`]) is provided; a real driver is an external
/// collaborator.
#[async_trait]
pub trait CameraSensor: Send + Sync {
    /// Transitions `stopped -> preview` (or reconfigures an active preview).
    async fn start_preview(&self, config: CameraConfig) -> AppResult<()>;

    /// Transitions `preview -> still`, reconfiguring for full resolution.
    async fn start_still(&self) -> AppResult<()>;

    /// Transitions `* -> stopped`.
    async fn stop(&self) -> AppResult<()>;

    /// Blocks until the next frame is available at the sensor's current mode.
    async fn next_frame(&self) -> AppResult<RawFrame>;

    /// The sensor's full (non-preview) resolution.
    fn full_resolution(&self) -> (u32, u32);

    /// The sensor's current state.
    async fn state(&self) -> SensorState;
}

/// The out-of-scope pixel-processing pure functions: white balance,
/// perspective correction, downsampling, and JPEG encoding. Only a
/// deterministic mock ([`MockFrameCodec`]) is provided.
pub trait FrameCodec: Send + Sync {
    /// Multiplies the R channel by `r_gain` and the B channel by `b_gain`,
    /// clipping to the valid pixel range.
    fn white_balance(&self, frame: &mut RawFrame, r_gain: f64, b_gain: f64);

    /// Applies a fixed perspective-correction homography in place. A no-op
    /// unless the sensor has perspective correction enabled.
    fn perspective_correct(&self, frame: &mut RawFrame);

    /// Downsamples `frame` to `target` (centred crop if aspect ratio
    /// permits, else linear resize).
    fn downsample(&self, frame: &RawFrame, target: (u32, u32)) -> RawFrame;

    /// Encodes `frame` as JPEG under a fixed quality. The returned byte
    /// length is used elsewhere as the sharpness proxy.
    fn encode_jpeg(&self, frame: &RawFrame) -> Vec<u8>;
}
