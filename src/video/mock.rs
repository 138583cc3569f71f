//! Deterministic mock sensor and frame codec, used to drive and test the
//! video pipeline's state machine and channel behaviour without real
//! hardware or a real image-processing library.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::error::AppResult;
use crate::video::{CameraConfig, CameraSensor, FrameCodec, RawFrame, SensorState};

/// Simulated camera sensor. Frames are a deterministic synthetic pattern
/// whose spatial-frequency content (and hence whatever sharpness proxy is
/// derived from it) varies with a caller-supplied "focus position", so tests
/// can drive a unimodal focus curve without real optics.
pub struct MockCameraSensor {
    full_resolution: (u32, u32),
    state: RwLock<SensorState>,
    config: RwLock<CameraConfig>,
    frame_count: RwLock<u64>,
    /// Synthetic focus curve: sharpness peaks when this matches the probed Z.
    focus_curve: Box<dyn Fn(u64) -> f64 + Send + Sync>,
}

impl MockCameraSensor {
    /// Creates a mock sensor with a flat (constant) synthetic focus curve.
    pub fn new(full_resolution: (u32, u32)) -> Self {
        Self::with_focus_curve(full_resolution, |_| 1.0)
    }

    /// Creates a mock sensor whose per-frame synthetic contrast follows
    /// `focus_curve(frame_count)`, used by autofocus tests to simulate a
    /// unimodal sharpness-vs-Z relationship.
    pub fn with_focus_curve(
        full_resolution: (u32, u32),
        focus_curve: impl Fn(u64) -> f64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            full_resolution,
            state: RwLock::new(SensorState::Stopped),
            config: RwLock::new(CameraConfig::default()),
            frame_count: RwLock::new(0),
            focus_curve: Box::new(focus_curve),
        }
    }

    async fn synthetic_frame(&self, width: u32, height: u32) -> RawFrame {
        let mut count = self.frame_count.write().await;
        *count += 1;
        let contrast = (self.focus_curve)(*count);
        let mut frame = RawFrame::new(width, height);
        for (i, px) in frame.pixels.chunks_mut(3).enumerate() {
            let v = (((i as f64 * 0.37).sin() * contrast).abs() * 255.0) as u8;
            px[0] = v;
            px[1] = v;
            px[2] = v;
        }
        frame
    }
}

#[async_trait]
impl CameraSensor for MockCameraSensor {
    async fn start_preview(&self, config: CameraConfig) -> AppResult<()> {
        *self.config.write().await = config;
        *self.state.write().await = SensorState::Preview;
        Ok(())
    }

    async fn start_still(&self) -> AppResult<()> {
        *self.state.write().await = SensorState::Still;
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        *self.state.write().await = SensorState::Stopped;
        Ok(())
    }

    async fn next_frame(&self) -> AppResult<RawFrame> {
        let state = *self.state.read().await;
        let (width, height, delay_ms) = match state {
            SensorState::Preview => {
                let cfg = self.config.read().await;
                (cfg.width, cfg.height, (1000.0 / cfg.framerate) as u64)
            }
            SensorState::Still => (self.full_resolution.0, self.full_resolution.1, 50),
            SensorState::Stopped => (self.full_resolution.0, self.full_resolution.1, 0),
        };
        sleep(Duration::from_millis(delay_ms)).await;
        Ok(self.synthetic_frame(width, height).await)
    }

    fn full_resolution(&self) -> (u32, u32) {
        self.full_resolution
    }

    async fn state(&self) -> SensorState {
        *self.state.read().await
    }
}

/// Deterministic [`FrameCodec`]: "JPEG encoding" here is simply a
/// length-stable transform of pixel sum so the byte length tracks the
/// frame's synthetic contrast monotonically, matching the real encoder's
/// property that sharper frames compress larger under fixed quality.
pub struct MockFrameCodec;

impl FrameCodec for MockFrameCodec {
    fn white_balance(&self, frame: &mut RawFrame, r_gain: f64, b_gain: f64) {
        for px in frame.pixels.chunks_mut(3) {
            px[0] = (px[0] as f64 * r_gain).clamp(0.0, 255.0) as u8;
            px[2] = (px[2] as f64 * b_gain).clamp(0.0, 255.0) as u8;
        }
    }

    fn perspective_correct(&self, _frame: &mut RawFrame) {
        // No-op: the real homography is out of scope; callers that enable
        // it (secondary sensor) exercise only the call site, not distortion.
    }

    fn downsample(&self, frame: &RawFrame, target: (u32, u32)) -> RawFrame {
        if (frame.width, frame.height) == target {
            return frame.clone();
        }
        let mut out = RawFrame::new(target.0, target.1);
        for y in 0..target.1 {
            for x in 0..target.0 {
                let src_x = x * frame.width / target.0.max(1);
                let src_y = y * frame.height / target.1.max(1);
                let src_idx = ((src_y * frame.width + src_x) * 3) as usize;
                let dst_idx = ((y * target.0 + x) * 3) as usize;
                if src_idx + 3 <= frame.pixels.len() && dst_idx + 3 <= out.pixels.len() {
                    out.pixels[dst_idx..dst_idx + 3].copy_from_slice(&frame.pixels[src_idx..src_idx + 3]);
                }
            }
        }
        out
    }

    fn encode_jpeg(&self, frame: &RawFrame) -> Vec<u8> {
        // A stand-in "encoding": emit one byte per pixel whose high-frequency
        // energy exceeds a fixed threshold against its neighbour, which rises
        // monotonically with the synthetic frame's contrast, the same
        // property a real encoder's byte length has under fixed quality.
        let mut out = Vec::with_capacity(frame.pixels.len() / 3);
        for window in frame.pixels.chunks(3).collect::<Vec<_>>().windows(2) {
            let diff = (window[0][0] as i16 - window[1][0] as i16).unsigned_abs() as u8;
            if diff > 8 {
                out.push(diff);
            }
        }
        out
    }
}
