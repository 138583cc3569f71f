//! Consumes raw frames into a video file. The main-sensor recorder writes
//! at a fixed cadence up to a frame cap; the secondary-sensor variant gates
//! its write rate on detected motion in the frame's centre.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::channel::Receiver;
use crate::error::{AppResult, MicroscopeError};
use crate::video::RawFrame;

/// The out-of-scope video container/codec mux.
pub trait VideoWriter: Send + Sync {
    /// Appends one frame to the output.
    fn write_frame(&mut self, frame: &RawFrame) -> AppResult<()>;
    /// Closes the writer and returns the output path and size in bytes.
    fn finish(self: Box<Self>) -> AppResult<(PathBuf, u64)>;
    /// Number of frames written so far.
    fn frame_count(&self) -> u64;
}

/// Deterministic in-memory stand-in for the real codec mux: counts frames
/// and bytes without touching the filesystem.
pub struct MockVideoWriter {
    path: PathBuf,
    frames_written: u64,
    bytes_written: u64,
}

impl MockVideoWriter {
    /// Creates a writer that will report `path` on [`VideoWriter::finish`].
    pub fn new(path: PathBuf) -> Self {
        Self { path, frames_written: 0, bytes_written: 0 }
    }
}

impl VideoWriter for MockVideoWriter {
    fn write_frame(&mut self, frame: &RawFrame) -> AppResult<()> {
        self.frames_written += 1;
        self.bytes_written += frame.pixels.len() as u64;
        Ok(())
    }

    fn finish(self: Box<Self>) -> AppResult<(PathBuf, u64)> {
        Ok((self.path, self.bytes_written))
    }

    fn frame_count(&self) -> u64 {
        self.frames_written
    }
}

/// The out-of-scope motion-detection pixel pipeline (greyscale, blur,
/// centre-region absolute difference, threshold).
pub trait MotionDetector: Send + Sync {
    /// Returns the fraction of the centre region whose absolute difference
    /// against the previous frame exceeds the detector's threshold.
    fn motion_ratio(&mut self, frame: &RawFrame) -> f64;
}

/// Deterministic motion detector: treats the mean absolute pixel delta
/// against the previous frame as the motion ratio, clamped to [0, 1].
pub struct MockMotionDetector {
    previous: Option<RawFrame>,
}

impl MockMotionDetector {
    /// Creates a detector with no prior frame.
    pub fn new() -> Self {
        Self { previous: None }
    }
}

impl Default for MockMotionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionDetector for MockMotionDetector {
    fn motion_ratio(&mut self, frame: &RawFrame) -> f64 {
        let ratio = match &self.previous {
            None => 0.0,
            Some(prev) if prev.pixels.len() == frame.pixels.len() && !frame.pixels.is_empty() => {
                let diff_pixels = prev
                    .pixels
                    .chunks(3)
                    .zip(frame.pixels.chunks(3))
                    .filter(|(a, b)| (a[0] as i16 - b[0] as i16).unsigned_abs() as u8 > 25)
                    .count();
                diff_pixels as f64 / (frame.pixels.len() / 3) as f64
            }
            Some(_) => 0.0,
        };
        self.previous = Some(frame.clone());
        ratio.clamp(0.0, 1.0)
    }
}

/// Motion-ratio threshold above which the secondary recorder records at the
/// high (10fps) cadence.
const MOTION_THRESHOLD: f64 = 0.005;
/// Cool-down window after the last detected motion during which the high
/// cadence is retained.
const MOTION_COOLDOWN: Duration = Duration::from_secs(2);
const HIGH_CADENCE_FPS: f64 = 10.0;
const LOW_CADENCE_FPS: f64 = 1.0;

/// Tracks which of the two recorders, if either, is active. Shared so the
/// dispatcher can enforce mutual exclusion before starting either one.
#[derive(Default)]
pub struct RecorderLock {
    main_active: AtomicBool,
    secondary_active: AtomicBool,
}

impl RecorderLock {
    /// Attempts to reserve the main recorder slot.
    pub fn try_start_main(&self) -> AppResult<()> {
        if self.secondary_active.load(Ordering::SeqCst) {
            return Err(MicroscopeError::ResourceBusy("secondary recorder is active".into()));
        }
        if self.main_active.swap(true, Ordering::SeqCst) {
            return Err(MicroscopeError::ResourceBusy("main recorder already active".into()));
        }
        Ok(())
    }

    /// Attempts to reserve the secondary recorder slot.
    pub fn try_start_secondary(&self) -> AppResult<()> {
        if self.main_active.load(Ordering::SeqCst) {
            return Err(MicroscopeError::ResourceBusy("main recorder is active".into()));
        }
        if self.secondary_active.swap(true, Ordering::SeqCst) {
            return Err(MicroscopeError::ResourceBusy("secondary recorder already active".into()));
        }
        Ok(())
    }

    /// Releases the main recorder slot.
    pub fn release_main(&self) {
        self.main_active.store(false, Ordering::SeqCst);
    }

    /// Releases the secondary recorder slot.
    pub fn release_secondary(&self) {
        self.secondary_active.store(false, Ordering::SeqCst);
    }
}

/// Result of a completed recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingResult {
    /// Output file path.
    pub path: PathBuf,
    /// Output file size in bytes.
    pub size_bytes: u64,
    /// Number of frames written.
    pub frames_written: u64,
}

/// Main-sensor recorder: pulls frames from the raw channel and writes them
/// at a fixed cadence (honouring an optional inter-frame delay) up to a
/// configured frame cap.
pub struct Recorder {
    recording: Arc<AtomicBool>,
}

impl Recorder {
    /// Creates an idle recorder.
    pub fn new() -> Self {
        Self { recording: Arc::new(AtomicBool::new(false)) }
    }

    /// Cooperative stop request, observed at the next channel-read boundary.
    pub fn stop(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }

    /// Runs until stopped or `max_frames` is reached, writing every frame
    /// pulled from `raw_rx` through `writer`, sleeping `inter_frame_delay`
    /// between writes if set.
    pub async fn run(
        &self,
        raw_rx: Receiver<RawFrame>,
        mut writer: Box<dyn VideoWriter>,
        inter_frame_delay: Option<Duration>,
        max_frames: u64,
    ) -> AppResult<RecordingResult> {
        self.recording.store(true, Ordering::SeqCst);
        while self.recording.load(Ordering::SeqCst) && writer.frame_count() < max_frames {
            let frame = raw_rx.get().await;
            writer.write_frame(&frame)?;
            if let Some(delay) = inter_frame_delay {
                tokio::time::sleep(delay).await;
            }
        }
        self.recording.store(false, Ordering::SeqCst);
        let frames_written = writer.frame_count();
        let (path, size_bytes) = writer.finish()?;
        info!(frames_written, ?path, "main recording finished");
        Ok(RecordingResult { path, size_bytes, frames_written })
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Secondary-sensor recorder: writes at 10fps while motion is detected (or
/// within a 2s cool-down of the last detection), else at 1fps.
pub struct MotionGatedRecorder {
    recording: Arc<AtomicBool>,
}

impl MotionGatedRecorder {
    /// Creates an idle recorder.
    pub fn new() -> Self {
        Self { recording: Arc::new(AtomicBool::new(false)) }
    }

    /// Cooperative stop request.
    pub fn stop(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }

    /// Runs until stopped, adapting write cadence to detected motion.
    pub async fn run(
        &self,
        raw_rx: Receiver<RawFrame>,
        mut writer: Box<dyn VideoWriter>,
        mut detector: Box<dyn MotionDetector>,
    ) -> AppResult<RecordingResult> {
        self.recording.store(true, Ordering::SeqCst);
        let mut last_motion: Option<Instant> = None;

        while self.recording.load(Ordering::SeqCst) {
            let frame = raw_rx.get().await;
            let ratio = detector.motion_ratio(&frame);
            let now = Instant::now();
            let motion_now = ratio > MOTION_THRESHOLD;
            if motion_now {
                last_motion = Some(now);
            }
            let within_cooldown = last_motion.is_some_and(|t| now.duration_since(t) < MOTION_COOLDOWN);
            let fps = if motion_now || within_cooldown { HIGH_CADENCE_FPS } else { LOW_CADENCE_FPS };

            writer.write_frame(&frame)?;
            tokio::time::sleep(Duration::from_secs_f64(1.0 / fps)).await;
        }
        self.recording.store(false, Ordering::SeqCst);
        let frames_written = writer.frame_count();
        let (path, size_bytes) = writer.finish()?;
        info!(frames_written, ?path, "secondary recording finished");
        Ok(RecordingResult { path, size_bytes, frames_written })
    }
}

impl Default for MotionGatedRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;

    #[tokio::test]
    async fn recorder_lock_allows_only_one_active_at_a_time() {
        let lock = RecorderLock::default();
        lock.try_start_main().expect("main starts");
        assert!(lock.try_start_secondary().is_err());
        lock.release_main();
        lock.try_start_secondary().expect("secondary starts after release");
        assert!(lock.try_start_main().is_err());
    }

    #[tokio::test]
    async fn s5_recorder_caps_at_configured_frame_count() {
        let (tx, rx) = channel::single_slot::<RawFrame>();
        let recorder = Recorder::new();
        let writer: Box<dyn VideoWriter> = Box::new(MockVideoWriter::new(PathBuf::from("/scratch/out.mp4")));

        let feeder = tokio::spawn(async move {
            for _ in 0..100 {
                while !tx.try_put(RawFrame::new(4, 4)).await {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let result = recorder.run(rx, writer, None, 10).await.expect("recording");
        feeder.abort();
        assert_eq!(result.frames_written, 10);
    }

    #[tokio::test]
    async fn recorder_stop_is_observed_before_cap() {
        let (tx, rx) = channel::single_slot::<RawFrame>();
        let recorder = Recorder::new();
        let writer: Box<dyn VideoWriter> = Box::new(MockVideoWriter::new(PathBuf::from("/scratch/out.mp4")));

        let stop_signal = tokio::spawn({
            let recording_flag = recorder.recording.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                recording_flag.store(false, Ordering::SeqCst);
            }
        });
        let feeder = tokio::spawn(async move {
            loop {
                if !tx.try_put(RawFrame::new(2, 2)).await {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        });

        let result = recorder.run(rx, writer, None, 10_000).await.expect("recording");
        feeder.abort();
        stop_signal.await.expect("stop signal");
        assert!(result.frames_written < 10_000);
    }

    #[test]
    fn mock_motion_detector_reports_zero_on_identical_frames() {
        let mut detector = MockMotionDetector::new();
        let frame = RawFrame { width: 2, height: 2, pixels: vec![100; 12] };
        assert_eq!(detector.motion_ratio(&frame), 0.0);
        assert_eq!(detector.motion_ratio(&frame), 0.0);
    }

    #[test]
    fn mock_motion_detector_reports_nonzero_on_changed_frame() {
        let mut detector = MockMotionDetector::new();
        let frame_a = RawFrame { width: 2, height: 2, pixels: vec![0; 12] };
        let frame_b = RawFrame { width: 2, height: 2, pixels: vec![255; 12] };
        detector.motion_ratio(&frame_a);
        assert!(detector.motion_ratio(&frame_b) > 0.0);
    }
}
