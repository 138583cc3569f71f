//! Coarse directional probe -> full-range sweep -> golden-section
//! refinement over the Z axis, driven by live sharpness telemetry.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::axis::AxisTag;
use crate::channel::Receiver;
use crate::error::{AppResult, MicroscopeError};
use crate::motion::MotionEngine;
use crate::pin_io::PinIo;

/// Golden ratio used by phase 3.
const PHI: f64 = 0.618;
/// Phase 1 probe distance, in steps.
const PROBE_STEPS: i64 = 200;
/// Phase 2 sweep half-width; the full window is 2mm.
const SWEEP_WINDOW_MM: f64 = 2.0;
/// Phase 3 bracket half-width around the provisional peak, in steps.
const REFINEMENT_HALF_WIDTH: i64 = 300;
/// Phase 3 iteration cap.
const MAX_REFINEMENT_ITERATIONS: u32 = 20;
/// Convergence threshold for phase 3, in steps.
const CONVERGENCE_STEPS: f64 = 1.0;
/// Minimum distance a provisional peak must sit from either sweep endpoint.
const MIN_EDGE_MARGIN_STEPS: i64 = 100;
/// Provisional-peak threshold: peak must exceed this multiple of the mean.
const PEAK_PROMINENCE_FACTOR: f64 = 1.2;
/// Timeout guarding against a stalled video pipeline.
const SHARPNESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Rejects a sample once `stop_move` has requested cancellation.
fn check_cancelled(cancel: &AtomicBool) -> AppResult<()> {
    if cancel.load(Ordering::SeqCst) {
        Err(MicroscopeError::Preempted("focus session stopped".into()))
    } else {
        Ok(())
    }
}

/// Reads one sharpness value, bounded by [`SHARPNESS_TIMEOUT`]. Free
/// function (rather than a method) so the phase 2 background sampler task
/// can call it without holding a borrow of the controller.
async fn sample_from(sharpness_rx: &Receiver<f64>, cancel: &AtomicBool) -> AppResult<f64> {
    check_cancelled(cancel)?;
    sharpness_rx.get_timeout(SHARPNESS_TIMEOUT, "autofocus sharpness").await
}

/// Outcome of a completed or aborted autofocus session.
#[derive(Debug, Clone, PartialEq)]
pub enum FocusOutcome {
    /// Converged; final Z position in millimetres and steps.
    Converged { z_mm: f64, z_steps: i64 },
    /// Phase 2 never found a provisional peak; reports the best observed.
    Fallback { z_mm: f64, z_steps: i64 },
    /// Aborted by `stop_move` or a channel timeout.
    Aborted { reason: String },
}

/// Drives the Z axis through the three autofocus phases.
pub struct AutofocusController<P: PinIo> {
    sharpness_rx: Receiver<f64>,
    cancel: Arc<AtomicBool>,
    _pin: PhantomData<P>,
}

impl<P: PinIo> AutofocusController<P> {
    /// Builds a controller reading sharpness from `sharpness_rx`.
    pub fn new(sharpness_rx: Receiver<f64>) -> Self {
        Self { sharpness_rx, cancel: Arc::new(AtomicBool::new(false)), _pin: PhantomData }
    }

    /// A handle the dispatcher's `stop_move` handler can use to abort a
    /// session in progress, observed at the next phase or sample boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    async fn sample(&self) -> AppResult<f64> {
        sample_from(&self.sharpness_rx, &self.cancel).await
    }

    /// Runs a full autofocus session starting from the Z axis's current
    /// position. `steps_per_mm` is the Z axis's calibrated constant. A
    /// `stop_move` observed via [`Self::cancel_handle`] resolves the session
    /// to [`FocusOutcome::Aborted`] at the next phase or sample boundary.
    pub async fn run(&self, engine: &MotionEngine<P>, steps_per_mm: f64) -> AppResult<FocusOutcome> {
        self.cancel.store(false, Ordering::SeqCst);
        match self.run_inner(engine, steps_per_mm).await {
            Err(MicroscopeError::Preempted(reason)) => Ok(aborted(reason)),
            other => other,
        }
    }

    async fn run_inner(&self, engine: &MotionEngine<P>, steps_per_mm: f64) -> AppResult<FocusOutcome> {
        let z = engine.axis(AxisTag::Z)?.clone();

        // Phase 1: directional probe.
        let before = self.sample().await?;
        engine.move_relative(AxisTag::Z, PROBE_STEPS).await?;
        let after = self.sample().await?;
        let search_direction: i64 = if after >= before { 1 } else { -1 };
        info!(before, after, search_direction, "autofocus phase 1 complete");

        // Phase 2: full-range sweep in one continuous move, sampling as we go.
        let window_steps = (SWEEP_WINDOW_MM * steps_per_mm).round() as i64;
        let sweep_start = z.position_steps();
        let sweep_target = sweep_start + search_direction * window_steps;

        // A background task samples sharpness concurrently with the single
        // continuous sweep move, mirroring how the capture loop already runs
        // concurrently with motion, rather than stopping and restarting the
        // axis at a series of waypoints, which would both contradict "one
        // continuous move" and re-trigger backlash compensation on every leg
        // of a negative sweep.
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
        let sampler_rx = self.sharpness_rx.clone();
        let sampler_cancel = self.cancel.clone();
        let sampler_axis = z.clone();
        let sampler: tokio::task::JoinHandle<AppResult<Vec<(i64, f64)>>> = tokio::spawn(async move {
            let mut observed: Vec<(i64, f64)> = Vec::new();
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => return Ok(observed),
                    sample = sample_from(&sampler_rx, &sampler_cancel) => {
                        observed.push((sampler_axis.position_steps(), sample?));
                    }
                }
            }
        });

        let taken = engine.move_absolute(AxisTag::Z, sweep_target).await?;
        let final_position = sweep_start + taken;
        let _ = stop_tx.send(());
        let observed: Vec<(i64, f64)> = sampler
            .await
            .map_err(|_| MicroscopeError::Preempted("autofocus sampler task panicked".into()))??;

        let mut max_sharpness = f64::MIN;
        let mut peak_step = sweep_start;
        let mut sharpness_observed: Vec<f64> = Vec::with_capacity(observed.len());
        for (z_here, s) in observed {
            sharpness_observed.push(s);
            if s > max_sharpness {
                max_sharpness = s;
                peak_step = z_here;
            }
        }

        let mean_sharpness = if sharpness_observed.is_empty() {
            0.0
        } else {
            sharpness_observed.iter().sum::<f64>() / sharpness_observed.len() as f64
        };
        let lo = sweep_start.min(final_position);
        let hi = sweep_start.max(final_position);
        let inside_margin = peak_step - lo >= MIN_EDGE_MARGIN_STEPS && hi - peak_step >= MIN_EDGE_MARGIN_STEPS;
        let provisional = max_sharpness > PEAK_PROMINENCE_FACTOR * mean_sharpness && inside_margin;

        info!(peak_step, max_sharpness, mean_sharpness, provisional, "autofocus phase 2 complete");

        if !provisional {
            return Ok(FocusOutcome::Fallback {
                z_mm: peak_step as f64 / steps_per_mm,
                z_steps: peak_step,
            });
        }

        // Phase 3: golden-section refinement around the provisional peak.
        let mut z_min = peak_step - REFINEMENT_HALF_WIDTH;
        let mut z_max = peak_step + REFINEMENT_HALF_WIDTH;

        for iteration in 0..MAX_REFINEMENT_ITERATIONS {
            if (z_max - z_min) as f64 <= CONVERGENCE_STEPS {
                break;
            }
            let z1 = (z_max as f64 - PHI * (z_max - z_min) as f64).round() as i64;
            let z2 = (z_min as f64 + PHI * (z_max - z_min) as f64).round() as i64;

            engine.move_absolute(AxisTag::Z, z2).await?;
            let s_z2 = self.sample().await?;
            engine.move_absolute(AxisTag::Z, z1).await?;
            let s_z1 = self.sample().await?;

            if s_z1 > s_z2 {
                z_max = z2;
            } else {
                z_min = z1;
            }
            info!(iteration, z_min, z_max, s_z1, s_z2, "autofocus phase 3 iteration");
        }

        let final_steps = (z_min + z_max) / 2;
        engine.move_absolute(AxisTag::Z, final_steps).await?;
        Ok(FocusOutcome::Converged { z_mm: final_steps as f64 / steps_per_mm, z_steps: final_steps })
    }
}

/// Converts a `stop_move` signal observed mid-session into the aborted
/// outcome, clearing `focus_mode` bookkeeping at the call site.
pub fn aborted(reason: impl Into<String>) -> FocusOutcome {
    FocusOutcome::Aborted { reason: reason.into() }
}

impl From<MicroscopeError> for FocusOutcome {
    fn from(err: MicroscopeError) -> Self {
        aborted(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis;
    use crate::config::ArctanCalibration;
    use crate::pin_io::MockPinIo;
    use crate::video::{CameraConfig, MockCameraSensor, MockFrameCodec, SensorPipeline};
    use std::sync::Arc;

    fn engine_with_z(steps_per_mm: f64) -> MotionEngine<MockPinIo> {
        let pins = Arc::new(MockPinIo::new());
        let axes = vec![
            Arc::new(Axis::new(AxisTag::X, [1, 2, 3, 4], 1, ArctanCalibration::default(), 966.67, 35)),
            Arc::new(Axis::new(AxisTag::Y, [5, 6, 7, 8], 1, ArctanCalibration::default(), 966.67, 35)),
            Arc::new(Axis::new(AxisTag::Z, [9, 10, 11, 12], 1, ArctanCalibration::default(), steps_per_mm, 0)),
        ];
        MotionEngine::new(axes, pins)
    }

    /// S3: a synthetic unimodal curve peaking at z=5000 should converge
    /// within +/-1 step after `fast_focus` starting from z=2000.
    #[tokio::test(flavor = "multi_thread")]
    async fn s3_converges_on_synthetic_unimodal_curve() {
        let engine = engine_with_z(1450.0);
        engine.move_absolute(AxisTag::Z, 2000).await.expect("seed start position");

        let z_for_sharpness = engine.axis(AxisTag::Z).expect("z axis").clone();
        let sensor = Arc::new(MockCameraSensor::with_focus_curve((640, 480), {
            let z = z_for_sharpness.clone();
            move |_frame_count| {
                let z = z.position_steps() as f64;
                let peak = 5000.0;
                let value = 1000.0 - (z - peak).powi(2) / 1000.0;
                (value.max(1.0)).sqrt() / 10.0
            }
        }));
        let pipeline = SensorPipeline::new(sensor, Arc::new(MockFrameCodec), false);
        pipeline
            .start_preview(CameraConfig { width: 64, height: 48, framerate: 500.0, ..CameraConfig::default() })
            .await
            .expect("start preview");

        let controller = AutofocusController::new(pipeline.sharpness_receiver());
        let outcome = controller.run(&engine, 1450.0).await.expect("autofocus run");

        match outcome {
            FocusOutcome::Converged { z_steps, .. } => {
                assert!((z_steps - 5000).abs() <= 1, "expected convergence near 5000, got {z_steps}");
            }
            other => panic!("expected convergence, got {other:?}"),
        }
        pipeline.shutdown().await.expect("shutdown");
    }
}
