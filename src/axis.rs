//! Axis state and the half-step driver for a single stepper motor.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::ArctanCalibration;
use crate::error::AppResult;
use crate::pin_io::PinIo;

/// Fixed delay between microsteps. At 2ms this yields a ~125Hz step rate,
/// below the motor's pull-in frequency limit.
pub const STEP_DELAY: Duration = Duration::from_millis(2);

/// Identifies one of the three mechanical axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisTag {
    /// Horizontal stage axis.
    X,
    /// Horizontal stage axis, orthogonal to X.
    Y,
    /// Focus axis.
    Z,
}

impl AxisTag {
    /// All three axes, in a stable order.
    pub const ALL: [AxisTag; 3] = [AxisTag::X, AxisTag::Y, AxisTag::Z];
}

impl std::fmt::Display for AxisTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AxisTag::X => write!(f, "X"),
            AxisTag::Y => write!(f, "Y"),
            AxisTag::Z => write!(f, "Z"),
        }
    }
}

/// The four-phase half-step coil activation sequence for forward motion.
/// Reverse motion plays the same four patterns in reverse order.
const HALF_STEP_FORWARD: [[u8; 4]; 4] = [
    [0, 0, 1, 1],
    [0, 1, 1, 0],
    [1, 1, 0, 0],
    [1, 0, 0, 0],
];

/// Shared, cooperatively-mutated state for one axis.
///
/// The step counter is mutated only by the [`AxisDriver`] currently
/// servicing this axis; `active` is a cooperative stop request observable
/// from any context (the dispatcher's `stop_move`, a disconnect handler, or
/// a new move superseding an in-flight one on the same axis).
pub struct Axis {
    /// Which of X/Y/Z this is.
    pub tag: AxisTag,
    /// Four digital output pins driving the coil sequence, in phase order.
    pub pins: [u8; 4],
    /// Logical-to-physical direction sign, from calibration.
    pub direction_sign: i8,
    /// Signed, monotonic-with-motion step counter.
    pub step_counter: Arc<AtomicI64>,
    /// True while a driver is actively stepping this axis.
    pub active: Arc<AtomicBool>,
    /// Arctangent voltage-to-millimetre calibration.
    pub calibration: ArctanCalibration,
    /// Steps per millimetre for this axis.
    pub steps_per_mm: f64,
    /// Backlash overshoot margin in steps.
    pub backlash_margin_steps: i64,
}

impl Axis {
    /// Builds a new axis at step count zero, inactive.
    pub fn new(
        tag: AxisTag,
        pins: [u8; 4],
        direction_sign: i8,
        calibration: ArctanCalibration,
        steps_per_mm: f64,
        backlash_margin_steps: i64,
    ) -> Self {
        Self {
            tag,
            pins,
            direction_sign,
            step_counter: Arc::new(AtomicI64::new(0)),
            active: Arc::new(AtomicBool::new(false)),
            calibration,
            steps_per_mm,
            backlash_margin_steps,
        }
    }

    /// Current step count.
    pub fn position_steps(&self) -> i64 {
        self.step_counter.load(Ordering::SeqCst)
    }

    /// Current step-derived position in millimetres.
    pub fn position_mm(&self) -> f64 {
        self.position_steps() as f64 / self.steps_per_mm
    }

    /// Whether a driver is currently stepping this axis.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Requests that any in-flight driver on this axis stop at the next
    /// microstep boundary.
    pub fn request_stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Executes microstep sequences against one axis's four pins.
///
/// At most one driver per axis exists at any instant; the [`crate::motion::MotionEngine`]
/// enforces this by serializing moves on the same axis.
pub struct AxisDriver<'a, P: PinIo> {
    axis: &'a Axis,
    pin_io: &'a P,
}

impl<'a, P: PinIo> AxisDriver<'a, P> {
    /// Creates a driver bound to `axis`'s pins via `pin_io`.
    pub fn new(axis: &'a Axis, pin_io: &'a P) -> Self {
        Self { axis, pin_io }
    }

    /// Executes `|delta_steps|` microsteps in the direction
    /// `sign(delta_steps) * axis.direction_sign`, sampling `axis.active`
    /// between microsteps. Returns the number of steps actually taken
    /// (signed, same sign convention as `delta_steps`).
    ///
    /// `delta_steps = 0` is a no-op that still deasserts all four coils.
    /// On any exit — completion, a cleared `active` flag, or a hardware
    /// error — the coils are driven low before returning.
    pub async fn step(&self, delta_steps: i64) -> AppResult<i64> {
        self.axis.active.store(true, Ordering::SeqCst);
        let result = self.step_inner(delta_steps).await;
        let deassert = self.deassert_coils().await;
        self.axis.active.store(false, Ordering::SeqCst);
        // Prefer a stepping error over a deassert error, but never hide either.
        match (result, deassert) {
            (Ok(steps), Ok(())) => Ok(steps),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
        }
    }

    async fn step_inner(&self, delta_steps: i64) -> AppResult<i64> {
        if delta_steps == 0 {
            return Ok(0);
        }
        let logical_sign: i64 = if delta_steps > 0 { 1 } else { -1 };
        let physical_forward = logical_sign * self.axis.direction_sign as i64 > 0;
        let total = delta_steps.unsigned_abs();

        let mut taken: i64 = 0;
        let mut phase: usize = 0;
        for _ in 0..total {
            if !self.axis.active.load(Ordering::SeqCst) {
                debug!(axis = %self.axis.tag, "stop flag observed, halting step sequence");
                break;
            }
            let pattern = if physical_forward {
                HALF_STEP_FORWARD[phase % 4]
            } else {
                HALF_STEP_FORWARD[(4 - (phase % 4)) % 4]
            };
            self.write_pattern(pattern).await?;
            tokio::time::sleep(STEP_DELAY).await;
            phase += 1;
            self.axis.step_counter.fetch_add(logical_sign, Ordering::SeqCst);
            taken += logical_sign;
            trace!(axis = %self.axis.tag, steps = taken, "microstep");
        }
        Ok(taken)
    }

    async fn write_pattern(&self, pattern: [u8; 4]) -> AppResult<()> {
        for (pin, level) in self.axis.pins.iter().zip(pattern.iter()) {
            self.pin_io.digital_write(*pin, *level).await?;
        }
        Ok(())
    }

    async fn deassert_coils(&self) -> AppResult<()> {
        self.write_pattern([0, 0, 0, 0]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArctanCalibration;
    use crate::pin_io::MockPinIo;

    fn test_axis(tag: AxisTag, sign: i8) -> Axis {
        Axis::new(tag, [1, 2, 3, 4], sign, ArctanCalibration::default(), 966.67, 35)
    }

    #[tokio::test]
    async fn positive_delta_increments_counter() {
        let axis = test_axis(AxisTag::X, 1);
        let pins = MockPinIo::new();
        let driver = AxisDriver::new(&axis, &pins);
        let taken = driver.step(10).await.expect("step");
        assert_eq!(taken, 10);
        assert_eq!(axis.position_steps(), 10);
    }

    #[tokio::test]
    async fn negative_delta_decrements_counter() {
        let axis = test_axis(AxisTag::Z, 1);
        let pins = MockPinIo::new();
        let driver = AxisDriver::new(&axis, &pins);
        driver.step(10).await.expect("step");
        let taken = driver.step(-4).await.expect("step");
        assert_eq!(taken, -4);
        assert_eq!(axis.position_steps(), 6);
    }

    #[tokio::test]
    async fn direction_sign_inverts_physical_pattern_but_not_counter_sign() {
        // With a flipped direction sign the counter still follows the
        // logical (commanded) sign, only the physical pattern order differs.
        let axis = test_axis(AxisTag::Y, -1);
        let pins = MockPinIo::new();
        let driver = AxisDriver::new(&axis, &pins);
        let taken = driver.step(5).await.expect("step");
        assert_eq!(taken, 5);
        assert_eq!(axis.position_steps(), 5);
    }

    #[tokio::test]
    async fn zero_delta_is_noop_but_deasserts_coils() {
        let axis = test_axis(AxisTag::X, 1);
        let pins = MockPinIo::new();
        axis.pins.iter().for_each(|_| {});
        let driver = AxisDriver::new(&axis, &pins);
        let taken = driver.step(0).await.expect("step");
        assert_eq!(taken, 0);
        for pin in axis.pins {
            assert_eq!(pins.pin_level(pin).await, Some(0));
        }
    }

    #[tokio::test]
    async fn coils_are_low_after_completion() {
        let axis = test_axis(AxisTag::X, 1);
        let pins = MockPinIo::new();
        let driver = AxisDriver::new(&axis, &pins);
        driver.step(3).await.expect("step");
        for pin in axis.pins {
            assert_eq!(pins.pin_level(pin).await, Some(0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flag_halts_mid_sequence_and_still_deasserts() {
        let axis = Arc::new(test_axis(AxisTag::Z, 1));
        let pins = MockPinIo::new();
        let stop_axis = axis.clone();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(STEP_DELAY * 3).await;
            stop_axis.request_stop();
        });
        let driver = AxisDriver::new(&axis, &pins);
        let taken = driver.step(10_000).await.expect("step");
        stopper.await.expect("stopper task");
        assert!(taken < 10_000, "stop should have cut the sequence short");
        assert!(taken > 0, "a few microsteps should land before the stop is observed");
        for pin in axis.pins {
            assert_eq!(pins.pin_level(pin).await, Some(0));
        }
    }
}
