//! Pin-level primitives: digital out, PWM duty/frequency, single-ended ADC.
//!
//! The real GPIO/PWM/I2C hardware abstraction is an external collaborator of
//! this core (see the purpose & scope notes); [`PinIo`] is the seam. Only a
//! deterministic mock is provided here for driving and testing the axis
//! driver, LED control, and Hall-voltage reconciliation logic.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::AppResult;

/// The four ADC channels wired to Hall sensors (three axes plus a reference).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdcChannel {
    /// X axis Hall voltage.
    X,
    /// Y axis Hall voltage.
    Y,
    /// Z axis Hall voltage.
    Z,
    /// Shared reference channel.
    Reference,
}

/// Level primitives for digital out, PWM duty/frequency, and ADC reads.
///
/// `pwm_configure` is idempotent: duty 0 disables the channel, duty 100 is
/// always-on. A hardware-layer failure on any method is surfaced to the
/// caller as a [`crate::error::MicroscopeError::Transient`] or
/// [`crate::error::MicroscopeError::Configuration`] as appropriate; the axis
/// driver treats such a failure as fatal for the move in progress.
#[async_trait]
pub trait PinIo: Send + Sync {
    /// Drives `pin` to `level` (0 or 1).
    async fn digital_write(&self, pin: u8, level: u8) -> AppResult<()>;

    /// Configures a PWM channel's frequency and duty cycle.
    async fn pwm_configure(&self, channel: u8, frequency_hz: f64, duty_percent: u8) -> AppResult<()>;

    /// Reads one ADC channel in volts.
    async fn adc_read(&self, channel: AdcChannel) -> AppResult<f64>;
}

/// Deterministic in-memory [`PinIo`] implementation used by tests and by the
/// mock camera/axis harness. Tracks the last-written level per pin and the
/// last-configured duty/frequency per PWM channel, and lets tests seed ADC
/// voltages to exercise the reconciliation path.
pub struct MockPinIo {
    pin_levels: Mutex<HashMap<u8, u8>>,
    pwm_state: Mutex<HashMap<u8, (f64, u8)>>,
    adc_voltages: Mutex<HashMap<AdcChannel, f64>>,
}

impl MockPinIo {
    /// Creates a mock with all pins low, all PWM channels off, and 1.6V on
    /// every ADC channel (a plausible mid-travel Hall reading).
    pub fn new() -> Self {
        let mut adc = HashMap::new();
        adc.insert(AdcChannel::X, 1.6);
        adc.insert(AdcChannel::Y, 1.6);
        adc.insert(AdcChannel::Z, 1.4);
        adc.insert(AdcChannel::Reference, 1.6);
        Self {
            pin_levels: Mutex::new(HashMap::new()),
            pwm_state: Mutex::new(HashMap::new()),
            adc_voltages: Mutex::new(adc),
        }
    }

    /// Seeds the voltage a subsequent `adc_read` on `channel` will return.
    pub async fn set_adc_voltage(&self, channel: AdcChannel, volts: f64) {
        self.adc_voltages.lock().await.insert(channel, volts);
    }

    /// Returns the last level written to `pin`, or `None` if never written.
    pub async fn pin_level(&self, pin: u8) -> Option<u8> {
        self.pin_levels.lock().await.get(&pin).copied()
    }

    /// Returns the last configured (frequency, duty) for `channel`.
    pub async fn pwm_state(&self, channel: u8) -> Option<(f64, u8)> {
        self.pwm_state.lock().await.get(&channel).copied()
    }
}

impl Default for MockPinIo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PinIo for MockPinIo {
    async fn digital_write(&self, pin: u8, level: u8) -> AppResult<()> {
        self.pin_levels.lock().await.insert(pin, level);
        Ok(())
    }

    async fn pwm_configure(&self, channel: u8, frequency_hz: f64, duty_percent: u8) -> AppResult<()> {
        self.pwm_state.lock().await.insert(channel, (frequency_hz, duty_percent));
        Ok(())
    }

    async fn adc_read(&self, channel: AdcChannel) -> AppResult<f64> {
        Ok(*self.adc_voltages.lock().await.get(&channel).unwrap_or(&0.0))
    }
}
