//! Control core for a networked digital microscope: three calibrated
//! stepper axes, a dual-camera preview/recording pipeline, a golden-section
//! autofocus controller, and the session dispatcher that multiplexes
//! operator commands and telemetry over one persistent connection.
//!
//! The hardware GPIO/PWM/I2C layer, the camera sensor driver, the
//! pixel-processing algorithms (white balance, perspective correction,
//! JPEG encoding, motion detection), and the wire transport are external
//! collaborators, represented here by traits ([`pin_io::PinIo`],
//! [`video::CameraSensor`], [`video::FrameCodec`], [`recorder::VideoWriter`],
//! [`recorder::MotionDetector`], [`dispatcher::EventSink`]) with
//! deterministic mocks sufficient to drive and test every state machine in
//! this crate.

pub mod autofocus;
pub mod axis;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod motion;
pub mod pin_io;
pub mod position;
pub mod recorder;
pub mod video;

pub use error::{AppResult, MicroscopeError};
