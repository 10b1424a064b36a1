use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::device::{DeviceId, ProtocolMode};
use crate::dfu::{DfuState, DfuStatus};
use crate::image::ImageError;
use crate::sequencer::{SequenceState, Step};

/// Errors produced while scanning for target devices.
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("The {} enumeration backend is unavailable on this host", _0)]
    Unavailable(&'static str),
    #[error("USB enumeration failed: {}", _0)]
    Usb(#[from] rusb::Error),
    #[error("Serial port enumeration failed: {}", _0)]
    Serial(#[from] serialport::Error),
}

/// Errors returned by a target transport while talking to a device.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("USB transfer failed: {}", _0)]
    Usb(#[from] rusb::Error),
    #[error("Serial port error: {}", _0)]
    Serial(#[from] serialport::Error),
    #[error("I/O error: {}", _0)]
    Io(#[from] io::Error),
    #[error("DFU request failed with status {status:?} ({status}) in state {state:?}")]
    Dfu { status: DfuStatus, state: DfuState },
    #[error("The bootloader rejected command {:#04x}", _0)]
    Nack(u8),
    #[error("Unexpected response from target: {:02x?}", _0)]
    UnexpectedResponse(Vec<u8>),
    #[error("Verification failed at {address:#010x}: expected {expected:#04x}, read {actual:#04x}")]
    VerifyMismatch {
        address: u32,
        expected: u8,
        actual: u8,
    },
    #[error("Address {:#010x} is outside of the device memory map", _0)]
    OutOfRange(u32),
    #[error("The target did not come back within {:?} after a reset", _0)]
    ReconnectTimeout(Duration),
}

impl TargetError {
    /// Returns the numeric code of the underlying failure.
    ///
    /// USB errors map to their libusb error numbers, DFU failures to the `bStatus` byte reported
    /// by the device and bootloader NACKs to the rejected command id in the `0x100` range.
    pub fn code(&self) -> i32 {
        match self {
            TargetError::Usb(err) => usb_error_code(*err),
            TargetError::Serial(_) => 0x200,
            TargetError::Io(err) => err.raw_os_error().unwrap_or(0x300),
            TargetError::Dfu { status, .. } => u8::from(*status) as i32,
            TargetError::Nack(command) => 0x100 | *command as i32,
            TargetError::UnexpectedResponse(_) => 0x400,
            TargetError::VerifyMismatch { .. } => 0x401,
            TargetError::OutOfRange(_) => 0x402,
            TargetError::ReconnectTimeout(_) => 0x403,
        }
    }
}

fn usb_error_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}

/// Errors produced while opening or closing a flash session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Timed out after {:?} while connecting to the target", _0)]
    Timeout(Duration),
    #[error("Device {} already has an active session", _0)]
    AlreadyConnected(DeviceId),
    #[error("Connecting to {} devices is not supported", _0)]
    Unsupported(ProtocolMode),
    #[error("Device {} is no longer attached", _0)]
    NotFound(DeviceId),
    #[error("Could not open device {}: {}", _0, _1)]
    Open(DeviceId, #[source] TargetError),
}

/// A step of the flash sequence failed.
#[derive(Debug, Error)]
#[error("The {step} step failed with code {code}: {source}")]
pub struct SequenceStepFailure {
    /// The step that failed
    pub step: Step,
    /// The numeric code of the underlying target error
    pub code: i32,
    /// The underlying target error
    #[source]
    pub source: TargetError,
}

impl SequenceStepFailure {
    pub fn new(step: Step, source: TargetError) -> SequenceStepFailure {
        SequenceStepFailure {
            step,
            code: source.code(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Enumeration error: {}", _0)]
    Enumeration(#[from] EnumerationError),
    #[error("Connection error: {}", _0)]
    Connection(#[from] ConnectionError),
    #[error("Malformed image: {}", _0)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Step(#[from] SequenceStepFailure),
    #[error("Target error: {}", _0)]
    Target(#[from] TargetError),
    #[error("The session is in state {:?}, a new session is required", _0)]
    SessionNotIdle(SequenceState),
    #[error("The flash sequence was cancelled before it started")]
    Cancelled,
    #[error("No target device found")]
    NoDevice,
}

impl Error {
    /// Returns the process exit code that reports this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Enumeration(_) => 2,
            Error::Connection(_) => 3,
            Error::Image(_) => 4,
            Error::NoDevice => 5,
            Error::Cancelled => 6,
            Error::Step(failure) => failure.step.exit_code(),
            Error::Target(_) | Error::SessionNotIdle(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_report_step_specific_exit_codes() {
        let err = Error::from(SequenceStepFailure::new(
            Step::Erase,
            TargetError::Nack(0x44),
        ));

        assert_eq!(err.exit_code(), 11);

        let err = Error::from(SequenceStepFailure::new(
            Step::Verify,
            TargetError::VerifyMismatch {
                address: 0x0800_0000,
                expected: 0xaa,
                actual: 0xff,
            },
        ));

        assert_eq!(err.exit_code(), 13);
    }

    #[test]
    fn it_should_carry_the_underlying_code() {
        let failure = SequenceStepFailure::new(Step::Program, TargetError::Usb(rusb::Error::Pipe));

        assert_eq!(failure.code, -9);

        let failure = SequenceStepFailure::new(
            Step::Program,
            TargetError::Dfu {
                status: DfuStatus::ErrWrite,
                state: DfuState::DfuError,
            },
        );

        assert_eq!(failure.code, 0x03);
    }
}
