//! Flashing of STM32 microcontrollers through their system bootloader
//!
//! Devices are found by an [`Enumerator`](enumerate::Enumerator), opened exclusively through a
//! [`ConnectionManager`](connection::ConnectionManager) and flashed by a
//! [`Sequencer`](sequencer::Sequencer):
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use cubeflash::connection::{ConnectionManager, DefaultConnector};
//! use cubeflash::enumerate::Enumerator;
//! use cubeflash::image::FirmwareImage;
//! use cubeflash::sequencer::{SequenceOptions, Sequencer};
//!
//! let image = FirmwareImage::from_path("blinky.hex", 0x0800_0000)?;
//! let devices = Enumerator::new(vec![]).scan()?;
//! let manager = ConnectionManager::new(DefaultConnector::default(), Duration::from_secs(10));
//!
//! if let Some(device) = devices.first() {
//!     let mut session = manager.connect(device)?;
//!
//!     Sequencer::new(&mut session, &image, SequenceOptions::default()).run()?;
//!     manager.disconnect(session);
//! }
//!
//! # Ok::<(), cubeflash::Error>(())
//! ```

pub mod connection;
pub mod device;
pub mod dfu;
pub mod enumerate;
mod error;
pub mod image;
pub mod poll;
pub mod protocol;
pub mod sequencer;
pub mod target;
pub mod uart;

#[cfg(test)]
mod mock;

pub use error::{ConnectionError, EnumerationError, Error, SequenceStepFailure, TargetError};

pub use serialport;
