//! The operations a connected target supports

use std::fmt;
use std::ops::Range;

use crate::TargetError;

/// Where the internal flash of STM32 devices is mapped
pub const STM32_FLASH_BASE: u32 = 0x0800_0000;

/// General information reported by a connected target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInfo {
    /// Name of the memory or bootloader the session talks to
    pub description: String,
    pub bootloader_version: Option<String>,
    /// The chip product id, as reported by the system bootloader
    pub chip_id: Option<u16>,
    pub flash_start: Option<u32>,
    pub flash_size: Option<u64>,
}

impl fmt::Display for TargetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Target: {}", self.description)?;

        if let Some(version) = &self.bootloader_version {
            writeln!(f, "Bootloader version: {}", version)?;
        }

        if let Some(chip_id) = self.chip_id {
            writeln!(f, "Chip id: {:#06x}", chip_id)?;
        }

        if let (Some(start), Some(size)) = (self.flash_start, self.flash_size) {
            writeln!(f, "Flash: {} KiB at {:#010x}", size / 1024, start)?;
        }

        Ok(())
    }
}

/// A connected device that can be flashed.
///
/// Every method is a blocking call into the device. Implementations do not retry failed
/// operations.
pub trait Target: Send {
    fn info(&mut self) -> Result<TargetInfo, TargetError>;

    /// Removes flash read protection if it is enabled. Unprotecting mass erases the device.
    fn unprotect(&mut self) -> Result<(), TargetError>;

    /// Erases at least the flash pages covering each of the given address ranges.
    fn erase(&mut self, regions: &[Range<u32>]) -> Result<(), TargetError>;

    /// Erases the whole flash.
    fn mass_erase(&mut self) -> Result<(), TargetError>;

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), TargetError>;

    /// Fills `buf` with memory read from `address`.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TargetError>;

    /// Starts the application whose vector table is at `address`. The target usually leaves the
    /// bootloader and disappears from the bus afterwards.
    fn execute(&mut self, address: u32) -> Result<(), TargetError>;

    /// Releases the underlying transport.
    fn close(&mut self) -> Result<(), TargetError> {
        Ok(())
    }
}
