use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// The `bStatus` field of a DFU_GETSTATUS response
#[repr(u8)]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
pub enum DfuStatus {
    #[error("No error condition is present")]
    NoError = 0x00,
    #[error("File is not targeted for use by this device")]
    ErrTarget = 0x01,
    #[error("File is for this device but fails some vendor-specific verification test")]
    ErrFile,
    #[error("Device is unable to write memory")]
    ErrWrite,
    #[error("Memory erase function failed")]
    ErrErase,
    #[error("Memory erase check failed")]
    ErrCheckErased,
    #[error("Program memory function failed")]
    ErrProg,
    #[error("Programmed memory failed verification")]
    ErrVerify,
    #[error("Cannot program memory due to received address that is out of range")]
    ErrAddress,
    #[error("Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet")]
    ErrNotDone,
    #[error("Device's firmware is corrupt; it cannot return to run-time operations")]
    ErrFirmware,
    #[error("Vendor-specific error, the target may be read protected")]
    ErrVendor,
    #[error("Device detected unexpected USB reset signaling")]
    ErrUsbr,
    #[error("Device detected unexpected power on reset")]
    ErrPor,
    #[error("Something went wrong, but the device does not know what it was")]
    #[num_enum(default)]
    ErrUnknown = 0x0e,
    #[error("Device stalled an unexpected request")]
    ErrStalledPkt = 0x0f,
}

/// The `bState` field of a DFU_GETSTATUS response
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DfuDnloadSync = 3,
    DfuDnBusy = 4,
    DfuDnloadIdle = 5,
    DfuManifestSync = 6,
    DfuManifest = 7,
    DfuManifestWaitReset = 8,
    DfuUploadIdle = 9,
    DfuError = 10,
}
