//! Firmware image reader
//!
//! Parses Motorola S-record, Intel HEX and raw binary files into a list of non-overlapping
//! segments. Parsing is all-or-nothing: any malformed record rejects the whole file.

mod hex;
pub mod srec;

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use log::{debug, trace};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use srec::SrecError;

/// The base address raw binaries are placed at when none is given: the start of the STM32 main
/// flash.
pub const DEFAULT_BASE_ADDRESS: u32 = crate::target::STM32_FLASH_BASE;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("S-record line {}: {}", _0, _1)]
    SRecord(usize, SrecError),
    #[error("Intel HEX error: {}", _0)]
    IntelHex(#[from] ::ihex::ReaderError),
    #[error("The image is truncated: no end of file record was found")]
    Truncated,
    #[error("Record at {address:#010x} overlaps the previous record ending at {previous_end:#010x}")]
    Overlap { address: u32, previous_end: u64 },
    #[error("Record at {:#010x} extends past the end of the address space", _0)]
    AddressOverflow(u32),
    #[error("The image does not contain any data")]
    Empty,
    #[error("The image is not valid text")]
    NotText,
    #[error("I/O error: {}", _0)]
    IoError(#[from] io::Error),
}

/// The container format of a firmware image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    SRecord,
    IntelHex,
    /// Raw bytes placed at `base_address`
    Binary { base_address: u32 },
}

impl ImageFormat {
    /// Guesses the format of `path` from its extension, then from the first non-blank byte of
    /// `content`.
    pub fn detect<P: AsRef<Path>>(path: P, content: &[u8], base_address: u32) -> ImageFormat {
        let extension = path
            .as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        match extension.as_deref() {
            Some("srec") | Some("s19") | Some("s28") | Some("s37") | Some("mot") => {
                return ImageFormat::SRecord
            }
            Some("hex") | Some("ihex") => return ImageFormat::IntelHex,
            Some("bin") => return ImageFormat::Binary { base_address },
            _ => {}
        }

        match content.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'S') => ImageFormat::SRecord,
            Some(b':') => ImageFormat::IntelHex,
            _ => ImageFormat::Binary { base_address },
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::SRecord => f.write_str("S-record"),
            ImageFormat::IntelHex => f.write_str("Intel HEX"),
            ImageFormat::Binary { base_address } => write!(f, "binary @ {:#010x}", base_address),
        }
    }
}

/// A contiguous run of bytes to be written at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Segment {
    /// The first address after this segment.
    pub fn end(&self) -> u32 {
        self.address + self.data.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    format: ImageFormat,
    segments: Vec<Segment>,
    entry_point: Option<u32>,
    header: Option<String>,
}

impl FirmwareImage {
    /// Parses `bytes` as an image in the given `format`.
    pub fn parse(bytes: &[u8], format: ImageFormat) -> Result<FirmwareImage, ImageError> {
        let (chunks, entry_point, header) = match format {
            ImageFormat::SRecord => {
                let text = std::str::from_utf8(bytes).map_err(|_| ImageError::NotText)?;
                let file = srec::parse(text)?;

                (file.records, file.entry_point, file.header)
            }
            ImageFormat::IntelHex => {
                let text = std::str::from_utf8(bytes).map_err(|_| ImageError::NotText)?;
                let file = hex::parse(text)?;

                (file.records, file.entry_point, None)
            }
            ImageFormat::Binary { base_address } => {
                (vec![(base_address, bytes.to_vec())], None, None)
            }
        };

        let segments = assemble(chunks)?;

        debug!(
            "Parsed {} image with {} segment(s)",
            format,
            segments.len()
        );

        Ok(FirmwareImage {
            format,
            segments,
            entry_point,
            header,
        })
    }

    /// Reads all of `reader` and parses it as an image in the given `format`.
    pub fn from_reader<R: Read>(mut reader: R, format: ImageFormat) -> Result<Self, ImageError> {
        let mut buf = Vec::new();

        reader.read_to_end(&mut buf)?;

        FirmwareImage::parse(&buf, format)
    }

    /// Opens and parses the image at `path`, detecting its format.
    ///
    /// `base_address` is only used when the file turns out to be a raw binary.
    pub fn from_path<P: AsRef<Path>>(path: P, base_address: u32) -> Result<Self, ImageError> {
        let mut buf = Vec::new();

        File::open(path.as_ref())?.read_to_end(&mut buf)?;

        let format = ImageFormat::detect(path.as_ref(), &buf, base_address);

        debug!("Reading {} as {}", path.as_ref().display(), format);

        FirmwareImage::parse(&buf, format)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// The segments of the image, sorted by address.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The entry point declared by the image's termination or start address record, if any.
    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    /// The text of the S0 header record, if any.
    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    /// The lowest address written by the image.
    pub fn start_address(&self) -> u32 {
        self.segments[0].address
    }

    /// Total number of payload bytes.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// SHA-256 digest over the payload of every segment in address order.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();

        for segment in &self.segments {
            hasher.update(&segment.data);
        }

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());

        digest
    }

    /// The digest as a lowercase hex string.
    pub fn digest_hex(&self) -> String {
        self.digest().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Sorts the `(address, bytes)` records and merges contiguous ones into segments.
///
/// Empty records are dropped; overlapping records are an error.
fn assemble(mut chunks: Vec<(u32, Vec<u8>)>) -> Result<Vec<Segment>, ImageError> {
    chunks.retain(|(_, data)| !data.is_empty());

    for (address, data) in &chunks {
        if *address as u64 + data.len() as u64 > u32::MAX as u64 {
            return Err(ImageError::AddressOverflow(*address));
        }
    }

    chunks.sort_by_key(|(address, _)| *address);

    let mut segments: Vec<Segment> = Vec::new();

    for (address, data) in chunks {
        if let Some(last) = segments.last_mut() {
            if last.end() == address {
                trace!("Merging record at {:#010x} into previous segment", address);
                last.data.extend_from_slice(&data);

                continue;
            }

            if last.end() > address {
                return Err(ImageError::Overlap {
                    address,
                    previous_end: last.end() as u64,
                });
            }
        }

        segments.push(Segment { address, data });
    }

    if segments.is_empty() {
        return Err(ImageError::Empty);
    }

    Ok(segments)
}
