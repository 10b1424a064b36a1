//! Intel HEX support on top of the `ihex` record reader

use ihex::{Reader, Record};
use log::trace;

use super::ImageError;

#[derive(Debug, Default)]
pub(crate) struct HexFile {
    pub records: Vec<(u32, Vec<u8>)>,
    pub entry_point: Option<u32>,
}

/// Parses a whole Intel HEX file, resolving extended segment and linear address records.
///
/// Every record is checked by the reader; the file must contain an end of file record.
pub(crate) fn parse(input: &str) -> Result<HexFile, ImageError> {
    let mut file = HexFile::default();
    let mut base: u32 = 0;
    let mut seen_eof = false;

    for record in Reader::new(input) {
        match record? {
            Record::Data { offset, value } => {
                let address = base.wrapping_add(offset as u32);

                trace!("Data record: {} bytes at {:#010x}", value.len(), address);

                file.records.push((address, value));
            }
            Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
            Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
            Record::StartSegmentAddress { cs, ip } => {
                file.entry_point = Some(((cs as u32) << 4) + ip as u32)
            }
            Record::StartLinearAddress(address) => file.entry_point = Some(address),
            Record::EndOfFile => {
                seen_eof = true;
                break;
            }
        }
    }

    if !seen_eof {
        return Err(ImageError::Truncated);
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLINK_HEX: &str = "\
:020000040800F2
:10000000000002200D01000815010008170100087A
:0400100019010008CA
:04000005080000ED02
:00000001FF
";

    #[test]
    fn it_should_apply_extended_linear_addresses() {
        let file = parse(BLINK_HEX).unwrap();

        assert_eq!(file.records.len(), 2);
        assert_eq!(file.records[0].0, 0x0800_0000);
        assert_eq!(file.records[1].0, 0x0800_0010);
        assert_eq!(file.entry_point, Some(0x0800_00ed));
    }

    #[test]
    fn it_should_require_an_end_of_file_record() {
        let truncated = &BLINK_HEX[..BLINK_HEX.find(":00000001FF").unwrap()];

        assert!(matches!(parse(truncated), Err(ImageError::Truncated)));
    }

    #[test]
    fn it_should_reject_checksum_errors() {
        let corrupted = BLINK_HEX.replace(":0400100019010008CA", ":0400100019010008CB");

        assert!(matches!(parse(&corrupted), Err(ImageError::IntelHex(_))));
    }
}
