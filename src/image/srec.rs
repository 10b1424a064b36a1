//! Motorola S-record parser

use byteorder::{BigEndian, ByteOrder};
use log::trace;
use thiserror::Error;

use super::ImageError;

/// Validation errors for a single S-record line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SrecError {
    #[error("Record does not start with 'S'")]
    MissingStartCode,
    #[error("Unknown record type {:?}", _0)]
    InvalidRecordType(char),
    #[error("Record contains characters that are not hexadecimal digit pairs")]
    InvalidHex,
    #[error("Byte count is {declared} but the record holds {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Record is too short for its address field")]
    RecordTooShort,
    #[error("Checksum mismatch: the record says {expected:#04x}, computed {computed:#04x}")]
    ChecksumMismatch { expected: u8, computed: u8 },
    #[error("Record count says {declared} data records, found {actual}")]
    CountMismatch { declared: u32, actual: u32 },
    #[error("Data follows the termination record")]
    DataAfterTermination,
}

/// A single decoded S-record line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The record type digit, 0 through 9
    pub kind: u8,
    pub address: u32,
    pub data: Vec<u8>,
}

impl Record {
    /// Decodes and validates a single line, without the trailing newline.
    pub fn from_line(line: &str) -> Result<Record, SrecError> {
        let mut chars = line.chars();

        if chars.next() != Some('S') {
            return Err(SrecError::MissingStartCode);
        }

        let kind_char = chars.next().ok_or(SrecError::RecordTooShort)?;
        let kind = match kind_char.to_digit(10) {
            Some(4) | None => return Err(SrecError::InvalidRecordType(kind_char)),
            Some(kind) => kind as u8,
        };

        let bytes = decode_hex(&line[2..])?;

        let (&count, rest) = bytes.split_first().ok_or(SrecError::RecordTooShort)?;

        if count as usize != rest.len() {
            return Err(SrecError::LengthMismatch {
                declared: count as usize,
                actual: rest.len(),
            });
        }

        let address_len = address_len(kind);

        // Address field plus the checksum byte
        if rest.len() < address_len + 1 {
            return Err(SrecError::RecordTooShort);
        }

        let (&expected, body) = bytes.split_last().ok_or(SrecError::RecordTooShort)?;
        let computed = !body.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));

        if expected != computed {
            return Err(SrecError::ChecksumMismatch { expected, computed });
        }

        let address = BigEndian::read_uint(&body[1..=address_len], address_len) as u32;
        let data = body[1 + address_len..].to_vec();

        Ok(Record {
            kind,
            address,
            data,
        })
    }
}

/// Width of the address field in bytes for the given record type.
fn address_len(kind: u8) -> usize {
    match kind {
        2 | 6 | 8 => 3,
        3 | 7 => 4,
        _ => 2,
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>, SrecError> {
    let text = text.as_bytes();

    if text.len() % 2 != 0 {
        return Err(SrecError::InvalidHex);
    }

    text.chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16).ok_or(SrecError::InvalidHex)?;
            let lo = (pair[1] as char).to_digit(16).ok_or(SrecError::InvalidHex)?;

            Ok((hi << 4 | lo) as u8)
        })
        .collect()
}

/// The contents of a fully validated S-record file.
#[derive(Debug, Default)]
pub(crate) struct SrecFile {
    pub header: Option<String>,
    pub records: Vec<(u32, Vec<u8>)>,
    pub entry_point: Option<u32>,
}

/// Parses a whole S-record file.
///
/// The file must end with an S7, S8 or S9 termination record; a file cut short anywhere is
/// rejected as truncated.
pub(crate) fn parse(input: &str) -> Result<SrecFile, ImageError> {
    let mut file = SrecFile::default();
    let mut data_records = 0u32;
    let mut terminated = false;

    for (index, line) in input.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim();

        if line.is_empty() {
            continue;
        }

        if terminated {
            return Err(ImageError::SRecord(line_no, SrecError::DataAfterTermination));
        }

        let record = Record::from_line(line).map_err(|err| ImageError::SRecord(line_no, err))?;

        match record.kind {
            0 => {
                let header = String::from_utf8_lossy(&record.data);
                let header = header.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());

                file.header = Some(header.to_owned());
            }
            1 | 2 | 3 => {
                trace!(
                    "S{} record: {} bytes at {:#010x}",
                    record.kind,
                    record.data.len(),
                    record.address
                );

                data_records += 1;
                file.records.push((record.address, record.data));
            }
            5 | 6 => {
                if record.address != data_records {
                    return Err(ImageError::SRecord(
                        line_no,
                        SrecError::CountMismatch {
                            declared: record.address,
                            actual: data_records,
                        },
                    ));
                }
            }
            _ => {
                if record.address != 0 {
                    file.entry_point = Some(record.address);
                }

                terminated = true;
            }
        }
    }

    if !terminated {
        return Err(ImageError::Truncated);
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use assert_hex::*;

    use super::*;

    #[test]
    fn it_should_decode_s3_records() {
        let record = Record::from_line("S30E08000000000102030405060708C5").unwrap();

        assert_eq!(record.kind, 3);
        assert_eq_hex!(record.address, 0x0800_0000);
        assert_eq_hex!(record.data, vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn it_should_reject_checksum_mismatches() {
        let err = Record::from_line("S111003848656C6C6F20776F726C642E0A0043").unwrap_err();

        assert_eq!(
            err,
            SrecError::ChecksumMismatch {
                expected: 0x43,
                computed: 0x42
            }
        );
    }

    #[test]
    fn it_should_reject_cut_off_records() {
        let err = Record::from_line("S111003848656C6C6F20776F72").unwrap_err();

        assert_eq!(
            err,
            SrecError::LengthMismatch {
                declared: 0x11,
                actual: 11
            }
        );
    }

    #[test]
    fn it_should_reject_malformed_lines() {
        assert_eq!(
            Record::from_line(":1000000000").unwrap_err(),
            SrecError::MissingStartCode
        );
        assert_eq!(
            Record::from_line("S4030000FC").unwrap_err(),
            SrecError::InvalidRecordType('4')
        );
        assert_eq!(
            Record::from_line("S1030000FG").unwrap_err(),
            SrecError::InvalidHex
        );
        assert_eq!(
            Record::from_line("S30100FE").unwrap_err(),
            SrecError::LengthMismatch {
                declared: 1,
                actual: 2
            }
        );
        assert_eq!(
            Record::from_line("S3030000FC").unwrap_err(),
            SrecError::RecordTooShort
        );
    }

    #[test]
    fn it_should_reject_files_without_termination() {
        let input = "S00F000068656C6C6F202020202000003C\n\
                     S11F00007C0802A6900100049421FFF07C6C1B787C8C23783C6000003863000026\n";

        assert!(matches!(parse(input), Err(ImageError::Truncated)));
    }

    #[test]
    fn it_should_check_record_counts() {
        let input = "S11F00007C0802A6900100049421FFF07C6C1B787C8C23783C6000003863000026\n\
                     S5030003F9\n\
                     S9030000FC\n";

        assert!(matches!(
            parse(input),
            Err(ImageError::SRecord(
                2,
                SrecError::CountMismatch {
                    declared: 3,
                    actual: 1
                }
            ))
        ));
    }

    #[test]
    fn it_should_reject_data_after_termination() {
        let input = "S9030000FC\n\
                     S11F00007C0802A6900100049421FFF07C6C1B787C8C23783C6000003863000026\n";

        assert!(matches!(
            parse(input),
            Err(ImageError::SRecord(2, SrecError::DataAfterTermination))
        ));
    }

    #[test]
    fn it_should_read_the_entry_point() {
        let input = "S30E08000000000102030405060708C5\r\n\
                     S70508000101F0\r\n";
        let file = parse(input).unwrap();

        assert_eq!(file.entry_point, Some(0x0800_0101));
        assert_eq!(file.records.len(), 1);
    }
}
