//! Intel HEX reader

use std::convert::TryFrom;

use log::trace;
use num_enum::TryFromPrimitive;

use super::{ImageError, MemoryImage};

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
enum RecordType {
    Data = 0,
    EndOfFile = 1,
    ExtendedSegmentAddress = 2,
    StartSegmentAddress = 3,
    ExtendedLinearAddress = 4,
    StartLinearAddress = 5,
}

/// A decoded and checksum verified record
struct Record {
    typ: RecordType,
    address: u16,
    data: Vec<u8>,
}

fn invalid(line: usize, reason: &str) -> ImageError {
    ImageError::InvalidRecord {
        line,
        reason: reason.to_owned(),
    }
}

fn parse_record(line: usize, text: &str) -> Result<Record, ImageError> {
    let digits = text
        .strip_prefix(':')
        .ok_or_else(|| invalid(line, "missing start code"))?;

    if !digits.is_ascii() {
        return Err(invalid(line, "invalid hex digit"));
    }

    if digits.len() % 2 != 0 {
        return Err(invalid(line, "odd number of hex digits"));
    }

    let bytes = (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| invalid(line, "invalid hex digit"))?;

    // count, address (2), type, data, checksum
    if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
        return Err(invalid(line, "length does not match byte count"));
    }

    let (body, checksum) = bytes.split_at(bytes.len() - 1);
    let calculated = body
        .iter()
        .fold(0u8, |sum, &b| sum.wrapping_add(b))
        .wrapping_neg();

    if calculated != checksum[0] {
        return Err(ImageError::ChecksumMismatch {
            line,
            expected: checksum[0],
            actual: calculated,
        });
    }

    let typ = RecordType::try_from(body[3])
        .map_err(|_| invalid(line, &format!("unknown record type {:02x}", body[3])))?;

    Ok(Record {
        typ,
        address: u16::from_be_bytes([body[1], body[2]]),
        data: body[4..].to_vec(),
    })
}

/// Parses Intel HEX `text` into an image of `capacity` bytes.
///
/// Parsing stops at the first invalid record, before anything from it is written.
pub fn from_str(text: &str, capacity: usize) -> Result<MemoryImage, ImageError> {
    let mut image = MemoryImage::new(capacity);
    let mut offset = 0u32;

    for (index, text) in text.lines().enumerate() {
        let text = text.trim();

        if text.is_empty() {
            continue;
        }

        let line = index + 1;
        let record = parse_record(line, text)?;

        match record.typ {
            RecordType::Data => {
                let address = offset.wrapping_add(u32::from(record.address));

                image.write(address, &record.data)?;
            }
            RecordType::EndOfFile => {
                trace!(
                    "End of file on line {}, loaded {:#010x}..={:#010x}",
                    line,
                    image.start_address(),
                    image.end_address()
                );

                return Ok(image);
            }
            RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress => {
                if record.data.len() != 2 {
                    return Err(invalid(line, "address record must hold 2 bytes"));
                }

                let base = u32::from(u16::from_be_bytes([record.data[0], record.data[1]]));

                offset = if record.typ == RecordType::ExtendedSegmentAddress {
                    base << 4
                } else {
                    base << 16
                };
            }
            RecordType::StartSegmentAddress | RecordType::StartLinearAddress => {
                trace!("Ignoring start address record on line {}", line);
            }
        }
    }

    Err(invalid(
        text.lines().count(),
        "missing end of file record",
    ))
}
