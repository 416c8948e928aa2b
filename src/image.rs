//! Firmware images and the loaders that produce them

mod binary;
mod elf;
mod ihex;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use thiserror::Error;

pub use elf::ParseError;

/// The value of unprogrammed flash
pub const ERASED_BYTE: u8 = 0xff;

/// Number of vector table words covered by the boot checksum
const CHECKSUM_WORDS: usize = 8;

/// Index of the word that holds the boot checksum
const CHECKSUM_INDEX: usize = 7;

/// Errors that indicate why an image could not be loaded
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Could not read {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] io::Error),
    #[error("Unsupported image format {:?}, expected .bin, .hex, .ihex, .elf or .axf", _0)]
    UnsupportedFormat(String),
    #[error("{} bytes at {:#010x} do not fit in {} bytes of memory", len, address, capacity)]
    TooLarge {
        address: u32,
        len: usize,
        capacity: usize,
    },
    #[error("Image does not contain any data")]
    Empty,
    #[error("Invalid record on line {}: {}", line, reason)]
    InvalidRecord { line: usize, reason: String },
    #[error(
        "Checksum mismatch on line {}: record says {:#04x}, calculated {:#04x}",
        line,
        expected,
        actual
    )]
    ChecksumMismatch { line: usize, expected: u8, actual: u8 },
    #[error("ELF error: {}", _0)]
    Elf(#[from] ParseError),
}

/// A memory sized byte buffer together with the inclusive range of addresses that were loaded.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    data: Vec<u8>,
    range: Option<(u32, u32)>,
    dirty: bool,
}

impl MemoryImage {
    /// Creates an empty image of `capacity` erased bytes
    pub fn new(capacity: usize) -> MemoryImage {
        MemoryImage {
            data: vec![ERASED_BYTE; capacity],
            range: None,
            dirty: false,
        }
    }

    /// Copies `bytes` to `address` and widens the loaded range to cover them
    pub fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), ImageError> {
        if bytes.is_empty() {
            return Ok(());
        }

        let start = address as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= self.data.len())
            .ok_or(ImageError::TooLarge {
                address,
                len: bytes.len(),
                capacity: self.data.len(),
            })?;

        self.data[start..end].copy_from_slice(bytes);

        let last = (end - 1) as u32;

        self.range = Some(match self.range {
            Some((lo, hi)) => (lo.min(address), hi.max(last)),
            None => (address, last),
        });

        Ok(())
    }

    /// Returns the number of bytes the image can hold
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing has been loaded
    pub fn is_empty(&self) -> bool {
        self.range.is_none()
    }

    /// Returns the first loaded address
    pub fn start_address(&self) -> u32 {
        self.range.map(|(start, _)| start).unwrap_or(0)
    }

    /// Returns the last loaded address (inclusive)
    pub fn end_address(&self) -> u32 {
        self.range.map(|(_, end)| end).unwrap_or(0)
    }

    /// Returns the loaded bytes, `start_address..=end_address`
    pub fn contents(&self) -> &[u8] {
        match self.range {
            Some((start, end)) => &self.data[start as usize..=end as usize],
            None => &[],
        }
    }

    /// Returns `len` bytes at `address`, or `None` if they lie outside the image
    pub fn slice(&self, address: u32, len: usize) -> Option<&[u8]> {
        let start = address as usize;

        self.data.get(start..start.checked_add(len)?)
    }

    /// Returns true if the boot checksum had to be rewritten
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rewrites the boot checksum so that the first eight vector table words at the image start
    /// sum to zero.
    ///
    /// The image is left untouched, and not marked dirty, when the checksum is already correct.
    pub fn update_checksum(&mut self) -> Result<(), ImageError> {
        let start = self.start_address();
        let len = CHECKSUM_WORDS * 4;
        let capacity = self.data.len();
        let table = self
            .data
            .get_mut(start as usize..start as usize + len)
            .ok_or(ImageError::TooLarge {
                address: start,
                len,
                capacity,
            })?;

        let mut words = [0u32; CHECKSUM_WORDS];
        LittleEndian::read_u32_into(table, &mut words);

        let checksum = words[..CHECKSUM_INDEX]
            .iter()
            .fold(0u32, |sum, &word| sum.wrapping_add(word))
            .wrapping_neg();

        if words[CHECKSUM_INDEX] != checksum {
            info!(
                "Updating checksum from {:#010x} to {:#010x}",
                words[CHECKSUM_INDEX], checksum
            );

            LittleEndian::write_u32(&mut table[CHECKSUM_INDEX * 4..], checksum);
            self.dirty = true;

            // The checksum word itself is part of what gets programmed
            let last = start + len as u32 - 1;
            self.range = Some((start, self.end_address().max(last)));
        }

        Ok(())
    }
}

/// Loads the firmware at `path` into an image of `capacity` bytes and fixes up its boot checksum.
///
/// The format is chosen by file extension: `.bin`, `.hex`/`.ihex` or `.elf`/`.axf`.
pub fn load<P: AsRef<Path>>(path: P, capacity: usize) -> Result<MemoryImage, ImageError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let read = || fs::read(path).map_err(|err| ImageError::Io(path.to_owned(), err));

    debug!("Loading {} as {:?}", path.display(), extension);

    let mut image = match extension.as_str() {
        "bin" => binary::from_bytes(&read()?, capacity)?,
        "hex" | "ihex" => {
            let bytes = read()?;
            ihex::from_str(&String::from_utf8_lossy(&bytes), capacity)?
        }
        "elf" | "axf" => elf::from_bytes(&read()?, capacity)?,
        _ => return Err(ImageError::UnsupportedFormat(extension)),
    };

    if image.is_empty() {
        return Err(ImageError::Empty);
    }

    image.update_checksum()?;

    info!(
        "Loaded {} ({:#010x}..={:#010x})",
        path.display(),
        image.start_address(),
        image.end_address()
    );

    Ok(image)
}

#[cfg(test)]
mod tests {
    use std::env;

    use assert_hex::*;

    use super::*;

    /// Returns the wrapping sum of the first eight words
    fn vector_sum(image: &MemoryImage) -> u32 {
        let mut words = [0u32; CHECKSUM_WORDS];
        LittleEndian::read_u32_into(
            image.slice(image.start_address(), 32).unwrap(),
            &mut words,
        );

        words.iter().fold(0u32, |sum, &word| sum.wrapping_add(word))
    }

    fn vectors() -> Vec<u8> {
        let words = [
            0x1000_2000u32,
            0x0000_00c1,
            0x0000_00c3,
            0x0000_00c5,
            0x0000_00c7,
            0x0000_00c9,
            0x0000_00cb,
            0xdead_beef,
        ];
        let mut bytes = vec![0u8; 32];
        LittleEndian::write_u32_into(&words, &mut bytes);

        bytes
    }

    #[test]
    fn it_should_track_the_loaded_range() {
        let mut image = MemoryImage::new(0x100);

        image.write(0x20, &[1, 2, 3, 4]).unwrap();
        image.write(0x10, &[5, 6]).unwrap();

        assert_eq!(image.start_address(), 0x10);
        assert_eq!(image.end_address(), 0x23);
        assert_eq!(image.contents().len(), 0x14);
        // Gaps are left erased
        assert_eq_hex!(image.slice(0x12, 2).unwrap(), &[0xffu8, 0xff][..]);
    }

    #[test]
    fn it_should_reject_writes_beyond_capacity() {
        let mut image = MemoryImage::new(16);

        assert!(image.write(12, &[0; 4]).is_ok());
        assert!(matches!(
            image.write(13, &[0; 4]),
            Err(ImageError::TooLarge { address: 13, .. })
        ));
        assert!(matches!(
            image.write(u32::MAX, &[0]),
            Err(ImageError::TooLarge { .. })
        ));
    }

    #[test]
    fn it_should_fix_a_corrupted_checksum_once() {
        let mut image = MemoryImage::new(0x1000);
        image.write(0, &vectors()).unwrap();

        image.update_checksum().unwrap();

        assert!(image.is_dirty());
        assert_eq_hex!(vector_sum(&image), 0);

        let fixed = image.contents().to_vec();
        image.update_checksum().unwrap();

        assert_eq!(image.contents(), &fixed[..]);
        assert!(image.is_dirty());
    }

    #[test]
    fn it_should_leave_a_correct_checksum_alone() {
        let mut image = MemoryImage::new(0x1000);
        image.write(0, &vectors()).unwrap();
        image.update_checksum().unwrap();

        let mut clean = MemoryImage::new(0x1000);
        clean.write(0, image.contents()).unwrap();
        clean.update_checksum().unwrap();

        assert!(!clean.is_dirty());
        assert_eq!(clean.contents(), image.contents());
    }

    #[test]
    fn it_should_checksum_at_the_image_start() {
        let mut image = MemoryImage::new(0x2000);
        image.write(0x1000, &vectors()).unwrap();

        image.update_checksum().unwrap();

        assert_eq_hex!(vector_sum(&image), 0);
        assert_eq_hex!(image.slice(0, 4).unwrap(), &[0xffu8; 4][..]);
    }

    #[test]
    fn it_should_extend_short_images_over_the_checksum_word() {
        let mut image = MemoryImage::new(0x100);
        image.write(0, &[0x00, 0x20, 0x00, 0x10]).unwrap();

        image.update_checksum().unwrap();

        assert_eq!(image.end_address(), 31);
    }

    #[test]
    fn it_should_load_raw_binaries_at_address_zero() {
        let path = env::temp_dir().join(format!("lpc-isp-{}.bin", std::process::id()));
        fs::write(&path, vectors()).unwrap();

        let image = load(&path, 0x1000).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(image.start_address(), 0);
        assert_eq!(image.end_address(), 31);
        assert_eq_hex!(vector_sum(&image), 0);
    }

    #[test]
    fn it_should_reject_unknown_extensions() {
        assert!(matches!(
            load("firmware.srec", 0x1000),
            Err(ImageError::UnsupportedFormat(ref ext)) if ext == "srec"
        ));
    }

    #[test]
    fn it_should_report_missing_files() {
        assert!(matches!(
            load("/nonexistent/firmware.bin", 0x1000),
            Err(ImageError::Io(..))
        ));
    }
}
