//! Fixed chip geometry and run options

use std::ops::RangeInclusive;

use crate::Error;

/// The default baud rate used by both the host and the bootloader
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// The default number of stop bits
pub const DEFAULT_STOP_BITS: u8 = 1;

/// The number of full synchronization attempts, each preceded by an ISP mode entry
pub const DEFAULT_SYNC_RETRIES: u32 = 2;

/// The number of times a command is re-sent before giving up with a timeout
pub const DEFAULT_COMMAND_RETRIES: u32 = 3;

/// Flash and RAM layout of the target chip.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Geometry {
    /// Size of a single erase/program sector, in bytes
    pub sector_size: u32,
    /// Number of flash sectors
    pub sector_count: u32,
    /// Size of the RAM window that is staged and copied to flash in one go
    pub ram_window_size: u32,
    /// Address of the RAM staging window
    pub ram_staging_address: u32,
}

impl Geometry {
    /// LPC15xx: 64 x 4 KiB sectors, staged through 1 KiB of RAM at 0x0200_1000
    pub const LPC15XX: Geometry = Geometry {
        sector_size: 4096,
        sector_count: 64,
        ram_window_size: 1024,
        ram_staging_address: 0x0200_1000,
    };

    /// Returns the total flash size in bytes
    pub fn flash_size(&self) -> usize {
        self.sector_size as usize * self.sector_count as usize
    }

    /// Returns the size of one half of the RAM staging window
    pub fn half_window(&self) -> u32 {
        self.ram_window_size / 2
    }

    /// Returns the first address of `sector`
    pub fn sector_address(&self, sector: u32) -> u32 {
        sector * self.sector_size
    }

    /// Returns the sector that contains `address`
    pub fn sector_of(&self, address: u32) -> Result<u32, Error> {
        let sector = address / self.sector_size;

        if sector >= self.sector_count {
            return Err(Error::InvalidSector {
                sector,
                count: self.sector_count,
            });
        }

        Ok(sector)
    }

    /// Returns the inclusive range of sectors spanned by the inclusive address range
    pub fn sectors_spanned(&self, start: u32, end: u32) -> Result<RangeInclusive<u32>, Error> {
        Ok(self.sector_of(start)?..=self.sector_of(end)?)
    }
}

impl Default for Geometry {
    fn default() -> Geometry {
        Geometry::LPC15XX
    }
}

/// Serial line parameters agreed with the bootloader.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LinkConfig {
    pub baud_rate: u32,
    pub stop_bits: u8,
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            baud_rate: DEFAULT_BAUD_RATE,
            stop_bits: DEFAULT_STOP_BITS,
        }
    }
}

/// Options for a single workflow run.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Options {
    pub link: LinkConfig,
    pub sync_retries: u32,
    pub command_retries: u32,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            link: LinkConfig::default(),
            sync_retries: DEFAULT_SYNC_RETRIES,
            command_retries: DEFAULT_COMMAND_RETRIES,
        }
    }
}
