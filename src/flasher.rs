//! Erase, program, examine and info workflows
//!
//! Every workflow owns its link for its whole duration and follows the same outline: reset the
//! target into ISP mode and synchronize, set the baud rate and query the part, run the
//! workflow-specific steps, and then always reset the target back into its application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, trace, warn};

use crate::config::{Geometry, Options};
use crate::hexdump::trace_dump;
use crate::image::{ImageError, MemoryImage};
use crate::isp::{
    BootCodeVersion, Bootloader, LONG_TIMEOUT, MEDIUM_TIMEOUT, MINIMAL_TIMEOUT, SHORT_TIMEOUT,
};
use crate::reset::ModeControl;
use crate::transport::{Port, Transport};
use crate::Error;

/// A shared flag that asks a running workflow to stop at its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Blank state of every flash sector, as reported by blank-check.
///
/// Sectors start out as not blank, so a sector that was never checked is erased before use.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SectorMap {
    blank: Vec<bool>,
}

impl SectorMap {
    pub fn new(sector_count: u32) -> SectorMap {
        SectorMap {
            blank: vec![false; sector_count as usize],
        }
    }

    /// Records the blank state of `sector`
    pub fn set(&mut self, sector: u32, blank: bool) -> Result<(), Error> {
        let count = self.blank.len() as u32;
        let slot = self
            .blank
            .get_mut(sector as usize)
            .ok_or(Error::InvalidSector { sector, count })?;

        *slot = blank;

        Ok(())
    }

    pub fn is_blank(&self, sector: u32) -> bool {
        self.blank.get(sector as usize).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.blank.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blank.is_empty()
    }
}

/// What the bootloader reports about the connected chip
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TargetInfo {
    pub chip_id: String,
    pub part_id: u32,
    pub uid: [u32; 4],
    pub boot_code_version: BootCodeVersion,
}

/// Drives one workflow against one target.
pub struct Flasher<P, M> {
    isp: Bootloader<P>,
    mode: M,
    geometry: Geometry,
    options: Options,
    cancel: CancelToken,
    chip_id: String,
    part_id: u32,
}

impl<P: Port, M: ModeControl> Flasher<P, M> {
    pub fn new(
        transport: Transport<P>,
        mode: M,
        geometry: Geometry,
        options: Options,
        cancel: CancelToken,
    ) -> Flasher<P, M> {
        Flasher {
            isp: Bootloader::new(transport).with_retries(options.command_retries),
            mode,
            geometry,
            options,
            cancel,
            chip_id: String::new(),
            part_id: 0,
        }
    }

    fn checkpoint(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resets the target into ISP mode until it synchronizes, then sets the baud rate and reads
    /// the part id.
    fn connect(&mut self) -> Result<(), Error> {
        let retries = self.options.sync_retries;
        let mut synchronized = false;

        for attempt in 1..=retries {
            self.checkpoint()?;
            self.mode.enter_isp_mode()?;

            match self.isp.synchronize() {
                Ok(chip_id) => {
                    debug!("Synchronized on attempt {}/{}", attempt, retries);

                    self.chip_id = chip_id;
                    synchronized = true;
                    break;
                }
                Err(err) => warn!("Synchronization attempt {}/{} failed: {}", attempt, retries, err),
            }
        }

        if !synchronized {
            return Err(Error::SynchronizationFailure(retries));
        }

        let link = self.options.link;

        self.isp
            .set_baud_rate(link.baud_rate, link.stop_bits, SHORT_TIMEOUT)?;
        self.part_id = self.isp.read_part_id(MINIMAL_TIMEOUT)?;

        info!(
            "Connected to part {:#010x} (chip id {})",
            self.part_id, self.chip_id
        );

        Ok(())
    }

    /// Runs `body` between connecting and returning the target to its application.
    ///
    /// The target is reset into application mode and the link is closed whatever the outcome;
    /// a failure to do so is logged and never replaces the result of `body`.
    fn run<T, F>(mut self, name: &str, body: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Self) -> Result<T, Error>,
    {
        info!("Starting {}", name);

        let result = match self.connect() {
            Ok(()) => body(&mut self),
            Err(err) => Err(err),
        };

        match &result {
            Ok(_) => info!("Finished {}", name),
            Err(err) => error!("Aborted {}: {}", name, err),
        }

        if let Err(err) = self.mode.enter_application_mode() {
            warn!("Could not return the target to application mode: {}", err);
        }

        self.isp.close();

        result
    }

    /// Blank-checks sectors `first..=last` in ascending order
    fn blank_check(&mut self, first: u32, last: u32) -> Result<SectorMap, Error> {
        let mut map = SectorMap::new(self.geometry.sector_count);

        for sector in first..=last {
            self.checkpoint()?;

            let blank = self.isp.blank_check_sector(sector, SHORT_TIMEOUT)?;
            map.set(sector, blank)?;

            trace!(
                "Sector {} is {}",
                sector,
                if blank { "blank" } else { "not blank" }
            );
        }

        Ok(map)
    }

    /// Prepares and erases `sector` unless it is already blank
    fn erase_sector(&mut self, sector: u32, map: &SectorMap) -> Result<(), Error> {
        if map.is_blank(sector) {
            return Ok(());
        }

        self.isp.prepare_sectors(sector, sector, MEDIUM_TIMEOUT)?;
        self.isp.erase_sectors(sector, sector, LONG_TIMEOUT)
    }

    /// Returns the sectors covered by the loaded range of `image`
    fn image_sectors(&self, image: &MemoryImage) -> Result<(u32, u32), Error> {
        if image.is_empty() {
            return Err(Error::ImageLoadError(ImageError::Empty));
        }

        let sectors = self
            .geometry
            .sectors_spanned(image.start_address(), image.end_address())?;

        Ok((*sectors.start(), *sectors.end()))
    }

    /// Erases every sector that is not blank, starting from the last sector.
    pub fn erase(self) -> Result<(), Error> {
        self.run("erase", |flasher| {
            let last = flasher.geometry.sector_count.saturating_sub(1);

            flasher.isp.unlock(MEDIUM_TIMEOUT)?;

            let map = flasher.blank_check(0, last)?;

            for sector in (0..=last).rev() {
                flasher.checkpoint()?;
                flasher.isp.unlock(SHORT_TIMEOUT)?;
                flasher.erase_sector(sector, &map)?;
            }

            info!("Erased {} sectors", map.blank.iter().filter(|&&b| !b).count());

            Ok(())
        })
    }

    /// Programs the sectors spanned by `image`, starting from the last one.
    ///
    /// Each sector is written one RAM window at a time, again from the last window down. The
    /// parts of a sector that lie outside the image are programmed as erased bytes.
    pub fn program(self, image: &MemoryImage) -> Result<(), Error> {
        self.run("program", |flasher| {
            let (first, last) = flasher.image_sectors(image)?;
            let map = flasher.blank_check(first, last)?;

            for sector in (first..=last).rev() {
                flasher.checkpoint()?;
                flasher.isp.unlock(SHORT_TIMEOUT)?;
                flasher.erase_sector(sector, &map)?;
                flasher.program_sector(sector, image)?;

                info!("Programmed sector {}", sector);
            }

            Ok(())
        })
    }

    fn program_sector(&mut self, sector: u32, image: &MemoryImage) -> Result<(), Error> {
        let Geometry {
            sector_size,
            ram_window_size,
            ram_staging_address,
            ..
        } = self.geometry;
        let half = self.geometry.half_window();
        let base = self.geometry.sector_address(sector);

        for offset in (0..sector_size).step_by(ram_window_size as usize).rev() {
            let flash_address = base + offset;

            self.isp.set_echo(false, MEDIUM_TIMEOUT)?;

            for &part in &[0, half] {
                let data = image
                    .slice(flash_address + part, half as usize)
                    .ok_or(Error::InvalidSector {
                        sector,
                        count: self.geometry.sector_count,
                    })?;

                self.isp
                    .write_memory(ram_staging_address + part, data, LONG_TIMEOUT)?;
            }

            self.isp.set_echo(true, MEDIUM_TIMEOUT)?;
            self.isp.unlock(MEDIUM_TIMEOUT)?;
            // The bootloader consumes the prepare with every erase and copy
            self.isp.prepare_sectors(sector, sector, MEDIUM_TIMEOUT)?;
            self.isp.copy_ram_to_flash(
                flash_address,
                ram_staging_address,
                ram_window_size,
                LONG_TIMEOUT,
            )?;

            trace!("Copied {:#010x}..{:#010x}", flash_address, flash_address + ram_window_size);
        }

        Ok(())
    }

    /// Reads back the sectors spanned by `image` and compares them with its loaded range.
    ///
    /// The first differing byte fails with [`Error::CompareError`].
    pub fn examine(self, image: &MemoryImage) -> Result<(), Error> {
        self.run("examine", |flasher| {
            let (first, last) = flasher.image_sectors(image)?;
            let base = flasher.geometry.sector_address(first);
            let flash = flasher.read_sectors(first, last)?;
            let start = image.start_address();

            for (index, (&expected, &actual)) in image
                .contents()
                .iter()
                .zip(&flash[(start - base) as usize..])
                .enumerate()
            {
                if expected != actual {
                    let address = start + index as u32;

                    debug!(
                        "Mismatch at {:#010x}: expected {:#04x}, read {:#04x}",
                        address, expected, actual
                    );

                    return Err(Error::CompareError { address });
                }
            }

            info!(
                "Verified {:#010x}..={:#010x}",
                image.start_address(),
                image.end_address()
            );

            Ok(())
        })
    }

    fn read_sectors(&mut self, first: u32, last: u32) -> Result<Vec<u8>, Error> {
        let sector_size = self.geometry.sector_size;
        let window = self.geometry.ram_window_size;
        let half = self.geometry.half_window();
        let mut flash = Vec::with_capacity(((last - first + 1) * sector_size) as usize);

        for sector in first..=last {
            self.checkpoint()?;

            let base = self.geometry.sector_address(sector);

            for offset in (0..sector_size).step_by(window as usize) {
                for &part in &[0, half] {
                    let address = base + offset + part;
                    let bytes = self.isp.read_memory(address, half, LONG_TIMEOUT)?;

                    trace_dump("flash", &bytes, address);
                    flash.extend_from_slice(&bytes);
                }
            }

            debug!("Read sector {}", sector);
        }

        Ok(flash)
    }

    /// Reads the identification of the connected chip.
    pub fn info(self) -> Result<TargetInfo, Error> {
        self.run("info", |flasher| {
            let uid = flasher.isp.read_uid(MINIMAL_TIMEOUT)?;
            let boot_code_version = flasher.isp.read_boot_code_version(MINIMAL_TIMEOUT)?;

            Ok(TargetInfo {
                chip_id: flasher.chip_id.clone(),
                part_id: flasher.part_id,
                uid,
                boot_code_version,
            })
        })
    }
}
