use std::io::Write;

use crate::Error;

/// The magic number that unlocks the flash write and erase commands
pub const UNLOCK_CODE: u32 = 23130;

/// The autobaud query that starts synchronization
pub const SYNC_QUERY: &[u8] = b"?";

/// The synchronization string exchanged with the bootloader
pub const SYNCHRONIZED: &[u8] = b"Synchronized\r\n";

/// The acknowledgement of a synchronization string
pub const SYNC_ACK: &[u8] = b"OK";

/// The escape byte sent after synchronizing
pub const ESCAPE: u8 = 0x27;

/// An interface for serializing commands to a writer in the line-oriented protocol of the ISP
/// bootloader.
pub trait Command {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error>;
}

/// Writes `letter` followed by space separated decimal `args` and CRLF
fn write_line<W: Write>(mut writer: W, letter: char, args: &[u32]) -> Result<(), Error> {
    write!(writer, "{}", letter)?;

    for arg in args {
        write!(writer, " {}", arg)?;
    }

    writer.write_all(b"\r\n")?;

    Ok(())
}

/// Unlocks the flash write, erase and go commands
pub struct Unlock;

impl Command for Unlock {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'U', &[UNLOCK_CODE])
    }
}

/// Changes the baud rate and number of stop bits of the bootloader
pub struct SetBaudRate {
    pub baud_rate: u32,
    pub stop_bits: u8,
}

impl Command for SetBaudRate {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'B', &[self.baud_rate, u32::from(self.stop_bits)])
    }
}

/// Turns command echo on or off
pub struct SetEcho(pub bool);

impl Command for SetEcho {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'A', &[u32::from(self.0)])
    }
}

/// Announces a raw write of `size` bytes to RAM at `address`
pub struct WriteToRam {
    pub address: u32,
    pub size: u32,
}

impl Command for WriteToRam {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'W', &[self.address, self.size])
    }
}

/// Reads `size` raw bytes from `address`
pub struct ReadMemory {
    pub address: u32,
    pub size: u32,
}

impl Command for ReadMemory {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'R', &[self.address, self.size])
    }
}

/// Prepares the sectors `start..=end` for a write or erase
pub struct PrepareSectors {
    pub start: u32,
    pub end: u32,
}

impl Command for PrepareSectors {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'P', &[self.start, self.end])
    }
}

/// Programs `size` bytes of flash at `flash_address` from RAM at `ram_address`
pub struct CopyRamToFlash {
    pub flash_address: u32,
    pub ram_address: u32,
    pub size: u32,
}

impl Command for CopyRamToFlash {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(
            writer,
            'C',
            &[self.flash_address, self.ram_address, self.size],
        )
    }
}

/// Jumps to `address` in Thumb mode
pub struct Go {
    pub address: u32,
}

impl Command for Go {
    fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), Error> {
        write!(writer, "G {} T\r\n", self.address)?;

        Ok(())
    }
}

/// Erases the sectors `start..=end`
pub struct EraseSectors {
    pub start: u32,
    pub end: u32,
}

impl Command for EraseSectors {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'E', &[self.start, self.end])
    }
}

/// Checks whether the sectors `start..=end` are blank
pub struct BlankCheckSectors {
    pub start: u32,
    pub end: u32,
}

impl Command for BlankCheckSectors {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'I', &[self.start, self.end])
    }
}

/// Reads the part identification number
pub struct ReadPartId;

impl Command for ReadPartId {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'J', &[])
    }
}

/// Reads the boot code version
pub struct ReadBootCodeVersion;

impl Command for ReadBootCodeVersion {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'K', &[])
    }
}

/// Reads the 128-bit device serial number
pub struct ReadUid;

impl Command for ReadUid {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'N', &[])
    }
}

/// Reads the CRC checksum of `size` bytes at `address`
pub struct ReadCrc {
    pub address: u32,
    pub size: u32,
}

impl Command for ReadCrc {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        write_line(writer, 'S', &[self.address, self.size])
    }
}

/// Serializes `command` into a new buffer
pub fn encode<C: Command>(command: &C) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(32);

    command.to_writer(&mut buf)?;

    Ok(buf)
}
