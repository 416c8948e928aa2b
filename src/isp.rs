//! Command/response engine for the LPC ISP bootloader.
//!
//! Every command is a single CRLF terminated ASCII line. While echo is enabled the bootloader
//! repeats the command before answering, and a response is only interpreted after that echo
//! has been located. The answer is a decimal return code line, optionally followed by decimal
//! value lines, or by raw bytes for a memory read.

mod code;
pub mod command;

use std::convert::TryFrom;
use std::time::Duration;

use log::{debug, info, trace};

pub use code::ReturnCode;
use command::{Command, ESCAPE, SYNCHRONIZED, SYNC_ACK, SYNC_QUERY};

use crate::config::DEFAULT_COMMAND_RETRIES;
use crate::hexdump::trace_dump;
use crate::transport::{Port, Transport};
use crate::Error;

pub const MINIMAL_TIMEOUT: Duration = Duration::from_millis(10);
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(20);
pub const MEDIUM_TIMEOUT: Duration = Duration::from_millis(40);
pub const LONG_TIMEOUT: Duration = Duration::from_millis(80);

const CRLF: &[u8] = b"\r\n";

/// The boot code version reported by the bootloader
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BootCodeVersion {
    pub major: u32,
    pub minor: u32,
}

/// A decoded textual response
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Reply {
    /// The return code line
    pub code: ReturnCode,
    /// The value lines that followed the return code
    pub values: Vec<String>,
}

impl Reply {
    /// Returns the values if the return code is `CMD_SUCCESS`
    pub fn into_values(self) -> Result<Vec<String>, Error> {
        if self.code.is_success() {
            Ok(self.values)
        } else {
            Err(Error::ProtocolError(self.code))
        }
    }

    /// Parses value line `index` as a decimal number
    fn value(&self, index: usize) -> Result<u32, Error> {
        let line = self.values.get(index).ok_or_else(|| {
            Error::MalformedResponse(format!("missing value line {}", index))
        })?;

        parse_decimal(line)
    }
}

/// Returns the position of the first occurrence of `needle` in `haystack`
///
/// An empty needle is found at position 0.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }

    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_decimal(line: &str) -> Result<u32, Error> {
    line.trim()
        .parse()
        .map_err(|_| Error::MalformedResponse(format!("expected a decimal number, got {:?}", line)))
}

fn parse_code(line: &[u8]) -> Result<ReturnCode, Error> {
    let value = parse_decimal(&String::from_utf8_lossy(line))?;

    ReturnCode::try_from(value)
        .map_err(|_| Error::MalformedResponse(format!("unknown return code {}", value)))
}

/// Decodes the lines that follow `echo` in `response`.
///
/// Only complete (CRLF terminated) lines are considered; the first is the return code.
pub fn parse_reply(response: &[u8], echo: &[u8]) -> Result<Reply, Error> {
    let pos = find(response, echo)
        .ok_or_else(|| Error::MalformedResponse("command echo not found".to_owned()))?;
    let mut rest = &response[pos + echo.len()..];
    let mut lines = Vec::new();

    while let Some(eol) = find(rest, CRLF) {
        lines.push(&rest[..eol]);
        rest = &rest[eol + CRLF.len()..];
    }

    let (code, values) = lines
        .split_first()
        .ok_or_else(|| Error::MalformedResponse("missing return code".to_owned()))?;

    Ok(Reply {
        code: parse_code(code)?,
        values: values
            .iter()
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect(),
    })
}

/// A connection to the ISP bootloader over an owned transport.
pub struct Bootloader<P> {
    transport: Transport<P>,
    echo: bool,
    retries: u32,
}

impl<P: Port> Bootloader<P> {
    /// Creates a new bootloader connection, assuming echo is enabled as it is after reset
    pub fn new(transport: Transport<P>) -> Bootloader<P> {
        Bootloader {
            transport,
            echo: true,
            retries: DEFAULT_COMMAND_RETRIES,
        }
    }

    /// Sets the number of times a command is sent before giving up
    pub fn with_retries(mut self, retries: u32) -> Bootloader<P> {
        self.retries = retries.max(1);
        self
    }

    /// Returns whether the bootloader is expected to echo commands
    pub fn is_echo(&self) -> bool {
        self.echo
    }

    /// Releases the underlying link
    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Returns the echo the bootloader will produce for `line` in the current mode
    fn expected_echo(&self, line: &[u8]) -> Vec<u8> {
        if self.echo {
            line.to_vec()
        } else {
            Vec::new()
        }
    }

    /// Sends `bytes` and reads the response until it contains `needle`.
    ///
    /// The full command is re-sent up to the retry budget; when no response contains `needle`
    /// this fails with [`Error::TimeoutError`].
    pub fn send_expect(
        &mut self,
        bytes: &[u8],
        needle: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        for attempt in 1..=self.retries {
            trace_dump(">", bytes, 0);
            self.transport.write(bytes)?;

            let response = self.transport.read(timeout)?;

            if !response.is_empty() {
                trace_dump("<", &response, 0);

                if find(&response, needle).is_some() {
                    return Ok(response);
                }
            }

            debug!(
                "No matching response to {:?} (attempt {}/{})",
                String::from_utf8_lossy(bytes).trim_end(),
                attempt,
                self.retries
            );
        }

        Err(Error::TimeoutError)
    }

    /// Sends a textual `command` and decodes its reply
    pub fn transact<C: Command>(&mut self, command: &C, timeout: Duration) -> Result<Reply, Error> {
        let line = command::encode(command)?;
        let echo = self.expected_echo(&line);
        let response = self.send_expect(&line, &echo, timeout)?;
        let reply = parse_reply(&response, &echo)?;

        if !reply.code.is_success() {
            debug!(
                "{:?} returned {:?}",
                String::from_utf8_lossy(&line).trim_end(),
                reply.code
            );
        }

        Ok(reply)
    }

    /// Sends a textual `command` and fails unless it returns `CMD_SUCCESS`
    fn execute<C: Command>(&mut self, command: &C, timeout: Duration) -> Result<Vec<String>, Error> {
        self.transact(command, timeout)?.into_values()
    }

    /// Synchronizes with a freshly reset bootloader and returns the trimmed chip identifier.
    pub fn synchronize(&mut self) -> Result<String, Error> {
        // Every ISP entry resets the target, which turns echo back on
        self.echo = true;

        let stale = self.transport.read(MEDIUM_TIMEOUT)?;

        if !stale.is_empty() {
            trace!("Discarded {} stale bytes", stale.len());
        }

        self.send_expect(SYNC_QUERY, SYNCHRONIZED, MINIMAL_TIMEOUT)?;
        self.send_expect(SYNCHRONIZED, SYNC_ACK, SHORT_TIMEOUT)?;
        self.send_expect(&[ESCAPE], &[ESCAPE], MINIMAL_TIMEOUT)?;

        let line = command::encode(&command::ReadPartId)?;
        let mut expected = self.expected_echo(&line);
        expected.extend_from_slice(b"0\r\n");

        let response = self.send_expect(&line, &expected, SHORT_TIMEOUT)?;
        let pos = find(&response, &expected).unwrap_or(0) + expected.len();
        let chip_id = String::from_utf8_lossy(&response[pos..]).trim().to_owned();

        debug!("Synchronized, chip id {:?}", chip_id);

        Ok(chip_id)
    }

    /// Sets the baud rate and stop bits of the bootloader, then retunes the host side
    pub fn set_baud_rate(
        &mut self,
        baud_rate: u32,
        stop_bits: u8,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.execute(
            &command::SetBaudRate {
                baud_rate,
                stop_bits,
            },
            timeout,
        )?;
        self.transport.set_baud_rate(baud_rate)?;

        info!(
            "Baud rate set to {} with {} stop bit(s)",
            baud_rate, stop_bits
        );

        Ok(())
    }

    /// Reads the part identification number
    pub fn read_part_id(&mut self, timeout: Duration) -> Result<u32, Error> {
        let reply = self.transact(&command::ReadPartId, timeout)?;

        if !reply.code.is_success() {
            return Err(Error::ProtocolError(reply.code));
        }

        reply.value(0)
    }

    /// Reads the four words of the device serial number
    pub fn read_uid(&mut self, timeout: Duration) -> Result<[u32; 4], Error> {
        let values = self.execute(&command::ReadUid, timeout)?;

        if values.len() < 4 {
            return Err(Error::MalformedResponse(format!(
                "expected 4 UID words, got {}",
                values.len()
            )));
        }

        let mut uid = [0u32; 4];

        for (word, line) in uid.iter_mut().zip(&values) {
            *word = parse_decimal(line)?;
        }

        Ok(uid)
    }

    /// Reads the boot code version, sent as the minor number followed by the major number
    pub fn read_boot_code_version(&mut self, timeout: Duration) -> Result<BootCodeVersion, Error> {
        let reply = self.transact(&command::ReadBootCodeVersion, timeout)?;

        if !reply.code.is_success() {
            return Err(Error::ProtocolError(reply.code));
        }

        Ok(BootCodeVersion {
            minor: reply.value(0)?,
            major: reply.value(1)?,
        })
    }

    /// Reads the CRC checksum of `size` bytes at `address`
    pub fn read_crc(&mut self, address: u32, size: u32, timeout: Duration) -> Result<u32, Error> {
        let reply = self.transact(&command::ReadCrc { address, size }, timeout)?;

        if !reply.code.is_success() {
            return Err(Error::ProtocolError(reply.code));
        }

        reply.value(0)
    }

    /// Unlocks flash write and erase commands
    pub fn unlock(&mut self, timeout: Duration) -> Result<(), Error> {
        self.execute(&command::Unlock, timeout)?;

        Ok(())
    }

    /// Prepares the sectors `start..=end` for writing
    pub fn prepare_sectors(&mut self, start: u32, end: u32, timeout: Duration) -> Result<(), Error> {
        self.execute(&command::PrepareSectors { start, end }, timeout)?;

        trace!("Sectors {}..={} prepared for write operations", start, end);

        Ok(())
    }

    /// Erases the sectors `start..=end`
    pub fn erase_sectors(&mut self, start: u32, end: u32, timeout: Duration) -> Result<(), Error> {
        self.execute(&command::EraseSectors { start, end }, timeout)?;

        debug!("Sectors {}..={} erased", start, end);

        Ok(())
    }

    /// Checks whether `sector` is blank
    ///
    /// `SECTOR_NOT_BLANK` is reported as `Ok(false)`; any other failure is an error.
    pub fn blank_check_sector(&mut self, sector: u32, timeout: Duration) -> Result<bool, Error> {
        let reply = self.transact(
            &command::BlankCheckSectors {
                start: sector,
                end: sector,
            },
            timeout,
        )?;

        match reply.code {
            ReturnCode::Success => Ok(true),
            ReturnCode::SectorNotBlank => Ok(false),
            code => Err(Error::ProtocolError(code)),
        }
    }

    /// Reads `size` raw bytes of memory at `address`
    pub fn read_memory(
        &mut self,
        address: u32,
        size: u32,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let line = command::encode(&command::ReadMemory { address, size })?;
        let echo = self.expected_echo(&line);
        let response = self.send_expect(&line, &echo, timeout)?;
        let pos = find(&response, &echo).unwrap_or(0) + echo.len();
        let rest = &response[pos..];

        // The payload is binary and may itself contain CRLF, so only the code line is split
        let eol = find(rest, CRLF)
            .ok_or_else(|| Error::MalformedResponse("missing return code".to_owned()))?;
        let code = parse_code(&rest[..eol])?;

        if !code.is_success() {
            return Err(Error::ProtocolError(code));
        }

        let payload = &rest[eol + CRLF.len()..];
        let size = size as usize;

        if payload.len() < size {
            return Err(Error::ShortRead {
                expected: size,
                actual: payload.len(),
            });
        }

        Ok(payload[..size].to_vec())
    }

    /// Writes `data` to RAM at `address`.
    ///
    /// The raw bytes are only streamed once the announcing command has been accepted.
    pub fn write_memory(&mut self, address: u32, data: &[u8], timeout: Duration) -> Result<(), Error> {
        self.execute(
            &command::WriteToRam {
                address,
                size: data.len() as u32,
            },
            timeout,
        )?;

        trace_dump(">", data, 0);
        self.transport.write(data)?;

        trace!("Wrote {} bytes to {:#010x}", data.len(), address);

        Ok(())
    }

    /// Enables or disables command echo
    pub fn set_echo(&mut self, enable: bool, timeout: Duration) -> Result<(), Error> {
        self.execute(&command::SetEcho(enable), timeout)?;
        self.echo = enable;

        Ok(())
    }

    /// Programs `size` bytes of flash at `flash_address` from RAM at `ram_address`
    pub fn copy_ram_to_flash(
        &mut self,
        flash_address: u32,
        ram_address: u32,
        size: u32,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.execute(
            &command::CopyRamToFlash {
                flash_address,
                ram_address,
                size,
            },
            timeout,
        )?;

        Ok(())
    }

    /// Starts executing code at `address`
    pub fn go(&mut self, address: u32, timeout: Duration) -> Result<(), Error> {
        self.execute(&command::Go { address }, timeout)?;

        info!("Executing from {:#010x}", address);

        Ok(())
    }
}
