//! A simulated LPC15xx ISP bootloader behind the `Port` and `ModeControl` seams.
//!
//! The target answers immediately and an idle read times out on the first poll, so workflow
//! tests run without wall-clock delays.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::Geometry;
use crate::flasher::CancelToken;
use crate::isp::command::{ESCAPE, UNLOCK_CODE};
use crate::isp::ReturnCode;
use crate::reset::ModeControl;
use crate::transport::Port;
use crate::Error;

pub const PART_ID: u32 = 0x0000_1549;
pub const BOOT_CODE_VERSION: (u32, u32) = (7, 13);
pub const UID: [u32; 4] = [0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    /// Running the user application, deaf to the link
    Application,
    /// Freshly reset into the bootloader, waiting for `?`
    Autobaud,
    /// Waiting for the host to confirm with `Synchronized`
    Confirm,
    /// Accepting commands
    Command,
}

/// Bytes of a `W` command still to be received
#[derive(Debug)]
struct PendingWrite {
    address: u32,
    remaining: usize,
}

pub struct Target {
    pub geometry: Geometry,
    pub flash: Vec<u8>,
    pub ram: Vec<u8>,
    pub echo: bool,
    pub baud_rate: Option<u32>,
    /// The first ISP entry on which `?` is answered
    pub sync_from_attempt: u32,
    pub isp_entries: u32,
    pub app_entries: u32,
    /// Return codes forced for a command letter
    pub fail: HashMap<char, ReturnCode>,
    /// Command letters that get no response at all
    pub mute: HashSet<char>,
    /// Sets the token when a command line starting with the prefix is received
    pub cancel_on: Option<(String, CancelToken)>,
    /// Every command line received, without CRLF
    pub commands: Vec<String>,
    /// How many host ends of the link have been dropped
    pub closed_ports: u32,
    state: State,
    unlocked: bool,
    prepared: Option<(u32, u32)>,
    pending: Option<PendingWrite>,
    line: Vec<u8>,
    rx: VecDeque<u8>,
}

impl Target {
    pub fn new(geometry: Geometry) -> Target {
        Target {
            geometry,
            flash: vec![0xff; geometry.flash_size()],
            ram: vec![0; geometry.ram_window_size as usize],
            echo: true,
            baud_rate: None,
            sync_from_attempt: 1,
            isp_entries: 0,
            app_entries: 0,
            fail: HashMap::new(),
            mute: HashSet::new(),
            cancel_on: None,
            commands: Vec::new(),
            closed_ports: 0,
            state: State::Application,
            unlocked: false,
            prepared: None,
            pending: None,
            line: Vec::new(),
            rx: VecDeque::new(),
        }
    }

    /// Returns the received command lines that start with `prefix`
    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.commands
            .iter()
            .filter(|line| line.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn reset(&mut self, state: State) {
        self.state = state;
        self.echo = true;
        self.unlocked = false;
        self.prepared = None;
        self.pending = None;
        self.line.clear();
        self.rx.clear();
    }

    fn reply(&mut self, text: &str) {
        self.rx.extend(text.as_bytes());
    }

    fn code(&mut self, code: ReturnCode) {
        self.reply(&format!("{}\r\n", code.code()));
    }

    fn receive(&mut self, byte: u8) {
        match self.state {
            State::Application => {}
            State::Autobaud => {
                if byte == b'?' && self.isp_entries >= self.sync_from_attempt {
                    self.reply("Synchronized\r\n");
                    self.state = State::Confirm;
                }
            }
            State::Confirm => {
                if let Some(line) = self.take_line(byte) {
                    if line == "Synchronized" {
                        self.reply("Synchronized\r\nOK\r\n");
                        self.state = State::Command;
                    }
                }
            }
            State::Command => {
                if let Some(pending) = self.pending.as_mut() {
                    let offset = (pending.address - self.geometry.ram_staging_address) as usize;

                    self.ram[offset] = byte;
                    pending.address += 1;
                    pending.remaining -= 1;

                    if pending.remaining == 0 {
                        self.pending = None;
                    }
                } else if byte == ESCAPE && self.line.is_empty() {
                    self.rx.push_back(ESCAPE);
                } else if let Some(line) = self.take_line(byte) {
                    self.command(&line);
                }
            }
        }
    }

    /// Accumulates `byte` and returns the line once CRLF has been received
    fn take_line(&mut self, byte: u8) -> Option<String> {
        self.line.push(byte);

        if self.line.ends_with(b"\r\n") {
            let line = String::from_utf8_lossy(&self.line[..self.line.len() - 2]).into_owned();
            self.line.clear();

            Some(line)
        } else {
            None
        }
    }

    fn command(&mut self, line: &str) {
        self.commands.push(line.to_owned());

        if let Some((prefix, token)) = &self.cancel_on {
            if line.starts_with(prefix.as_str()) {
                token.cancel();
            }
        }

        let mut words = line.split_whitespace();
        let letter = words.next().and_then(|w| w.chars().next()).unwrap_or(' ');
        let args: Vec<u32> = words.filter_map(|w| w.parse().ok()).collect();

        if self.mute.contains(&letter) {
            return;
        }

        if self.echo {
            self.reply(&format!("{}\r\n", line));
        }

        if let Some(&code) = self.fail.get(&letter) {
            return self.code(code);
        }

        let arg = |i: usize| args.get(i).copied().unwrap_or(0);
        let code = match letter {
            'U' if arg(0) == UNLOCK_CODE => {
                self.unlocked = true;
                ReturnCode::Success
            }
            'U' => ReturnCode::InvalidCode,
            'B' => {
                self.baud_rate = Some(arg(0));
                ReturnCode::Success
            }
            'A' => {
                self.code(ReturnCode::Success);
                self.echo = arg(0) == 1;
                return;
            }
            'J' => return self.reply(&format!("0\r\n{}\r\n", PART_ID)),
            'K' => {
                let (major, minor) = BOOT_CODE_VERSION;
                return self.reply(&format!("0\r\n{}\r\n{}\r\n", minor, major));
            }
            'N' => {
                return self.reply(&format!(
                    "0\r\n{}\r\n{}\r\n{}\r\n{}\r\n",
                    UID[0], UID[1], UID[2], UID[3]
                ))
            }
            'P' => match self.sectors(arg(0), arg(1)) {
                Ok(()) => {
                    self.prepared = Some((arg(0), arg(1)));
                    ReturnCode::Success
                }
                Err(code) => code,
            },
            'E' => match self.check_write(arg(0), arg(1)) {
                Ok(()) => {
                    let start = self.geometry.sector_address(arg(0)) as usize;
                    let end = self.geometry.sector_address(arg(1) + 1) as usize;

                    self.flash[start..end].iter_mut().for_each(|b| *b = 0xff);
                    self.prepared = None;
                    ReturnCode::Success
                }
                Err(code) => code,
            },
            'I' => match self.sectors(arg(0), arg(1)) {
                Ok(()) => {
                    let start = self.geometry.sector_address(arg(0)) as usize;
                    let end = self.geometry.sector_address(arg(1) + 1) as usize;

                    match self.flash[start..end].iter().position(|&b| b != 0xff) {
                        Some(offset) => {
                            let value = self.flash[start + offset];
                            return self.reply(&format!(
                                "8\r\n{}\r\n{}\r\n",
                                start + offset,
                                value
                            ));
                        }
                        None => ReturnCode::Success,
                    }
                }
                Err(code) => code,
            },
            'W' => match self.ram_offset(arg(0), arg(1)) {
                Ok(_) => {
                    if arg(1) > 0 {
                        self.pending = Some(PendingWrite {
                            address: arg(0),
                            remaining: arg(1) as usize,
                        });
                    }
                    ReturnCode::Success
                }
                Err(code) => code,
            },
            'C' => self.copy(arg(0), arg(1), arg(2)),
            'R' => match self.read(arg(0), arg(1)) {
                Ok(bytes) => {
                    self.code(ReturnCode::Success);
                    self.rx.extend(bytes);
                    return;
                }
                Err(code) => code,
            },
            'S' => match self.read(arg(0), arg(1)) {
                Ok(bytes) => {
                    let crc = bytes
                        .iter()
                        .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)));
                    return self.reply(&format!("0\r\n{}\r\n", crc));
                }
                Err(code) => code,
            },
            'G' => ReturnCode::Success,
            _ => ReturnCode::InvalidCommand,
        };

        self.code(code);
    }

    fn sectors(&self, start: u32, end: u32) -> Result<(), ReturnCode> {
        if start > end || end >= self.geometry.sector_count {
            Err(ReturnCode::InvalidSector)
        } else {
            Ok(())
        }
    }

    /// Checks that `start..=end` may be erased or written right now
    fn check_write(&self, start: u32, end: u32) -> Result<(), ReturnCode> {
        self.sectors(start, end)?;

        if !self.unlocked {
            return Err(ReturnCode::CmdLocked);
        }

        match self.prepared {
            Some((lo, hi)) if lo <= start && end <= hi => Ok(()),
            _ => Err(ReturnCode::SectorNotPreparedForWriteOperation),
        }
    }

    fn ram_offset(&self, address: u32, size: u32) -> Result<usize, ReturnCode> {
        if address % 4 != 0 {
            return Err(ReturnCode::AddrError);
        }

        if size % 4 != 0 {
            return Err(ReturnCode::CountError);
        }

        let base = self.geometry.ram_staging_address;

        if address < base || address - base + size > self.geometry.ram_window_size {
            return Err(ReturnCode::AddrNotMapped);
        }

        Ok((address - base) as usize)
    }

    fn copy(&mut self, flash: u32, ram: u32, size: u32) -> ReturnCode {
        if ![256, 512, 1024, 4096].contains(&size) {
            return ReturnCode::CountError;
        }

        if flash % 256 != 0 || flash as usize + size as usize > self.flash.len() {
            return ReturnCode::DstAddrError;
        }

        let offset = match self.ram_offset(ram, size) {
            Ok(offset) => offset,
            Err(_) => return ReturnCode::SrcAddrNotMapped,
        };

        let sector = flash / self.geometry.sector_size;
        let last = (flash + size - 1) / self.geometry.sector_size;

        if let Err(code) = self.check_write(sector, last) {
            return code;
        }

        // Programming can only clear bits
        for (dst, src) in self.flash[flash as usize..(flash + size) as usize]
            .iter_mut()
            .zip(&self.ram[offset..offset + size as usize])
        {
            *dst &= *src;
        }

        self.prepared = None;

        ReturnCode::Success
    }

    fn read(&self, address: u32, size: u32) -> Result<Vec<u8>, ReturnCode> {
        let end = address as usize + size as usize;

        if end <= self.flash.len() {
            return Ok(self.flash[address as usize..end].to_vec());
        }

        let offset = self.ram_offset(address, size)?;

        Ok(self.ram[offset..offset + size as usize].to_vec())
    }
}

/// A shared handle to a simulated target
#[derive(Clone)]
pub struct Sim(Arc<Mutex<Target>>);

impl Sim {
    pub fn new(target: Target) -> Sim {
        Sim(Arc::new(Mutex::new(target)))
    }

    pub fn target(&self) -> MutexGuard<'_, Target> {
        self.0.lock().unwrap()
    }

    pub fn port(&self) -> SimPort {
        SimPort(self.clone())
    }

    pub fn reset(&self) -> SimReset {
        SimReset(self.clone())
    }
}

/// The host end of the simulated serial link
pub struct SimPort(Sim);

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut target = self.0.target();

        if target.rx.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }

        let n = buf.len().min(target.rx.len());

        for (dst, src) in buf.iter_mut().zip(target.rx.drain(..n)) {
            *dst = src;
        }

        Ok(n)
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut target = self.0.target();

        for &byte in buf {
            target.receive(byte);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SimPort {
    fn drop(&mut self) {
        // Never panic while unwinding from a failed assertion
        if let Ok(mut target) = (self.0).0.lock() {
            target.closed_ports += 1;
        }
    }
}

impl Port for SimPort {
    fn set_baud_rate(&mut self, _baud_rate: u32) -> io::Result<()> {
        Ok(())
    }
}

/// Mode control wired straight to the simulated target
pub struct SimReset(Sim);

impl ModeControl for SimReset {
    fn enter_isp_mode(&mut self) -> Result<(), Error> {
        let mut target = self.0.target();

        target.isp_entries += 1;
        target.reset(State::Autobaud);

        Ok(())
    }

    fn enter_application_mode(&mut self) -> Result<(), Error> {
        let mut target = self.0.target();

        target.app_entries += 1;
        target.reset(State::Application);

        Ok(())
    }
}
