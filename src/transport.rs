//! Byte transport over a serial link with silence-terminated reads

use std::fmt;
use std::io::{self, Read, Write};
use std::time::Duration;

use log::debug;
use serialport::prelude::*;
use serialport::ClearBuffer;

use crate::config::LinkConfig;
use crate::Error;

/// The interval at which the link is polled for new bytes
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// The number of bytes requested from the port per poll
const RX_CHUNK_SIZE: usize = 2048;

/// A raw, opened byte link to the target.
///
/// A `read` that finds no data within one poll interval must fail with
/// [`io::ErrorKind::TimedOut`] or [`io::ErrorKind::WouldBlock`].
pub trait Port: Read + Write {
    /// Changes the host side baud rate of the link
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()>;
}

impl Port for Box<dyn SerialPort> {
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        SerialPort::set_baud_rate(&mut **self, baud_rate)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}

/// Exclusive owner of an open link.
///
/// The link is released by [`Transport::close`] or when the transport is dropped.
pub struct Transport<P> {
    port: Option<P>,
}

impl<P> fmt::Debug for Transport<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl Transport<Box<dyn SerialPort>> {
    /// Opens the serial `device` with 8 data bits, no parity, no flow control and the line
    /// parameters in `config`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use lpcisp::{LinkConfig, Transport};
    ///
    /// let transport = Transport::open("/dev/ttyUSB0", &LinkConfig::default())?;
    ///
    /// # Ok::<(), lpcisp::Error>(())
    /// ```
    pub fn open(device: &str, config: &LinkConfig) -> Result<Self, Error> {
        let settings = SerialPortSettings {
            baud_rate: config.baud_rate,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: match config.stop_bits {
                2 => StopBits::Two,
                _ => StopBits::One,
            },
            timeout: POLL_INTERVAL,
        };

        debug!("Opening serial port {} with {:?}", device, config);

        let port = serialport::open_with_settings(device, &settings)
            .map_err(|err| Error::SerialOpenError(device.to_owned(), err))?;

        // Discard anything left over from a previous session
        port.clear(ClearBuffer::All)
            .map_err(|err| Error::SerialOpenError(device.to_owned(), err))?;

        Ok(Transport::new(port))
    }
}

impl<P: Port> Transport<P> {
    /// Wraps an already opened `port`
    pub fn new(port: P) -> Transport<P> {
        Transport { port: Some(port) }
    }

    /// Returns true until the link has been closed
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Releases the link. Subsequent reads and writes fail with [`Error::NotOpen`].
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Serial link closed");
        }
    }

    fn port_mut(&mut self) -> Result<&mut P, Error> {
        self.port.as_mut().ok_or(Error::NotOpen)
    }

    /// Writes all of `bytes` to the link and returns the number of bytes written
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, Error> {
        if bytes.is_empty() {
            return Ok(0);
        }

        let port = self.port_mut()?;

        port.write_all(bytes)?;
        port.flush()?;

        Ok(bytes.len())
    }

    /// Reads until the link has been silent for `timeout`.
    ///
    /// The countdown restarts whenever bytes arrive, so `timeout` bounds the idle gap
    /// rather than the total duration of the read. An empty result means nothing arrived.
    pub fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        let port = self.port_mut()?;
        let budget = poll_ticks(timeout);
        let mut remaining = budget;
        let mut chunk = [0u8; RX_CHUNK_SIZE];
        let mut received = Vec::new();

        while remaining > 0 {
            match port.read(&mut chunk) {
                Ok(0) => remaining -= 1,
                Ok(n) => {
                    received.extend_from_slice(&chunk[..n]);
                    remaining = budget;
                }
                Err(ref err)
                    if err.kind() == io::ErrorKind::TimedOut
                        || err.kind() == io::ErrorKind::WouldBlock =>
                {
                    remaining -= 1
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::TransportError(err)),
            }
        }

        Ok(received)
    }

    /// Changes the host side baud rate
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), Error> {
        self.port_mut()?.set_baud_rate(baud_rate)?;

        Ok(())
    }
}

/// Converts an idle timeout to a number of poll intervals
fn poll_ticks(timeout: Duration) -> u128 {
    timeout.as_micros() / POLL_INTERVAL.as_micros()
}
