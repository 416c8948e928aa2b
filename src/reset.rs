//! Moving the target between ISP and application mode

use std::fs;
use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::Error;

/// Drives the target into the bootloader or into the user application.
pub trait ModeControl {
    /// Resets the target with the ISP select lines low, so it starts the serial bootloader
    fn enter_isp_mode(&mut self) -> Result<(), Error>;

    /// Resets the target with the ISP select lines high, so it boots from flash
    fn enter_application_mode(&mut self) -> Result<(), Error>;
}

impl<M: ModeControl + ?Sized> ModeControl for Box<M> {
    fn enter_isp_mode(&mut self) -> Result<(), Error> {
        (**self).enter_isp_mode()
    }

    fn enter_application_mode(&mut self) -> Result<(), Error> {
        (**self).enter_application_mode()
    }
}

/// The sysfs value files of the reset and ISP select lines
#[derive(Debug, Clone)]
pub struct GpioPins {
    pub reset: PathBuf,
    pub isp0: PathBuf,
    pub isp1: PathBuf,
}

impl Default for GpioPins {
    fn default() -> GpioPins {
        GpioPins {
            reset: PathBuf::from("/sys/class/gpio/gpio17/value"),
            isp0: PathBuf::from("/sys/class/gpio/gpio18/value"),
            isp1: PathBuf::from("/sys/class/gpio/gpio27/value"),
        }
    }
}

/// Delays of a reset pulse
#[derive(Debug, Clone, Copy)]
pub struct ResetTiming {
    /// Settle time after driving the ISP select lines
    pub select: Duration,
    /// How long reset is held asserted
    pub hold: Duration,
    /// Settle time after releasing reset
    pub release: Duration,
}

impl Default for ResetTiming {
    fn default() -> ResetTiming {
        ResetTiming {
            select: Duration::from_millis(100),
            hold: Duration::from_millis(500),
            release: Duration::from_millis(100),
        }
    }
}

/// Writes a level to the sysfs value file of an exported output
fn set_level(path: &Path, high: bool) -> Result<(), Error> {
    fs::write(path, if high { "1\n" } else { "0\n" })
        .map_err(|err| Error::SignalError(path.display().to_string(), err))
}

/// Mode control through Linux sysfs GPIO lines that are already exported as outputs.
#[derive(Debug, Clone)]
pub struct GpioReset {
    pins: GpioPins,
    active_low: bool,
    timing: ResetTiming,
}

impl GpioReset {
    /// Creates a controller on the default pins. `active_low` is the reset polarity.
    pub fn new(active_low: bool) -> GpioReset {
        GpioReset {
            pins: GpioPins::default(),
            active_low,
            timing: ResetTiming::default(),
        }
    }

    pub fn with_pins(mut self, pins: GpioPins) -> GpioReset {
        self.pins = pins;
        self
    }

    pub fn with_timing(mut self, timing: ResetTiming) -> GpioReset {
        self.timing = timing;
        self
    }

    /// Drives the ISP select lines to `select` and pulses reset
    fn pulse(&self, select: bool) -> Result<(), Error> {
        set_level(&self.pins.isp0, select)?;
        set_level(&self.pins.isp1, select)?;
        thread::sleep(self.timing.select);

        set_level(&self.pins.reset, !self.active_low)?;
        thread::sleep(self.timing.hold);

        set_level(&self.pins.reset, self.active_low)?;
        thread::sleep(self.timing.release);

        set_level(&self.pins.isp0, select)?;
        set_level(&self.pins.isp1, select)
    }
}

impl ModeControl for GpioReset {
    fn enter_isp_mode(&mut self) -> Result<(), Error> {
        debug!("Resetting into ISP mode");

        self.pulse(false)
    }

    fn enter_application_mode(&mut self) -> Result<(), Error> {
        debug!("Resetting into application mode");

        self.pulse(true)
    }
}

/// A status LED on a sysfs GPIO line, lit while a workflow runs.
///
/// The LED is wired active low: the line is driven low while busy and high once done.
#[derive(Debug, Clone)]
pub struct StatusLed {
    pin: PathBuf,
}

impl Default for StatusLed {
    fn default() -> StatusLed {
        StatusLed {
            pin: PathBuf::from("/sys/class/gpio/gpio25/value"),
        }
    }
}

impl StatusLed {
    pub fn new() -> StatusLed {
        StatusLed::default()
    }

    pub fn with_pin(mut self, pin: PathBuf) -> StatusLed {
        self.pin = pin;
        self
    }

    /// Lights the LED until the returned guard is dropped
    pub fn busy(&self) -> Result<BusyLed<'_>, Error> {
        set_level(&self.pin, false)?;

        Ok(BusyLed { led: self })
    }
}

/// Turns the status LED off again when dropped
#[must_use = "the LED goes off as soon as the guard is dropped"]
pub struct BusyLed<'a> {
    led: &'a StatusLed,
}

impl Drop for BusyLed<'_> {
    fn drop(&mut self) {
        if let Err(err) = set_level(&self.led.pin, true) {
            warn!("Could not turn off the status LED: {}", err);
        }
    }
}

/// Mode control by asking an operator to set the boot pins and press reset.
pub struct ManualReset<R, W> {
    input: R,
    output: W,
}

impl ManualReset<BufReader<Stdin>, Stdout> {
    /// Prompts on stdout and waits for Enter on stdin
    pub fn stdio() -> Self {
        ManualReset::new(BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead, W: Write> ManualReset<R, W> {
    pub fn new(input: R, output: W) -> ManualReset<R, W> {
        ManualReset { input, output }
    }

    fn prompt(&mut self, mode: &str) -> Result<(), Error> {
        let operator = |err: io::Error| Error::SignalError("operator".to_owned(), err);

        writeln!(
            self.output,
            "Put the board in {} mode and press RESET, then press Enter:",
            mode
        )
        .map_err(operator)?;
        self.output.flush().map_err(operator)?;

        let mut line = String::new();

        if self.input.read_line(&mut line).map_err(operator)? == 0 {
            return Err(operator(io::ErrorKind::UnexpectedEof.into()));
        }

        Ok(())
    }
}

impl<R: BufRead, W: Write> ModeControl for ManualReset<R, W> {
    fn enter_isp_mode(&mut self) -> Result<(), Error> {
        self.prompt("ISP UART0")
    }

    fn enter_application_mode(&mut self) -> Result<(), Error> {
        self.prompt("application")
    }
}
