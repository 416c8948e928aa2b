//! Flashing of LPC15xx microcontrollers through the serial ISP bootloader in ROM.
//!
//! [`Transport`] moves bytes over the serial link, [`Bootloader`] speaks the line based command
//! protocol on top of it, and [`Flasher`] sequences the erase, program and examine workflows.

pub mod config;
mod error;
pub mod flasher;
pub mod hexdump;
pub mod image;
pub mod isp;
pub mod reset;
#[cfg(test)]
mod sim;
pub mod transport;

pub use config::{Geometry, LinkConfig, Options};
pub use error::Error;
pub use flasher::{CancelToken, Flasher, SectorMap, TargetInfo};
pub use image::{ImageError, MemoryImage};
pub use isp::{BootCodeVersion, Bootloader, ReturnCode};
pub use reset::{GpioReset, ManualReset, ModeControl, StatusLed};
pub use serialport;
pub use transport::{Port, Transport};
