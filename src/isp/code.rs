use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Indicates a return code received from the ISP bootloader
#[repr(u32)]
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum ReturnCode {
    #[error("CMD_SUCCESS")]
    Success = 0,
    #[error("Invalid command")]
    InvalidCommand = 1,
    #[error("Source address is not on a word boundary")]
    SrcAddrError = 2,
    #[error("Destination address is not on a correct boundary")]
    DstAddrError = 3,
    #[error("Source address is not mapped in the memory map")]
    SrcAddrNotMapped = 4,
    #[error("Destination address is not mapped in the memory map")]
    DstAddrNotMapped = 5,
    #[error("Byte count is not a multiple of 4 or is not a permitted value")]
    CountError = 6,
    #[error("Sector number is invalid or the end sector is less than the start sector")]
    InvalidSector = 7,
    #[error("Sector is not blank")]
    SectorNotBlank = 8,
    #[error("Command to prepare the sector for write was not executed")]
    SectorNotPreparedForWriteOperation = 9,
    #[error("Source and destination data are not the same")]
    CompareError = 10,
    #[error("Flash programming interface is busy")]
    Busy = 11,
    #[error("Insufficient number of parameters or invalid parameter")]
    ParamError = 12,
    #[error("Address is not on a word boundary")]
    AddrError = 13,
    #[error("Address is not mapped in the memory map")]
    AddrNotMapped = 14,
    #[error("Command is locked")]
    CmdLocked = 15,
    #[error("Unlock code is invalid")]
    InvalidCode = 16,
    #[error("Invalid baud rate setting")]
    InvalidBaudRate = 17,
    #[error("Invalid stop bit setting")]
    InvalidStopBit = 18,
    #[error("Code read protection is enabled")]
    CodeReadProtectionEnabled = 19,
    #[error("Invalid flash unit")]
    InvalidFlashUnit = 20,
    #[error("User code checksum is invalid")]
    UserCodeChecksum = 21,
    #[error("Error while setting the active partition")]
    SettingActivePartition = 22,
    #[error("Internal RC oscillator is not powered")]
    IrcNoPower = 23,
    #[error("Flash is not powered")]
    FlashNoPower = 24,
    #[error("EEPROM is not powered")]
    EepromNoPower = 25,
    #[error("EEPROM is not clocked")]
    EepromNoClock = 26,
    #[error("Flash is not clocked")]
    FlashNoClock = 27,
    #[error("Reinvoke ISP configuration error")]
    ReinvokeIspConfig = 28,
}

impl ReturnCode {
    /// Returns the numeric code as sent on the wire
    pub fn code(self) -> u32 {
        self.into()
    }

    /// Returns true for `CMD_SUCCESS`
    pub fn is_success(self) -> bool {
        self == ReturnCode::Success
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::*;

    #[test]
    fn it_should_map_wire_codes() {
        assert_eq!(ReturnCode::try_from(0).unwrap(), ReturnCode::Success);
        assert_eq!(ReturnCode::try_from(8).unwrap(), ReturnCode::SectorNotBlank);
        assert_eq!(
            ReturnCode::try_from(28).unwrap(),
            ReturnCode::ReinvokeIspConfig
        );
        assert_eq!(ReturnCode::CmdLocked.code(), 15);
    }

    #[test]
    fn it_should_reject_codes_outside_the_table() {
        assert!(ReturnCode::try_from(29).is_err());
        assert!(ReturnCode::try_from(u32::MAX).is_err());
    }
}
