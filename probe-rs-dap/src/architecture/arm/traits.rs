use serde::{Deserialize, Serialize};

use super::memory::SecurityAttribute;
use crate::Error;

/// A DP or AP register address as seen on the wire.
///
/// The low byte carries the register offset, A[3:2] of which go into the transfer request.
/// For DP registers the highest 4 bits select the DP bank, for AP registers bits 7:4 are the
/// APBANKSEL value.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub enum PortAddress {
    Dp(u8),
    Ap(u8),
}

impl PortAddress {
    pub fn is_ap(&self) -> bool {
        matches!(self, PortAddress::Ap(_))
    }

    fn raw(&self) -> u8 {
        match self {
            PortAddress::Dp(addr) | PortAddress::Ap(addr) => *addr,
        }
    }

    /// A2 and A3 of the register address, in place.
    pub fn a2_and_3(&self) -> u8 {
        self.raw() & 0b1100
    }

    pub fn a2(&self) -> bool {
        self.raw() & 0b0100 != 0
    }

    pub fn a3(&self) -> bool {
        self.raw() & 0b1000 != 0
    }

    /// DPBANKSEL for DP registers, APBANKSEL for AP registers.
    pub fn bank(&self) -> u8 {
        self.raw() >> 4
    }
}

/// Access port address.
#[derive(
    Debug, Default, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub struct ApAddress {
    /// Index of the debug port. Sent as the DAP index of each transfer.
    pub dp: u8,
    /// APSEL value of the access port behind `dp`.
    pub ap: u8,
}

impl std::fmt::Display for ApAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dp, self.ap)
    }
}

/// A typed DP or AP register.
pub trait Register: Clone + From<u32> + Into<u32> + Sized + std::fmt::Debug {
    const ADDRESS: u8;
    const NAME: &'static str;
}

/// Register and memory access of a debug connection.
///
/// This is the surface handed to recovery collaborators: everything goes through the
/// connection's link lock, so implementations may be called from inside a recovery run.
pub trait DapAccess {
    /// Read a Debug Port register. The highest 4 bits of `addr` select the DP bank.
    fn read_dp(&self, addr: u8) -> Result<u32, Error>;

    /// Write a Debug Port register. The highest 4 bits of `addr` select the DP bank.
    fn write_dp(&self, addr: u8, value: u32) -> Result<(), Error>;

    /// Read a register of the currently selected access port.
    fn read_ap(&self, addr: u8) -> Result<u32, Error>;

    /// Write a register of the currently selected access port.
    fn write_ap(&self, addr: u8, value: u32) -> Result<(), Error>;

    fn read_word(&self, address: u32) -> Result<u32, Error>;

    fn write_word(&self, address: u32, value: u32) -> Result<(), Error>;

    /// Write whole words with auto-incrementing block transfers. `address` and the length
    /// of `data` must be multiples of four.
    fn write_block(&self, address: u32, data: &[u8], attrib: SecurityAttribute)
        -> Result<(), Error>;

    fn read_mem(&self, address: u32, data: &mut [u8], attrib: SecurityAttribute)
        -> Result<(), Error>;

    fn write_mem(&self, address: u32, data: &[u8], attrib: SecurityAttribute)
        -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(PortAddress::Dp(0x0), false, false, 0; "abort")]
    #[test_case(PortAddress::Dp(0x4), true, false, 0; "ctrl stat")]
    #[test_case(PortAddress::Dp(0x8), false, true, 0; "select")]
    #[test_case(PortAddress::Dp(0x24), true, false, 2; "dp bank 2")]
    #[test_case(PortAddress::Ap(0x0C), true, true, 0; "drw")]
    #[test_case(PortAddress::Ap(0xFC), true, true, 0xF; "idr")]
    fn address_bits(address: PortAddress, a2: bool, a3: bool, bank: u8) {
        assert_eq!(address.a2(), a2);
        assert_eq!(address.a3(), a3);
        assert_eq!(address.bank(), bank);
    }
}
