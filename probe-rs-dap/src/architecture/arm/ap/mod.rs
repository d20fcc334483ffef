//! Memory access port registers.

pub mod context;

use bitfield::bitfield;
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};

/// Transfer Address Register.
pub const TAR: u8 = 0x04;
/// Data Read/Write register.
pub const DRW: u8 = 0x0C;
/// Configuration register.
pub const CFG: u8 = 0xF4;
/// Debug base address register.
pub const BASE: u8 = 0xF8;

#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSize {
    U8 = 0b000,
    U16 = 0b001,
    U32 = 0b010,
}

impl DataSize {
    /// Width of one access in bytes.
    pub fn bytes(self) -> usize {
        match self {
            DataSize::U8 => 1,
            DataSize::U16 => 2,
            DataSize::U32 => 4,
        }
    }
}

#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq)]
pub enum AddressIncrement {
    Off = 0b00,
    Single = 0b01,
    Packed = 0b10,
}

bitfield! {
    /// Control/Status Word of a MEM-AP.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Csw(u32);
    impl Debug;
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    pub sprot, set_sprot: 30;
    pub mstr_dbg, set_mstr_dbg: 29;
    pub u8, hprot, set_hprot: 27, 24;
    pub spiden, _: 23;
    pub tr_in_prog, _: 7;
    pub device_en, _: 6;
    u8, addr_inc_bits, set_addr_inc_bits: 5, 4;
    u8, size_bits, set_size_bits: 2, 0;
}

impl Csw {
    /// Fields which change per access, everything else is the per-AP base value.
    pub const TRANSIENT_MASK: u32 = 0x0000_0037;

    /// CSW base used for AHB-APs: debugger master, privileged data access.
    pub const DEFAULT_BASE: u32 = 0x2300_0040;

    pub fn size(&self) -> Option<DataSize> {
        DataSize::from_u8(self.size_bits())
    }

    pub fn set_size(&mut self, size: DataSize) {
        self.set_size_bits(size.to_u8().unwrap_or_default());
    }

    pub fn addr_inc(&self) -> Option<AddressIncrement> {
        AddressIncrement::from_u8(self.addr_inc_bits())
    }

    pub fn set_addr_inc(&mut self, inc: AddressIncrement) {
        self.set_addr_inc_bits(inc.to_u8().unwrap_or_default());
    }

    /// The value written for an access of `size` on top of `base`.
    pub fn for_access(base: u32, size: DataSize, inc: AddressIncrement) -> Csw {
        let mut csw = Csw(base & !Self::TRANSIENT_MASK);
        csw.set_size(size);
        csw.set_addr_inc(inc);
        csw
    }
}

word_register!(Csw @ 0x00, "CSW");

#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq)]
pub enum ApClass {
    Undefined = 0b0000,
    ComAp = 0b0001,
    MemAp = 0b1000,
}

#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq)]
pub enum ApType {
    JtagComAp = 0x0,
    AmbaAhb3 = 0x1,
    AmbaApb2Apb3 = 0x2,
    AmbaAxi3Axi4 = 0x4,
    AmbaAhb5 = 0x5,
    AmbaApb4 = 0x6,
    AmbaAxi5 = 0x7,
    AmbaAhb5Hprot = 0x8,
}

bitfield! {
    /// Identification register of an access port.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Idr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u16, designer, _: 27, 17;
    u8, class_bits, _: 16, 13;
    pub u8, variant, _: 7, 4;
    u8, type_bits, _: 3, 0;
}

impl Idr {
    pub fn class(&self) -> Option<ApClass> {
        ApClass::from_u8(self.class_bits())
    }

    pub fn ap_type(&self) -> Option<ApType> {
        ApType::from_u8(self.type_bits())
    }

    pub fn is_mem_ap(&self) -> bool {
        self.0 != 0 && self.class() == Some(ApClass::MemAp)
    }
}

word_register!(Idr @ 0xFC, "IDR");

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0x2477_0011, Some(ApType::AmbaAhb3); "cortex-m3 ahb-ap")]
    #[test_case(0x0477_0021, Some(ApType::AmbaAhb3); "cortex-m0 ahb-ap")]
    #[test_case(0x5477_0002, Some(ApType::AmbaApb2Apb3); "apb-ap")]
    #[test_case(0x0477_0015, Some(ApType::AmbaAhb5); "cortex-m33 ahb5-ap")]
    fn mem_ap_idr(raw: u32, ap_type: Option<ApType>) {
        let idr = Idr(raw);

        assert!(idr.is_mem_ap());
        assert_eq!(idr.ap_type(), ap_type);
    }

    #[test]
    fn jtag_ap_is_not_mem_ap() {
        assert!(!Idr(0x0476_0010).is_mem_ap());
        assert!(!Idr(0).is_mem_ap());
    }

    #[test]
    fn csw_for_access_replaces_transient_fields() {
        let csw = Csw::for_access(
            Csw::DEFAULT_BASE | 0x12,
            DataSize::U8,
            AddressIncrement::Packed,
        );

        assert_eq!(u32::from(csw), 0x2300_0060);
        assert_eq!(csw.size(), Some(DataSize::U8));
        assert_eq!(csw.addr_inc(), Some(AddressIncrement::Packed));
        assert!(csw.device_en());
    }
}
