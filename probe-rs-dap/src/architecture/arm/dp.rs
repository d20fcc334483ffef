//! Debug port registers.

use bitfield::bitfield;
use jep106::JEP106Code;

bitfield! {
    /// Writing a one to a `*clr` bit clears the matching sticky flag in CTRL/STAT.
    #[derive(Clone, Default)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 5;
    pub _, set_wderrclr: 4;
    pub _, set_stkerrclr: 3;
    pub _, set_stkcmpclr: 2;
    pub _, set_dapabort: 1;
}

word_register!(Abort @ 0x0, "ABORT");

impl Abort {
    /// All sticky flags, DAPABORT left alone.
    pub fn clear_all_sticky() -> Self {
        Abort(0b11_1100)
    }
}

/// Plain reads and writes through DRW.
pub const TRNMODE_NORMAL: u8 = 0b00;
/// DRW writes are compared against memory and set STICKYCMP on a mismatch.
pub const TRNMODE_PUSHED_VERIFY: u8 = 0b01;

bitfield! {
    #[derive(Clone, Default)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub u8, mask_lane, set_mask_lane: 11, 8;
    pub sticky_err, _: 5;
    pub sticky_cmp, _: 4;
    pub u8, trn_mode, set_trn_mode: 3, 2;
    pub sticky_orun, _: 1;
}

word_register!(Ctrl @ 0x4, "CTRL/STAT");

impl Ctrl {
    pub fn powered_up(&self) -> bool {
        self.csyspwrupack() && self.cdbgpwrupack()
    }

    /// The writable request and mode bits. Acknowledge and sticky bits read back set and
    /// would be written back otherwise.
    pub fn without_status(&self) -> Ctrl {
        Ctrl(self.0 & 0x5000_0F0D)
    }
}

bitfield! {
    #[derive(Clone, Default)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

word_register!(Select @ 0x8, "SELECT");

bitfield! {
    /// Identification register, the first thing read after a line reset.
    #[derive(Clone)]
    pub struct DPIDR(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, version, _: 15, 12;
    u8, jep_cc, _: 11, 8;
    u8, jep_id, _: 7, 1;
}

word_register!(DPIDR @ 0x0, "DPIDR");

/// What a debug port tells about itself.
#[derive(Debug)]
pub struct DebugPortId {
    pub revision: u8,
    pub version: DebugPortVersion,
    pub designer: JEP106Code,
}

impl From<DPIDR> for DebugPortId {
    fn from(dpidr: DPIDR) -> DebugPortId {
        DebugPortId {
            revision: dpidr.revision(),
            version: match dpidr.version() {
                0 => DebugPortVersion::DPv0,
                1 => DebugPortVersion::DPv1,
                2 => DebugPortVersion::DPv2,
                _ => DebugPortVersion::Unsupported,
            },
            designer: JEP106Code::new(dpidr.jep_cc(), dpidr.jep_id()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugPortVersion {
    DPv0,
    DPv1,
    DPv2,
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_clears_all_sticky_flags() {
        let mut abort = Abort(0);
        abort.set_orunerrclr(true);
        abort.set_wderrclr(true);
        abort.set_stkerrclr(true);
        abort.set_stkcmpclr(true);

        assert_eq!(u32::from(Abort::clear_all_sticky()), u32::from(abort));
    }

    #[test]
    fn decode_dpidr() {
        // Cortex-M4 SW-DP
        let id = DebugPortId::from(DPIDR(0x2BA0_1477));

        assert_eq!(id.revision, 2);
        assert_eq!(id.version, DebugPortVersion::DPv1);
        assert_eq!(id.designer, JEP106Code::new(4, 0x3b));
        assert_eq!(id.designer.get(), Some("ARM Ltd"));
    }

    #[test]
    fn ctrl_status_bits_are_dropped() {
        let ctrl = Ctrl(0xF000_0F32);

        assert!(ctrl.powered_up());
        assert!(ctrl.sticky_err());
        assert_eq!(u32::from(ctrl.without_status()), 0x5000_0F00);
    }
}
