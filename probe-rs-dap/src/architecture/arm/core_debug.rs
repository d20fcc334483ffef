//! Cortex-M core debug registers touched by detection and recovery.

use bitfield::bitfield;

bitfield! {
    /// Debug Halting Control and Status Register (ARMv7-M ARM, C1.6.2).
    ///
    /// Writes are ignored by the core unless they carry the debug key, see
    /// [`Dhcsr::enable_write`].
    #[derive(Copy, Clone)]
    pub struct Dhcsr(u32);
    impl Debug;
    pub s_lockup, _: 19;
    /// The core is in debug state.
    pub s_halt, _: 17;
    pub c_debugen, set_c_debugen: 0;
}

word_register!(Dhcsr);

impl Dhcsr {
    pub const ADDRESS: u32 = 0xE000_EDF0;

    /// Replace the read-only status half with DBGKEY, so the value can be written back.
    pub fn enable_write(&mut self) {
        self.0 = (self.0 & 0x0000_FFFF) | 0xA05F_0000;
    }
}

bitfield! {
    /// Debug Exception and Monitor Control Register.
    #[derive(Copy, Clone)]
    pub struct Demcr(u32);
    impl Debug;
    /// DWT and ITM enable.
    pub trcena, set_trcena: 24;
    /// Halt on the first instruction after a core reset.
    pub vc_corereset, set_vc_corereset: 0;
}

word_register!(Demcr);

impl Demcr {
    pub const ADDRESS: u32 = 0xE000_EDFC;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_write_keeps_control_bits() {
        let mut dhcsr = Dhcsr(0x0003_0003);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();

        assert_eq!(u32::from(dhcsr), 0xA05F_0003);
    }

    #[test]
    fn halted_core_reports_s_halt() {
        let dhcsr = Dhcsr::from(0x0003_0003);

        assert!(dhcsr.s_halt());
        assert!(!dhcsr.s_lockup());
        assert!(dhcsr.c_debugen());
    }
}
