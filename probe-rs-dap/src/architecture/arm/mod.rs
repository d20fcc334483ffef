//! All the interface bits for ARM.

/// Raw `u32` conversions for a bitfield register, plus its [`Register`] impl when it sits
/// at a DP or AP register address.
macro_rules! word_register {
    ($name:ident) => {
        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                $name(raw)
            }
        }

        impl From<$name> for u32 {
            fn from(reg: $name) -> u32 {
                reg.0
            }
        }
    };
    ($name:ident @ $address:expr, $display:literal) => {
        word_register!($name);

        impl $crate::architecture::arm::Register for $name {
            const ADDRESS: u8 = $address;
            const NAME: &'static str = $display;
        }
    };
}

pub mod ap;
pub(crate) mod communication_interface;
pub mod core_debug;
pub mod debug_access;
pub mod dp;
pub mod memory;
mod traits;

pub use communication_interface::Connection;
pub use debug_access::{DebugAccessLevel, NoHooks, RecoveryFlags, RecoveryHooks};
pub use memory::SecurityAttribute;
pub use traits::*;
