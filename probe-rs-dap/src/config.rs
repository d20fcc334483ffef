//! Connection settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::architecture::arm::ApAddress;
use crate::probe::WireProtocol;

/// Settings of a [`Connection`](crate::Connection).
///
/// The defaults match what a CMSIS-DAP probe attached to a single Cortex-M core expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Wire protocol used during the handshake.
    pub protocol: WireProtocol,
    /// Send the SWJ switch sequence before the line reset.
    pub use_swj: bool,
    /// SWJ clock in Hz, selected during the handshake.
    pub clock_hz: u32,
    /// Maximum number of register transfers per submission.
    pub max_batch_items: usize,
    /// Idle cycles after each transfer.
    pub idle_cycles: u8,
    /// Retries of a transfer answered with WAIT.
    pub wait_retry: u16,
    /// Retries of a read with value match.
    pub match_retry: u16,
    /// Upper bound on the power-up acknowledge poll.
    pub power_up_timeout: Duration,
    /// The access port in front of the core debug registers.
    pub cpu_ap: ApAddress,
    /// R/W page of the CPU access port.
    pub cpu_rw_page: u32,
    /// R/W page of any other access port.
    pub default_rw_page: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol: WireProtocol::Swd,
            use_swj: true,
            clock_hz: 10_000_000,
            max_batch_items: 255,
            idle_cycles: 0,
            wait_retry: 100,
            match_retry: 100,
            power_up_timeout: Duration::from_secs(1),
            cpu_ap: ApAddress::default(),
            cpu_rw_page: 0x1000,
            default_rw_page: 0x400,
        }
    }
}

impl ConnectionConfig {
    /// R/W page for the given access port.
    pub fn rw_page(&self, ap: ApAddress) -> u32 {
        if ap == self.cpu_ap {
            self.cpu_rw_page
        } else {
            self.default_rw_page
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_config_uses_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{ "protocol": "Jtag", "cpu_rw_page": 2048 }"#).unwrap();

        assert_eq!(
            config,
            ConnectionConfig {
                protocol: WireProtocol::Jtag,
                cpu_rw_page: 0x800,
                ..Default::default()
            }
        );
    }

    #[test]
    fn rw_page_per_ap() {
        let config = ConnectionConfig::default();

        assert_eq!(config.rw_page(ApAddress { dp: 0, ap: 0 }), 0x1000);
        assert_eq!(config.rw_page(ApAddress { dp: 0, ap: 1 }), 0x400);
    }
}
