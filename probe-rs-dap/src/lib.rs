//! # Debug access to ARM Cortex-M targets over CMSIS-DAP
//!
//! A [`Connection`] drives a CMSIS-DAP command channel ([`Transport`]) and offers DP, AP
//! and memory access to the target behind it. Register transfers are batched into as few
//! submissions as the probe allows, DP SELECT and AP CSW writes are only emitted when they
//! change, and memory transfers of any alignment are split into naturally aligned pieces.
//!
//! The connection keeps track of how much of the debug path works as a
//! [`DebugAccessLevel`] and can climb back to full access after the target was reset,
//! powered down or lost its link.
//!
//! ## Reading from RAM
//!
//! ```no_run
//! # fn transport() -> Box<dyn probe_rs_dap::Transport> { unimplemented!() }
//! use probe_rs_dap::{Connection, ConnectionConfig, SecurityAttribute};
//!
//! let connection = Connection::new(transport(), ConnectionConfig::default());
//! connection.ensure()?;
//!
//! let mut buffer = [0u8; 10];
//! connection.read_mem(0x2000_0003, &mut buffer, SecurityAttribute::Any)?;
//!
//! let word = connection.read_word(0x2000_0000)?;
//! # Ok::<(), probe_rs_dap::Error>(())
//! ```

/// All the interface bits for the different architectures.
pub mod architecture;
pub mod config;
mod error;
pub mod probe;

pub use crate::architecture::arm::{
    ApAddress, Connection, DapAccess, DebugAccessLevel, PortAddress, RecoveryHooks,
    SecurityAttribute,
};
pub use crate::config::ConnectionConfig;
pub use crate::error::{DapError, Error, ErrorCode, ProtocolError};
pub use crate::probe::{Transport, TransportError, TransportStatus, WireProtocol};
