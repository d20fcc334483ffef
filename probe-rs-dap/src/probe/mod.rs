//! The command channel to the debug probe.

pub mod batch;
pub mod cmsisdap;
#[cfg(any(test, feature = "test"))]
pub mod fake_probe;

use scroll::{Pread, LE};
use serde::{Deserialize, Serialize};

/// The protocol that is to be used by the probe when communicating with the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireProtocol {
    /// Serial Wire Debug is ARMs proprietary standard for communicating with ARM cores.
    Swd,
    /// JTAG is a standard which is supported by many chips independent of architecture.
    Jtag,
}

impl std::fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireProtocol::Swd => f.write_str("SWD"),
            WireProtocol::Jtag => f.write_str("JTAG"),
        }
    }
}

/// Outcome of a submitted command stream, as reported by the debug server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// Every command executed and every transfer was acknowledged with OK.
    Ok,
    /// A transfer kept answering WAIT until the retry count was exhausted.
    Wait,
    /// A transfer was answered with FAULT. The DP has latched a sticky error.
    Fault,
    /// A read with value match did not match within the match retry count.
    ValueMismatch,
    /// The stream could not be executed (malformed, NO_ACK, protocol error).
    GeneralError,
}

/// Response to [`Transport::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: TransportStatus,
    /// One little endian word per data-returning transfer, in submission order.
    /// Shorter than requested if execution stopped early.
    pub data: Vec<u8>,
}

impl TransportResponse {
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            status: TransportStatus::Ok,
            data,
        }
    }

    /// Number of complete result words in the response.
    pub fn word_count(&self) -> usize {
        self.data.len() / 4
    }

    /// Result words, in order.
    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.word_count())
            .filter_map(move |i| -> Option<u32> { self.data.as_slice().pread_with(i * 4, LE).ok() })
    }
}

/// The channel to the debug server is gone.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("The debug server closed the connection.")]
    Disconnected,
    #[error("I/O error on the debug server channel")]
    Io(#[from] std::io::Error),
}

/// Opaque request/response channel to a CMSIS-DAP debug server.
///
/// `command` is a complete CMSIS-DAP command (possibly a DAP_ExecuteCommands wrapping
/// several), `expected_items` the number of result words the caller will read back.
pub trait Transport: Send {
    fn submit(
        &mut self,
        command: &[u8],
        expected_items: usize,
    ) -> Result<TransportResponse, TransportError>;

    /// Upper bound on register transfers in one submission.
    fn max_batch_items(&self) -> usize {
        255
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn submit(
        &mut self,
        command: &[u8],
        expected_items: usize,
    ) -> Result<TransportResponse, TransportError> {
        (**self).submit(command, expected_items)
    }

    fn max_batch_items(&self) -> usize {
        (**self).max_batch_items()
    }
}
