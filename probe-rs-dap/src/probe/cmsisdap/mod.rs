//! CMSIS-DAP command encoding and the physical-layer sequences built from it.

pub mod commands;

use commands::{
    encode,
    swj::{clock::SWJClockRequest, sequence::SequenceRequest},
    Request,
};

use super::{Transport, TransportResponse, TransportStatus};
use crate::error::{Error, ProtocolError};

/// Encode `request` and submit it, mapping a lost channel and general failures to errors.
///
/// WAIT, FAULT and value mismatch are returned in the response for the caller to interpret.
pub(crate) fn send<T: Transport + ?Sized, Req: Request>(
    transport: &mut T,
    request: &Req,
) -> Result<TransportResponse, Error> {
    let command = encode(request)?;
    send_encoded(transport, &command, request.expected_reads())
}

/// Submit an already encoded command, see [`send`].
pub(crate) fn send_encoded<T: Transport + ?Sized>(
    transport: &mut T,
    command: &[u8],
    expected_reads: usize,
) -> Result<TransportResponse, Error> {
    let response = transport.submit(command, expected_reads)?;

    tracing::trace!(
        "Command {:#04x} answered {:?} with {} result bytes",
        command.first().copied().unwrap_or_default(),
        response.status,
        response.data.len()
    );

    match response.status {
        TransportStatus::GeneralError => Err(ProtocolError::GeneralError.into()),
        _ => Ok(response),
    }
}

fn expect_ok(response: TransportResponse) -> Result<(), Error> {
    match response.status {
        TransportStatus::Ok => Ok(()),
        _ => Err(ProtocolError::GeneralError.into()),
    }
}

/// Bit sequences on SWDIO/TMS and the clock setting.
///
/// These are passed through to the probe as they are, the probe does the bit-level work.
pub trait SwdSequence {
    /// Clock out `bit_len` bits of `bits`, LSB first.
    fn swj_sequence(&mut self, bit_len: u8, bits: u64) -> Result<(), Error>;

    fn swj_clock(&mut self, clock_hz: u32) -> Result<(), Error>;

    /// At least 50 clock cycles with SWDIO/TMS high.
    fn line_reset(&mut self) -> Result<(), Error> {
        self.swj_sequence(51, 0x0007_FFFF_FFFF_FFFF)
    }

    /// Switch a SWJ-DP from JTAG to SWD and reset the line.
    fn jtag_to_swd(&mut self) -> Result<(), Error> {
        self.line_reset()?;
        self.swj_sequence(16, 0xE79E)?;
        self.line_reset()?;
        // At least two idle cycles before the first packet.
        self.swj_sequence(8, 0x00)
    }

    /// Switch a SWJ-DP from SWD to JTAG, ending in Test-Logic-Reset.
    fn swd_to_jtag(&mut self) -> Result<(), Error> {
        self.line_reset()?;
        self.swj_sequence(16, 0xE73C)?;
        self.line_reset()
    }
}

impl<T: Transport + ?Sized> SwdSequence for T {
    fn swj_sequence(&mut self, bit_len: u8, bits: u64) -> Result<(), Error> {
        let request = SequenceRequest::new(bit_len, bits)?;
        expect_ok(send(self, &request)?)
    }

    fn swj_clock(&mut self, clock_hz: u32) -> Result<(), Error> {
        expect_ok(send(self, &SWJClockRequest(clock_hz))?)
    }
}
