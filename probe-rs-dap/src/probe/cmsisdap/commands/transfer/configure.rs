use scroll::{Pwrite, LE};

use super::super::{scroll_error, CommandId, Request};
use crate::error::ProtocolError;

/// The DAP_TransferConfigure Command sets parameters for DAP_Transfer and DAP_TransferBlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigureRequest {
    /// Number of extra idle cycles after each transfer.
    pub idle_cycles: u8,
    /// Number of transfer retries after WAIT response.
    pub wait_retry: u16,
    /// Number of retries on reads with Value Match in DAP_Transfer. On value mismatch the Register is read again until its value matches or the Match Retry count exceeds.
    pub match_retry: u16,
}

impl Request for ConfigureRequest {
    const COMMAND_ID: CommandId = CommandId::TransferConfigure;

    fn to_bytes(&self, buffer: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let mut body = [0u8; 5];
        body[0] = self.idle_cycles;
        body.as_mut_slice()
            .pwrite_with(self.wait_retry, 1, LE)
            .map_err(scroll_error)?;
        body.as_mut_slice()
            .pwrite_with(self.match_retry, 3, LE)
            .map_err(scroll_error)?;
        buffer.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::cmsisdap::commands::encode;

    #[test]
    fn configure_bytes() {
        let request = ConfigureRequest {
            idle_cycles: 0,
            wait_retry: 100,
            match_retry: 0x0102,
        };

        assert_eq!(
            encode(&request).unwrap(),
            vec![0x04, 0x00, 0x64, 0x00, 0x02, 0x01]
        );
    }
}
