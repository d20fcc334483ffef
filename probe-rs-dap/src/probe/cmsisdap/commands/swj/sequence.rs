/// Implementation of the DAP_SWJ_SEQUENCE command
///
use super::super::{CommandId, Request};
use crate::error::ProtocolError;

#[derive(Clone, Copy, Debug)]
pub struct SequenceRequest {
    bit_count: u8,
    data: [u8; 32],
}

impl Request for SequenceRequest {
    const COMMAND_ID: CommandId = CommandId::SwjSequence;

    fn to_bytes(&self, buffer: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buffer.push(self.bit_count);

        // A bit_count of zero means that we want to transmit 256 bits
        let transfer_len_bytes: usize = if self.bit_count == 0 {
            256 / 8
        } else {
            usize::from(self.bit_count).div_ceil(8)
        };

        buffer.extend_from_slice(&self.data[..transfer_len_bytes]);
        Ok(())
    }
}

impl SequenceRequest {
    /// A sequence of `bit_len` bits, LSB of `bits` first.
    pub(crate) fn new(bit_len: u8, bits: u64) -> Result<SequenceRequest, ProtocolError> {
        if bit_len == 0 || bit_len > 64 {
            return Err(ProtocolError::Encoding(
                "SWJ sequence must hold between 1 and 64 bits",
            ));
        }

        let mut data = [0u8; 32];
        data[..8].copy_from_slice(&bits.to_le_bytes());

        Ok(SequenceRequest {
            bit_count: bit_len,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::cmsisdap::commands::encode;

    #[test]
    fn line_reset_sequence() {
        let request = SequenceRequest::new(51, 0x0007_FFFF_FFFF_FFFF).unwrap();

        assert_eq!(
            encode(&request).unwrap(),
            vec![0x12, 0x33, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x07]
        );
    }

    #[test]
    fn switch_sequence() {
        let request = SequenceRequest::new(16, 0xE79E).unwrap();

        assert_eq!(encode(&request).unwrap(), vec![0x12, 0x10, 0x9E, 0xE7]);
    }
}
