//! Packing of register operations into as few transport submissions as possible.
//!
//! [`compile`] is a pure function from an ordered list of [`RegisterOp`] to a list of
//! [`Batch`]es. [`execute_into`] encodes each batch as one CMSIS-DAP command and hands it
//! to the [`Transport`]. Batching never reorders or drops operations: executing the
//! compiled batches is equivalent to executing each operation on its own, in order.

use super::cmsisdap::{
    commands::{
        encode,
        execute::ExecuteCommandsRequest,
        transfer::{configure::ConfigureRequest, InnerTransferRequest, TransferRequest},
        Request,
    },
    send_encoded,
};
use super::{Transport, TransportStatus};
use crate::architecture::arm::PortAddress;
use crate::error::{DapError, Error, ProtocolError};

/// One abstract register operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOp {
    ReadDp(u8),
    WriteDp(u8, u32),
    ReadAp(u8),
    WriteAp(u8, u32),
    /// Number of retries for reads with value match.
    ConfigureRetry(u16),
    /// Mask applied by subsequent [`RegisterOp::ReadWithMatch`] operations.
    ConfigureMatchMask(u32),
    /// Poll a register until `(value & mask) == expected`. Returns no data.
    ReadWithMatch(PortAddress, u32),
}

impl RegisterOp {
    fn directive(&self) -> Option<Directive> {
        match self {
            RegisterOp::ConfigureRetry(count) => Some(Directive::Retry(*count)),
            RegisterOp::ConfigureMatchMask(mask) => Some(Directive::MatchMask(*mask)),
            _ => None,
        }
    }

    fn access(&self) -> Option<Access> {
        match *self {
            RegisterOp::ReadDp(addr) => Some(Access::ReadDp(addr)),
            RegisterOp::WriteDp(addr, value) => Some(Access::WriteDp(addr, value)),
            RegisterOp::ReadAp(addr) => Some(Access::ReadAp(addr)),
            RegisterOp::WriteAp(addr, value) => Some(Access::WriteAp(addr, value)),
            RegisterOp::ReadWithMatch(addr, expected) => Some(Access::ReadWithMatch(addr, expected)),
            RegisterOp::ConfigureRetry(_) | RegisterOp::ConfigureMatchMask(_) => None,
        }
    }

    /// Operations which fill a result slot.
    pub fn is_read(&self) -> bool {
        matches!(self, RegisterOp::ReadDp(_) | RegisterOp::ReadAp(_))
    }
}

/// A transfer configuration directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Retry(u16),
    MatchMask(u32),
}

/// A register transfer inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadDp(u8),
    WriteDp(u8, u32),
    ReadAp(u8),
    WriteAp(u8, u32),
    ReadWithMatch(PortAddress, u32),
}

impl Access {
    fn is_read(&self) -> bool {
        matches!(self, Access::ReadDp(_) | Access::ReadAp(_))
    }

    fn to_transfer(self) -> InnerTransferRequest {
        use super::cmsisdap::commands::transfer::RW;

        match self {
            Access::ReadDp(addr) => InnerTransferRequest::new(PortAddress::Dp(addr), RW::R, None),
            Access::WriteDp(addr, value) => {
                InnerTransferRequest::new(PortAddress::Dp(addr), RW::W, Some(value))
            }
            Access::ReadAp(addr) => InnerTransferRequest::new(PortAddress::Ap(addr), RW::R, None),
            Access::WriteAp(addr, value) => {
                InnerTransferRequest::new(PortAddress::Ap(addr), RW::W, Some(value))
            }
            Access::ReadWithMatch(addr, expected) => {
                InnerTransferRequest::read_with_match(addr, expected)
            }
        }
    }
}

/// One transport submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    /// A directive on its own.
    Configure(Directive),
    /// Register transfers, optionally preceded by a directive in the same submission.
    Access {
        header: Option<Directive>,
        items: Vec<Access>,
    },
}

impl Batch {
    /// Number of result words this batch produces.
    pub fn reads(&self) -> usize {
        match self {
            Batch::Configure(_) => 0,
            Batch::Access { items, .. } => items.iter().filter(|a| a.is_read()).count(),
        }
    }
}

/// Split `ops` into submissions of at most `max_items` register transfers.
///
/// A directive met with nothing accumulated becomes a [`Batch::Configure`] of its own.
/// Otherwise the accumulated transfers are flushed and the directive becomes the header
/// of the next batch. Batches split at the item ceiling carry no header, the directive
/// has already been applied by then.
pub fn compile(ops: &[RegisterOp], max_items: usize) -> Vec<Batch> {
    let max_items = max_items.max(1);
    let mut batches = Vec::new();
    let mut header: Option<Directive> = None;
    let mut items: Vec<Access> = Vec::new();

    for op in ops {
        if let Some(directive) = op.directive() {
            if items.is_empty() {
                if let Some(pending) = header.take() {
                    batches.push(Batch::Configure(pending));
                }
                batches.push(Batch::Configure(directive));
            } else {
                batches.push(Batch::Access {
                    header: header.take(),
                    items: std::mem::take(&mut items),
                });
                header = Some(directive);
            }
            continue;
        }

        if let Some(access) = op.access() {
            items.push(access);
        }

        if items.len() == max_items {
            batches.push(Batch::Access {
                header: header.take(),
                items: std::mem::take(&mut items),
            });
        }
    }

    if !items.is_empty() {
        batches.push(Batch::Access { header, items });
    } else if let Some(pending) = header {
        batches.push(Batch::Configure(pending));
    }

    batches
}

/// Parameters every submission of a connection shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Index of the debug port the transfers are addressed to.
    pub dap_index: u8,
    pub idle_cycles: u8,
    pub wait_retry: u16,
}

impl BatchSettings {
    fn configure_command(&self, directive: Directive) -> Result<(Vec<u8>, usize), ProtocolError> {
        match directive {
            Directive::Retry(match_retry) => {
                let request = ConfigureRequest {
                    idle_cycles: self.idle_cycles,
                    wait_retry: self.wait_retry,
                    match_retry,
                };
                Ok((encode(&request)?, 0))
            }
            Directive::MatchMask(mask) => {
                let mut request = TransferRequest::new(self.dap_index);
                request.add(InnerTransferRequest::match_mask(mask));
                Ok((encode(&request)?, 0))
            }
        }
    }

    /// Encode a batch as one CMSIS-DAP command and the number of result words it returns.
    pub fn encode(&self, batch: &Batch) -> Result<(Vec<u8>, usize), ProtocolError> {
        match batch {
            Batch::Configure(directive) => self.configure_command(*directive),
            Batch::Access { header, items } => {
                let mut transfer = TransferRequest::new(self.dap_index);
                for access in items {
                    transfer.add(access.to_transfer());
                }
                let reads = transfer.expected_reads();

                match header {
                    None => Ok((encode(&transfer)?, reads)),
                    Some(directive) => {
                        let (configure, _) = self.configure_command(*directive)?;
                        let mut execute = ExecuteCommandsRequest::default();
                        execute.push(configure, 0);
                        execute.push(encode(&transfer)?, reads);
                        Ok((encode(&execute)?, execute.expected_reads()))
                    }
                }
            }
        }
    }
}

/// DAP_Transfer carries its transfer count in one byte.
const MAX_TRANSFERS: usize = 255;

/// Compile and run `ops`, writing read results into `results` in submission order.
///
/// `results` must have exactly one slot per [`RegisterOp::ReadDp`]/[`RegisterOp::ReadAp`].
/// Execution stops at the first failing submission. Slots of reads which completed
/// before it are filled.
#[tracing::instrument(level = "trace", skip(transport, ops, results))]
pub fn execute_into<T: Transport + ?Sized>(
    transport: &mut T,
    settings: &BatchSettings,
    ops: &[RegisterOp],
    max_items: usize,
    results: &mut [u32],
) -> Result<(), Error> {
    let read_ops = ops.iter().filter(|op| op.is_read()).count();
    if read_ops != results.len() {
        return Err(Error::InvalidArgument(
            "result slots do not match the number of read operations",
        ));
    }

    let max_items = max_items
        .min(transport.max_batch_items())
        .min(MAX_TRANSFERS);
    let mut filled = 0;

    for batch in compile(ops, max_items) {
        let (command, expected) = settings.encode(&batch)?;
        let response = send_encoded(transport, &command, expected)?;

        let available = response.word_count().min(expected);
        for (slot, word) in results[filled..filled + available]
            .iter_mut()
            .zip(response.words())
        {
            *slot = word;
        }
        filled += available;

        let dap_error = match response.status {
            TransportStatus::Ok => {
                if response.word_count() != expected {
                    return Err(ProtocolError::ReadCountMismatch {
                        expected,
                        actual: response.word_count(),
                    }
                    .into());
                }
                continue;
            }
            TransportStatus::Wait => DapError::WaitResponse,
            TransportStatus::Fault => DapError::FaultResponse,
            TransportStatus::ValueMismatch => DapError::ValueMismatch,
            TransportStatus::GeneralError => return Err(ProtocolError::GeneralError.into()),
        };

        tracing::debug!("Batch {:?} failed: {:?}", batch, dap_error);
        return Err(Error::dap(dap_error));
    }

    Ok(())
}

/// Like [`execute_into`], returning the read results.
pub fn execute<T: Transport + ?Sized>(
    transport: &mut T,
    settings: &BatchSettings,
    ops: &[RegisterOp],
    max_items: usize,
) -> Result<Vec<u32>, Error> {
    let mut results = vec![0; ops.iter().filter(|op| op.is_read()).count()];
    execute_into(transport, settings, ops, max_items, &mut results)?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake_probe::FakeTarget;
    use crate::probe::{TransportError, TransportResponse};
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use test_case::test_case;

    const SETTINGS: BatchSettings = BatchSettings {
        dap_index: 0,
        idle_cycles: 0,
        wait_retry: 100,
    };

    fn reads(n: usize) -> Vec<RegisterOp> {
        (0..n).map(|_| RegisterOp::ReadDp(0x4)).collect()
    }

    fn item_counts(batches: &[Batch]) -> Vec<usize> {
        batches
            .iter()
            .map(|b| match b {
                Batch::Configure(_) => 0,
                Batch::Access { items, .. } => items.len(),
            })
            .collect()
    }

    #[test]
    fn empty_input_compiles_to_nothing() {
        assert_eq!(compile(&[], 255), vec![]);
    }

    #[test_case(1, 4, vec![1]; "single op")]
    #[test_case(4, 4, vec![4]; "exactly one batch")]
    #[test_case(5, 4, vec![4, 1]; "one over")]
    #[test_case(600, 255, vec![255, 255, 90]; "long sequence")]
    fn flushes_at_item_ceiling(len: usize, max: usize, expected: Vec<usize>) {
        assert_eq!(item_counts(&compile(&reads(len), max)), expected);
    }

    #[test]
    fn leading_directive_is_configure_only() {
        let ops = [RegisterOp::ConfigureRetry(10), RegisterOp::ReadDp(0x4)];

        assert_eq!(
            compile(&ops, 255),
            vec![
                Batch::Configure(Directive::Retry(10)),
                Batch::Access {
                    header: None,
                    items: vec![Access::ReadDp(0x4)]
                },
            ]
        );
    }

    #[test]
    fn directive_mid_sequence_flushes_and_primes() {
        let ops = [
            RegisterOp::WriteAp(0x04, 0xE000_EDF0),
            RegisterOp::ConfigureMatchMask(0x0001_0000),
            RegisterOp::ReadWithMatch(PortAddress::Ap(0x0C), 0x0001_0000),
            RegisterOp::ReadAp(0x0C),
        ];

        assert_eq!(
            compile(&ops, 255),
            vec![
                Batch::Access {
                    header: None,
                    items: vec![Access::WriteAp(0x04, 0xE000_EDF0)]
                },
                Batch::Access {
                    header: Some(Directive::MatchMask(0x0001_0000)),
                    items: vec![
                        Access::ReadWithMatch(PortAddress::Ap(0x0C), 0x0001_0000),
                        Access::ReadAp(0x0C)
                    ]
                },
            ]
        );
    }

    #[test]
    fn trailing_directive_is_flushed() {
        let ops = [RegisterOp::ReadDp(0x4), RegisterOp::ConfigureRetry(100)];

        assert_eq!(
            compile(&ops, 255),
            vec![
                Batch::Access {
                    header: None,
                    items: vec![Access::ReadDp(0x4)]
                },
                Batch::Configure(Directive::Retry(100)),
            ]
        );
    }

    #[test]
    fn consecutive_directives_never_share_a_batch() {
        let ops = [
            RegisterOp::ReadDp(0x4),
            RegisterOp::ConfigureRetry(5),
            RegisterOp::ConfigureMatchMask(0xFF),
            RegisterOp::ReadDp(0x4),
        ];

        assert_eq!(
            compile(&ops, 255),
            vec![
                Batch::Access {
                    header: None,
                    items: vec![Access::ReadDp(0x4)]
                },
                Batch::Configure(Directive::Retry(5)),
                Batch::Configure(Directive::MatchMask(0xFF)),
                Batch::Access {
                    header: None,
                    items: vec![Access::ReadDp(0x4)]
                },
            ]
        );
    }

    #[test]
    fn primed_batch_split_at_ceiling_keeps_header_on_first_part_only() {
        let mut ops = reads(1);
        ops.push(RegisterOp::ConfigureRetry(7));
        ops.extend(reads(5));

        let batches = compile(&ops, 3);

        assert_eq!(item_counts(&batches), vec![1, 3, 2]);
        assert!(matches!(
            batches[1],
            Batch::Access {
                header: Some(Directive::Retry(7)),
                ..
            }
        ));
        assert!(matches!(batches[2], Batch::Access { header: None, .. }));
    }

    #[test]
    fn directive_never_joins_preceding_accesses() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let len = rng.gen_range(0..40);
            let ops: Vec<RegisterOp> = (0..len)
                .map(|_| match rng.gen_range(0..4) {
                    0 => RegisterOp::ConfigureRetry(rng.gen()),
                    1 => RegisterOp::WriteDp(0x8, rng.gen()),
                    _ => RegisterOp::ReadDp(0x4),
                })
                .collect();

            let batches = compile(&ops, 6);

            // Flattening the batches gives back the operations in order.
            let flattened: Vec<RegisterOp> = batches
                .iter()
                .flat_map(|b| match b {
                    Batch::Configure(Directive::Retry(n)) => vec![RegisterOp::ConfigureRetry(*n)],
                    Batch::Access { header, items } => header
                        .iter()
                        .map(|d| match d {
                            Directive::Retry(n) => RegisterOp::ConfigureRetry(*n),
                            Directive::MatchMask(m) => RegisterOp::ConfigureMatchMask(*m),
                        })
                        .chain(items.iter().map(|a| match *a {
                            Access::ReadDp(addr) => RegisterOp::ReadDp(addr),
                            Access::WriteDp(addr, v) => RegisterOp::WriteDp(addr, v),
                            other => panic!("unexpected access {other:?}"),
                        }))
                        .collect(),
                    other => panic!("unexpected batch {other:?}"),
                })
                .collect();
            assert_eq!(flattened, ops);

            for batch in &batches {
                if let Batch::Access { items, .. } = batch {
                    assert!(!items.is_empty() && items.len() <= 6);
                }
            }
        }
    }

    #[test]
    fn primed_batch_is_wrapped_in_execute_commands() {
        let batch = Batch::Access {
            header: Some(Directive::Retry(0x0102)),
            items: vec![Access::ReadDp(0x4)],
        };

        let (command, reads) = SETTINGS.encode(&batch).unwrap();

        assert_eq!(reads, 1);
        assert_eq!(
            command,
            vec![
                0x7F, 0x02, //
                0x04, 0x00, 0x64, 0x00, 0x02, 0x01, //
                0x05, 0x00, 0x01, 0x06,
            ]
        );
    }

    #[test]
    fn batched_execution_matches_one_by_one() {
        let mut rng = StdRng::seed_from_u64(42);
        let ops: Vec<RegisterOp> = (0..300)
            .map(|_| match rng.gen_range(0..3) {
                0 => RegisterOp::WriteDp(0x8, u32::from(rng.gen::<u8>()) << 24),
                1 => RegisterOp::ReadDp(0x0),
                _ => RegisterOp::ReadDp(0x4),
            })
            .collect();

        let mut batched = FakeTarget::new();
        let batched_results = execute(&mut batched, &SETTINGS, &ops, 255).unwrap();

        let mut single = FakeTarget::new();
        let single_results: Vec<u32> = ops
            .iter()
            .flat_map(|op| execute(&mut single, &SETTINGS, std::slice::from_ref(op), 255).unwrap())
            .collect();

        assert_eq!(batched_results, single_results);
        assert_eq!(batched.select(), single.select());
        assert_eq!(batched.submissions(), 2);
        assert_eq!(single.submissions(), 300);
    }

    struct ShortReads;

    impl Transport for ShortReads {
        fn submit(
            &mut self,
            _command: &[u8],
            _expected_items: usize,
        ) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse::ok(vec![0; 4]))
        }
    }

    #[test]
    fn missing_read_results_are_a_protocol_error() {
        let result = execute(&mut ShortReads, &SETTINGS, &reads(2), 255);

        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::ReadCountMismatch {
                expected: 2,
                actual: 1
            }))
        ));
    }

    #[test]
    fn fault_is_surfaced_with_detail() {
        let mut target = FakeTarget::new();
        target.inject_wait(1);

        let result = execute(&mut target, &SETTINGS, &reads(1), 255);

        assert!(matches!(
            result,
            Err(Error::MemoryAccess {
                source: DapError::WaitResponse,
                ..
            })
        ));
        assert_eq!(target.submissions(), 1);
    }

    /// Reports more room per submission than one DAP_Transfer can carry.
    struct Unbounded(FakeTarget);

    impl Transport for Unbounded {
        fn submit(
            &mut self,
            command: &[u8],
            expected_items: usize,
        ) -> Result<TransportResponse, TransportError> {
            self.0.submit(command, expected_items)
        }

        fn max_batch_items(&self) -> usize {
            1000
        }
    }

    #[test]
    fn batches_never_exceed_one_transfer_command() {
        let target = FakeTarget::new();
        let mut transport = Unbounded(target.clone());

        let results = execute(&mut transport, &SETTINGS, &reads(300), 1000).unwrap();

        assert_eq!(results.len(), 300);
        assert_eq!(target.submissions(), 2);
    }

    #[test]
    fn result_slots_must_match_reads() {
        let mut target = FakeTarget::new();
        let mut results = [0u32; 1];

        let result = execute_into(&mut target, &SETTINGS, &reads(2), 255, &mut results);

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(target.submissions(), 0);
    }
}
