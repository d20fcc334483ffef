use std::cell::RefCell;

use jep106::JEP106Code;
use parking_lot::{Mutex, ReentrantMutex};

use super::ap::{
    context::{AccessPointContext, ApContextRegistry, ApInformation},
    AddressIncrement, Csw, DataSize, Idr, BASE, DRW, TAR,
};
use super::debug_access::{DebugAccessLevel, NoHooks, RecoveryFlags, RecoveryHooks};
use super::dp::{Abort, Ctrl, DebugPortId, Select, DPIDR, TRNMODE_NORMAL, TRNMODE_PUSHED_VERIFY};
use super::memory::SecurityAttribute;
use super::{ApAddress, DapAccess, PortAddress, Register};
use crate::config::ConnectionConfig;
use crate::error::{DapError, Error, ProtocolError};
use crate::probe::batch::{self, BatchSettings, RegisterOp};
use crate::probe::cmsisdap::{
    self,
    commands::{transfer::TransferBlockRequest, Request as _},
    SwdSequence,
};
use crate::probe::{Transport, TransportStatus, WireProtocol};

/// Run `f`, and run it a second time if the first attempt ran into WAIT.
///
/// Any other error, and a second WAIT, is returned as is.
pub(crate) fn retry_once<R>(mut f: impl FnMut() -> Result<R, Error>) -> Result<R, Error> {
    match f() {
        Err(error) if error.is_wait() => {
            tracing::debug!("Retrying after: {}", error);
            f()
        }
        other => other,
    }
}

fn single(values: Vec<u32>) -> Result<u32, Error> {
    values.first().copied().ok_or_else(|| {
        ProtocolError::ReadCountMismatch {
            expected: 1,
            actual: 0,
        }
        .into()
    })
}

/// What the DP SELECT register is known to contain.
///
/// Each field is `None` while the value on the target is unknown, which forces the next
/// access to write SELECT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DpApSelection {
    pub current_dp_index: u8,
    /// APSEL as last written.
    pub ap_select_value: Option<u8>,
    /// APBANKSEL as last written.
    pub ap_bank: Option<u8>,
    /// DPBANKSEL as last written.
    pub dp_bank: Option<u8>,
}

impl DpApSelection {
    fn switch_dp(&mut self, dp: u8) {
        if dp != self.current_dp_index {
            *self = Self {
                current_dp_index: dp,
                ..Default::default()
            };
        }
    }

    fn select_value(&mut self) -> u32 {
        let mut select = Select::default();
        select.set_ap_sel(*self.ap_select_value.get_or_insert(0));
        select.set_ap_bank_sel(*self.ap_bank.get_or_insert(0));
        select.set_dp_bank_sel(*self.dp_bank.get_or_insert(0));
        select.into()
    }

    /// The SELECT value to write before accessing `bank` of AP `ap`, if the current one
    /// does not fit.
    fn select_ap(&mut self, ap: u8, bank: u8) -> Option<u32> {
        if self.ap_select_value == Some(ap) && self.ap_bank == Some(bank) {
            return None;
        }
        self.ap_select_value = Some(ap);
        self.ap_bank = Some(bank);
        Some(self.select_value())
    }

    /// The SELECT value to write before accessing DP register `addr`, if needed.
    ///
    /// Only CTRL/STAT is banked.
    fn select_dp_bank(&mut self, addr: u8) -> Option<u32> {
        let address = PortAddress::Dp(addr);
        if address.a2_and_3() != Ctrl::ADDRESS || self.dp_bank == Some(address.bank()) {
            return None;
        }
        self.dp_bank = Some(address.bank());
        Some(self.select_value())
    }

    fn written(&mut self, value: u32) {
        let select = Select::from(value);
        self.ap_select_value = Some(select.ap_sel());
        self.ap_bank = Some(select.ap_bank_sel());
        self.dp_bank = Some(select.dp_bank_sel());
    }

    pub(crate) fn invalidate(&mut self) {
        self.ap_select_value = None;
        self.ap_bank = None;
        self.dp_bank = None;
    }
}

/// DP and AP register access on the wire, with the SELECT cache and fault handling.
pub(crate) struct DapPort<T> {
    pub(crate) transport: T,
    pub(crate) selection: DpApSelection,
    settings: BatchSettings,
    max_batch_items: usize,
}

impl<T: Transport> DapPort<T> {
    fn new(transport: T, config: &ConnectionConfig) -> Self {
        Self {
            transport,
            selection: DpApSelection::default(),
            settings: BatchSettings {
                dap_index: 0,
                idle_cycles: config.idle_cycles,
                wait_retry: config.wait_retry,
            },
            max_batch_items: config.max_batch_items,
        }
    }

    /// Insert the SELECT writes `ops` need.
    fn prepare(&mut self, ap: Option<ApAddress>, ops: &[RegisterOp]) -> Vec<RegisterOp> {
        let dp = ap.map_or(self.selection.current_dp_index, |ap| ap.dp);
        self.selection.switch_dp(dp);

        let mut prepared = Vec::with_capacity(ops.len() + 1);
        for op in ops {
            let select = match *op {
                RegisterOp::ReadAp(addr)
                | RegisterOp::WriteAp(addr, _)
                | RegisterOp::ReadWithMatch(PortAddress::Ap(addr), _) => ap.and_then(|ap| {
                    self.selection
                        .select_ap(ap.ap, PortAddress::Ap(addr).bank())
                }),
                RegisterOp::ReadDp(addr)
                | RegisterOp::WriteDp(addr, _)
                | RegisterOp::ReadWithMatch(PortAddress::Dp(addr), _) => {
                    self.selection.select_dp_bank(addr)
                }
                RegisterOp::ConfigureRetry(_) | RegisterOp::ConfigureMatchMask(_) => None,
            };

            if let Some(select) = select {
                prepared.push(RegisterOp::WriteDp(Select::ADDRESS, select));
            }
            if let RegisterOp::WriteDp(Select::ADDRESS, value) = *op {
                self.selection.written(value);
            }
            prepared.push(*op);
        }
        prepared
    }

    /// Run `ops` once, without retry or fault handling.
    fn execute_once(
        &mut self,
        ap: Option<ApAddress>,
        ops: &[RegisterOp],
    ) -> Result<Vec<u32>, Error> {
        let prepared = self.prepare(ap, ops);
        let settings = BatchSettings {
            dap_index: self.selection.current_dp_index,
            ..self.settings
        };

        batch::execute(
            &mut self.transport,
            &settings,
            &prepared,
            self.max_batch_items,
        )
        .map_err(|error| {
            self.selection.invalidate();
            error
        })
    }

    /// Run `ops`, clearing sticky state after a fault and retrying once after WAIT.
    pub(crate) fn execute(
        &mut self,
        ap: Option<ApAddress>,
        ops: &[RegisterOp],
    ) -> Result<Vec<u32>, Error> {
        retry_once(|| {
            self.execute_once(ap, ops)
                .map_err(|error| self.clear_fault(error))
        })
    }

    /// Abort or clear whatever `error` left behind on the DP, returning the error to report.
    fn clear_fault(&mut self, error: Error) -> Error {
        let Error::MemoryAccess { source, .. } = error else {
            return error;
        };

        match source {
            DapError::WaitResponse => {
                let mut abort = Abort::default();
                abort.set_dapabort(true);
                let ops = [RegisterOp::WriteDp(Abort::ADDRESS, abort.into())];
                if let Err(e) = self.execute_once(None, &ops) {
                    tracing::debug!("Failed to abort the stalled transaction: {}", e);
                }
                error
            }
            DapError::FaultResponse | DapError::StickyError => {
                match self.execute_once(None, &[RegisterOp::ReadDp(Ctrl::ADDRESS)]) {
                    Ok(values) if values.first().is_some_and(|v| Ctrl::from(*v).sticky_err()) => {
                        let mut abort = Abort::default();
                        abort.set_stkerrclr(true);
                        abort.set_wderrclr(true);
                        abort.set_orunerrclr(true);
                        let ops = [RegisterOp::WriteDp(Abort::ADDRESS, abort.into())];
                        if let Err(e) = self.execute_once(None, &ops) {
                            tracing::warn!("Failed to clear the sticky error: {}", e);
                        }
                        Error::dap(DapError::StickyError)
                    }
                    _ => Error::dap(DapError::FaultResponse),
                }
            }
            DapError::ValueMismatch => error,
        }
    }

    pub(crate) fn read_dp(&mut self, addr: u8) -> Result<u32, Error> {
        single(self.execute(None, &[RegisterOp::ReadDp(addr)])?)
    }

    pub(crate) fn write_dp(&mut self, addr: u8, value: u32) -> Result<(), Error> {
        self.execute(None, &[RegisterOp::WriteDp(addr, value)])
            .map(|_| ())
    }

    pub(crate) fn read_ap(&mut self, ap: ApAddress, addr: u8) -> Result<u32, Error> {
        single(self.execute(Some(ap), &[RegisterOp::ReadAp(addr)])?)
    }

    pub(crate) fn write_ap(&mut self, ap: ApAddress, addr: u8, value: u32) -> Result<(), Error> {
        self.execute(Some(ap), &[RegisterOp::WriteAp(addr, value)])
            .map(|_| ())
    }

    fn block_once(
        &mut self,
        ap: ApAddress,
        addr: u8,
        request: &TransferBlockRequest,
    ) -> Result<Vec<u32>, Error> {
        self.selection.switch_dp(ap.dp);
        if let Some(select) = self
            .selection
            .select_ap(ap.ap, PortAddress::Ap(addr).bank())
        {
            self.execute_once(None, &[RegisterOp::WriteDp(Select::ADDRESS, select)])?;
        }

        let expected = request.expected_reads();
        let response = cmsisdap::send(&mut self.transport, request).map_err(|error| {
            self.selection.invalidate();
            error
        })?;

        let source = match response.status {
            TransportStatus::Ok if response.word_count() == expected => {
                return Ok(response.words().collect());
            }
            TransportStatus::Ok => {
                return Err(ProtocolError::ReadCountMismatch {
                    expected,
                    actual: response.word_count(),
                }
                .into())
            }
            TransportStatus::Wait => DapError::WaitResponse,
            TransportStatus::Fault => DapError::FaultResponse,
            TransportStatus::ValueMismatch => DapError::ValueMismatch,
            TransportStatus::GeneralError => return Err(ProtocolError::GeneralError.into()),
        };

        self.selection.invalidate();
        Err(Error::dap(source))
    }

    /// Read `count` words from AP register `addr` with one DAP_TransferBlock.
    pub(crate) fn read_block(
        &mut self,
        ap: ApAddress,
        addr: u8,
        count: usize,
    ) -> Result<Vec<u32>, Error> {
        let request = TransferBlockRequest::read_request(ap.dp, PortAddress::Ap(addr), count)?;
        retry_once(|| {
            self.block_once(ap, addr, &request)
                .map_err(|error| self.clear_fault(error))
        })
    }

    /// Write `data` to AP register `addr` with one DAP_TransferBlock.
    pub(crate) fn write_block(&mut self, ap: ApAddress, addr: u8, data: &[u32]) -> Result<(), Error> {
        let request =
            TransferBlockRequest::write_request(ap.dp, PortAddress::Ap(addr), data.to_vec())?;
        retry_once(|| {
            self.block_once(ap, addr, &request)
                .map_err(|error| self.clear_fault(error))
        })
        .map(|_| ())
    }

    /// Fail with [`DapError::StickyError`] if the DP latched one, clearing it.
    pub(crate) fn check_sticky(&mut self) -> Result<(), Error> {
        let ctrl = Ctrl::from(self.read_dp(Ctrl::ADDRESS)?);
        if ctrl.sticky_err() {
            let mut abort = Abort::default();
            abort.set_stkerrclr(true);
            abort.set_wderrclr(true);
            abort.set_orunerrclr(true);
            self.write_dp(Abort::ADDRESS, abort.into())?;
            return Err(Error::dap(DapError::StickyError));
        }
        Ok(())
    }

    /// Bring the wire protocol up and identify the debug port.
    #[tracing::instrument(level = "debug", skip(self, config))]
    pub(crate) fn handshake(&mut self, config: &ConnectionConfig) -> Result<DebugPortId, Error> {
        self.transport.swj_clock(config.clock_hz)?;
        match (config.protocol, config.use_swj) {
            (WireProtocol::Swd, true) => self.transport.jtag_to_swd()?,
            (WireProtocol::Swd, false) => self.transport.line_reset()?,
            (WireProtocol::Jtag, _) => self.transport.swd_to_jtag()?,
        }
        self.selection.invalidate();

        // The first transfer after a line reset has to read DPIDR.
        let dpidr = DPIDR::from(single(
            self.execute_once(None, &[RegisterOp::ReadDp(DPIDR::ADDRESS)])?,
        )?);
        let id = DebugPortId::from(dpidr);
        tracing::info!(
            "Debug port {:?}, designer {}",
            id.version,
            designer_name(&id.designer)
        );

        self.execute_once(None, &[RegisterOp::ConfigureRetry(config.match_retry)])?;
        Ok(id)
    }

    /// Read IDR and CSW of `ap` and find out what it supports.
    fn probe_ap(&mut self, ap: ApAddress, rw_page_size: u32) -> Result<AccessPointContext, Error> {
        let values = self.execute(
            Some(ap),
            &[RegisterOp::ReadAp(Idr::ADDRESS), RegisterOp::ReadAp(Csw::ADDRESS)],
        )?;
        let &[idr, csw] = values.as_slice() else {
            return Err(ProtocolError::ReadCountMismatch {
                expected: 2,
                actual: values.len(),
            }
            .into());
        };

        AccessPointContext::probe(ap, Idr::from(idr), Csw::from(csw), rw_page_size, |value| {
            single(self.execute(
                Some(ap),
                &[
                    RegisterOp::WriteAp(Csw::ADDRESS, value),
                    RegisterOp::ReadAp(Csw::ADDRESS),
                ],
            )?)
        })
    }
}

fn designer_name(code: &JEP106Code) -> String {
    code.get()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{code:?}"))
}

fn check_block_args(address: u32, len: usize) -> Result<(), Error> {
    if len == 0 {
        return Err(Error::InvalidArgument("block transfers need at least one word"));
    }
    if address % 4 != 0 || len % 4 != 0 {
        return Err(Error::InvalidArgument(
            "block transfers need a word aligned address and length",
        ));
    }
    if u64::from(address) + len as u64 > 1 << 32 {
        return Err(Error::InvalidArgument("transfer runs past the end of the address space"));
    }
    Ok(())
}

/// Everything behind the link lock.
pub(crate) struct LinkState<T> {
    pub(crate) port: DapPort<T>,
    pub(crate) registry: ApContextRegistry,
    /// The AP register and memory accesses go to.
    pub(crate) selected: ApAddress,
    config: ConnectionConfig,
}

impl<T: Transport> LinkState<T> {
    pub(crate) fn context(&mut self, ap: ApAddress) -> Result<&mut AccessPointContext, Error> {
        let rw_page = self.config.rw_page(ap);
        let port = &mut self.port;
        self.registry
            .get_or_probe(ap, |ap| port.probe_ap(ap, rw_page))
    }

    /// Forget everything known about the target, as after a reconnect.
    pub(crate) fn reset(&mut self) {
        self.registry.clear();
        self.port.selection.invalidate();
    }

    /// Run `ops` against `ap`, preceded by a CSW write if the CSW on the AP does not fit
    /// an access of `size`.
    fn access(
        &mut self,
        ap: ApAddress,
        size: DataSize,
        inc: AddressIncrement,
        attrib: SecurityAttribute,
        ops: &[RegisterOp],
    ) -> Result<Vec<u32>, Error> {
        let rw_page = self.config.rw_page(ap);
        let port = &mut self.port;
        let context = self
            .registry
            .get_or_probe(ap, |ap| port.probe_ap(ap, rw_page))?;

        if !context.supports(size) {
            return Err(Error::UnsupportedAccessWidth {
                ap,
                width: size.bytes(),
            });
        }
        context.apply_security(attrib);

        let csw = context.csw_for(size, inc);
        let mut prepared = Vec::with_capacity(ops.len() + 1);
        if context.csw_current != Some(csw) {
            tracing::trace!("CSW of AP {} changes to {:#010x}", ap, csw);
            prepared.push(RegisterOp::WriteAp(Csw::ADDRESS, csw));
        }
        prepared.extend_from_slice(ops);

        context.csw_current = None;
        let values = port.execute(Some(ap), &prepared)?;
        context.csw_current = Some(csw);
        Ok(values)
    }

    /// Write the CSW base of `ap` for word accesses, whatever the cache says.
    pub(crate) fn restore_csw(&mut self, ap: ApAddress) -> Result<(), Error> {
        self.context(ap)?.csw_current = None;
        self.access(
            ap,
            DataSize::U32,
            AddressIncrement::Single,
            SecurityAttribute::Any,
            &[],
        )
        .map(|_| ())
    }

    /// Read the bus word containing `address` with an access of `size`.
    pub(crate) fn read_sized(
        &mut self,
        ap: ApAddress,
        address: u32,
        size: DataSize,
        attrib: SecurityAttribute,
    ) -> Result<u32, Error> {
        check_alignment(address, size)?;
        single(self.access(
            ap,
            size,
            AddressIncrement::Single,
            attrib,
            &[RegisterOp::WriteAp(TAR, address), RegisterOp::ReadAp(DRW)],
        )?)
    }

    /// Write `value`, placed in its byte lanes, with an access of `size`.
    pub(crate) fn write_sized(
        &mut self,
        ap: ApAddress,
        address: u32,
        size: DataSize,
        value: u32,
        attrib: SecurityAttribute,
    ) -> Result<(), Error> {
        check_alignment(address, size)?;
        self.access(
            ap,
            size,
            AddressIncrement::Single,
            attrib,
            &[RegisterOp::WriteAp(TAR, address), RegisterOp::WriteAp(DRW, value)],
        )
        .map(|_| ())
    }

    /// Split `len` bytes at `address` into pieces that do not cross an R/W page.
    fn pages(&mut self, ap: ApAddress, address: u32, len: usize) -> Result<Vec<(u32, usize)>, Error> {
        let page = self.context(ap)?.rw_page_size.max(4) as usize;
        let mut pieces = Vec::new();
        let mut offset = 0;
        while offset < len {
            let piece_address = address + offset as u32;
            let piece = (page - piece_address as usize % page).min(len - offset);
            pieces.push((piece_address, piece));
            offset += piece;
        }
        Ok(pieces)
    }

    pub(crate) fn read_block(
        &mut self,
        ap: ApAddress,
        address: u32,
        data: &mut [u8],
        attrib: SecurityAttribute,
    ) -> Result<(), Error> {
        check_block_args(address, data.len())?;

        let mut offset = 0;
        for (piece_address, len) in self.pages(ap, address, data.len())? {
            self.access(
                ap,
                DataSize::U32,
                AddressIncrement::Single,
                attrib,
                &[RegisterOp::WriteAp(TAR, piece_address)],
            )?;
            let words = self.port.read_block(ap, DRW, len / 4)?;
            for (bytes, word) in data[offset..offset + len].chunks_exact_mut(4).zip(words) {
                bytes.copy_from_slice(&word.to_le_bytes());
            }
            offset += len;
        }
        Ok(())
    }

    pub(crate) fn write_block(
        &mut self,
        ap: ApAddress,
        address: u32,
        data: &[u8],
        attrib: SecurityAttribute,
    ) -> Result<(), Error> {
        check_block_args(address, data.len())?;

        let mut offset = 0;
        for (piece_address, len) in self.pages(ap, address, data.len())? {
            let words: Vec<u32> = data[offset..offset + len]
                .chunks_exact(4)
                .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                .collect();

            self.access(
                ap,
                DataSize::U32,
                AddressIncrement::Single,
                attrib,
                &[RegisterOp::WriteAp(TAR, piece_address)],
            )?;
            self.port.write_block(ap, DRW, &words)?;
            offset += len;
        }
        Ok(())
    }

    /// Compare `data` with target memory using pushed verify. Nothing is written to memory.
    pub(crate) fn verify_block(
        &mut self,
        ap: ApAddress,
        address: u32,
        data: &[u8],
        attrib: SecurityAttribute,
    ) -> Result<bool, Error> {
        check_block_args(address, data.len())?;

        let ctrl = Ctrl::from(self.port.read_dp(Ctrl::ADDRESS)?).without_status();
        let mut verify = ctrl.clone();
        verify.set_trn_mode(TRNMODE_PUSHED_VERIFY);
        self.port.write_dp(Ctrl::ADDRESS, verify.into())?;

        // A mismatch makes the DP answer FAULT to every AP access after it, so a failed
        // block is only a memory error when STICKYERR is set.
        let status = match self.write_block(ap, address, data, attrib) {
            Ok(()) => self.port.read_dp(Ctrl::ADDRESS),
            Err(
                error @ Error::MemoryAccess {
                    source: DapError::FaultResponse | DapError::StickyError,
                    ..
                },
            ) => self.port.read_dp(Ctrl::ADDRESS).and_then(|value| {
                let ctrl = Ctrl::from(value);
                if ctrl.sticky_cmp() && !ctrl.sticky_err() {
                    Ok(value)
                } else {
                    Err(error)
                }
            }),
            Err(error) => Err(error),
        };

        let mut normal = ctrl;
        normal.set_trn_mode(TRNMODE_NORMAL);
        let restored = self.port.execute(
            None,
            &[
                RegisterOp::WriteDp(Abort::ADDRESS, Abort::clear_all_sticky().into()),
                RegisterOp::WriteDp(Ctrl::ADDRESS, normal.into()),
            ],
        );

        let status = Ctrl::from(status?);
        restored?;

        if status.sticky_err() {
            return Err(Error::dap(DapError::StickyError).at_address(u64::from(address)));
        }
        Ok(!status.sticky_cmp())
    }

    /// Poll the word at `address` until `(value & mask) == expected`, at most `retries` times.
    pub(crate) fn wait_for_word(
        &mut self,
        ap: ApAddress,
        address: u32,
        mask: u32,
        expected: u32,
        retries: u16,
    ) -> Result<bool, Error> {
        check_alignment(address, DataSize::U32)?;

        let result = self.access(
            ap,
            DataSize::U32,
            AddressIncrement::Off,
            SecurityAttribute::Any,
            &[
                RegisterOp::ConfigureRetry(retries),
                RegisterOp::WriteAp(TAR, address),
                RegisterOp::ConfigureMatchMask(mask),
                RegisterOp::ReadWithMatch(PortAddress::Ap(DRW), expected & mask),
            ],
        );
        let restored = self
            .port
            .execute(None, &[RegisterOp::ConfigureRetry(self.config.match_retry)]);

        let matched = match result {
            Ok(_) => true,
            Err(Error::MemoryAccess {
                source: DapError::ValueMismatch,
                ..
            }) => false,
            Err(error) => return Err(error.at_address(u64::from(address))),
        };
        restored?;
        Ok(matched)
    }
}

fn check_alignment(address: u32, size: DataSize) -> Result<(), Error> {
    match size {
        DataSize::U16 if address % 2 != 0 => Err(Error::InvalidArgument(
            "halfword accesses need a 2-byte aligned address",
        )),
        DataSize::U32 if address % 4 != 0 => Err(Error::InvalidArgument(
            "word accesses need a 4-byte aligned address",
        )),
        _ => Ok(()),
    }
}

/// Byte lane shift of the data at `address` on the 32-bit bus.
fn lane_shift(address: u32) -> u32 {
    (address & 3) * 8
}

/// A debug connection to a Cortex-M target through a CMSIS-DAP transport.
///
/// All methods take `&self`: a connection is shared between the threads using it. Register
/// and memory accesses are serialized by a reentrant link lock, so an operation built from
/// several accesses (like [`Connection::read_mem`]) runs without interleaving and may be
/// called from a recovery hook.
pub struct Connection<T: Transport> {
    pub(crate) link: ReentrantMutex<RefCell<LinkState<T>>>,
    /// Held for a whole recovery run.
    pub(crate) recovery: Mutex<()>,
    pub(crate) level: Mutex<DebugAccessLevel>,
    pub(crate) flags: Mutex<RecoveryFlags>,
    pub(crate) hooks: Box<dyn RecoveryHooks>,
    pub(crate) config: ConnectionConfig,
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("level", &self.level())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Connection<T> {
    /// Wrap an attached transport. The level starts at [`DebugAccessLevel::Normal`].
    pub fn new(transport: T, config: ConnectionConfig) -> Self {
        Self::with_hooks(transport, config, NoHooks)
    }

    pub fn with_hooks(
        transport: T,
        config: ConnectionConfig,
        hooks: impl RecoveryHooks + 'static,
    ) -> Self {
        let state = LinkState {
            port: DapPort::new(transport, &config),
            registry: ApContextRegistry::default(),
            selected: config.cpu_ap,
            config: config.clone(),
        };

        Self {
            link: ReentrantMutex::new(RefCell::new(state)),
            recovery: Mutex::new(()),
            level: Mutex::new(DebugAccessLevel::Normal),
            flags: Mutex::new(RecoveryFlags::default()),
            hooks: Box::new(hooks),
            config,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Run `f` on the link state with the link lock held.
    ///
    /// Fails right away once the server is lost, and records a lost server.
    pub(crate) fn with_link<R>(
        &self,
        f: impl FnOnce(&mut LinkState<T>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        if self.level() == DebugAccessLevel::ServerLost {
            return Err(Error::ServerLost(None));
        }

        let guard = self.link.lock();
        let result = f(&mut guard.borrow_mut());
        drop(guard);

        if let Err(Error::ServerLost(_)) = &result {
            self.mark_server_lost();
        }
        result
    }

    /// Direct AP register and memory accesses to `ap`.
    pub fn select_ap(&self, ap: ApAddress) {
        let guard = self.link.lock();
        guard.borrow_mut().selected = ap;
    }

    pub fn selected_ap(&self) -> ApAddress {
        let guard = self.link.lock();
        let ap = guard.borrow().selected;
        ap
    }

    /// Identify the access port at `ap`.
    pub fn ap_information(&self, ap: ApAddress) -> Result<ApInformation, Error> {
        self.with_link(|link| {
            let idr = Idr::from(link.port.read_ap(ap, Idr::ADDRESS)?);
            let base = link.port.read_ap(ap, BASE)?;
            Ok(ApInformation::new(ap, idr, base))
        })
    }

    /// Read a DP register. The highest 4 bits of `addr` select the DP bank.
    pub fn read_dp(&self, addr: u8) -> Result<u32, Error> {
        self.with_link(|link| link.port.read_dp(addr))
    }

    /// Write a DP register. The highest 4 bits of `addr` select the DP bank.
    pub fn write_dp(&self, addr: u8, value: u32) -> Result<(), Error> {
        self.with_link(|link| link.port.write_dp(addr, value))
    }

    /// Read a register of the selected AP. Bits 7:4 of `addr` are the AP bank.
    pub fn read_ap(&self, addr: u8) -> Result<u32, Error> {
        self.with_link(|link| {
            let ap = link.selected;
            link.context(ap)?;
            link.port.read_ap(ap, addr)
        })
    }

    /// Write a register of the selected AP. Bits 7:4 of `addr` are the AP bank.
    pub fn write_ap(&self, addr: u8, value: u32) -> Result<(), Error> {
        self.with_link(|link| {
            let ap = link.selected;
            let context = link.context(ap)?;
            if addr == Csw::ADDRESS {
                context.csw_current = None;
            }
            link.port.write_ap(ap, addr, value)
        })
    }

    pub fn read_dp_register<R: Register>(&self) -> Result<R, Error> {
        let value = self.read_dp(R::ADDRESS)?;
        tracing::debug!("Read DP register {}: {:#010x}", R::NAME, value);
        Ok(R::from(value))
    }

    pub fn write_dp_register<R: Register>(&self, register: R) -> Result<(), Error> {
        let value = register.into();
        tracing::debug!("Write DP register {}: {:#010x}", R::NAME, value);
        self.write_dp(R::ADDRESS, value)
    }

    pub fn read_ap_register<R: Register>(&self) -> Result<R, Error> {
        let value = self.read_ap(R::ADDRESS)?;
        tracing::debug!("Read AP register {}: {:#010x}", R::NAME, value);
        Ok(R::from(value))
    }

    pub fn write_ap_register<R: Register>(&self, register: R) -> Result<(), Error> {
        let value = register.into();
        tracing::debug!("Write AP register {}: {:#010x}", R::NAME, value);
        self.write_ap(R::ADDRESS, value)
    }

    /// Read a word on `ap`, whichever AP is selected.
    pub(crate) fn read_word_on(&self, ap: ApAddress, address: u32) -> Result<u32, Error> {
        self.with_link(|link| link.read_sized(ap, address, DataSize::U32, SecurityAttribute::Any))
    }

    pub(crate) fn write_word_on(&self, ap: ApAddress, address: u32, value: u32) -> Result<(), Error> {
        self.with_link(|link| {
            link.write_sized(ap, address, DataSize::U32, value, SecurityAttribute::Any)
        })
    }

    pub fn read_word(&self, address: u32) -> Result<u32, Error> {
        self.read_word_on(self.selected_ap(), address)
    }

    pub fn write_word(&self, address: u32, value: u32) -> Result<(), Error> {
        self.write_word_on(self.selected_ap(), address, value)
    }

    pub fn read_halfword(&self, address: u32) -> Result<u16, Error> {
        self.with_link(|link| {
            let value =
                link.read_sized(link.selected, address, DataSize::U16, SecurityAttribute::Any)?;
            Ok((value >> lane_shift(address)) as u16)
        })
    }

    pub fn write_halfword(&self, address: u32, value: u16) -> Result<(), Error> {
        self.with_link(|link| {
            let lanes = u32::from(value) << lane_shift(address);
            link.write_sized(link.selected, address, DataSize::U16, lanes, SecurityAttribute::Any)
        })
    }

    pub fn read_byte(&self, address: u32) -> Result<u8, Error> {
        self.with_link(|link| {
            let value =
                link.read_sized(link.selected, address, DataSize::U8, SecurityAttribute::Any)?;
            Ok((value >> lane_shift(address)) as u8)
        })
    }

    pub fn write_byte(&self, address: u32, value: u8) -> Result<(), Error> {
        self.with_link(|link| {
            let lanes = u32::from(value) << lane_shift(address);
            link.write_sized(link.selected, address, DataSize::U8, lanes, SecurityAttribute::Any)
        })
    }

    /// Read whole words with auto-incrementing block transfers.
    ///
    /// `address` and the length of `data` must be multiples of four.
    pub fn read_block(
        &self,
        address: u32,
        data: &mut [u8],
        attrib: SecurityAttribute,
    ) -> Result<(), Error> {
        self.with_link(|link| link.read_block(link.selected, address, data, attrib))
    }

    /// Write whole words with auto-incrementing block transfers.
    ///
    /// `address` and the length of `data` must be multiples of four.
    pub fn write_block(
        &self,
        address: u32,
        data: &[u8],
        attrib: SecurityAttribute,
    ) -> Result<(), Error> {
        self.with_link(|link| link.write_block(link.selected, address, data, attrib))
    }

    /// Check whether memory at `address` holds `data`, without reading it back.
    ///
    /// Returns `Ok(false)` on a mismatch. A bus error is reported as an error.
    pub fn verify_block(
        &self,
        address: u32,
        data: &[u8],
        attrib: SecurityAttribute,
    ) -> Result<bool, Error> {
        self.with_link(|link| link.verify_block(link.selected, address, data, attrib))
    }

    /// Wait until `(word & mask) == expected` for the word at `address`.
    ///
    /// The probe polls the word up to `retries` times. Returns `Ok(false)` if it never matched.
    pub fn wait_for_word(
        &self,
        address: u32,
        mask: u32,
        expected: u32,
        retries: u16,
    ) -> Result<bool, Error> {
        self.with_link(|link| {
            link.wait_for_word(link.selected, address, mask, expected, retries)
        })
    }

    /// Fail if the DP latched a sticky error since the last check.
    pub(crate) fn check_sticky(&self) -> Result<(), Error> {
        self.with_link(|link| link.port.check_sticky())
    }
}

impl<T: Transport> DapAccess for Connection<T> {
    fn read_dp(&self, addr: u8) -> Result<u32, Error> {
        Connection::read_dp(self, addr)
    }

    fn write_dp(&self, addr: u8, value: u32) -> Result<(), Error> {
        Connection::write_dp(self, addr, value)
    }

    fn read_ap(&self, addr: u8) -> Result<u32, Error> {
        Connection::read_ap(self, addr)
    }

    fn write_ap(&self, addr: u8, value: u32) -> Result<(), Error> {
        Connection::write_ap(self, addr, value)
    }

    fn read_word(&self, address: u32) -> Result<u32, Error> {
        Connection::read_word(self, address)
    }

    fn write_word(&self, address: u32, value: u32) -> Result<(), Error> {
        Connection::write_word(self, address, value)
    }

    fn write_block(&self, address: u32, data: &[u8], attrib: SecurityAttribute) -> Result<(), Error> {
        Connection::write_block(self, address, data, attrib)
    }

    fn read_mem(&self, address: u32, data: &mut [u8], attrib: SecurityAttribute) -> Result<(), Error> {
        Connection::read_mem(self, address, data, attrib)
    }

    fn write_mem(&self, address: u32, data: &[u8], attrib: SecurityAttribute) -> Result<(), Error> {
        Connection::write_mem(self, address, data, attrib)
    }
}
