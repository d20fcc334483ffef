//! Detection and recovery of debug access to the target.
//!
//! A connection tracks how much of the debug path is known to work as a
//! [`DebugAccessLevel`]. Detection only ever lowers the level, recovery climbs back up one
//! rung at a time.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::ap::Csw;
use super::communication_interface::Connection;
use super::core_debug::{Demcr, Dhcsr};
use super::dp::{Abort, Ctrl};
use super::{DapAccess, Register};
use crate::error::Error;
use crate::probe::Transport;

/// How far up the debug path access currently works. Levels are ordered, `Normal` being
/// the highest.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    docsplay::Display,
)]
pub enum DebugAccessLevel {
    /// the debug server is gone
    ServerLost,
    /// inactive
    Inactive,
    /// debug port reachable
    DebugPort,
    /// debug port powered
    DebugPower,
    /// access port enabled
    AccessPort,
    /// normal
    Normal,
}

impl DebugAccessLevel {
    fn next(self) -> Self {
        match self {
            DebugAccessLevel::ServerLost => DebugAccessLevel::ServerLost,
            DebugAccessLevel::Inactive => DebugAccessLevel::DebugPort,
            DebugAccessLevel::DebugPort => DebugAccessLevel::DebugPower,
            DebugAccessLevel::DebugPower => DebugAccessLevel::AccessPort,
            DebugAccessLevel::AccessPort | DebugAccessLevel::Normal => DebugAccessLevel::Normal,
        }
    }
}

/// Collaborators outside the debug access path which recovery has to bring back.
///
/// Every method has a default which does nothing. The methods receive the connection as
/// [`DapAccess`] and may use it freely.
pub trait RecoveryHooks: Send + Sync {
    /// Re-enable trace output. Only called while trace is marked active.
    fn restore_trace(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
        Ok(())
    }

    /// Write the shadowed breakpoint unit configuration back to the target.
    fn restore_breakpoints(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
        Ok(())
    }

    /// Write the shadowed watchpoint unit configuration back to the target.
    fn restore_watchpoints(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
        Ok(())
    }

    fn assert_reset(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
        Ok(())
    }

    fn deassert_reset(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
        Ok(())
    }

    /// Runs after a successful recovery, with no connection lock held.
    fn on_recovered(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
        Ok(())
    }

    /// The core was found halted right after a recovery.
    fn on_halted_after_recovery(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
        Ok(())
    }

    fn level_changed(&self, _from: DebugAccessLevel, _to: DebugAccessLevel) {}
}

/// Hooks which do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl RecoveryHooks for NoHooks {}

/// What recovery has to restore besides debug access itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryFlags {
    pub trace_active: bool,
    /// Keep the reset vector catch enabled.
    pub reset_catch: bool,
    /// Reset is asserted and has to be released once the core is back.
    pub under_reset: bool,
}

impl<T: Transport> Connection<T> {
    pub fn level(&self) -> DebugAccessLevel {
        *self.level.lock()
    }

    /// `ServerLost` is never left.
    fn set_level(&self, level: DebugAccessLevel) {
        let previous = {
            let mut current = self.level.lock();
            let previous = *current;
            if previous == DebugAccessLevel::ServerLost {
                return;
            }
            *current = level;
            previous
        };

        if previous != level {
            tracing::debug!("Debug access level {} -> {}", previous, level);
            self.hooks.level_changed(previous, level);
        }
    }

    /// The debug server went away. Nothing works on this connection any more.
    pub fn mark_server_lost(&self) {
        self.set_level(DebugAccessLevel::ServerLost);
    }

    pub fn set_trace_active(&self, active: bool) {
        self.flags.lock().trace_active = active;
    }

    pub fn set_reset_catch(&self, enabled: bool) {
        self.flags.lock().reset_catch = enabled;
    }

    /// Prepare the next recovery.
    ///
    /// With `under_reset` the target is put into reset through the hooks and the connection
    /// drops to [`DebugAccessLevel::Inactive`]. The next recovery releases the reset once
    /// core debug is back.
    pub fn configure_recovery(&self, under_reset: bool) -> Result<(), Error> {
        if self.level() == DebugAccessLevel::ServerLost {
            return Err(Error::ServerLost(None));
        }

        if under_reset {
            self.hooks.assert_reset(self)?;
            self.flags.lock().under_reset = true;
            self.link.lock().borrow_mut().reset();
            self.set_level(DebugAccessLevel::Inactive);
        } else {
            self.flags.lock().under_reset = false;
        }
        Ok(())
    }

    /// Find out how much of the debug path still works, lowering the level if needed.
    ///
    /// Each level is checked with the cheapest access that proves it. A failed check falls
    /// through to the next lower level.
    pub fn detect(&self) -> DebugAccessLevel {
        let _link = self.link.lock();
        let ap = self.config.cpu_ap;
        let mut level = self.level();

        if level == DebugAccessLevel::Normal {
            match self.read_word_on(ap, Dhcsr::ADDRESS) {
                Ok(dhcsr) if Dhcsr::from(dhcsr).c_debugen() => return level,
                Ok(_) => tracing::debug!("Core debug is disabled"),
                Err(error) => tracing::debug!("Reading DHCSR failed: {}", error),
            }
            level = DebugAccessLevel::AccessPort;
        }

        if level == DebugAccessLevel::AccessPort {
            match self.with_link(|link| link.port.read_ap(ap, Csw::ADDRESS)) {
                Ok(csw) if Csw::from(csw).device_en() => {
                    self.set_level(level);
                    return self.level();
                }
                Ok(_) => tracing::debug!("Device access through AP {} is disabled", ap),
                Err(error) => tracing::debug!("Reading CSW failed: {}", error),
            }
            level = DebugAccessLevel::DebugPower;
        }

        if level >= DebugAccessLevel::DebugPort {
            let was_powered = level >= DebugAccessLevel::DebugPower;
            level = match self.read_dp(Ctrl::ADDRESS) {
                Ok(ctrl) if was_powered && Ctrl::from(ctrl).powered_up() => {
                    DebugAccessLevel::DebugPower
                }
                Ok(_) => DebugAccessLevel::DebugPort,
                Err(error) => {
                    tracing::debug!("Debug port is unreachable: {}", error);
                    self.link.lock().borrow_mut().reset();
                    DebugAccessLevel::Inactive
                }
            };
        }

        self.set_level(level);
        self.level()
    }

    /// Climb back to [`DebugAccessLevel::Normal`] from the current level.
    ///
    /// Recoveries are serialized: a caller arriving while another recovery runs waits for
    /// it and finds the connection recovered. A failing rung keeps the level reached so far.
    pub fn recover(&self) -> Result<DebugAccessLevel, Error> {
        let recovery = self.recovery.lock();
        let link = self.link.lock();
        let climbed = self.climb();
        drop(link);
        drop(recovery);

        if climbed? {
            tracing::info!("Debug access recovered");
            if let Err(error) = self.hooks.on_recovered(self) {
                tracing::warn!("Post-recovery hook failed: {}", error);
            }
        }
        Ok(self.level())
    }

    /// Returns whether any rung ran.
    fn climb(&self) -> Result<bool, Error> {
        let mut climbed = false;
        loop {
            let level = self.level();
            let rung = match level {
                DebugAccessLevel::ServerLost => return Err(Error::ServerLost(None)),
                DebugAccessLevel::Normal => return Ok(climbed),
                DebugAccessLevel::Inactive => self.connect_debug_port(),
                DebugAccessLevel::DebugPort => self.power_up_debug_port(),
                DebugAccessLevel::DebugPower => self.enable_access_port(),
                DebugAccessLevel::AccessPort => self.enable_core_debug(),
            };

            if let Err(error) = rung {
                tracing::warn!("Recovery stopped at {}: {}", level, error);
                if let Error::ServerLost(_) = error {
                    self.mark_server_lost();
                }
                return Err(error);
            }
            self.set_level(level.next());
            climbed = true;
        }
    }

    /// Make sure debug access works, recovering it if needed.
    pub fn ensure(&self) -> Result<(), Error> {
        match self.detect() {
            DebugAccessLevel::Normal => return Ok(()),
            DebugAccessLevel::ServerLost => return Err(Error::ServerLost(None)),
            _ => {}
        }

        let level = self.recover()?;
        if level != DebugAccessLevel::Normal {
            return Err(Error::ConnectionInactive(level));
        }

        let dhcsr = Dhcsr::from(self.read_word_on(self.config.cpu_ap, Dhcsr::ADDRESS)?);
        if dhcsr.s_halt() {
            tracing::info!("Core is halted after recovery");
            if let Err(error) = self.hooks.on_halted_after_recovery(self) {
                tracing::warn!("Halted-after-recovery hook failed: {}", error);
            }
        }
        Ok(())
    }

    /// Inactive to DebugPort: line reset or protocol switch, then identify the DP.
    #[tracing::instrument(level = "debug", skip(self))]
    fn connect_debug_port(&self) -> Result<(), Error> {
        self.with_link(|link| {
            link.reset();
            link.port.handshake(&self.config)
        })
        .map(|_| ())
    }

    /// DebugPort to DebugPower: request debug and system power and wait for both.
    #[tracing::instrument(level = "debug", skip(self))]
    fn power_up_debug_port(&self) -> Result<(), Error> {
        let mut ctrl = Ctrl::default();
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_csyspwrupreq(true);
        self.write_dp_register(ctrl.clone())?;

        let start = Instant::now();
        loop {
            let status: Ctrl = self.read_dp_register()?;
            if status.powered_up() {
                break;
            }
            if start.elapsed() >= self.config.power_up_timeout {
                return Err(Error::PowerUpFailed);
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // Normal transfer mode, all byte lanes.
        ctrl.set_mask_lane(0b1111);
        self.write_dp_register(ctrl)?;
        self.write_dp_register(Abort::clear_all_sticky())
    }

    /// DebugPower to AccessPort: select the CPU AP again and check device access.
    #[tracing::instrument(level = "debug", skip(self))]
    fn enable_access_port(&self) -> Result<(), Error> {
        let ap = self.config.cpu_ap;
        self.with_link(|link| {
            link.port.selection.invalidate();
            link.registry.invalidate_csw();

            let csw = Csw::from(link.port.read_ap(ap, Csw::ADDRESS)?);
            if !csw.device_en() {
                return Err(Error::DeviceAccessDisabled(ap));
            }
            link.restore_csw(ap)
        })
    }

    /// AccessPort to Normal: core debug, trace and the debug units.
    #[tracing::instrument(level = "debug", skip(self))]
    fn enable_core_debug(&self) -> Result<(), Error> {
        let ap = self.config.cpu_ap;

        let mut dhcsr = Dhcsr::from(self.read_word_on(ap, Dhcsr::ADDRESS)?);
        if !dhcsr.c_debugen() {
            tracing::info!("Core debug was disabled, enabling it again");
            dhcsr.set_c_debugen(true);
            dhcsr.enable_write();
            self.write_word_on(ap, Dhcsr::ADDRESS, dhcsr.into())?;
        }

        let flags = *self.flags.lock();
        if flags.trace_active || flags.reset_catch {
            let mut demcr = Demcr::from(self.read_word_on(ap, Demcr::ADDRESS)?);
            if flags.trace_active {
                demcr.set_trcena(true);
            }
            if flags.reset_catch {
                demcr.set_vc_corereset(true);
            }
            self.write_word_on(ap, Demcr::ADDRESS, demcr.into())?;
        }

        if flags.trace_active {
            self.hooks.restore_trace(self)?;
        }
        self.hooks.restore_breakpoints(self)?;
        self.hooks.restore_watchpoints(self)?;

        if flags.under_reset {
            self.hooks.deassert_reset(self)?;
            self.flags.lock().under_reset = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::architecture::arm::PortAddress;
    use crate::config::ConnectionConfig;
    use crate::probe::fake_probe::FakeTarget;

    const RAM: u32 = 0x2000_0000;

    /// Hooks which write down what they were asked to do.
    #[derive(Debug, Default, Clone)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        fail_breakpoints: bool,
    }

    impl Recorder {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn clear(&self) {
            self.calls.lock().clear();
        }

        fn levels(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| call.strip_prefix("level ").map(str::to_owned))
                .collect()
        }
    }

    impl RecoveryHooks for Recorder {
        fn restore_trace(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
            self.record("restore_trace");
            Ok(())
        }

        fn restore_breakpoints(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
            self.record("restore_breakpoints");
            if self.fail_breakpoints {
                return Err(anyhow::anyhow!("FPB did not respond").into());
            }
            Ok(())
        }

        fn restore_watchpoints(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
            self.record("restore_watchpoints");
            Ok(())
        }

        fn assert_reset(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
            self.record("assert_reset");
            Ok(())
        }

        fn deassert_reset(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
            self.record("deassert_reset");
            Ok(())
        }

        fn on_recovered(&self, dap: &dyn DapAccess) -> Result<(), Error> {
            let word = dap.read_word(RAM)?;
            self.record(format!("on_recovered {word:#010x}"));
            Ok(())
        }

        fn on_halted_after_recovery(&self, _dap: &dyn DapAccess) -> Result<(), Error> {
            self.record("halted");
            Ok(())
        }

        fn level_changed(&self, _from: DebugAccessLevel, to: DebugAccessLevel) {
            self.record(format!("level {to:?}"));
        }
    }

    fn connect_with(config: ConnectionConfig) -> (FakeTarget, Recorder, Connection<FakeTarget>) {
        let target = FakeTarget::new();
        let hooks = Recorder::default();
        let connection = Connection::with_hooks(target.clone(), config, hooks.clone());
        (target, hooks, connection)
    }

    fn connect() -> (FakeTarget, Recorder, Connection<FakeTarget>) {
        connect_with(ConnectionConfig::default())
    }

    #[test]
    fn levels_are_ordered() {
        assert!(DebugAccessLevel::ServerLost < DebugAccessLevel::Inactive);
        assert!(DebugAccessLevel::DebugPower < DebugAccessLevel::AccessPort);
        assert!(DebugAccessLevel::AccessPort < DebugAccessLevel::Normal);
        assert_eq!(DebugAccessLevel::DebugPower.to_string(), "debug port powered");
    }

    #[test_log::test]
    fn recovery_visits_every_level_once() {
        let (target, hooks, connection) = connect();
        target.lose_link(true);

        assert_eq!(connection.detect(), DebugAccessLevel::Inactive);
        hooks.clear();

        assert_eq!(connection.recover().unwrap(), DebugAccessLevel::Normal);

        assert_eq!(
            hooks.levels(),
            vec!["DebugPort", "DebugPower", "AccessPort", "Normal"]
        );
        assert_eq!(target.swd_switches(), 1);
        assert_eq!(connection.read_word(RAM).unwrap(), 0x0403_0201);
    }

    #[test]
    fn ensure_on_a_healthy_connection_only_detects() {
        let (target, hooks, connection) = connect();

        connection.ensure().unwrap();
        connection.ensure().unwrap();

        assert_eq!(connection.level(), DebugAccessLevel::Normal);
        assert_eq!(target.line_resets(), 0);
        assert_eq!(target.writes_to(PortAddress::Dp(Ctrl::ADDRESS)), 0);
        assert!(hooks.calls().is_empty());
    }

    #[test]
    fn recover_when_normal_runs_no_rung() {
        let (target, hooks, connection) = connect();

        assert_eq!(connection.recover().unwrap(), DebugAccessLevel::Normal);

        assert_eq!(target.submissions(), 0);
        assert!(hooks.calls().is_empty());
    }

    fn core_debug_off(target: &FakeTarget) {
        target.disable_debug();
    }

    fn device_access_off(target: &FakeTarget) {
        target.disable_debug();
        target.set_device_enabled(0, false);
    }

    fn powered_down(target: &FakeTarget) {
        device_access_off(target);
        target.power_down();
    }

    fn link_lost(target: &FakeTarget) {
        target.lose_link(true);
    }

    #[test_case(core_debug_off, DebugAccessLevel::AccessPort; "core debug disabled")]
    #[test_case(device_access_off, DebugAccessLevel::DebugPower; "device access disabled")]
    #[test_case(powered_down, DebugAccessLevel::DebugPort; "debug port powered down")]
    #[test_case(link_lost, DebugAccessLevel::Inactive; "link lost")]
    fn detection_demotes(break_target: fn(&FakeTarget), expected: DebugAccessLevel) {
        let (target, _hooks, connection) = connect();
        break_target(&target);

        assert_eq!(connection.detect(), expected);
        assert_eq!(connection.level(), expected);
    }

    #[test]
    fn detection_never_raises_the_level() {
        let (target, _hooks, connection) = connect();
        target.lose_link(true);
        assert_eq!(connection.detect(), DebugAccessLevel::Inactive);

        let submissions = target.submissions();
        assert_eq!(connection.detect(), DebugAccessLevel::Inactive);
        assert_eq!(target.submissions(), submissions);
    }

    #[test]
    fn recovery_enables_core_debug_and_restores_collaborators() {
        let (target, hooks, connection) = connect();
        connection.set_trace_active(true);
        connection.set_reset_catch(true);
        target.disable_debug();

        connection.ensure().unwrap();

        assert!(target.debug_enabled());
        let demcr = Demcr::from(target.demcr());
        assert!(demcr.trcena());
        assert!(demcr.vc_corereset());

        let calls = hooks.calls();
        let restores: Vec<_> = calls
            .iter()
            .filter(|call| call.starts_with("restore_"))
            .collect();
        assert_eq!(
            restores,
            ["restore_trace", "restore_breakpoints", "restore_watchpoints"]
        );
        assert!(calls.contains(&"on_recovered 0x04030201".to_owned()));
    }

    #[test]
    fn power_up_timeout() {
        let (target, _hooks, connection) = connect_with(ConnectionConfig {
            power_up_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        target.lose_link(true);
        target.power_down();
        target.block_power_up();

        let result = connection.ensure();

        assert!(matches!(result, Err(Error::PowerUpFailed)));
        assert_eq!(connection.level(), DebugAccessLevel::DebugPort);
    }

    #[test]
    fn disabled_device_access_stops_recovery() {
        let (target, _hooks, connection) = connect();
        device_access_off(&target);

        let result = connection.ensure();

        assert!(matches!(result, Err(Error::DeviceAccessDisabled(_))));
        assert_eq!(connection.level(), DebugAccessLevel::DebugPower);
    }

    #[test]
    fn failing_collaborator_keeps_access_port_level() {
        let target = FakeTarget::new();
        let hooks = Recorder {
            fail_breakpoints: true,
            ..Default::default()
        };
        let connection =
            Connection::with_hooks(target.clone(), ConnectionConfig::default(), hooks.clone());
        target.disable_debug();

        let result = connection.ensure();

        assert!(matches!(result, Err(Error::Other(_))));
        assert_eq!(connection.level(), DebugAccessLevel::AccessPort);
        assert!(!hooks.calls().contains(&"restore_watchpoints".to_owned()));
    }

    #[test]
    fn lost_server_is_never_recovered() {
        let (target, _hooks, connection) = connect();
        target.disconnect();

        assert!(matches!(connection.ensure(), Err(Error::ServerLost(_))));
        assert_eq!(connection.level(), DebugAccessLevel::ServerLost);

        assert!(matches!(connection.recover(), Err(Error::ServerLost(None))));
        assert_eq!(connection.detect(), DebugAccessLevel::ServerLost);
        assert!(matches!(
            connection.configure_recovery(true),
            Err(Error::ServerLost(None))
        ));
    }

    #[test]
    fn mark_server_lost_is_terminal() {
        let (_target, hooks, connection) = connect();

        connection.mark_server_lost();

        assert!(matches!(connection.read_word(RAM), Err(Error::ServerLost(None))));
        assert!(matches!(connection.ensure(), Err(Error::ServerLost(None))));
        assert_eq!(hooks.levels(), vec!["ServerLost"]);
    }

    #[test]
    fn halted_core_is_reported_after_recovery() {
        let (target, hooks, connection) = connect();
        target.lose_link(true);
        target.halt();

        connection.ensure().unwrap();

        assert!(hooks.calls().contains(&"halted".to_owned()));
    }

    #[test]
    fn recovery_under_reset() {
        let (target, hooks, connection) = connect();

        connection.configure_recovery(true).unwrap();
        assert_eq!(connection.level(), DebugAccessLevel::Inactive);

        connection.ensure().unwrap();

        let calls = hooks.calls();
        let position = |name: &str| calls.iter().position(|call| call == name).unwrap();
        assert_eq!(position("assert_reset"), 0);
        assert!(position("restore_watchpoints") < position("deassert_reset"));
        assert_eq!(target.swd_switches(), 1);
        assert!(!connection.flags.lock().under_reset);
    }

    #[test]
    fn concurrent_ensure_recovers_once() {
        let (target, _hooks, connection) = connect();
        target.lose_link(true);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| connection.ensure().unwrap());
            }
        });

        assert_eq!(connection.level(), DebugAccessLevel::Normal);
        assert_eq!(target.swd_switches(), 1);
    }
}
