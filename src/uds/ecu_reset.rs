//! Provides methods to reset the ECU

use crate::DiagServerResult;

use super::{UdsCommand, UdsServer};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// ECU reset types. Handled by SID 0x11
pub enum ResetType {
    /// Full power cycle equivalent
    HardReset,
    /// Simulates an ignition off/on cycle
    KeyOffOnReset,
    /// Restarts the application without dropping power
    SoftReset,
    /// Requests a rapid shutdown on the next power off
    EnableRapidPowerShutDown,
    /// Cancels a previously requested rapid shutdown
    DisableRapidPowerShutDown,
}

impl From<ResetType> for u8 {
    fn from(from: ResetType) -> u8 {
        match from {
            ResetType::HardReset => 0x01,
            ResetType::KeyOffOnReset => 0x02,
            ResetType::SoftReset => 0x03,
            ResetType::EnableRapidPowerShutDown => 0x04,
            ResetType::DisableRapidPowerShutDown => 0x05,
        }
    }
}

/// Asks the ECU to perform a reset.
///
/// For [ResetType::EnableRapidPowerShutDown] the ECU reports the time until
/// shutdown in seconds, which is returned; other reset types return None.
pub fn ecu_reset(server: &mut UdsServer, reset_type: ResetType) -> DiagServerResult<Option<u8>> {
    let resp =
        server.execute_command_with_response(UdsCommand::ECUReset, &[reset_type.into()])?;
    if reset_type == ResetType::EnableRapidPowerShutDown {
        Ok(resp.get(2).copied())
    } else {
        Ok(None)
    }
}
