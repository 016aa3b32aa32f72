//! Provides methods for clearing stored diagnostic trouble codes

use crate::DiagServerResult;

use super::{UdsCommand, UdsServer};

/// Group selector covering every stored DTC
pub const ALL_DTC_GROUPS: u32 = 0x00FF_FFFF;

/// Clears the diagnostic information for a DTC group.
///
/// The group is a 24 bit selector; [ALL_DTC_GROUPS] wipes everything.
pub fn clear_diagnostic_information(server: &mut UdsServer, group: u32) -> DiagServerResult<()> {
    let bytes = group.to_be_bytes();
    server
        .execute_command_with_response(
            UdsCommand::ClearDiagnosticInformation,
            &[bytes[1], bytes[2], bytes[3]],
        )
        .map(|_| ())
}
