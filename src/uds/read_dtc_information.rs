//! Provides methods to read and query DTCs on the ECU (SID 0x19)

use crate::dtc::Dtc;
use crate::{DiagError, DiagServerResult};

use super::{UdsCommand, UdsServer};

#[derive(Debug, Copy, Clone)]
#[repr(u8)]
/// ReadDTCInformation sub-function definitions
pub enum DtcSubFunction {
    /// Takes a 1 byte DTCStatusMask, returns a count
    ReportNumberOfDTCByStatusMask = 0x01,
    /// Takes a 1 byte DTCStatusMask, returns the matching DTC records
    ReportDTCByStatusMask = 0x02,
    /// No arguments; returns every DTC the ECU can report
    ReportSupportedDTC = 0x0A,
    /// No arguments; returns the first DTC that failed since last clear
    ReportFirstTestFailedDTC = 0x0B,
    /// No arguments; returns DTCs with permanent status
    ReportDTCWithPermanentStatus = 0x15,
}

/// Returns the number of DTCs matching the status mask, together with the
/// status availability mask the ECU supports.
pub fn get_number_of_dtcs_by_status_mask(
    server: &mut UdsServer,
    status_mask: u8,
) -> DiagServerResult<(u8, u16)> {
    let resp = server.execute_command_with_response(
        UdsCommand::ReadDTCInformation,
        &[DtcSubFunction::ReportNumberOfDTCByStatusMask as u8, status_mask],
    )?;
    if resp.len() != 6 {
        return Err(DiagError::InvalidResponseLength);
    }
    Ok((resp[2], u16::from_be_bytes([resp[4], resp[5]])))
}

/// Returns the DTCs stored on the ECU matching the status mask.
pub fn get_dtcs_by_status_mask(
    server: &mut UdsServer,
    status_mask: u8,
) -> DiagServerResult<Vec<Dtc>> {
    let mut resp = server.execute_command_with_response(
        UdsCommand::ReadDTCInformation,
        &[DtcSubFunction::ReportDTCByStatusMask as u8, status_mask],
    )?;
    if resp.len() < 3 {
        return Err(DiagError::InvalidResponseLength);
    }
    // SID, sub-function echo and availability mask precede the records
    resp.drain(0..3);
    if resp.len() % 4 != 0 {
        return Err(DiagError::InvalidResponseLength);
    }
    Ok(resp
        .chunks_exact(4)
        .map(|c| Dtc::from_record([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Returns every DTC the ECU knows how to report.
pub fn get_supported_dtcs(server: &mut UdsServer) -> DiagServerResult<Vec<Dtc>> {
    let mut resp = server.execute_command_with_response(
        UdsCommand::ReadDTCInformation,
        &[DtcSubFunction::ReportSupportedDTC as u8],
    )?;
    if resp.len() < 3 {
        return Err(DiagError::InvalidResponseLength);
    }
    resp.drain(0..3);
    if resp.len() % 4 != 0 {
        return Err(DiagError::InvalidResponseLength);
    }
    Ok(resp
        .chunks_exact(4)
        .map(|c| Dtc::from_record([c[0], c[1], c[2], c[3]]))
        .collect())
}
