//! Provides methods for reading and writing values by their 16 bit data
//! identifier (SIDs 0x22 and 0x2E)

use crate::{DiagError, DiagServerResult};

use super::{UdsCommand, UdsServer};

/// Data identifier of the vehicle identification number
pub const DID_VIN: u16 = 0xF190;
/// Data identifier of the active diagnostic session
pub const DID_ACTIVE_SESSION: u16 = 0xF186;

/// Reads a value by its data identifier.
///
/// The positive response is checked to echo the requested identifier; the
/// returned bytes are the record content with SID and DID stripped.
pub fn read_data_by_identifier(server: &mut UdsServer, did: u16) -> DiagServerResult<Vec<u8>> {
    let id = did.to_be_bytes();
    let mut resp =
        server.execute_command_with_response(UdsCommand::ReadDataByIdentifier, &[id[0], id[1]])?;
    if resp.len() < 3 {
        return Err(DiagError::InvalidResponseLength);
    }
    if resp[1] != id[0] || resp[2] != id[1] {
        return Err(DiagError::WrongMessage);
    }
    resp.drain(0..3);
    Ok(resp)
}

/// Writes a record to a data identifier.
pub fn write_data_by_identifier(
    server: &mut UdsServer,
    did: u16,
    record: &[u8],
) -> DiagServerResult<()> {
    let id = did.to_be_bytes();
    let mut payload = Vec::with_capacity(record.len() + 2);
    payload.extend_from_slice(&id);
    payload.extend_from_slice(record);
    let resp = server.execute_command_with_response(UdsCommand::WriteDataByIdentifier, &payload)?;
    if resp.len() < 3 {
        return Err(DiagError::InvalidResponseLength);
    }
    if resp[1] != id[0] || resp[2] != id[1] {
        return Err(DiagError::WrongMessage);
    }
    Ok(())
}

/// Reads the vehicle identification number.
pub fn read_vin(server: &mut UdsServer) -> DiagServerResult<String> {
    let raw = read_data_by_identifier(server, DID_VIN)?;
    if raw.len() != 17 {
        log::warn!("VIN record is {} bytes, expected 17", raw.len());
    }
    Ok(raw.iter().map(|&b| b as char).collect())
}
