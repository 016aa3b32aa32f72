//! Provides methods to start, stop and query ECU routines (SID 0x31)

use crate::{DiagError, DiagServerResult};

use super::{UdsCommand, UdsServer};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// RoutineControl sub-functions
pub enum RoutineControlType {
    /// Starts the routine
    Start,
    /// Stops the routine
    Stop,
    /// Queries the routine's results
    RequestResults,
}

impl From<RoutineControlType> for u8 {
    fn from(from: RoutineControlType) -> u8 {
        match from {
            RoutineControlType::Start => 0x01,
            RoutineControlType::Stop => 0x02,
            RoutineControlType::RequestResults => 0x03,
        }
    }
}

/// Routine id conventionally used for erasing flash memory
pub const ROUTINE_ERASE_MEMORY: u16 = 0xFF00;
/// Routine id conventionally used to verify a programmed block
pub const ROUTINE_CHECK_PROGRAMMING: u16 = 0x0202;

fn routine_op(
    server: &mut UdsServer,
    op: RoutineControlType,
    routine_id: u16,
    args: &[u8],
) -> DiagServerResult<Vec<u8>> {
    let id = routine_id.to_be_bytes();
    let mut payload = Vec::with_capacity(3 + args.len());
    payload.push(op.into());
    payload.extend_from_slice(&id);
    payload.extend_from_slice(args);
    let mut resp = server.execute_command_with_response(UdsCommand::RoutineControl, &payload)?;
    if resp.len() < 4 {
        return Err(DiagError::InvalidResponseLength);
    }
    if resp[2] != id[0] || resp[3] != id[1] {
        return Err(DiagError::WrongMessage);
    }
    // Remaining bytes are the routine status record
    resp.drain(0..4);
    Ok(resp)
}

/// Starts a routine; returns the routine status record.
pub fn start_routine(
    server: &mut UdsServer,
    routine_id: u16,
    args: &[u8],
) -> DiagServerResult<Vec<u8>> {
    routine_op(server, RoutineControlType::Start, routine_id, args)
}

/// Stops a routine; returns the routine status record.
pub fn stop_routine(
    server: &mut UdsServer,
    routine_id: u16,
    args: &[u8],
) -> DiagServerResult<Vec<u8>> {
    routine_op(server, RoutineControlType::Stop, routine_id, args)
}

/// Queries a routine's results.
pub fn request_routine_results(
    server: &mut UdsServer,
    routine_id: u16,
) -> DiagServerResult<Vec<u8>> {
    routine_op(server, RoutineControlType::RequestResults, routine_id, &[])
}
