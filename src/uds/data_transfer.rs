//! Provides the ECU reprogramming transfer sequence (SIDs 0x34, 0x36, 0x37)
//!
//! The full sequence is RequestDownload, a TransferData loop with a wrapping
//! one byte block counter, RequestTransferExit, then a verification routine.
//! Any negative response aborts the sequence and surfaces the failure.

use crate::{DiagError, DiagServerResult};

use super::routine_control::{self, ROUTINE_CHECK_PROGRAMMING};
use super::{UdsCommand, UdsServer};

/// Announces a download of `size` bytes to `address` on the ECU.
///
/// Returns the largest block the ECU will accept per TransferData request
/// (the number of payload bytes, excluding SID and counter).
pub fn request_download(
    server: &mut UdsServer,
    address: u32,
    size: u32,
) -> DiagServerResult<usize> {
    // dataFormat 0x00 (no compression or encryption), 4 byte address and
    // 4 byte size fields
    let mut payload = vec![0x00, 0x44];
    payload.extend_from_slice(&address.to_be_bytes());
    payload.extend_from_slice(&size.to_be_bytes());
    let resp = server.execute_command_with_response(UdsCommand::RequestDownload, &payload)?;
    if resp.len() < 3 {
        return Err(DiagError::InvalidResponseLength);
    }
    // lengthFormatIdentifier: high nibble is the byte count of the
    // maxNumberOfBlockLength field that follows
    let len_bytes = (resp[1] >> 4) as usize;
    if len_bytes == 0 || len_bytes > 4 || resp.len() < 2 + len_bytes {
        return Err(DiagError::InvalidResponseLength);
    }
    let mut max_block = 0usize;
    for &b in &resp[2..2 + len_bytes] {
        max_block = (max_block << 8) | b as usize;
    }
    if max_block <= 2 {
        return Err(DiagError::ParameterInvalid);
    }
    // The reported length includes SID and block counter
    Ok(max_block - 2)
}

/// Sends one block of a download.
///
/// `block_counter` starts at 1 for the first block and wraps 255 -> 1.
pub fn transfer_data(
    server: &mut UdsServer,
    block_counter: u8,
    data: &[u8],
) -> DiagServerResult<()> {
    let mut payload = Vec::with_capacity(data.len() + 1);
    payload.push(block_counter);
    payload.extend_from_slice(data);
    let resp = server.execute_command_with_response(UdsCommand::TransferData, &payload)?;
    if resp.len() < 2 {
        return Err(DiagError::InvalidResponseLength);
    }
    if resp[1] != block_counter {
        log::error!(
            "block counter echo mismatch: sent {}, ECU echoed {}",
            block_counter,
            resp[1]
        );
        return Err(DiagError::WrongMessage);
    }
    Ok(())
}

/// Finishes the download.
pub fn request_transfer_exit(server: &mut UdsServer) -> DiagServerResult<()> {
    server
        .execute_command_with_response(UdsCommand::RequestTransferExit, &[])
        .map(|_| ())
}

/// Advances the wrapping block sequence counter: 1, 2, .. 255, 1, ..
pub fn next_block_counter(counter: u8) -> u8 {
    if counter == 255 {
        1
    } else {
        counter + 1
    }
}

/// Runs the complete download sequence for one image, verifying with the
/// programming check routine afterwards.
pub fn download(
    server: &mut UdsServer,
    address: u32,
    image: &[u8],
) -> DiagServerResult<()> {
    if image.is_empty() {
        return Err(DiagError::ParameterInvalid);
    }
    let block_len = request_download(server, address, image.len() as u32)?;
    let mut counter = 1u8;
    for chunk in image.chunks(block_len) {
        transfer_data(server, counter, chunk)?;
        counter = next_block_counter(counter);
    }
    request_transfer_exit(server)?;
    routine_control::start_routine(server, ROUTINE_CHECK_PROGRAMMING, &[])?;
    Ok(())
}
