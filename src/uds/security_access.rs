//! Provides methods for the seed/key security access handshake (SID 0x27)
//!
//! The key derivation is manufacturer specific and never ships with this
//! crate; callers plug their algorithm in through [SecurityAlgorithm].

use std::time::Duration;

use crate::{DiagError, DiagServerResult};

use super::{UdsCommand, UdsServer};

/// Lockout applied locally after the ECU reports exceeded attempts or an
/// unexpired time delay, so we stop hammering it
const LOCKOUT: Duration = Duration::from_secs(10);

/// Computes the key for a security seed.
///
/// `level` is the odd requestSeed sub-function the seed was obtained with.
pub trait SecurityAlgorithm: Send + Sync {
    /// Derives the key to send back for `seed`
    fn compute_key(&self, seed: &[u8], level: u8) -> Vec<u8>;
}

impl<F> SecurityAlgorithm for F
where
    F: Fn(&[u8], u8) -> Vec<u8> + Send + Sync,
{
    fn compute_key(&self, seed: &[u8], level: u8) -> Vec<u8> {
        self(seed, level)
    }
}

fn check_level(level: u8) -> DiagServerResult<()> {
    if level % 2 == 0 || level == 0 {
        // Seed requests use the odd sub-function; the matching key send is
        // level + 1
        return Err(DiagError::ParameterInvalid);
    }
    Ok(())
}

/// Requests a security seed from the ECU.
///
/// Returns the raw seed bytes. A seed of all zeroes conventionally means
/// the level is already unlocked.
pub fn request_seed(server: &mut UdsServer, level: u8) -> DiagServerResult<Vec<u8>> {
    check_level(level)?;
    if let Some(remaining) = server.security_lockout_remaining() {
        log::warn!(
            "security access locked for another {} ms",
            remaining.as_millis()
        );
        return Err(DiagError::SecurityDenied { code: 0x37 });
    }
    let mut resp = guarded(server, |s| {
        s.execute_command_with_response(UdsCommand::SecurityAccess, &[level])
    })?;
    resp.drain(0..2); // SID and sub-function echo, the seed remains
    Ok(resp)
}

/// Sends the computed key for `level` back to the ECU.
///
/// On success the server records the granted security level.
pub fn send_key(server: &mut UdsServer, level: u8, key: &[u8]) -> DiagServerResult<()> {
    check_level(level)?;
    let mut payload = Vec::with_capacity(key.len() + 1);
    payload.push(level + 1);
    payload.extend_from_slice(key);
    guarded(server, |s| {
        s.execute_command_with_response(UdsCommand::SecurityAccess, &payload)
    })?;
    server.grant_security_level(level);
    Ok(())
}

/// Runs the complete two-step handshake for `level` using the supplied
/// key derivation.
pub fn unlock(
    server: &mut UdsServer,
    level: u8,
    algorithm: &dyn SecurityAlgorithm,
) -> DiagServerResult<()> {
    let seed = request_seed(server, level)?;
    if seed.iter().all(|&b| b == 0) {
        log::debug!("zero seed, level {level} already unlocked");
        server.grant_security_level(level);
        return Ok(());
    }
    let key = algorithm.compute_key(&seed, level);
    send_key(server, level, &key)
}

/// Runs a security exchange, folding the security specific NRCs into the
/// server's retry/lockout bookkeeping.
fn guarded(
    server: &mut UdsServer,
    f: impl FnOnce(&mut UdsServer) -> DiagServerResult<Vec<u8>>,
) -> DiagServerResult<Vec<u8>> {
    match f(server) {
        Err(DiagError::ECUError { code, def }) => {
            server.note_security_nrc(code, LOCKOUT);
            match code {
                0x36 | 0x37 => Err(DiagError::SecurityDenied { code }),
                _ => Err(DiagError::ECUError { code, def }),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_levels_are_rejected_before_the_wire() {
        assert!(check_level(2).is_err());
        assert!(check_level(0).is_err());
        assert!(check_level(1).is_ok());
        assert!(check_level(3).is_ok());
    }

    #[test]
    fn closures_are_algorithms() {
        let alg = |seed: &[u8], _level: u8| seed.iter().map(|b| b ^ 0xA5).collect::<Vec<u8>>();
        assert_eq!(alg.compute_key(&[0x00, 0xFF], 1), vec![0xA5, 0x5A]);
    }
}
