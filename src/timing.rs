//! Protocol timing parameters.
//!
//! Defaults follow the J2534 parameter set; a handful of vehicle profiles
//! carry the manufacturer deviations that matter in practice. Values are
//! applied to a channel when it is created and can be adjusted afterwards
//! through the channel manager's parameter interface.

use crate::passthru::Protocol;

/// Identifier of a tunable channel parameter, numbered like the J2534
/// GET_CONFIG/SET_CONFIG parameter ids.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::FromRepr)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum TimingParam {
    DataRate = 0x01,
    P1Max = 0x07,
    P2Min = 0x08,
    P2Max = 0x09,
    P3Min = 0x0A,
    P3Max = 0x0B,
    P4Max = 0x0D,
    W1 = 0x0E,
    W2 = 0x0F,
    W3 = 0x10,
    W4 = 0x11,
    W5 = 0x12,
    T1Max = 0x13,
    T2Max = 0x14,
    T4Max = 0x15,
    T5Max = 0x16,
    Iso15765BlockSize = 0x1E,
    Iso15765StMin = 0x1F,
    Iso15765WaitFramesMax = 0x24,
}

/// The full timing table of one channel. All values in milliseconds unless
/// the field name says otherwise.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimingParams {
    /// Response start window
    pub p1_max_ms: u32,
    /// Tester idle time before a response may start
    pub p2_min_ms: u32,
    /// Maximum response delay
    pub p2_max_ms: u32,
    /// Extended response delay applied after NRC 0x78
    pub p2_star_max_ms: u32,
    /// Minimum gap between requests
    pub p3_min_ms: u32,
    /// Maximum gap between requests; doubles as the session idle timeout
    pub p3_max_ms: u32,
    /// Maximum intra-transfer gap
    pub p4_max_ms: u32,
    /// ISO 9141 K-line timing W1-W5
    pub w_ms: [u32; 5],
    /// J1850 timing T1-T5 maxima
    pub t_max_ms: [u32; 5],
    /// ISO 15765 inter-consecutive-frame separation (raw STmin byte)
    pub st_min: u8,
    /// ISO 15765 flow control block size
    pub block_size: u8,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            p1_max_ms: 20,
            p2_min_ms: 25,
            p2_max_ms: 50,
            p2_star_max_ms: 5000,
            p3_min_ms: 55,
            p3_max_ms: 5000,
            p4_max_ms: 20,
            w_ms: [300, 20, 25, 50, 300],
            t_max_ms: [5000, 10000, 10000, 10000, 10000],
            st_min: 0,
            block_size: 0,
        }
    }
}

impl TimingParams {
    /// The default timing table for a protocol.
    pub fn defaults_for(_protocol: Protocol) -> Self {
        // The J2534 defaults are shared across protocols; the K-line and
        // J1850 entries are simply unused on CAN-based channels.
        Self::default()
    }

    /// Reads a parameter by its J2534 id.
    pub fn get(&self, param: TimingParam) -> u32 {
        match param {
            TimingParam::DataRate => 0,
            TimingParam::P1Max => self.p1_max_ms,
            TimingParam::P2Min => self.p2_min_ms,
            TimingParam::P2Max => self.p2_max_ms,
            TimingParam::P3Min => self.p3_min_ms,
            TimingParam::P3Max => self.p3_max_ms,
            TimingParam::P4Max => self.p4_max_ms,
            TimingParam::W1 => self.w_ms[0],
            TimingParam::W2 => self.w_ms[1],
            TimingParam::W3 => self.w_ms[2],
            TimingParam::W4 => self.w_ms[3],
            TimingParam::W5 => self.w_ms[4],
            TimingParam::T1Max => self.t_max_ms[0],
            TimingParam::T2Max => self.t_max_ms[1],
            TimingParam::T4Max => self.t_max_ms[3],
            TimingParam::T5Max => self.t_max_ms[4],
            TimingParam::Iso15765BlockSize => self.block_size as u32,
            TimingParam::Iso15765StMin => self.st_min as u32,
            TimingParam::Iso15765WaitFramesMax => 4,
        }
    }

    /// Writes a parameter by its J2534 id. Returns false for read-only or
    /// unknown parameters.
    pub fn set(&mut self, param: TimingParam, value: u32) -> bool {
        match param {
            TimingParam::P1Max => self.p1_max_ms = value,
            TimingParam::P2Min => self.p2_min_ms = value,
            TimingParam::P2Max => self.p2_max_ms = value,
            TimingParam::P3Min => self.p3_min_ms = value,
            TimingParam::P3Max => self.p3_max_ms = value,
            TimingParam::P4Max => self.p4_max_ms = value,
            TimingParam::W1 => self.w_ms[0] = value,
            TimingParam::W2 => self.w_ms[1] = value,
            TimingParam::W3 => self.w_ms[2] = value,
            TimingParam::W4 => self.w_ms[3] = value,
            TimingParam::W5 => self.w_ms[4] = value,
            TimingParam::T1Max => self.t_max_ms[0] = value,
            TimingParam::T2Max => self.t_max_ms[1] = value,
            TimingParam::T4Max => self.t_max_ms[3] = value,
            TimingParam::T5Max => self.t_max_ms[4] = value,
            TimingParam::Iso15765BlockSize => self.block_size = value as u8,
            TimingParam::Iso15765StMin => self.st_min = value as u8,
            _ => return false,
        }
        true
    }
}

/// Manufacturer-specific timing deviations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum VehicleProfile {
    /// BMW group
    Bmw,
    /// Mercedes-Benz
    Mercedes,
    /// VW / Audi / Porsche
    VagGroup,
}

impl VehicleProfile {
    /// Overlays this profile's deviations for `protocol` onto a timing table.
    pub fn apply(&self, protocol: Protocol, params: &mut TimingParams) {
        match (self, protocol) {
            (VehicleProfile::Bmw, Protocol::Iso15765) => {
                params.block_size = 8;
                params.st_min = 20;
            }
            (VehicleProfile::Mercedes, Protocol::Iso15765) => {
                params.block_size = 16;
                params.st_min = 10;
            }
            (VehicleProfile::VagGroup, Protocol::Iso15765) => {
                params.block_size = 0;
                params.st_min = 5;
            }
            (VehicleProfile::Bmw, Protocol::Iso14230) => {
                params.p2_max_ms = 100;
                params.p3_max_ms = 10000;
            }
            (VehicleProfile::Mercedes, Protocol::Iso14230) => {
                params.p2_min_ms = 50;
                params.p2_max_ms = 150;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_j2534_table() {
        let t = TimingParams::default();
        assert_eq!(t.p1_max_ms, 20);
        assert_eq!(t.p2_max_ms, 50);
        assert_eq!(t.p2_star_max_ms, 5000);
        assert_eq!(t.p3_max_ms, 5000);
        assert_eq!(t.w_ms, [300, 20, 25, 50, 300]);
        assert_eq!(t.block_size, 0);
        assert_eq!(t.st_min, 0);
    }

    #[test]
    fn bmw_can_profile_tightens_flow_control() {
        let mut t = TimingParams::defaults_for(Protocol::Iso15765);
        VehicleProfile::Bmw.apply(Protocol::Iso15765, &mut t);
        assert_eq!(t.block_size, 8);
        assert_eq!(t.st_min, 20);
        // KWP overrides must not leak onto a CAN channel
        assert_eq!(t.p2_max_ms, 50);
    }

    #[test]
    fn mercedes_kwp_profile_stretches_response_window() {
        let mut t = TimingParams::defaults_for(Protocol::Iso14230);
        VehicleProfile::Mercedes.apply(Protocol::Iso14230, &mut t);
        assert_eq!(t.p2_min_ms, 50);
        assert_eq!(t.p2_max_ms, 150);
    }

    #[test]
    fn params_round_trip_through_ioctl_ids() {
        let mut t = TimingParams::default();
        assert!(t.set(TimingParam::Iso15765BlockSize, 16));
        assert_eq!(t.get(TimingParam::Iso15765BlockSize), 16);
        assert!(t.set(TimingParam::P2Max, 150));
        assert_eq!(t.get(TimingParam::P2Max), 150);
        assert!(!t.set(TimingParam::DataRate, 1));
    }
}
