//! Module for common diagnostic trouble code data

use bitflags::bitflags;

/// System area a trouble code belongs to, encoded in the top two bits of
/// its first byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display)]
pub enum DtcCategory {
    /// Powertrain (P)
    #[strum(serialize = "P")]
    Powertrain,
    /// Chassis (C)
    #[strum(serialize = "C")]
    Chassis,
    /// Body (B)
    #[strum(serialize = "B")]
    Body,
    /// Network / communication (U)
    #[strum(serialize = "U")]
    Network,
}

impl DtcCategory {
    fn from_high_bits(byte: u8) -> Self {
        match (byte >> 6) & 0x3 {
            0 => Self::Powertrain,
            1 => Self::Chassis,
            2 => Self::Body,
            _ => Self::Network,
        }
    }
}

bitflags! {
    /// ISO 14229 DTC status byte
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DtcStatus: u8 {
        /// Most recent test of this DTC failed
        const TEST_FAILED = 0x01;
        /// Failed at some point in the current monitoring cycle
        const TEST_FAILED_THIS_CYCLE = 0x02;
        /// Failure seen but not yet confirmed
        const PENDING = 0x04;
        /// Failure confirmed and stored
        const CONFIRMED = 0x08;
        /// Test has not completed since DTCs were last cleared
        const NOT_COMPLETED_SINCE_CLEAR = 0x10;
        /// Test failed at least once since DTCs were last cleared
        const FAILED_SINCE_CLEAR = 0x20;
        /// Test has not completed in the current monitoring cycle
        const NOT_COMPLETED_THIS_CYCLE = 0x40;
        /// ECU is requesting the warning lamp
        const WARNING_INDICATOR = 0x80;
    }
}

/// One decoded diagnostic trouble code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dtc {
    /// System area
    pub category: DtcCategory,
    /// Display code, e.g. `P0171`
    pub code: String,
    /// The raw bytes as the ECU reported them
    pub raw: u32,
    /// Status byte, when the record carried one
    pub status: DtcStatus,
}

impl Dtc {
    /// Decodes a 3-byte DTC record without status.
    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        let category = DtcCategory::from_high_bits(bytes[0]);
        Self {
            category,
            code: format!("{}{:02X}{:02X}", category, bytes[0] & 0x3F, bytes[1]),
            raw: u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]),
            status: DtcStatus::empty(),
        }
    }

    /// Decodes a 4-byte record: 3 code bytes followed by the status byte,
    /// the layout of ISO 14229 ReadDTCInformation responses.
    pub fn from_record(bytes: [u8; 4]) -> Self {
        let mut dtc = Self::from_bytes([bytes[0], bytes[1], bytes[2]]);
        dtc.status = DtcStatus::from_bits_truncate(bytes[3]);
        dtc
    }

    /// True when the failure is confirmed and stored
    pub fn is_confirmed(&self) -> bool {
        self.status.contains(DtcStatus::CONFIRMED)
    }

    /// True when the ECU wants the warning lamp lit for this code
    pub fn warning_indicator_requested(&self) -> bool {
        self.status.contains(DtcStatus::WARNING_INDICATOR)
    }
}

impl std::fmt::Display for Dtc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_classic_lean_code() {
        // P0171: system too lean, bank 1
        let dtc = Dtc::from_bytes([0x01, 0x71, 0x00]);
        assert_eq!(dtc.category, DtcCategory::Powertrain);
        assert_eq!(dtc.code, "P0171");
    }

    #[test]
    fn category_comes_from_the_top_bits() {
        assert_eq!(Dtc::from_bytes([0x01, 0, 0]).category, DtcCategory::Powertrain);
        assert_eq!(Dtc::from_bytes([0x41, 0, 0]).category, DtcCategory::Chassis);
        assert_eq!(Dtc::from_bytes([0x81, 0, 0]).category, DtcCategory::Body);
        assert_eq!(Dtc::from_bytes([0xC1, 0, 0]).category, DtcCategory::Network);
    }

    #[test]
    fn network_code_formats_with_u_prefix() {
        let dtc = Dtc::from_bytes([0xC1, 0x00, 0x00]);
        assert_eq!(dtc.code, "U0100");
    }

    #[test]
    fn status_byte_bits_decode() {
        let dtc = Dtc::from_record([0x01, 0x71, 0x00, 0x2F]);
        assert!(dtc.status.contains(DtcStatus::TEST_FAILED));
        assert!(dtc.status.contains(DtcStatus::PENDING));
        assert!(dtc.is_confirmed());
        assert!(dtc.status.contains(DtcStatus::FAILED_SINCE_CLEAR));
        assert!(!dtc.warning_indicator_requested());
    }
}
