//! ISO-TP protocol control information (PCI) codec.
//!
//! The first byte of every ISO-TP CAN frame carries the frame type in its
//! upper nibble. Everything in here is pure; both the threaded link driver
//! and the channel manager's auto flow-control responder share this codec.

use std::time::Duration;

use super::{FramingError, FramingResult};

/// Upper-nibble frame type of an ISO-TP frame
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum FrameKind {
    /// Single frame, whole payload in one CAN frame
    Single,
    /// First frame of a segmented transfer
    First,
    /// Consecutive frame of a segmented transfer
    Consecutive,
    /// Flow control frame
    FlowControl,
}

/// Flow status nibble of a flow control frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlowStatus {
    /// Receiver is ready, continue sending
    ContinueToSend,
    /// Receiver needs more time, re-arm the flow control timer
    Wait,
    /// Receiver cannot take the announced payload, abort the transfer
    Overflow,
}

/// Decoded flow control frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlowControl {
    /// Flow status
    pub status: FlowStatus,
    /// Number of consecutive frames allowed before the next flow control.
    /// 0 means the whole remainder may be sent without further handshakes.
    pub block_size: u8,
    /// Raw STmin byte as found on the wire
    pub st_min: u8,
}

impl FlowControl {
    /// A continue-to-send frame with the given window parameters
    pub fn cts(block_size: u8, st_min: u8) -> Self {
        Self {
            status: FlowStatus::ContinueToSend,
            block_size,
            st_min,
        }
    }

    /// An overflow/abort frame
    pub fn overflow() -> Self {
        Self {
            status: FlowStatus::Overflow,
            block_size: 0,
            st_min: 0,
        }
    }

    /// Serializes into the 3 significant PCI bytes (caller pads to 8)
    pub fn to_bytes(self) -> [u8; 3] {
        let fs = match self.status {
            FlowStatus::ContinueToSend => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
        };
        [0x30 | fs, self.block_size, self.st_min]
    }
}

/// One decoded ISO-TP frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pci {
    /// Single frame; `data` is the complete payload
    Single {
        /// Payload carried in this frame
        data: Vec<u8>,
    },
    /// First frame of a multi-frame transfer
    First {
        /// Total transfer length announced by the sender
        length: u32,
        /// Payload bytes carried in this frame
        data: Vec<u8>,
    },
    /// Consecutive frame
    Consecutive {
        /// Sequence number 0..15
        sn: u8,
        /// Up to 7 payload bytes (trailing padding included; the reassembler
        /// truncates at the announced length)
        data: Vec<u8>,
    },
    /// Flow control frame
    FlowControl(FlowControl),
}

/// Decodes the STmin byte into the minimum gap between consecutive frames.
///
/// 0x00-0x7F are milliseconds, 0xF1-0xF9 are 100-900 microseconds. All other
/// values are reserved and interpreted as no separation.
pub fn decode_st_min(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw - 0xF0) as u64 * 100),
        _ => Duration::ZERO,
    }
}

/// Decodes one raw CAN frame payload into its PCI header.
pub fn decode(data: &[u8]) -> FramingResult<Pci> {
    let pci = *data
        .first()
        .ok_or_else(|| FramingError::ProtocolError("empty CAN frame".into()))?;
    match pci >> 4 {
        0x0 => {
            let len = (pci & 0x0F) as usize;
            if data.len() < len + 1 {
                return Err(FramingError::Truncated);
            }
            Ok(Pci::Single {
                data: data[1..=len].to_vec(),
            })
        }
        0x1 => {
            if data.len() < 8 {
                return Err(FramingError::Truncated);
            }
            let short_len = (((pci & 0x0F) as u32) << 8) | data[1] as u32;
            if short_len == 0 {
                // Escape sequence: 32 bit length follows, two data bytes remain
                let length = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
                Ok(Pci::First {
                    length,
                    data: data[6..8].to_vec(),
                })
            } else {
                Ok(Pci::First {
                    length: short_len,
                    data: data[2..8].to_vec(),
                })
            }
        }
        0x2 => Ok(Pci::Consecutive {
            sn: pci & 0x0F,
            data: data[1..].to_vec(),
        }),
        0x3 => {
            if data.len() < 3 {
                return Err(FramingError::Truncated);
            }
            let status = match pci & 0x0F {
                0 => FlowStatus::ContinueToSend,
                1 => FlowStatus::Wait,
                2 => FlowStatus::Overflow,
                other => {
                    return Err(FramingError::ProtocolError(format!(
                        "reserved flow status 0x{:X}",
                        other
                    )))
                }
            };
            Ok(Pci::FlowControl(FlowControl {
                status,
                block_size: data[1],
                st_min: data[2],
            }))
        }
        other => Err(FramingError::ProtocolError(format!(
            "reserved PCI type 0x{:X}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_decodes() {
        let pci = decode(&[0x03, 0x22, 0xF1, 0x90, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(
            pci,
            Pci::Single {
                data: vec![0x22, 0xF1, 0x90]
            }
        );
    }

    #[test]
    fn first_frame_decodes_length() {
        // 0x14 = 20 bytes total, VIN read response
        let pci = decode(&[0x10, 0x14, 0x62, 0xF1, 0x90, 0x57, 0x30, 0x4C]).unwrap();
        assert_eq!(
            pci,
            Pci::First {
                length: 20,
                data: vec![0x62, 0xF1, 0x90, 0x57, 0x30, 0x4C]
            }
        );
    }

    #[test]
    fn escaped_first_frame_decodes_32bit_length() {
        let pci = decode(&[0x10, 0x00, 0x00, 0x01, 0x00, 0x00, 0xAA, 0xBB]).unwrap();
        assert_eq!(
            pci,
            Pci::First {
                length: 0x10000,
                data: vec![0xAA, 0xBB]
            }
        );
    }

    #[test]
    fn flow_control_round_trips() {
        let fc = FlowControl::cts(8, 20);
        let bytes = fc.to_bytes();
        let mut frame = [0u8; 8];
        frame[..3].copy_from_slice(&bytes);
        assert_eq!(decode(&frame).unwrap(), Pci::FlowControl(fc));
    }

    #[test]
    fn st_min_bands() {
        assert_eq!(decode_st_min(0x00), Duration::ZERO);
        assert_eq!(decode_st_min(0x7F), Duration::from_millis(127));
        assert_eq!(decode_st_min(0xF1), Duration::from_micros(100));
        assert_eq!(decode_st_min(0xF9), Duration::from_micros(900));
        // Reserved band collapses to zero
        assert_eq!(decode_st_min(0x80), Duration::ZERO);
        assert_eq!(decode_st_min(0xF0), Duration::ZERO);
        assert_eq!(decode_st_min(0xFF), Duration::ZERO);
    }

    #[test]
    fn truncated_single_frame_rejected() {
        assert!(matches!(
            decode(&[0x05, 0x01, 0x02]),
            Err(FramingError::Truncated)
        ));
    }

    #[test]
    fn reserved_pci_type_rejected() {
        assert!(matches!(
            decode(&[0x40, 0, 0, 0, 0, 0, 0, 0]),
            Err(FramingError::ProtocolError(_))
        ));
    }
}
