//! Module for logical communication channels with an ECU
//!
//! Currently, the following channel types are defined:
//! * [PayloadChannel] - Basic payload-oriented channel, all channels build on this trait
//! * [IsoTpChannel] - ISO-TP (ISO 15765-2) channel
//! * [PacketChannel] - Packet-oriented (frame) channel

use crate::isotp::FramingError;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO error with the channel
    IOError(std::io::Error),
    /// Timeout when writing data to the channel
    WriteTimeout,
    /// Timeout when reading from the channel
    ReadTimeout,
    /// The channel's Rx buffer is empty. Only applies when read timeout is 0
    BufferEmpty,
    /// The channel's Tx buffer is full
    BufferFull,
    /// Unsupported channel request
    UnsupportedRequest,
    /// The interface is not open
    InterfaceNotOpen,
    /// Channel was used before it was configured
    ConfigurationError,
    /// Another active channel already claims the requested protocol exclusively,
    /// or the requested exclusive claim clashes with existing channels
    ProtocolConflict,
    /// A device-level cap (channel count, filters, bandwidth, buffers) was hit
    ResourceExhausted {
        /// Which resource ran out
        resource: &'static str,
    },
    /// A filter definition was rejected
    FilterInvalid {
        /// Why the filter was rejected
        reason: String,
    },
    /// A get/set of a channel parameter failed
    IoctlFailed {
        /// Parameter that was being accessed
        param: String,
    },
    /// ISO-TP framing fault on this channel
    Framing(FramingError),
    /// Anything else
    Other(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::IOError(e) => write!(f, "IO error: {}", e),
            ChannelError::UnsupportedRequest => write!(f, "unsupported channel request"),
            ChannelError::ReadTimeout => write!(f, "timeout reading from channel"),
            ChannelError::WriteTimeout => write!(f, "timeout writing to channel"),
            ChannelError::BufferFull => write!(f, "channel's transmit buffer is full"),
            ChannelError::BufferEmpty => write!(f, "channel's receive buffer is empty"),
            ChannelError::InterfaceNotOpen => write!(f, "channel's interface is not open"),
            ChannelError::ConfigurationError => {
                write!(f, "channel used prior to being configured")
            }
            ChannelError::ProtocolConflict => {
                write!(f, "protocol conflicts with an already active channel")
            }
            ChannelError::ResourceExhausted { resource } => {
                write!(f, "channel resource exhausted: {}", resource)
            }
            ChannelError::FilterInvalid { reason } => write!(f, "invalid filter: {}", reason),
            ChannelError::IoctlFailed { param } => {
                write!(f, "parameter access failed for {}", param)
            }
            ChannelError::Framing(e) => write!(f, "ISO-TP framing error: {}", e),
            ChannelError::Other(reason) => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IOError(io_err) => Some(io_err),
            Self::Framing(fr) => Some(fr),
            _ => None,
        }
    }
}

impl From<FramingError> for ChannelError {
    fn from(x: FramingError) -> Self {
        Self::Framing(x)
    }
}

impl<T> From<std::sync::mpsc::SendError<T>> for ChannelError {
    fn from(_: std::sync::mpsc::SendError<T>) -> Self {
        Self::Other("internal channel worker hung up".into())
    }
}

impl From<std::sync::mpsc::RecvTimeoutError> for ChannelError {
    fn from(_: std::sync::mpsc::RecvTimeoutError) -> Self {
        Self::ReadTimeout
    }
}

/// A CAN frame: 11 or 29 bit identifier and up to 8 data bytes.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; 8],
    ext: bool,
}

impl CanFrame {
    /// Creates a new CAN frame. Data beyond 8 bytes is truncated.
    pub fn new(id: u32, data: &[u8], ext: bool) -> Self {
        let dlc = data.len().min(8);
        let mut buf = [0u8; 8];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id,
            dlc: dlc as u8,
            data: buf,
            ext,
        }
    }

    /// Frame identifier
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Frame data bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// True if the frame carries a 29-bit identifier
    pub fn is_extended(&self) -> bool {
        self.ext
    }
}

impl std::fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CanFrame {{ id: 0x{:04X}, data: {:02X?}, ext: {} }}",
            self.id,
            self.data(),
            self.ext
        )
    }
}

/// Base trait for byte-payload oriented channels with an ECU.
pub trait PayloadChannel: Send {
    /// Opens the interface. Only called after the channel is fully configured.
    fn open(&mut self) -> ChannelResult<()>;

    /// Closes and destroys the channel
    fn close(&mut self) -> ChannelResult<()>;

    /// Configures the addressing pair for the exchange
    ///
    /// ## Parameters
    /// * send - Send ID (the ECU listens for data with this ID)
    /// * recv - Receive ID (the ECU sends data with this ID)
    fn set_ids(&mut self, send: u32, recv: u32) -> ChannelResult<()>;

    /// Attempts to read a payload from the channel, waiting at most
    /// `timeout_ms`. A timeout of 0 returns whatever is buffered.
    fn read_bytes(&mut self, timeout_ms: u32) -> ChannelResult<Vec<u8>>;

    /// Attempts to write a payload to the channel. A timeout of 0 queues the
    /// write without waiting for completion.
    fn write_bytes(&mut self, addr: u32, buffer: &[u8], timeout_ms: u32) -> ChannelResult<()>;

    /// Writes a payload, then waits for the reply.
    fn read_write_bytes(
        &mut self,
        addr: u32,
        buffer: &[u8],
        write_timeout_ms: u32,
        read_timeout_ms: u32,
    ) -> ChannelResult<Vec<u8>> {
        self.write_bytes(addr, buffer, write_timeout_ms)?;
        self.read_bytes(read_timeout_ms)
    }

    /// Tells the channel to discard its Rx buffer
    fn clear_rx_buffer(&mut self) -> ChannelResult<()>;

    /// Tells the channel to discard its Tx buffer
    fn clear_tx_buffer(&mut self) -> ChannelResult<()>;
}

/// Channel for sending and receiving whole frames.
pub trait PacketChannel<P: Send>: Send {
    /// Opens the interface
    fn open(&mut self) -> ChannelResult<()>;
    /// Closes the interface
    fn close(&mut self) -> ChannelResult<()>;
    /// Writes the given packets, in order
    fn write_packets(&mut self, packets: Vec<P>, timeout_ms: u32) -> ChannelResult<()>;
    /// Reads up to `max` packets, waiting at most `timeout_ms`
    fn read_packets(&mut self, max: usize, timeout_ms: u32) -> ChannelResult<Vec<P>>;
    /// Discards buffered inbound packets
    fn clear_rx_buffer(&mut self) -> ChannelResult<()>;
    /// Discards queued outbound packets
    fn clear_tx_buffer(&mut self) -> ChannelResult<()>;
}

/// Extension of [PayloadChannel] for channels that speak ISO-TP.
pub trait IsoTpChannel: PayloadChannel {
    /// Applies the ISO-TP specific configuration to the channel
    fn set_iso_tp_cfg(&mut self, cfg: crate::isotp::IsoTpSettings) -> ChannelResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_frame_truncates_at_8() {
        let f = CanFrame::new(0x7E0, &[0u8; 12], false);
        assert_eq!(f.data().len(), 8);
    }

    #[test]
    fn can_frame_keeps_short_dlc() {
        let f = CanFrame::new(0x7E0, &[0x02, 0x10, 0x01], false);
        assert_eq!(f.data(), &[0x02, 0x10, 0x01]);
        assert!(!f.is_extended());
    }
}
