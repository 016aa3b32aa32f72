//! Pass-thru (SAE J2534 style) device and channel management.
//!
//! One physical adapter carries several logical protocol channels. This
//! module models the adapter ([PassThruDevice]), discovery of installed
//! adapters from JSON descriptor files ([DeviceScanner]), the wire message
//! ([PassThruFrame]) and the channel multiplexer ([manager::ChannelManager]).
//!
//! Binding to a vendor's actual pass-thru shared library is a driver concern
//! and lives behind [PassThruInterface]; this crate ships an in-memory
//! implementation for bench setups and tests.

use std::path::Path;
use std::sync::mpsc;
use std::time::Instant;

use crate::channel::{ChannelError, ChannelResult};

pub mod filter;
pub mod manager;
pub mod periodic;

pub use filter::{Filter, FilterKind};
pub use manager::{
    ChannelManager, ChannelPriority, ChannelState, ChannelStats, ResourceAllocation, ResourceUsage,
};
pub use periodic::PeriodicMessage;

/// Largest data block a pass-thru message can carry (4 byte id header plus
/// a maximal ISO-TP payload)
pub const MAX_FRAME_DATA: usize = 4128;

/// Wire protocol spoken on a logical channel
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::EnumIter,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum Protocol {
    /// Raw CAN frames
    Can,
    /// ISO 15765-2 (ISO-TP over CAN)
    Iso15765,
    /// ISO 14230 (KWP2000 over K-line)
    Iso14230,
    /// ISO 9141 K-line
    Iso9141,
    /// J1850 variable pulse width
    J1850Vpw,
    /// J1850 pulse width modulation
    J1850Pwm,
}

bitflags::bitflags! {
    /// Channel connect flags
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ConnectFlags: u32 {
        /// Use 29 bit CAN identifiers
        const CAN_29BIT_ID = 0x0100;
        /// Pad ISO 15765 frames to 8 bytes
        const ISO15765_FRAME_PAD = 0x0040;
        /// K-line checksum handled by the adapter
        const ISO9141_NO_CHECKSUM = 0x0200;
    }
}

bitflags::bitflags! {
    /// Per-message transmit flags
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct TxFlags: u32 {
        /// Pad the frame to 8 bytes
        const ISO15765_FRAME_PAD = 0x0040;
        /// Message uses a 29 bit identifier
        const CAN_29BIT_ID = 0x0100;
    }
}

bitflags::bitflags! {
    /// Per-message receive status flags
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct RxStatus: u32 {
        /// Message was an echo of our own transmission
        const TX_MSG_TYPE = 0x0001;
        /// First frame of a segmented transfer was seen
        const START_OF_MESSAGE = 0x0002;
    }
}

/// One message on the pass-thru wire.
///
/// For CAN based protocols the first four data bytes carry the frame
/// identifier, big-endian, followed by the payload. Frames are immutable
/// once built and validated on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassThruFrame {
    /// Protocol this frame belongs to
    pub protocol: Protocol,
    /// Transmit flags
    pub tx_flags: TxFlags,
    /// Receive status (set by the adapter on inbound frames)
    pub rx_status: RxStatus,
    /// Adapter timestamp, microseconds
    pub timestamp_us: u32,
    data: Vec<u8>,
}

impl PassThruFrame {
    /// Builds a frame, rejecting oversize data blocks.
    pub fn new(protocol: Protocol, tx_flags: TxFlags, data: Vec<u8>) -> ChannelResult<Self> {
        if data.len() > MAX_FRAME_DATA {
            return Err(ChannelError::ResourceExhausted {
                resource: "frame data block",
            });
        }
        Ok(Self {
            protocol,
            tx_flags,
            rx_status: RxStatus::empty(),
            timestamp_us: 0,
            data,
        })
    }

    /// Builds a CAN based frame from an identifier and payload. The id is
    /// serialized big-endian into the leading four data bytes.
    pub fn with_can_id(
        protocol: Protocol,
        id: u32,
        payload: &[u8],
        extended: bool,
    ) -> ChannelResult<Self> {
        let mut data = Vec::with_capacity(4 + payload.len());
        data.extend_from_slice(&id.to_be_bytes());
        data.extend_from_slice(payload);
        let mut flags = TxFlags::empty();
        if extended {
            flags |= TxFlags::CAN_29BIT_ID;
        }
        Self::new(protocol, flags, data)
    }

    /// The frame's data block (id header included for CAN protocols)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The CAN identifier encoded in the leading four data bytes, if present
    pub fn can_id(&self) -> Option<u32> {
        if self.data.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes([
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
        ]))
    }

    /// Payload behind the CAN id header
    pub fn can_payload(&self) -> &[u8] {
        if self.data.len() < 4 {
            &[]
        } else {
            &self.data[4..]
        }
    }
}

/// Driver seam to the physical adapter.
///
/// Implementations wrap a vendor shared library, a bench harness, or the
/// in-memory [LoopbackInterface].
pub trait PassThruInterface: Send {
    /// Powers the adapter up
    fn open(&mut self) -> ChannelResult<()>;
    /// Powers the adapter down
    fn close(&mut self) -> ChannelResult<()>;
    /// Queues one frame for transmission
    fn send(&mut self, frame: PassThruFrame, timeout_ms: u32) -> ChannelResult<()>;
    /// Reads up to `max` inbound frames, waiting at most `timeout_ms`
    fn recv(&mut self, max: usize, timeout_ms: u32) -> ChannelResult<Vec<PassThruFrame>>;
    /// Battery voltage at the OBD port, if the adapter can measure it
    fn read_battery_voltage(&mut self) -> Option<f32> {
        None
    }
}

/// In-memory adapter joining two endpoints, for bench setups and tests.
#[derive(Debug)]
pub struct LoopbackInterface {
    tx: mpsc::Sender<PassThruFrame>,
    rx: mpsc::Receiver<PassThruFrame>,
    voltage: Option<f32>,
}

impl LoopbackInterface {
    /// Creates two joined endpoints; frames sent on one come out of the other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            Self {
                tx: a_tx,
                rx: a_rx,
                voltage: Some(13.8),
            },
            Self {
                tx: b_tx,
                rx: b_rx,
                voltage: Some(13.8),
            },
        )
    }

    /// Overrides the reported battery voltage.
    pub fn set_voltage(&mut self, voltage: Option<f32>) {
        self.voltage = voltage;
    }
}

impl PassThruInterface for LoopbackInterface {
    fn open(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn send(&mut self, frame: PassThruFrame, _timeout_ms: u32) -> ChannelResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| ChannelError::InterfaceNotOpen)
    }

    fn recv(&mut self, max: usize, timeout_ms: u32) -> ChannelResult<Vec<PassThruFrame>> {
        let mut out = Vec::new();
        let start = Instant::now();
        loop {
            while out.len() < max {
                match self.rx.try_recv() {
                    Ok(f) => out.push(f),
                    Err(_) => break,
                }
            }
            if !out.is_empty()
                || timeout_ms == 0
                || start.elapsed().as_millis() >= timeout_ms as u128
            {
                return Ok(out);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    fn read_battery_voltage(&mut self) -> Option<f32> {
        self.voltage
    }
}

/// Protocols a physical adapter can speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct DeviceCapabilities {
    /// Raw CAN
    #[serde(default)]
    pub can: bool,
    /// ISO 15765 (ISO-TP)
    #[serde(default)]
    pub iso15765: bool,
    /// ISO 14230 (KWP2000)
    #[serde(default)]
    pub iso14230: bool,
    /// ISO 9141 K-line
    #[serde(default)]
    pub iso9141: bool,
    /// J1850 VPW
    #[serde(default)]
    pub j1850_vpw: bool,
    /// J1850 PWM
    #[serde(default)]
    pub j1850_pwm: bool,
}

impl DeviceCapabilities {
    /// True if the adapter can open a channel for `protocol`
    pub fn supports(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Can => self.can,
            Protocol::Iso15765 => self.iso15765,
            Protocol::Iso14230 => self.iso14230,
            Protocol::Iso9141 => self.iso9141,
            Protocol::J1850Vpw => self.j1850_vpw,
            Protocol::J1850Pwm => self.j1850_pwm,
        }
    }
}

/// Identity and capability record of one installed adapter
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeviceInfo {
    /// Adapter vendor
    pub vendor: String,
    /// Product name
    pub product: String,
    /// Firmware revision, when reported
    #[serde(default)]
    pub firmware: Option<String>,
    /// Pass-thru API version the vendor library implements
    #[serde(default)]
    pub api_version: Option<String>,
    /// Protocol support matrix
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
}

/// An opened physical adapter.
///
/// The device is exclusively owned by the [manager::ChannelManager] that
/// channels are created on; nothing else may talk to the interface while the
/// manager is alive.
#[derive(Debug)]
pub struct PassThruDevice {
    info: DeviceInfo,
    interface: Box<dyn PassThruInterface>,
    /// Filters the hardware can hold per channel
    filter_cap: u8,
}

impl std::fmt::Debug for dyn PassThruInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PassThruInterface")
    }
}

impl PassThruDevice {
    /// Opens a device over the given driver interface.
    pub fn open(info: DeviceInfo, mut interface: Box<dyn PassThruInterface>) -> ChannelResult<Self> {
        interface.open()?;
        log::debug!("opened pass-thru device {} {}", info.vendor, info.product);
        Ok(Self {
            info,
            interface,
            filter_cap: 10,
        })
    }

    /// Device identity and capabilities
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Per-channel filter capacity of the hardware
    pub fn filter_cap(&self) -> u8 {
        self.filter_cap
    }

    pub(crate) fn interface_mut(&mut self) -> &mut dyn PassThruInterface {
        self.interface.as_mut()
    }

    /// Battery voltage at the OBD port, when the adapter reports it
    pub fn read_battery_voltage(&mut self) -> Option<f32> {
        self.interface.read_battery_voltage()
    }
}

/// Discovers installed adapters from JSON descriptor files.
///
/// Each `.json` file in the descriptor directory holds one [DeviceInfo]
/// document; unreadable or malformed entries are skipped.
#[derive(Debug, Clone, Default)]
pub struct DeviceScanner {
    devices: Vec<DeviceInfo>,
}

impl DeviceScanner {
    /// Scans `dir` for descriptor files.
    pub fn scan_dir(dir: &Path) -> Self {
        let mut devices = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| serde_json::from_str::<DeviceInfo>(&s).ok())
                {
                    Some(info) => devices.push(info),
                    None => log::warn!("skipping unreadable device descriptor {:?}", path),
                }
            }
        }
        Self { devices }
    }

    /// All discovered adapters
    pub fn list_devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Looks an adapter up by product name
    pub fn find_by_product(&self, product: &str) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.product == product)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_oversize_data() {
        let res = PassThruFrame::new(
            Protocol::Iso15765,
            TxFlags::empty(),
            vec![0u8; MAX_FRAME_DATA + 1],
        );
        assert!(matches!(
            res,
            Err(ChannelError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn can_id_header_round_trips() {
        let f = PassThruFrame::with_can_id(Protocol::Can, 0x18DAF110, &[1, 2, 3], true).unwrap();
        assert_eq!(f.can_id(), Some(0x18DAF110));
        assert_eq!(f.can_payload(), &[1, 2, 3]);
        assert!(f.tx_flags.contains(TxFlags::CAN_29BIT_ID));
    }

    #[test]
    fn scanner_reads_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tactrix.json"),
            r#"{"vendor":"Tactrix","product":"Openport 2.0",
                "capabilities":{"can":true,"iso15765":true}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        let scanner = DeviceScanner::scan_dir(dir.path());
        assert_eq!(scanner.list_devices().len(), 1);
        let dev = scanner.find_by_product("Openport 2.0").unwrap();
        assert!(dev.capabilities.supports(Protocol::Iso15765));
        assert!(!dev.capabilities.supports(Protocol::Iso9141));
    }

    #[test]
    fn loopback_interface_moves_frames() {
        let (mut a, mut b) = LoopbackInterface::pair();
        let f = PassThruFrame::with_can_id(Protocol::Can, 0x7E0, &[0xAA], false).unwrap();
        a.send(f.clone(), 0).unwrap();
        let got = b.recv(8, 100).unwrap();
        assert_eq!(got, vec![f]);
    }
}
