//! The byte-oriented transport contract the stack is built on.
//!
//! A [Transport] is an ordered, lossy duplex pipe. Concrete drivers (serial
//! over Bluetooth RFCOMM, TCP over WiFi, USB CDC, vendor pass-thru shared
//! libraries) are implemented outside this crate; the stack only assumes
//! ordered delivery for the duration of the `Connected` state and does its
//! own framing on top.

use std::sync::mpsc;

use strum_macros::{Display, EnumIter};

/// Transport operation result
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
/// Error produced by a transport link
pub enum TransportError {
    /// The link is not connected
    #[error("transport is disconnected")]
    Disconnected,
    /// Timed out waiting for inbound bytes
    #[error("timeout reading from transport")]
    ReadTimeout,
    /// The write could not be completed
    #[error("transport write failed: {0}")]
    WriteFailed(String),
    /// A transient fault the owning connection may recover from by reconnecting
    #[error("recoverable transport fault: {0}")]
    Recoverable(String),
}

/// The kind of physical link a connection runs over.
///
/// Ordering doubles as the conflict-resolution ranking: when two live
/// connections target the same scanner, the one with the lowest
/// [priority](ConnectionType::priority) value wins.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter,
    serde::Serialize, serde::Deserialize,
)]
pub enum ConnectionType {
    /// SAE J2534 pass-thru adapter (wired, most deterministic)
    J2534,
    /// USB CDC serial
    Usb,
    /// TCP over WiFi
    Wifi,
    /// Bluetooth classic RFCOMM
    BluetoothClassic,
    /// Bluetooth low energy GATT serial
    BluetoothLe,
}

impl ConnectionType {
    /// Conflict-resolution rank. Lower is better.
    pub fn priority(&self) -> u8 {
        match self {
            ConnectionType::J2534 => 0,
            ConnectionType::Usb => 1,
            ConnectionType::Wifi => 2,
            ConnectionType::BluetoothClassic => 3,
            ConnectionType::BluetoothLe => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Details reported by a transport once its link is up
pub struct TransportInfo {
    /// Human readable peer name (device name, host:port, ...)
    pub peer: String,
    /// Kind of link
    pub connection_type: ConnectionType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// State signal emitted by a transport.
///
/// Transports publish every state change on the stream handed out by
/// [Transport::subscribe]; the connection state manager folds these into its
/// global view.
pub enum TransportEvent {
    /// Link is down and no attempt is in progress
    Disconnected,
    /// A connection attempt is in progress
    Connecting,
    /// Link is up
    Connected(TransportInfo),
    /// Link dropped, driver is retrying
    Reconnecting {
        /// 1-based attempt counter
        attempt: u32,
    },
    /// The driver hit a fault
    Error {
        /// Human readable cause
        cause: String,
        /// Whether a reconnect can be expected to succeed
        recoverable: bool,
    },
}

/// An ordered, lossy byte pipe.
///
/// The stack treats the pipe as reliable and in-order while the transport
/// reports `Connected`, and makes no assumption about message boundaries.
pub trait Transport: Send {
    /// Brings the link up. Blocks until connected or failed.
    fn connect(&mut self) -> TransportResult<()>;

    /// Tears the link down. Idempotent.
    fn disconnect(&mut self) -> TransportResult<()>;

    /// Writes the whole buffer to the link.
    fn write(&mut self, bytes: &[u8]) -> TransportResult<()>;

    /// Reads whatever bytes are available, waiting at most `timeout_ms`.
    /// A timeout of 0 drains the receive buffer without blocking.
    fn read(&mut self, timeout_ms: u32) -> TransportResult<Vec<u8>>;

    /// Returns a lazy stream of state change events. Each call registers a
    /// new independent subscriber.
    fn subscribe(&mut self) -> mpsc::Receiver<TransportEvent>;
}

/// In-memory transport joining two endpoints over mpsc queues.
///
/// Useful for exercising the stack without hardware; create a pair with
/// [LoopbackTransport::pair].
#[derive(Debug)]
pub struct LoopbackTransport {
    connection_type: ConnectionType,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    subscribers: Vec<mpsc::Sender<TransportEvent>>,
    connected: bool,
}

impl LoopbackTransport {
    /// Creates two connected endpoints. Bytes written on one side are read on
    /// the other.
    pub fn pair(connection_type: ConnectionType) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            Self {
                connection_type,
                tx: a_tx,
                rx: a_rx,
                subscribers: Vec::new(),
                connected: false,
            },
            Self {
                connection_type,
                tx: b_tx,
                rx: b_rx,
                subscribers: Vec::new(),
                connected: false,
            },
        )
    }

    fn broadcast(&mut self, event: TransportEvent) {
        self.subscribers
            .retain(|sub| sub.send(event.clone()).is_ok());
    }
}

impl Transport for LoopbackTransport {
    fn connect(&mut self) -> TransportResult<()> {
        self.connected = true;
        let info = TransportInfo {
            peer: "loopback".into(),
            connection_type: self.connection_type,
        };
        self.broadcast(TransportEvent::Connected(info));
        Ok(())
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        if self.connected {
            self.connected = false;
            self.broadcast(TransportEvent::Disconnected);
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| TransportError::WriteFailed("peer endpoint dropped".into()))
    }

    fn read(&mut self, timeout_ms: u32) -> TransportResult<Vec<u8>> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        if timeout_ms == 0 {
            let mut out = Vec::new();
            while let Ok(chunk) = self.rx.try_recv() {
                out.extend_from_slice(&chunk);
            }
            return Ok(out);
        }
        match self
            .rx
            .recv_timeout(std::time::Duration::from_millis(timeout_ms as u64))
        {
            Ok(mut out) => {
                // Pick up anything else already queued behind the first chunk
                while let Ok(chunk) = self.rx.try_recv() {
                    out.extend_from_slice(&chunk);
                }
                Ok(out)
            }
            Err(_) => Err(TransportError::ReadTimeout),
        }
    }

    fn subscribe(&mut self) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }
}
