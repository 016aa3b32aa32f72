#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! A layered diagnostic communication stack for talking to vehicle ECUs.
//!
//! The crate is organised bottom-up, mirroring the path a diagnostic request
//! takes on its way to the wire:
//!
//! * [transport] - the byte-oriented duplex pipe the stack runs on. Concrete
//!   drivers (Bluetooth RFCOMM, TCP, USB CDC, vendor pass-thru libraries) live
//!   outside this crate and plug in through the [transport::Transport] trait.
//! * [isotp] - ISO 15765-2 transport layer. Segments payloads of up to 4095
//!   bytes (or 4 GiB with the escape sequence) into 8-byte CAN frames and
//!   reassembles them, honoring flow control from the peer.
//! * [passthru] - SAE J2534 style device and channel management. Multiplexes
//!   several logical protocol channels over one physical adapter, with
//!   per-channel filters, periodic messages and priority-weighted resource
//!   allocation.
//! * [uds] - Unified Diagnostic Services (ISO 14229). Session management,
//!   service encoding, negative response classification, security access and
//!   the ECU reprogramming sequence.
//! * [safety] - precondition checks (voltage, ignition, gear, speed) that
//!   gate destructive operations before anything touches the wire.
//! * [state] - bookkeeping for every registered transport connection:
//!   transition history, quality scoring, conflict resolution and failover.
//! * [scanner] - the facade tying it all together: discover, connect,
//!   start a session, send requests, observe events.

use channel::ChannelError;
use isotp::FramingError;
use safety::SafetyReport;
use transport::TransportError;

pub mod channel;
pub mod dtc;
pub mod isotp;
pub mod passthru;
pub mod safety;
pub mod scanner;
pub mod state;
pub mod timing;
pub mod transport;
pub mod uds;

/// Diagnostic server result
pub type DiagServerResult<T> = Result<T, DiagError>;

#[derive(Debug)]
/// Diagnostic server error
pub enum DiagError {
    /// The diagnostic server does not support the request
    NotSupported,
    /// Negative response code from the ECU itself
    ECUError {
        /// Raw negative response code from the ECU
        code: u8,
        /// Negative response code definition according to protocol
        def: Option<String>,
    },
    /// Response empty
    EmptyResponse,
    /// ECU responded, but with a message that was not a reply to the sent request
    WrongMessage,
    /// Diagnostic server terminated!?
    ServerNotRunning,
    /// ECU responded with a message, but the length was incorrect
    InvalidResponseLength,
    /// A parameter given to the function is invalid. Check the function's documentation
    /// for more information
    ParameterInvalid,
    /// The ECU did not respond within the response deadline
    Timeout,
    /// The ECU kept answering responsePending (NRC 0x78) beyond the configured
    /// maximum number of repetitions
    ResponsePendingExhausted,
    /// Security access is locked, either by the ECU's retry counter or its
    /// time delay
    SecurityDenied {
        /// Raw NRC which triggered the lockout (0x35, 0x36 or 0x37)
        code: u8,
    },
    /// A safety precondition check failed; the request never touched the wire
    SafetyViolation(SafetyReport),
    /// Error with the underlying communication channel
    ChannelError(ChannelError),
    /// Error with the underlying transport link
    TransportError(TransportError),
}

impl std::fmt::Display for DiagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            DiagError::NotSupported => write!(f, "request not supported"),
            DiagError::ECUError { code, def } => {
                if let Some(d) = def {
                    write!(f, "ECU error 0x{:02X} ({})", code, d)
                } else {
                    write!(f, "ECU error 0x{:02X}", code)
                }
            }
            DiagError::EmptyResponse => write!(f, "ECU provided an empty response"),
            DiagError::WrongMessage => write!(f, "ECU response message did not match request"),
            DiagError::ServerNotRunning => write!(f, "diagnostic server not running"),
            DiagError::ParameterInvalid => write!(f, "a parameter provided was invalid"),
            DiagError::InvalidResponseLength => {
                write!(f, "ECU response message was of invalid length")
            }
            DiagError::Timeout => write!(f, "timed out waiting for the ECU response"),
            DiagError::ResponsePendingExhausted => {
                write!(
                    f,
                    "ECU exceeded the maximum number of responsePending replies"
                )
            }
            DiagError::SecurityDenied { code } => {
                write!(f, "security access denied (NRC 0x{:02X})", code)
            }
            DiagError::SafetyViolation(report) => {
                write!(f, "safety preconditions not met: {}", report)
            }
            DiagError::ChannelError(err) => write!(f, "underlying channel error: {}", err),
            DiagError::TransportError(err) => write!(f, "underlying transport error: {}", err),
        }
    }
}

impl std::error::Error for DiagError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self {
            DiagError::ChannelError(e) => Some(e),
            DiagError::TransportError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ChannelError> for DiagError {
    fn from(x: ChannelError) -> Self {
        Self::ChannelError(x)
    }
}

impl From<TransportError> for DiagError {
    fn from(x: TransportError) -> Self {
        Self::TransportError(x)
    }
}

impl From<FramingError> for DiagError {
    fn from(x: FramingError) -> Self {
        Self::ChannelError(ChannelError::from(x))
    }
}
