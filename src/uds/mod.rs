//! Module for UDS (Unified diagnostic services - ISO 14229)
//!
//! The [UdsServer] owns one ISO-TP channel to one ECU and serializes every
//! exchange on it: requests go out FIFO, each with exactly one pending
//! response slot. A background thread keeps non-default sessions alive with
//! TesterPresent and folds session transitions into the server's view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::channel::IsoTpChannel;
use crate::isotp::IsoTpSettings;
use crate::{DiagError, DiagServerResult};

pub mod clear_diagnostic_information;
pub mod data_transfer;
pub mod diagnostic_session_control;
pub mod ecu_reset;
pub mod read_data_by_identifier;
pub mod read_dtc_information;
pub mod routine_control;
pub mod security_access;

#[cfg(test)]
pub(crate) mod mock;
#[cfg(test)]
mod test;

pub use diagnostic_session_control::UdsSessionType;
pub use security_access::SecurityAlgorithm;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// UDS command service IDs
pub enum UdsCommand {
    /// Diagnostic session control. See [diagnostic_session_control]
    DiagnosticSessionControl = 0x10,
    /// ECU reset. See [ecu_reset]
    ECUReset = 0x11,
    /// Clears stored diagnostic information. See [clear_diagnostic_information]
    ClearDiagnosticInformation = 0x14,
    /// Reads stored DTCs. See [read_dtc_information]
    ReadDTCInformation = 0x19,
    /// Reads a value by its 16 bit data identifier. See [read_data_by_identifier]
    ReadDataByIdentifier = 0x22,
    /// Security access seed/key handshake. See [security_access]
    SecurityAccess = 0x27,
    /// Writes a value by its 16 bit data identifier. See [read_data_by_identifier]
    WriteDataByIdentifier = 0x2E,
    /// Starts, stops or queries an ECU routine. See [routine_control]
    RoutineControl = 0x31,
    /// Announces a download to the ECU. See [data_transfer]
    RequestDownload = 0x34,
    /// One block of a download. See [data_transfer]
    TransferData = 0x36,
    /// Finishes a download. See [data_transfer]
    RequestTransferExit = 0x37,
    /// Keeps a non-default session alive
    TesterPresent = 0x3E,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// UDS negative response codes
pub enum UdsNrc {
    /// ECU rejected the request with no specific reason
    GeneralReject,
    /// Service is not supported by the ECU
    ServiceNotSupported,
    /// Sub-function is not supported by the ECU
    SubFunctionNotSupported,
    /// Request message had an invalid length or format
    IncorrectMessageLengthOrInvalidFormat,
    /// The response would be too long for the transport
    ResponseTooLong,
    /// ECU is busy; the request should be repeated after a delay
    BusyRepeatRequest,
    /// Prerequisite conditions for the request are not met
    ConditionsNotCorrect,
    /// Requests were sent in the wrong order
    RequestSequenceError,
    /// A request parameter is outside its valid range
    RequestOutOfRange,
    /// The request needs security access which has not been granted
    SecurityAccessDenied,
    /// The key sent in [security_access::send_key] was wrong
    InvalidKey,
    /// Too many wrong keys; the ECU has locked security access
    ExceedNumberOfAttempts,
    /// The mandatory delay after a failed attempt has not expired yet
    RequiredTimeDelayNotExpired,
    /// Upload/download request refused
    UploadDownloadNotAccepted,
    /// Data transfer halted due to a fault
    TransferDataSuspended,
    /// Erasing or flashing failed
    GeneralProgrammingFailure,
    /// The block sequence counter of a TransferData was wrong
    WrongBlockSequenceCounter,
    /// Request accepted, response still being prepared
    RequestCorrectlyReceivedResponsePending,
    /// Sub-function not available in the active session
    SubFunctionNotSupportedInActiveSession,
    /// Service not available in the active session
    ServiceNotSupportedInActiveSession,
    /// Any other code, including manufacturer reserved ranges
    Other(u8),
}

impl From<u8> for UdsNrc {
    fn from(p: u8) -> Self {
        match p {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrInvalidFormat,
            0x14 => Self::ResponseTooLong,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceedNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x70 => Self::UploadDownloadNotAccepted,
            0x71 => Self::TransferDataSuspended,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x78 => Self::RequestCorrectlyReceivedResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            x => Self::Other(x),
        }
    }
}

impl UdsNrc {
    /// Human readable definition of the code
    pub fn desc(&self) -> String {
        match self {
            Self::GeneralReject => "general reject".into(),
            Self::ServiceNotSupported => "service not supported".into(),
            Self::SubFunctionNotSupported => "sub-function not supported".into(),
            Self::IncorrectMessageLengthOrInvalidFormat => {
                "incorrect message length or invalid format".into()
            }
            Self::ResponseTooLong => "response too long".into(),
            Self::BusyRepeatRequest => "busy, repeat request".into(),
            Self::ConditionsNotCorrect => "conditions not correct".into(),
            Self::RequestSequenceError => "request sequence error".into(),
            Self::RequestOutOfRange => "request out of range".into(),
            Self::SecurityAccessDenied => "security access denied".into(),
            Self::InvalidKey => "invalid key".into(),
            Self::ExceedNumberOfAttempts => "exceeded number of attempts".into(),
            Self::RequiredTimeDelayNotExpired => "required time delay not expired".into(),
            Self::UploadDownloadNotAccepted => "upload/download not accepted".into(),
            Self::TransferDataSuspended => "transfer data suspended".into(),
            Self::GeneralProgrammingFailure => "general programming failure".into(),
            Self::WrongBlockSequenceCounter => "wrong block sequence counter".into(),
            Self::RequestCorrectlyReceivedResponsePending => {
                "request received, response pending".into()
            }
            Self::SubFunctionNotSupportedInActiveSession => {
                "sub-function not supported in active session".into()
            }
            Self::ServiceNotSupportedInActiveSession => {
                "service not supported in active session".into()
            }
            Self::Other(x) => format!("manufacturer or reserved code 0x{:02X}", x),
        }
    }
}

#[derive(Debug, Copy, Clone)]
/// UDS server options
pub struct UdsServerOptions {
    /// ECU send ID (requests go out with this ID)
    pub send_id: u32,
    /// ECU receive ID (responses come back with this ID)
    pub recv_id: u32,
    /// Read timeout in ms (the P2 window for the first response)
    pub read_timeout_ms: u32,
    /// Write timeout in ms
    pub write_timeout_ms: u32,
    /// TesterPresent send interval in ms for non-default sessions
    pub tester_present_interval_ms: u32,
    /// Whether TesterPresent messages request a response
    pub tester_present_require_response: bool,
    /// Whether the server keeps non-default sessions alive at all
    pub keepalive_enabled: bool,
    /// Extended wait applied every time the ECU answers responsePending
    pub p2_star_max_ms: u32,
    /// How many responsePending replies are tolerated per request
    pub response_pending_max: u32,
    /// How many times a busyRepeatRequest is retried
    pub busy_repeat_max: u32,
    /// Backoff before a busyRepeatRequest retry; at least one second
    pub busy_repeat_backoff_ms: u32,
    /// Server loop refresh interval. A sensible value is 10ms
    pub server_refresh_interval_ms: u32,
}

impl Default for UdsServerOptions {
    fn default() -> Self {
        Self {
            send_id: 0x7E0,
            recv_id: 0x7E8,
            read_timeout_ms: 1000,
            write_timeout_ms: 1000,
            tester_present_interval_ms: 2000,
            tester_present_require_response: true,
            keepalive_enabled: true,
            p2_star_max_ms: 5000,
            response_pending_max: 10,
            busy_repeat_max: 3,
            busy_repeat_backoff_ms: 1000,
            server_refresh_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone)]
/// UDS message payload
pub struct UdsCmd {
    bytes: Vec<u8>,
    response_required: bool,
}

impl UdsCmd {
    /// Builds a request from a service id and its arguments
    pub fn new(sid: UdsCommand, args: &[u8], need_response: bool) -> Self {
        let mut b: Vec<u8> = Vec::with_capacity(args.len() + 1);
        b.push(sid as u8);
        b.extend_from_slice(args);
        Self {
            bytes: b,
            response_required: need_response,
        }
    }

    fn from_raw(bytes: &[u8], need_response: bool) -> Self {
        Self {
            bytes: bytes.to_vec(),
            response_required: need_response,
        }
    }

    /// Service id byte of the request
    pub fn sid_byte(&self) -> u8 {
        self.bytes[0]
    }
}

/// Handler for events happening inside the server thread
pub trait UdsServerEventHandler: Send {
    /// Server thread came up
    fn on_server_start(&self) {}
    /// Server thread exited
    fn on_server_exit(&self) {}
    /// A background TesterPresent failed. Best effort only; the session may
    /// still drop back to default on the ECU side
    fn on_tester_present_error(&self, _err: &DiagError) {}
    /// The ECU kicked the session back to default on its own
    fn on_session_dropped(&self) {}
    /// The server thread hit an unrecoverable fault
    fn on_critical_error(&self, _desc: &str) {}
}

/// Handler that ignores every event
#[derive(Debug, Clone, Copy)]
pub struct UdsVoidHandler;

impl UdsServerEventHandler for UdsVoidHandler {}

/// Live session bookkeeping, shared between the server thread and handle
#[derive(Debug)]
struct SessionState {
    session_type: UdsSessionType,
    started_at: Instant,
    last_activity: Instant,
    security_level: u8,
    security_lockout_until: Option<Instant>,
    failed_key_attempts: u8,
}

impl SessionState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            session_type: UdsSessionType::Default,
            started_at: now,
            last_activity: now,
            security_level: 0,
            security_lockout_until: None,
            failed_key_attempts: 0,
        }
    }
}

/// Snapshot of the session as seen by the server
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UdsSessionInfo {
    /// Active diagnostic session
    pub session_type: UdsSessionType,
    /// ECU address the session talks to
    pub ecu_address: u32,
    /// How long the current session has been active
    pub session_age_ms: u64,
    /// Time since the last successful exchange
    pub idle_ms: u64,
    /// Security level granted by the last successful seed/key handshake,
    /// 0 when locked
    pub security_level: u8,
}

#[derive(Debug)]
/// UDS diagnostic server
pub struct UdsServer {
    server_running: Arc<AtomicBool>,
    settings: UdsServerOptions,
    tx: mpsc::Sender<UdsCmd>,
    rx: mpsc::Receiver<DiagServerResult<Vec<u8>>>,
    session: Arc<Mutex<SessionState>>,
    handle: Option<JoinHandle<()>>,
}

impl UdsServer {
    /// Creates a new UDS server over an ISO-TP connection with the ECU.
    ///
    /// On startup the channel is configured with the addressing and ISO-TP
    /// settings provided, then opened.
    pub fn new_over_iso_tp(
        settings: UdsServerOptions,
        mut channel: Box<dyn IsoTpChannel>,
        channel_cfg: IsoTpSettings,
        event_handler: Option<Box<dyn UdsServerEventHandler>>,
    ) -> DiagServerResult<Self> {
        channel.set_iso_tp_cfg(channel_cfg)?;
        channel.set_ids(settings.send_id, settings.recv_id)?;
        channel.open()?;

        let is_running = Arc::new(AtomicBool::new(true));
        let is_running_t = is_running.clone();
        let session = Arc::new(Mutex::new(SessionState::new()));
        let session_t = session.clone();

        let (tx_cmd, rx_cmd) = mpsc::channel::<UdsCmd>();
        let (tx_res, rx_res) = mpsc::channel::<DiagServerResult<Vec<u8>>>();

        let handle = std::thread::spawn(move || {
            server_loop(
                settings,
                channel,
                rx_cmd,
                tx_res,
                session_t,
                is_running_t,
                event_handler,
            )
        });

        Ok(Self {
            server_running: is_running,
            settings,
            tx: tx_cmd,
            rx: rx_res,
            session,
            handle: Some(handle),
        })
    }

    /// True while the background server thread is alive
    pub fn is_server_running(&self) -> bool {
        self.server_running.load(Ordering::Relaxed)
    }

    /// The settings this server was created with
    pub fn get_settings(&self) -> UdsServerOptions {
        self.settings
    }

    /// Snapshot of the current session state
    pub fn session_info(&self) -> UdsSessionInfo {
        let state = self.session.lock().expect("session state poisoned");
        UdsSessionInfo {
            session_type: state.session_type,
            ecu_address: self.settings.send_id,
            session_age_ms: state.started_at.elapsed().as_millis() as u64,
            idle_ms: state.last_activity.elapsed().as_millis() as u64,
            security_level: state.security_level,
        }
    }

    /// Sends a command to the ECU and waits for its positive response.
    ///
    /// On success the full response is returned, beginning with `sid + 0x40`.
    pub fn execute_command_with_response(
        &mut self,
        sid: UdsCommand,
        args: &[u8],
    ) -> DiagServerResult<Vec<u8>> {
        self.exec_command(UdsCmd::new(sid, args, true))
    }

    /// Sends a command without waiting for any response.
    pub fn execute_command(&mut self, sid: UdsCommand, args: &[u8]) -> DiagServerResult<()> {
        self.exec_command(UdsCmd::new(sid, args, false)).map(|_| ())
    }

    /// Sends a raw byte payload and returns the ECU's response.
    pub fn send_byte_array_with_response(&mut self, payload: &[u8]) -> DiagServerResult<Vec<u8>> {
        if payload.is_empty() {
            return Err(DiagError::ParameterInvalid);
        }
        self.exec_command(UdsCmd::from_raw(payload, true))
    }

    /// Sends a raw byte payload without waiting for a response.
    pub fn send_byte_array(&mut self, payload: &[u8]) -> DiagServerResult<()> {
        if payload.is_empty() {
            return Err(DiagError::ParameterInvalid);
        }
        self.exec_command(UdsCmd::from_raw(payload, false)).map(|_| ())
    }

    /// Puts the ECU into the requested diagnostic session.
    pub fn set_session_mode(&mut self, mode: UdsSessionType) -> DiagServerResult<()> {
        self.execute_command_with_response(UdsCommand::DiagnosticSessionControl, &[mode.into()])
            .map(|_| ())
    }

    pub(crate) fn security_lockout_remaining(&self) -> Option<Duration> {
        let state = self.session.lock().expect("session state poisoned");
        state
            .security_lockout_until
            .and_then(|t| t.checked_duration_since(Instant::now()))
    }

    pub(crate) fn note_security_nrc(&self, code: u8, lockout: Duration) {
        let mut state = self.session.lock().expect("session state poisoned");
        match code {
            0x35 => state.failed_key_attempts += 1,
            0x36 | 0x37 => {
                state.security_lockout_until = Some(Instant::now() + lockout);
            }
            _ => {}
        }
    }

    pub(crate) fn grant_security_level(&self, level: u8) {
        let mut state = self.session.lock().expect("session state poisoned");
        state.security_level = level;
        state.failed_key_attempts = 0;
        state.security_lockout_until = None;
    }

    fn exec_command(&mut self, cmd: UdsCmd) -> DiagServerResult<Vec<u8>> {
        match self.tx.send(cmd) {
            Ok(_) => self.rx.recv().unwrap_or(Err(DiagError::ServerNotRunning)),
            Err(_) => Err(DiagError::ServerNotRunning),
        }
    }
}

impl Drop for UdsServer {
    fn drop(&mut self) {
        self.server_running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn server_loop(
    settings: UdsServerOptions,
    mut channel: Box<dyn IsoTpChannel>,
    rx_cmd: mpsc::Receiver<UdsCmd>,
    tx_res: mpsc::Sender<DiagServerResult<Vec<u8>>>,
    session: Arc<Mutex<SessionState>>,
    is_running: Arc<AtomicBool>,
    event_handler: Option<Box<dyn UdsServerEventHandler>>,
) {
    if let Some(h) = &event_handler {
        h.on_server_start();
    }
    log::debug!("UDS server thread running");
    let mut last_tester_present = Instant::now();

    while is_running.load(Ordering::Relaxed) {
        if let Ok(cmd) = rx_cmd.try_recv() {
            let is_session_control = cmd.sid_byte() == UdsCommand::DiagnosticSessionControl as u8;
            let result = perform_cmd(&cmd, &settings, channel.as_mut());
            apply_session_effects(
                &cmd,
                &result,
                is_session_control,
                &session,
                &event_handler,
            );
            if result.is_ok() {
                last_tester_present = Instant::now();
            }
            if tx_res.send(result).is_err() {
                is_running.store(false, Ordering::Relaxed);
                if let Some(h) = &event_handler {
                    h.on_critical_error("result channel send failed");
                }
                break;
            }
        }

        let needs_keepalive = {
            let state = session.lock().expect("session state poisoned");
            settings.keepalive_enabled
                && state.session_type != UdsSessionType::Default
                && last_tester_present.elapsed().as_millis()
                    >= settings.tester_present_interval_ms as u128
        };
        if needs_keepalive {
            let cmd = UdsCmd::new(
                UdsCommand::TesterPresent,
                &[0x00],
                settings.tester_present_require_response,
            );
            match perform_cmd(&cmd, &settings, channel.as_mut()) {
                Ok(_) => {
                    let mut state = session.lock().expect("session state poisoned");
                    state.last_activity = Instant::now();
                }
                Err(e) => {
                    // Best effort: log and carry on, the next request will
                    // surface a real fault if the link is gone
                    log::warn!("tester present failed: {e}");
                    if let Some(h) = &event_handler {
                        h.on_tester_present_error(&e);
                    }
                }
            }
            last_tester_present = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(
            settings.server_refresh_interval_ms as u64,
        ));
    }
    if let Some(h) = &event_handler {
        h.on_server_exit();
    }
    let _ = channel.close();
    log::debug!("UDS server thread stopped");
}

fn apply_session_effects(
    cmd: &UdsCmd,
    result: &DiagServerResult<Vec<u8>>,
    is_session_control: bool,
    session: &Arc<Mutex<SessionState>>,
    event_handler: &Option<Box<dyn UdsServerEventHandler>>,
) {
    let mut state = session.lock().expect("session state poisoned");
    match result {
        Ok(_) => {
            state.last_activity = Instant::now();
            if is_session_control {
                if let Some(&requested) = cmd.bytes.get(1) {
                    let new_type = UdsSessionType::from(requested);
                    if new_type != state.session_type {
                        log::debug!(
                            "session transition {:?} -> {:?}",
                            state.session_type,
                            new_type
                        );
                        state.session_type = new_type;
                        state.started_at = Instant::now();
                        // Security grants do not survive a session change
                        state.security_level = 0;
                    }
                }
            }
        }
        Err(DiagError::ECUError { code, .. }) => {
            state.last_activity = Instant::now();
            // The ECU dropping back to default on its own shows up as a
            // general reject while we believe a sub-session is active
            if *code == 0x10 && state.session_type != UdsSessionType::Default {
                log::warn!("ECU returned to default session on its own");
                state.session_type = UdsSessionType::Default;
                state.security_level = 0;
                if let Some(h) = event_handler {
                    h.on_session_dropped();
                }
            }
        }
        Err(_) => {}
    }
}

/// Runs one request/response exchange on the channel, honoring the
/// responsePending and busyRepeatRequest policies.
fn perform_cmd(
    cmd: &UdsCmd,
    settings: &UdsServerOptions,
    channel: &mut dyn IsoTpChannel,
) -> DiagServerResult<Vec<u8>> {
    channel.clear_tx_buffer()?;
    channel.clear_rx_buffer()?;
    let target = cmd.sid_byte();
    let mut busy_retries = 0u32;
    loop {
        if !cmd.response_required {
            log::debug!("request 0x{target:02X} does not require a response, just sending");
            channel.write_bytes(settings.send_id, &cmd.bytes, settings.write_timeout_ms)?;
            return Ok(Vec::new());
        }
        channel.write_bytes(settings.send_id, &cmd.bytes, settings.write_timeout_ms)?;

        let mut pending_count = 0u32;
        let mut read_timeout = settings.read_timeout_ms;
        loop {
            let res = channel.read_bytes(read_timeout).map_err(|e| {
                if matches!(
                    e,
                    crate::channel::ChannelError::ReadTimeout
                        | crate::channel::ChannelError::BufferEmpty
                ) {
                    DiagError::Timeout
                } else {
                    DiagError::from(e)
                }
            })?;
            if res.is_empty() {
                return Err(DiagError::EmptyResponse);
            }
            if res[0] == 0x7F {
                if res.len() < 3 {
                    return Err(DiagError::InvalidResponseLength);
                }
                if res[1] != target {
                    log::error!(
                        "negative response echoes SID 0x{:02X}, request was 0x{:02X}",
                        res[1],
                        target
                    );
                    return Err(DiagError::WrongMessage);
                }
                let nrc = UdsNrc::from(res[2]);
                match nrc {
                    UdsNrc::RequestCorrectlyReceivedResponsePending => {
                        pending_count += 1;
                        if pending_count > settings.response_pending_max {
                            log::error!(
                                "ECU still pending after {} repetitions, giving up",
                                pending_count - 1
                            );
                            return Err(DiagError::ResponsePendingExhausted);
                        }
                        log::debug!("ECU response pending ({pending_count}), extending deadline");
                        read_timeout = settings.p2_star_max_ms;
                        continue;
                    }
                    UdsNrc::BusyRepeatRequest => {
                        busy_retries += 1;
                        if busy_retries > settings.busy_repeat_max {
                            return Err(DiagError::ECUError {
                                code: res[2],
                                def: Some(nrc.desc()),
                            });
                        }
                        let backoff = settings.busy_repeat_backoff_ms.max(1000);
                        log::warn!("ECU busy, retrying in {backoff} ms");
                        std::thread::sleep(Duration::from_millis(backoff as u64));
                        break; // resend the request
                    }
                    _ => {
                        log::error!("ECU negative response 0x{:02X}", res[2]);
                        return Err(DiagError::ECUError {
                            code: res[2],
                            def: Some(nrc.desc()),
                        });
                    }
                }
            }
            return check_pos_response_id(target, res);
        }
    }
}

/// Checks the positive-response correlation law: the response service id
/// must be the request id plus 0x40.
fn check_pos_response_id(sid: u8, resp: Vec<u8>) -> DiagServerResult<Vec<u8>> {
    if resp[0] != sid.wrapping_add(0x40) {
        log::error!(
            "SID mismatch: request 0x{:02X}, response 0x{:02X}",
            sid,
            resp[0]
        );
        Err(DiagError::WrongMessage)
    } else {
        Ok(resp)
    }
}
