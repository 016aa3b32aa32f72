//! ISO-TP (ISO 15765-2) transport layer.
//!
//! Splits variable-length diagnostic payloads into 8-byte CAN frames and
//! puts them back together, with flow-control handshaking between peers:
//!
//! * [segment] - outbound segmentation (single/first/consecutive frames)
//! * [reassemble] - inbound reassembly keyed by source id
//! * [pci] - the shared frame header codec
//! * [IsoTpLink] - a background worker gluing both halves onto any
//!   [PacketChannel] of CAN frames, exposing a [PayloadChannel] to the
//!   protocol layer above

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::channel::{
    CanFrame, ChannelError, ChannelResult, IsoTpChannel, PacketChannel, PayloadChannel,
};

pub mod pci;
pub mod reassemble;
pub mod segment;

pub use pci::{FlowControl, FlowStatus};
pub use reassemble::{Reassembler, RxEvent};
pub use segment::Segmenter;

/// ISO-TP framing result
pub type FramingResult<T> = Result<T, FramingError>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
/// Error produced while framing or defragmenting an ISO-TP transfer
pub enum FramingError {
    /// Payload exceeds what the addressing mode can express
    #[error("payload of {length} bytes exceeds the maximum of {max}")]
    PayloadTooLarge {
        /// Offending payload length
        length: usize,
        /// Largest length the encoding allows
        max: usize,
    },
    /// No flow control frame arrived within the flow control timeout
    #[error("timed out waiting for a flow control frame")]
    FlowControlTimeout,
    /// The receiver answered a first frame with an overflow status
    #[error("receiver aborted the transfer (flow control overflow)")]
    FlowControlAbort,
    /// A consecutive frame arrived out of order
    #[error("sequence number mismatch (expected {expected}, got {got})")]
    SequenceMismatch {
        /// Sequence number the reassembler was waiting for
        expected: u8,
        /// Sequence number actually received
        got: u8,
    },
    /// The gap between two consecutive frames exceeded N_CR
    #[error("timed out waiting for the next consecutive frame")]
    InterFrameTimeout,
    /// A frame was shorter than its header demands
    #[error("frame truncated")]
    Truncated,
    /// Anything else that violates the framing rules
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// ISO-TP configuration options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IsoTpSettings {
    /// Block size advertised to the peer. 0 disables intermediate flow control
    pub block_size: u8,
    /// Raw STmin byte advertised to the peer (0x00-0x7F ms, 0xF1-0xF9 for
    /// 100-900 us)
    pub st_min: u8,
    /// How long to wait for a flow control frame after a first frame
    pub fc_timeout_ms: u32,
    /// Largest tolerated gap between consecutive frames (N_CR)
    pub inter_frame_timeout_ms: u32,
    /// How many Wait flow control frames the peer may send before the
    /// transfer is abandoned
    pub wait_frames_max: u8,
    /// Pad frames shorter than 8 bytes
    pub pad_frame: bool,
    /// Byte used for padding
    pub padding_byte: u8,
    /// Baud rate of the CAN network
    pub can_speed: u32,
    /// Whether the CAN network uses extended (29 bit) addressing
    pub can_use_ext_addr: bool,
    /// Largest inbound transfer accepted before answering overflow
    pub max_recv_length: u32,
}

impl Default for IsoTpSettings {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: 0,
            fc_timeout_ms: 1000,
            inter_frame_timeout_ms: 1000,
            wait_frames_max: 4,
            pad_frame: true,
            padding_byte: 0x00,
            can_speed: 500_000,
            can_use_ext_addr: false,
            max_recv_length: 0x10_0000,
        }
    }
}

#[derive(Debug)]
enum LinkMsg {
    Open(mpsc::Sender<ChannelResult<()>>),
    Close(mpsc::Sender<ChannelResult<()>>),
    SetIds(u32, u32, mpsc::Sender<ChannelResult<()>>),
    SetCfg(IsoTpSettings, mpsc::Sender<ChannelResult<()>>),
    Write(u32, Vec<u8>, u32, mpsc::Sender<ChannelResult<()>>),
    Read(u32, mpsc::Sender<ChannelResult<Vec<u8>>>),
    ClearRx(mpsc::Sender<ChannelResult<()>>),
    ClearTx(mpsc::Sender<ChannelResult<()>>),
}

/// In-flight outbound transfer
struct TxTransfer {
    seg: Segmenter,
    clear_to_send: bool,
    /// Frames left in the current block. None when the peer set BS = 0
    window: Option<u8>,
    gap: Duration,
    next_cf_at: Instant,
    fc_deadline: Instant,
    wait_count: u8,
    reply: Option<mpsc::Sender<ChannelResult<()>>>,
}

impl TxTransfer {
    fn finish(&mut self, result: ChannelResult<()>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        } else if let Err(e) = result {
            log::warn!("unacknowledged ISO-TP send failed: {e}");
        }
    }
}

/// ISO-TP link over a raw CAN frame channel.
///
/// A background worker owns the CAN channel and the reassembly state; the
/// handle is cheap to move across threads and cancels the worker on drop.
#[derive(Debug)]
pub struct IsoTpLink {
    running: Arc<AtomicBool>,
    msg_tx: mpsc::Sender<LinkMsg>,
    handle: Option<JoinHandle<()>>,
}

impl IsoTpLink {
    /// Spawns the link worker over the given CAN channel.
    pub fn new(channel: Box<dyn PacketChannel<CanFrame>>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_t = running.clone();
        let (msg_tx, msg_rx) = mpsc::channel::<LinkMsg>();
        let handle = std::thread::spawn(move || worker(channel, msg_rx, running_t));
        Self {
            running,
            msg_tx,
            handle: Some(handle),
        }
    }

    fn roundtrip<T>(
        &self,
        build: impl FnOnce(mpsc::Sender<ChannelResult<T>>) -> LinkMsg,
    ) -> ChannelResult<T> {
        let (tx, rx) = mpsc::channel();
        self.msg_tx.send(build(tx))?;
        rx.recv()
            .map_err(|_| ChannelError::Other("ISO-TP worker hung up".into()))?
    }
}

fn worker(
    mut channel: Box<dyn PacketChannel<CanFrame>>,
    msg_rx: mpsc::Receiver<LinkMsg>,
    running: Arc<AtomicBool>,
) {
    let mut cfg: Option<IsoTpSettings> = None;
    let mut ids: Option<(u32, u32)> = None;
    let mut is_open = false;
    let mut reassembler: Option<Reassembler> = None;
    let mut rx_payloads: VecDeque<Vec<u8>> = VecDeque::new();
    let mut pending_read: Option<(Instant, mpsc::Sender<ChannelResult<Vec<u8>>>)> = None;
    let mut active_tx: Option<TxTransfer> = None;

    log::debug!("ISO-TP link worker running");
    while running.load(Ordering::Relaxed) {
        if let Ok(msg) = msg_rx.try_recv() {
            match msg {
                LinkMsg::Open(reply) => {
                    let res = if cfg.is_none() || ids.is_none() {
                        Err(ChannelError::ConfigurationError)
                    } else {
                        let res = channel.open();
                        if res.is_ok() {
                            is_open = true;
                            reassembler = cfg.map(Reassembler::new);
                        }
                        res
                    };
                    let _ = reply.send(res);
                }
                LinkMsg::Close(reply) => {
                    if let Some(tx) = active_tx.as_mut() {
                        tx.finish(Err(ChannelError::InterfaceNotOpen));
                    }
                    active_tx = None;
                    rx_payloads.clear();
                    reassembler = None;
                    let res = if is_open { channel.close() } else { Ok(()) };
                    is_open = false;
                    let _ = reply.send(res);
                }
                LinkMsg::SetIds(send, recv, reply) => {
                    ids = Some((send, recv));
                    let _ = reply.send(Ok(()));
                }
                LinkMsg::SetCfg(settings, reply) => {
                    cfg = Some(settings);
                    if is_open {
                        reassembler = Some(Reassembler::new(settings));
                    }
                    let _ = reply.send(Ok(()));
                }
                LinkMsg::Write(addr, data, timeout_ms, reply) => {
                    handle_write(
                        &mut channel,
                        &cfg,
                        is_open,
                        &mut active_tx,
                        addr,
                        data,
                        timeout_ms,
                        reply,
                    );
                }
                LinkMsg::Read(timeout_ms, reply) => {
                    if let Some(payload) = rx_payloads.pop_front() {
                        let _ = reply.send(Ok(payload));
                    } else if timeout_ms == 0 {
                        let _ = reply.send(Err(ChannelError::BufferEmpty));
                    } else {
                        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
                        pending_read = Some((deadline, reply));
                    }
                }
                LinkMsg::ClearRx(reply) => {
                    rx_payloads.clear();
                    if let Some(r) = reassembler.as_mut() {
                        r.reset();
                    }
                    let _ = reply.send(channel.clear_rx_buffer());
                }
                LinkMsg::ClearTx(reply) => {
                    let _ = reply.send(channel.clear_tx_buffer());
                }
            }
        }

        if is_open {
            pump_rx(
                &mut channel,
                &cfg,
                &ids,
                &mut reassembler,
                &mut rx_payloads,
                &mut active_tx,
            );
            pump_tx(&mut channel, &cfg, &ids, &mut active_tx);
        }

        let read_ready = match &pending_read {
            Some((deadline, _)) => !rx_payloads.is_empty() || Instant::now() >= *deadline,
            None => false,
        };
        if read_ready {
            if let Some((_, reply)) = pending_read.take() {
                let res = rx_payloads.pop_front().ok_or(ChannelError::ReadTimeout);
                let _ = reply.send(res);
            }
        }

        std::thread::sleep(Duration::from_millis(1));
    }
    log::debug!("ISO-TP link worker stopped");
}

#[allow(clippy::too_many_arguments)]
fn handle_write(
    channel: &mut Box<dyn PacketChannel<CanFrame>>,
    cfg: &Option<IsoTpSettings>,
    is_open: bool,
    active_tx: &mut Option<TxTransfer>,
    addr: u32,
    data: Vec<u8>,
    timeout_ms: u32,
    reply: mpsc::Sender<ChannelResult<()>>,
) {
    let settings = match cfg {
        Some(s) => *s,
        None => {
            let _ = reply.send(Err(ChannelError::ConfigurationError));
            return;
        }
    };
    if !is_open {
        let _ = reply.send(Err(ChannelError::InterfaceNotOpen));
        return;
    }
    if data.len() <= 7 {
        let res = segment::single_frame(addr, &data, &settings)
            .map_err(ChannelError::from)
            .and_then(|f| channel.write_packets(vec![f], 50));
        let _ = reply.send(res);
        return;
    }
    if active_tx.is_some() {
        let _ = reply.send(Err(ChannelError::BufferFull));
        return;
    }
    let mut seg = match Segmenter::new(addr, &data, settings) {
        Ok(s) => s,
        Err(e) => {
            let _ = reply.send(Err(e.into()));
            return;
        }
    };
    let ff = seg.first_frame();
    if let Err(e) = channel.write_packets(vec![ff], 50) {
        let _ = reply.send(Err(e));
        return;
    }
    let now = Instant::now();
    let reply = if timeout_ms == 0 {
        // Fire and forget: acknowledge the queued transfer immediately
        let _ = reply.send(Ok(()));
        None
    } else {
        Some(reply)
    };
    *active_tx = Some(TxTransfer {
        seg,
        clear_to_send: false,
        window: None,
        gap: Duration::ZERO,
        next_cf_at: now,
        fc_deadline: now + Duration::from_millis(settings.fc_timeout_ms as u64),
        wait_count: 0,
        reply,
    });
}

fn pump_rx(
    channel: &mut Box<dyn PacketChannel<CanFrame>>,
    cfg: &Option<IsoTpSettings>,
    ids: &Option<(u32, u32)>,
    reassembler: &mut Option<Reassembler>,
    rx_payloads: &mut VecDeque<Vec<u8>>,
    active_tx: &mut Option<TxTransfer>,
) {
    let (tx_id, rx_id) = match ids {
        Some(pair) => *pair,
        None => return,
    };
    let settings = match cfg {
        Some(s) => *s,
        None => return,
    };
    let frames = channel.read_packets(64, 0).unwrap_or_default();
    let now = Instant::now();
    for frame in frames {
        if frame.id() != rx_id {
            continue;
        }
        let reasm = match reassembler.as_mut() {
            Some(r) => r,
            None => return,
        };
        match reasm.handle_frame(frame.id(), frame.data(), now) {
            Ok(RxEvent::Consumed) => {}
            Ok(RxEvent::Complete(payload)) => {
                log::debug!("ISO-TP rx complete ({} bytes)", payload.len());
                rx_payloads.push_back(payload);
            }
            Ok(RxEvent::SendFlowControl(fc)) => {
                let mut data = fc.to_bytes().to_vec();
                if settings.pad_frame {
                    data.resize(8, settings.padding_byte);
                }
                let frame = CanFrame::new(tx_id, &data, settings.can_use_ext_addr);
                if let Err(e) = channel.write_packets(vec![frame], 50) {
                    log::error!("could not send flow control: {e}");
                    reasm.reset();
                }
            }
            Ok(RxEvent::FlowControl(fc)) => {
                apply_flow_control(active_tx, fc, &settings, now);
            }
            Err(e) => {
                log::warn!("ISO-TP rx fault: {e}");
            }
        }
    }
    if let Some(r) = reassembler.as_mut() {
        r.purge_expired(now);
    }
}

fn apply_flow_control(
    active_tx: &mut Option<TxTransfer>,
    fc: FlowControl,
    settings: &IsoTpSettings,
    now: Instant,
) {
    let tx = match active_tx.as_mut() {
        Some(t) => t,
        None => {
            log::debug!("flow control with no transfer in progress, ignoring");
            return;
        }
    };
    match fc.status {
        FlowStatus::ContinueToSend => {
            tx.clear_to_send = true;
            tx.window = match fc.block_size {
                0 => None,
                bs => Some(bs),
            };
            tx.gap = pci::decode_st_min(fc.st_min);
            tx.next_cf_at = now;
            tx.wait_count = 0;
        }
        FlowStatus::Wait => {
            tx.wait_count += 1;
            if tx.wait_count > settings.wait_frames_max {
                tx.finish(Err(FramingError::FlowControlTimeout.into()));
                *active_tx = None;
            } else {
                tx.fc_deadline = now + Duration::from_millis(settings.fc_timeout_ms as u64);
            }
        }
        FlowStatus::Overflow => {
            tx.finish(Err(FramingError::FlowControlAbort.into()));
            *active_tx = None;
        }
    }
}

fn pump_tx(
    channel: &mut Box<dyn PacketChannel<CanFrame>>,
    cfg: &Option<IsoTpSettings>,
    ids: &Option<(u32, u32)>,
    active_tx: &mut Option<TxTransfer>,
) {
    if ids.is_none() || cfg.is_none() {
        return;
    }
    let tx = match active_tx.as_mut() {
        Some(t) => t,
        None => return,
    };
    let now = Instant::now();
    if !tx.clear_to_send {
        if now >= tx.fc_deadline {
            tx.finish(Err(FramingError::FlowControlTimeout.into()));
            *active_tx = None;
        }
        return;
    }

    let mut done = false;
    let mut failed = false;
    // Up to 8 frames per pass keeps an unrestricted window fast without
    // starving the command queue
    for _ in 0..8 {
        if now < tx.next_cf_at {
            break;
        }
        let frame = match tx.seg.next_consecutive() {
            Some(f) => f,
            None => {
                done = true;
                break;
            }
        };
        if let Err(e) = channel.write_packets(vec![frame], 50) {
            tx.finish(Err(e));
            failed = true;
            break;
        }
        tx.next_cf_at = now + tx.gap;
        if tx.seg.is_complete() {
            done = true;
            break;
        }
        if let Some(window) = tx.window.as_mut() {
            *window -= 1;
            if *window == 0 {
                // Block spent, wait for the next flow control
                tx.clear_to_send = false;
                tx.fc_deadline = now
                    + Duration::from_millis(
                        cfg.map(|c| c.fc_timeout_ms).unwrap_or(1000) as u64
                    );
                break;
            }
        }
        if !tx.gap.is_zero() {
            break;
        }
    }
    if done {
        tx.finish(Ok(()));
        *active_tx = None;
    } else if failed {
        *active_tx = None;
    }
}

impl PayloadChannel for IsoTpLink {
    fn open(&mut self) -> ChannelResult<()> {
        self.roundtrip(LinkMsg::Open)
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.roundtrip(LinkMsg::Close)
    }

    fn set_ids(&mut self, send: u32, recv: u32) -> ChannelResult<()> {
        self.roundtrip(|tx| LinkMsg::SetIds(send, recv, tx))
    }

    fn read_bytes(&mut self, timeout_ms: u32) -> ChannelResult<Vec<u8>> {
        self.roundtrip(|tx| LinkMsg::Read(timeout_ms, tx))
    }

    fn write_bytes(&mut self, addr: u32, buffer: &[u8], timeout_ms: u32) -> ChannelResult<()> {
        self.roundtrip(|tx| LinkMsg::Write(addr, buffer.to_vec(), timeout_ms, tx))
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.roundtrip(LinkMsg::ClearRx)
    }

    fn clear_tx_buffer(&mut self) -> ChannelResult<()> {
        self.roundtrip(LinkMsg::ClearTx)
    }
}

impl IsoTpChannel for IsoTpLink {
    fn set_iso_tp_cfg(&mut self, cfg: IsoTpSettings) -> ChannelResult<()> {
        self.roundtrip(|tx| LinkMsg::SetCfg(cfg, tx))
    }
}

impl Drop for IsoTpLink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
