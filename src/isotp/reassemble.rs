//! Inbound reassembly of CAN frames into payloads.
//!
//! One [ReassemblyContext] exists per source id at any time; a new first
//! frame from the same source aborts and replaces the old transfer.

use std::collections::HashMap;
use std::time::Instant;

use super::pci::{self, FlowControl, Pci};
use super::{FramingError, FramingResult, IsoTpSettings};

/// Per-source reassembly state.
#[derive(Debug)]
pub struct ReassemblyContext {
    expected_length: u32,
    received: Vec<u8>,
    next_sn: u8,
    last_frame: Instant,
    /// Consecutive frames remaining before the next flow control is owed.
    /// None when the block size is 0 (no intermediate flow control).
    window_remaining: Option<u8>,
}

impl ReassemblyContext {
    fn new(expected_length: u32, first_data: &[u8], settings: &IsoTpSettings, now: Instant) -> Self {
        let take = (expected_length as usize).min(first_data.len());
        Self {
            expected_length,
            received: first_data[..take].to_vec(),
            next_sn: 1,
            last_frame: now,
            window_remaining: match settings.block_size {
                0 => None,
                bs => Some(bs),
            },
        }
    }

    /// Bytes collected so far
    pub fn received_len(&self) -> usize {
        self.received.len()
    }

    /// Total length announced by the first frame
    pub fn expected_length(&self) -> u32 {
        self.expected_length
    }
}

/// What the caller must do after feeding one frame to the reassembler
#[derive(Debug, PartialEq, Eq)]
pub enum RxEvent {
    /// Frame consumed, nothing to do
    Consumed,
    /// Send this flow control frame back to the source
    SendFlowControl(FlowControl),
    /// A complete payload is ready
    Complete(Vec<u8>),
    /// The frame was a flow control frame addressed to our sender side
    FlowControl(FlowControl),
}

/// Reassembles ISO-TP transfers, keyed by source id.
///
/// Multiple sources are independent; two interleaved multi-frame transfers
/// from the *same* source are illegal and restart the context.
#[derive(Debug)]
pub struct Reassembler {
    settings: IsoTpSettings,
    contexts: HashMap<u32, ReassemblyContext>,
}

impl Reassembler {
    /// Creates a reassembler answering flow control with the window in
    /// `settings`.
    pub fn new(settings: IsoTpSettings) -> Self {
        Self {
            settings,
            contexts: HashMap::new(),
        }
    }

    /// Number of transfers currently in progress
    pub fn in_progress(&self) -> usize {
        self.contexts.len()
    }

    /// Feeds one raw CAN frame payload received from `source`.
    ///
    /// On an error the context for `source` is discarded; the next single or
    /// first frame resynchronizes the stream.
    pub fn handle_frame(
        &mut self,
        source: u32,
        data: &[u8],
        now: Instant,
    ) -> FramingResult<RxEvent> {
        match pci::decode(data)? {
            Pci::Single { data } => {
                // A single frame always resynchronizes the source
                if self.contexts.remove(&source).is_some() {
                    log::warn!("0x{source:04X}: single frame aborted in-flight transfer");
                }
                Ok(RxEvent::Complete(data))
            }
            Pci::First { length, data } => {
                if self.contexts.remove(&source).is_some() {
                    log::warn!("0x{source:04X}: first frame restarted in-flight transfer");
                }
                if length > self.settings.max_recv_length {
                    return Ok(RxEvent::SendFlowControl(FlowControl::overflow()));
                }
                self.contexts.insert(
                    source,
                    ReassemblyContext::new(length, &data, &self.settings, now),
                );
                Ok(RxEvent::SendFlowControl(FlowControl::cts(
                    self.settings.block_size,
                    self.settings.st_min,
                )))
            }
            Pci::Consecutive { sn, data } => {
                let ctx = match self.contexts.get_mut(&source) {
                    Some(c) => c,
                    None => {
                        return Err(FramingError::ProtocolError(format!(
                            "0x{source:04X}: consecutive frame with no transfer in progress"
                        )))
                    }
                };
                if now.duration_since(ctx.last_frame).as_millis()
                    > self.settings.inter_frame_timeout_ms as u128
                {
                    self.contexts.remove(&source);
                    return Err(FramingError::InterFrameTimeout);
                }
                if sn != ctx.next_sn {
                    let expected = ctx.next_sn;
                    self.contexts.remove(&source);
                    return Err(FramingError::SequenceMismatch { expected, got: sn });
                }
                let remaining = ctx.expected_length as usize - ctx.received.len();
                if data.is_empty() && remaining > 0 {
                    self.contexts.remove(&source);
                    return Err(FramingError::Truncated);
                }
                let take = remaining.min(data.len());
                ctx.received.extend_from_slice(&data[..take]);
                ctx.next_sn = (sn + 1) & 0x0F;
                ctx.last_frame = now;

                if ctx.received.len() == ctx.expected_length as usize {
                    let done = self.contexts.remove(&source).map(|c| c.received);
                    return Ok(RxEvent::Complete(done.unwrap_or_default()));
                }
                if let Some(window) = ctx.window_remaining.as_mut() {
                    *window -= 1;
                    if *window == 0 {
                        *window = self.settings.block_size;
                        return Ok(RxEvent::SendFlowControl(FlowControl::cts(
                            self.settings.block_size,
                            self.settings.st_min,
                        )));
                    }
                }
                Ok(RxEvent::Consumed)
            }
            Pci::FlowControl(fc) => Ok(RxEvent::FlowControl(fc)),
        }
    }

    /// Drops every context whose inter-frame gap has exceeded N_CR and
    /// returns the affected source ids.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<u32> {
        let deadline = self.settings.inter_frame_timeout_ms as u128;
        let expired: Vec<u32> = self
            .contexts
            .iter()
            .filter(|(_, ctx)| now.duration_since(ctx.last_frame).as_millis() > deadline)
            .map(|(src, _)| *src)
            .collect();
        for src in &expired {
            self.contexts.remove(src);
            log::warn!("0x{src:04X}: reassembly timed out waiting for a consecutive frame");
        }
        expired
    }

    /// Forgets every in-flight transfer.
    pub fn reset(&mut self) {
        self.contexts.clear();
    }
}
