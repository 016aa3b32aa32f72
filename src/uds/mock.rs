//! Simulated ECU channel for exercising the server without hardware.

use std::collections::VecDeque;

use crate::channel::{ChannelError, ChannelResult, IsoTpChannel, PayloadChannel};
use crate::isotp::IsoTpSettings;

/// An ISO-TP channel backed by a callback playing the ECU.
///
/// Every request written to the channel is handed to the callback; whatever
/// it returns is queued and handed back one response per read. Returning
/// several responses models responsePending chains.
pub struct SimEcuChannel {
    callback: Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>,
    out_buffer: VecDeque<Vec<u8>>,
}

impl SimEcuChannel {
    pub fn new(callback: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) -> Box<Self> {
        Box::new(Self {
            callback: Box::new(callback),
            out_buffer: VecDeque::new(),
        })
    }

}

impl PayloadChannel for SimEcuChannel {
    fn open(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn set_ids(&mut self, _send: u32, _recv: u32) -> ChannelResult<()> {
        Ok(())
    }

    fn read_bytes(&mut self, _timeout_ms: u32) -> ChannelResult<Vec<u8>> {
        self.out_buffer
            .pop_front()
            .ok_or(ChannelError::ReadTimeout)
    }

    fn write_bytes(&mut self, _addr: u32, buffer: &[u8], _timeout_ms: u32) -> ChannelResult<()> {
        for resp in (self.callback)(buffer) {
            self.out_buffer.push_back(resp);
        }
        Ok(())
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.out_buffer.clear();
        Ok(())
    }

    fn clear_tx_buffer(&mut self) -> ChannelResult<()> {
        Ok(())
    }
}

impl IsoTpChannel for SimEcuChannel {
    fn set_iso_tp_cfg(&mut self, _cfg: IsoTpSettings) -> ChannelResult<()> {
        Ok(())
    }
}
